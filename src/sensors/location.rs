//! Best-fix selection across location providers.
//!
//! With several providers active, a new fix only replaces the current best
//! when it is newer by more than the expiration window, more accurate, or
//! newer and not meaningfully less accurate.

use super::producer::SampleSource;
use super::types::LocationFix;
use crate::lifecycle::LaunchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Tunables for [`FixSelection::is_better_fix`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixSelection {
    /// Age difference after which the newer fix always wins
    pub expiration_secs: u64,
    /// Accuracy loss (meters) above which a newer fix is rejected
    pub significant_accuracy_delta_m: f32,
    /// Accept a newer, slightly less accurate fix from the same provider
    pub accept_same_provider: bool,
}

impl Default for FixSelection {
    fn default() -> Self {
        Self {
            expiration_secs: 300,
            significant_accuracy_delta_m: 200.0,
            accept_same_provider: true,
        }
    }
}

impl FixSelection {
    /// Whether `candidate` should replace `current`.
    pub fn is_better_fix(&self, candidate: &LocationFix, current: Option<&LocationFix>) -> bool {
        let Some(current) = current else {
            return true;
        };

        let expiration_ms = (self.expiration_secs as i64).saturating_mul(1000);
        let time_delta = (candidate.timestamp - current.timestamp).num_milliseconds();
        if time_delta > expiration_ms {
            return true;
        }
        if time_delta < -expiration_ms {
            return false;
        }
        let is_newer = time_delta > 0;

        let accuracy_delta = candidate.accuracy_m - current.accuracy_m;
        let less_accurate = accuracy_delta > 0.0;
        let significantly_less_accurate = accuracy_delta > self.significant_accuracy_delta_m;
        let same_provider = candidate.provider == current.provider;

        if accuracy_delta < 0.0 {
            true
        } else if is_newer && !less_accurate {
            true
        } else {
            is_newer
                && !significantly_less_accurate
                && same_provider
                && self.accept_same_provider
        }
    }
}

/// Wraps a raw multi-provider source and emits the best known fix for every
/// fix it receives.
pub struct BestFixSource<S> {
    inner: S,
    selection: FixSelection,
    last_by_provider: BTreeMap<String, LocationFix>,
}

impl<S> BestFixSource<S>
where
    S: SampleSource<Sample = LocationFix>,
{
    pub fn new(inner: S, selection: FixSelection) -> Self {
        Self {
            inner,
            selection,
            last_by_provider: BTreeMap::new(),
        }
    }

    /// Best of the last fix seen from each provider.
    fn reference(&self) -> Option<&LocationFix> {
        self.last_by_provider.values().fold(None, |best, fix| {
            if self.selection.is_better_fix(fix, best) {
                Some(fix)
            } else {
                best
            }
        })
    }

    fn select(&mut self, fix: LocationFix) -> LocationFix {
        let best = match self.reference() {
            Some(reference) if !self.selection.is_better_fix(&fix, Some(reference)) => {
                reference.clone()
            }
            _ => fix.clone(),
        };
        self.last_by_provider.insert(fix.provider.clone(), fix);
        best
    }
}

impl<S> SampleSource for BestFixSource<S>
where
    S: SampleSource<Sample = LocationFix>,
{
    type Sample = LocationFix;

    fn open(&mut self) -> Result<(), LaunchError> {
        self.last_by_provider.clear();
        self.inner.open()
    }

    fn poll(&mut self, timeout: Duration) -> Option<LocationFix> {
        let fix = self.inner.poll(timeout)?;
        Some(self.select(fix))
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
