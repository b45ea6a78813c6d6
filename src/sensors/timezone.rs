//! Timezone producer: records the host's IANA timezone on a fixed period.

use super::producer::SampleSource;
use super::types::TimezoneSample;
use crate::lifecycle::LaunchError;
use chrono::Utc;
use chrono_tz::Tz;
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_TIMEZONE_PERIOD: Duration = Duration::from_secs(3600);

/// Resolve the host timezone from `TZ`, falling back to `fallback`.
pub fn host_timezone(fallback: Tz) -> Tz {
    parse_tz_var(std::env::var("TZ").ok().as_deref()).unwrap_or(fallback)
}

fn parse_tz_var(value: Option<&str>) -> Option<Tz> {
    // POSIX allows a leading ':' before a zone name.
    let name = value?.trim().trim_start_matches(':');
    name.parse().ok()
}

pub struct TimezoneSource {
    device_id: String,
    fallback: Tz,
    period: Duration,
    next_due: Option<Instant>,
}

impl TimezoneSource {
    pub fn new(device_id: impl Into<String>, fallback: Tz, period: Duration) -> Self {
        Self {
            device_id: device_id.into(),
            fallback,
            period,
            next_due: None,
        }
    }

    fn sample(&self) -> TimezoneSample {
        TimezoneSample {
            timestamp: Utc::now(),
            device_id: self.device_id.clone(),
            timezone: host_timezone(self.fallback).name().to_string(),
        }
    }
}

impl SampleSource for TimezoneSource {
    type Sample = TimezoneSample;

    fn open(&mut self) -> Result<(), LaunchError> {
        if self.period.is_zero() {
            return Err(LaunchError::Failed("timezone period must be positive".to_string()));
        }
        self.next_due = Some(Instant::now());
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<TimezoneSample> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if now >= due {
            self.next_due = Some(now + self.period);
            let sample = self.sample();
            debug!(timezone = %sample.timezone, "timezone sampled");
            return Some(sample);
        }
        std::thread::sleep(timeout.min(due - now));
        None
    }
}
