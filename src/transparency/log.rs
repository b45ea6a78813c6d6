//! Transparency log.
//!
//! Counts what the agent observed, wrote, dropped, fired and started so the
//! participant (or a researcher) can see what collection actually happened.
//! Only counters are kept; no sample content ends up here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Running counters for the current agent session.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Samples pushed into any buffer
    samples_observed: AtomicU64,
    /// Samples persisted by successful batch writes
    samples_written: AtomicU64,
    /// Successful batch writes
    batches_written: AtomicU64,
    /// Batches lost to storage faults or a full flush queue
    batches_dropped: AtomicU64,
    /// Batches discarded because storage writes were disabled
    batches_skipped: AtomicU64,
    /// Schedule entries fired
    schedules_fired: AtomicU64,
    /// Module and plugin starts
    module_starts: AtomicU64,
    /// Module and plugin launch failures
    module_failures: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    pub fn new() -> Self {
        Self {
            samples_observed: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            batches_written: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            batches_skipped: AtomicU64::new(0),
            schedules_fired: AtomicU64::new(0),
            module_starts: AtomicU64::new(0),
            module_failures: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that resumes from (and saves to) `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            debug!(error = %e, "could not load previous transparency stats");
        }

        log
    }

    pub fn record_sample(&self) {
        self.samples_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_written(&self, samples: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.samples_written.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_skipped(&self) {
        self.batches_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_schedule_fired(&self) {
        self.schedules_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_module_start(&self) {
        self.module_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_module_failure(&self) {
        self.module_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            samples_observed: self.samples_observed.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            batches_skipped: self.batches_skipped.load(Ordering::Relaxed),
            schedules_fired: self.schedules_fired.load(Ordering::Relaxed),
            module_starts: self.module_starts.load(Ordering::Relaxed),
            module_failures: self.module_failures.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the CLI.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Samples observed: {}\n\
             - Samples written: {} ({} batches)\n\
             - Batches dropped: {}\n\
             - Batches skipped (writes disabled): {}\n\
             - Schedules fired: {}\n\
             - Module starts: {} ({} failed)\n\
             - Session duration: {} seconds",
            stats.samples_observed,
            stats.samples_written,
            stats.batches_written,
            stats.batches_dropped,
            stats.batches_skipped,
            stats.schedules_fired,
            stats.module_starts,
            stats.module_failures,
            stats.session_duration_secs
        )
    }

    /// Save counters to the persistence path, if any.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                samples_observed: stats.samples_observed,
                samples_written: stats.samples_written,
                batches_written: stats.batches_written,
                batches_dropped: stats.batches_dropped,
                batches_skipped: stats.batches_skipped,
                schedules_fired: stats.schedules_fired,
                module_starts: stats.module_starts,
                module_failures: stats.module_failures,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.samples_observed
                    .store(persisted.samples_observed, Ordering::Relaxed);
                self.samples_written
                    .store(persisted.samples_written, Ordering::Relaxed);
                self.batches_written
                    .store(persisted.batches_written, Ordering::Relaxed);
                self.batches_dropped
                    .store(persisted.batches_dropped, Ordering::Relaxed);
                self.batches_skipped
                    .store(persisted.batches_skipped, Ordering::Relaxed);
                self.schedules_fired
                    .store(persisted.schedules_fired, Ordering::Relaxed);
                self.module_starts
                    .store(persisted.module_starts, Ordering::Relaxed);
                self.module_failures
                    .store(persisted.module_failures, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn reset(&self) {
        for counter in [
            &self.samples_observed,
            &self.samples_written,
            &self.batches_written,
            &self.batches_dropped,
            &self.batches_skipped,
            &self.schedules_fired,
            &self.module_starts,
            &self.module_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub samples_observed: u64,
    pub samples_written: u64,
    pub batches_written: u64,
    pub batches_dropped: u64,
    pub batches_skipped: u64,
    pub schedules_fired: u64,
    pub module_starts: u64,
    pub module_failures: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    #[serde(default)]
    samples_observed: u64,
    #[serde(default)]
    samples_written: u64,
    #[serde(default)]
    batches_written: u64,
    #[serde(default)]
    batches_dropped: u64,
    #[serde(default)]
    batches_skipped: u64,
    #[serde(default)]
    schedules_fired: u64,
    #[serde(default)]
    module_starts: u64,
    #[serde(default)]
    module_failures: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_counters() {
        let log = TransparencyLog::new();

        log.record_sample();
        log.record_sample();
        log.record_batch_written(2);
        log.record_batch_dropped();

        let stats = log.stats();
        assert_eq!(stats.samples_observed, 2);
        assert_eq!(stats.samples_written, 2);
        assert_eq!(stats.batches_written, 1);
        assert_eq!(stats.batches_dropped, 1);
    }

    #[test]
    fn test_reset() {
        let log = TransparencyLog::new();
        log.record_schedule_fired();
        log.record_module_start();
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.schedules_fired, 0);
        assert_eq!(stats.module_starts, 0);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transparency.json");

        let log = TransparencyLog::with_persistence(path.clone());
        log.record_batch_written(250);
        log.record_module_failure();
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path);
        let stats = reloaded.stats();
        assert_eq!(stats.samples_written, 250);
        assert_eq!(stats.module_failures, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = TransparencyLog::new().summary();
        assert!(summary.contains("Samples observed"));
        assert!(summary.contains("Schedules fired"));
    }
}
