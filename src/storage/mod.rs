//! Persistence for settings, schedules, module records and samples.
//!
//! Every component talks to storage through the small table traits below so
//! the same logic runs against SQLite on a device and against the in-memory
//! store in tests.

pub mod memory;
pub mod sqlite;

use crate::lifecycle::{ModuleRecord, ModuleStatus};
use crate::scheduler::ScheduleEntry;
use crate::settings::Setting;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backing store could not be reached or is refusing writes.
    Unavailable(String),
    /// A query or statement failed.
    Database(String),
    /// A row exists but cannot be decoded.
    Corrupt(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "Storage unavailable: {msg}"),
            StorageError::Database(msg) => write!(f, "Database error: {msg}"),
            StorageError::Corrupt(msg) => write!(f, "Corrupt row: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Settings rows keyed by `(key, scope)`.
pub trait SettingsTable: Send + Sync {
    fn read_setting(&self, key: &str, scope: &str) -> Result<Option<String>, StorageError>;
    fn upsert_setting(&self, key: &str, scope: &str, value: &str) -> Result<(), StorageError>;
    /// Write `value` only when the row is absent or empty, as one atomic
    /// step. Returns whether the row was written.
    fn set_if_empty(&self, key: &str, scope: &str, value: &str) -> Result<bool, StorageError>;
    /// Delete every row in `scope`, returning the number removed.
    fn delete_scope(&self, scope: &str) -> Result<usize, StorageError>;
    /// Delete every row in every scope.
    fn delete_all_settings(&self) -> Result<usize, StorageError>;
    fn list_settings(&self) -> Result<Vec<Setting>, StorageError>;
}

/// Schedule entries keyed by id.
pub trait ScheduleTable: Send + Sync {
    fn read_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StorageError>;
    fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<(), StorageError>;
    fn mark_triggered(&self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError>;
    fn delete_schedule(&self, id: &str) -> Result<bool, StorageError>;
    fn delete_owned_by(&self, owner: &str) -> Result<usize, StorageError>;
    fn delete_all_schedules(&self) -> Result<usize, StorageError>;
    /// All decodable entries. Rows that fail to decode are skipped.
    fn list_schedules(&self) -> Result<Vec<ScheduleEntry>, StorageError>;
}

/// Installed and bundled module records keyed by package name.
pub trait ModuleTable: Send + Sync {
    fn read_module(&self, package: &str) -> Result<Option<ModuleRecord>, StorageError>;
    fn upsert_module(&self, record: &ModuleRecord) -> Result<(), StorageError>;
    /// Returns false when no record exists for `package`.
    fn set_module_status(&self, package: &str, status: ModuleStatus)
        -> Result<bool, StorageError>;
    fn delete_module(&self, package: &str) -> Result<bool, StorageError>;
    fn list_modules(&self) -> Result<Vec<ModuleRecord>, StorageError>;
}

/// Bulk destination for buffered samples of one producer.
pub trait SampleSink<T>: Send + Sync {
    /// Insert the whole batch, returning the number of rows written.
    fn bulk_insert(&self, producer: &str, batch: &[T]) -> Result<usize, StorageError>;
}

/// Maintenance hook for clearing a producer's stored data.
pub trait DataMaintenance: Send + Sync {
    fn clear_producer(&self, producer: &str) -> Result<usize, StorageError>;
    /// Delete the producer's samples numbered `seq` or lower. Samples stored
    /// later are kept.
    fn clear_through(&self, producer: &str, seq: i64) -> Result<usize, StorageError>;
}

/// Read side of sample storage, used by sync.
pub trait SampleReader: Send + Sync {
    fn producers(&self) -> Result<Vec<String>, StorageError>;
    /// Samples stored after the one numbered `after_seq`, in insertion order.
    fn samples_after(
        &self,
        producer: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredSample>, StorageError>;
}

/// A sample as persisted: producer, millisecond timestamp and JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSample {
    /// Store-wide insertion number. Strictly increasing and never reused,
    /// even after rows are cleared.
    pub seq: i64,
    pub producer: String,
    pub timestamp: i64,
    pub payload: serde_json::Value,
}
