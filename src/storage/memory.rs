//! In-memory store with write fault injection.
//!
//! Used by tests and by `--ephemeral` runs. Setting [`MemoryStore::set_failing`]
//! makes every operation return [`StorageError::Unavailable`].

use super::{
    DataMaintenance, ModuleTable, SampleReader, SampleSink, ScheduleTable, SettingsTable,
    StorageError, StoredSample,
};
use crate::buffer::Sample;
use crate::lifecycle::{ModuleRecord, ModuleStatus};
use crate::scheduler::ScheduleEntry;
use crate::settings::Setting;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Store that keeps every table in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    settings: Mutex<BTreeMap<(String, String), String>>,
    schedules: Mutex<BTreeMap<String, ScheduleEntry>>,
    modules: Mutex<BTreeMap<String, ModuleRecord>>,
    samples: Mutex<Vec<StoredSample>>,
    batches: Mutex<Vec<(String, usize)>>,
    last_seq: AtomicI64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sizes of every batch accepted by [`SampleSink::bulk_insert`], in order.
    pub fn batch_sizes(&self, producer: &str) -> Vec<usize> {
        match self.batches.lock() {
            Ok(batches) => batches
                .iter()
                .filter(|(p, _)| p == producer)
                .map(|(_, n)| *n)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of stored samples for `producer`.
    pub fn sample_count(&self, producer: &str) -> usize {
        match self.samples.lock() {
            Ok(samples) => samples.iter().filter(|s| s.producer == producer).count(),
            Err(_) => 0,
        }
    }

    fn guard<'a, T>(&self, lock: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected fault".to_string()));
        }
        lock.lock()
            .map_err(|_| StorageError::Unavailable("lock poisoned".to_string()))
    }
}

impl SettingsTable for MemoryStore {
    fn read_setting(&self, key: &str, scope: &str) -> Result<Option<String>, StorageError> {
        let settings = self.guard(&self.settings)?;
        Ok(settings.get(&(key.to_string(), scope.to_string())).cloned())
    }

    fn upsert_setting(&self, key: &str, scope: &str, value: &str) -> Result<(), StorageError> {
        let mut settings = self.guard(&self.settings)?;
        settings.insert((key.to_string(), scope.to_string()), value.to_string());
        Ok(())
    }

    fn set_if_empty(&self, key: &str, scope: &str, value: &str) -> Result<bool, StorageError> {
        let mut settings = self.guard(&self.settings)?;
        let slot = settings
            .entry((key.to_string(), scope.to_string()))
            .or_default();
        if !slot.is_empty() {
            return Ok(false);
        }
        *slot = value.to_string();
        Ok(true)
    }

    fn delete_scope(&self, scope: &str) -> Result<usize, StorageError> {
        let mut settings = self.guard(&self.settings)?;
        let before = settings.len();
        settings.retain(|(_, s), _| s != scope);
        Ok(before - settings.len())
    }

    fn delete_all_settings(&self) -> Result<usize, StorageError> {
        let mut settings = self.guard(&self.settings)?;
        let removed = settings.len();
        settings.clear();
        Ok(removed)
    }

    fn list_settings(&self) -> Result<Vec<Setting>, StorageError> {
        let settings = self.guard(&self.settings)?;
        let mut rows: Vec<Setting> = settings
            .iter()
            .map(|((key, scope), value)| Setting {
                key: key.clone(),
                scope: scope.clone(),
                value: value.clone(),
            })
            .collect();
        rows.sort_by(|a, b| (&a.scope, &a.key).cmp(&(&b.scope, &b.key)));
        Ok(rows)
    }
}

impl ScheduleTable for MemoryStore {
    fn read_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StorageError> {
        Ok(self.guard(&self.schedules)?.get(id).cloned())
    }

    fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<(), StorageError> {
        self.guard(&self.schedules)?
            .insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    fn mark_triggered(&self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some(entry) = self.guard(&self.schedules)?.get_mut(id) {
            entry.last_triggered = Some(at);
        }
        Ok(())
    }

    fn delete_schedule(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.guard(&self.schedules)?.remove(id).is_some())
    }

    fn delete_owned_by(&self, owner: &str) -> Result<usize, StorageError> {
        let mut schedules = self.guard(&self.schedules)?;
        let before = schedules.len();
        schedules.retain(|_, entry| entry.owner != owner);
        Ok(before - schedules.len())
    }

    fn delete_all_schedules(&self) -> Result<usize, StorageError> {
        let mut schedules = self.guard(&self.schedules)?;
        let removed = schedules.len();
        schedules.clear();
        Ok(removed)
    }

    fn list_schedules(&self) -> Result<Vec<ScheduleEntry>, StorageError> {
        Ok(self.guard(&self.schedules)?.values().cloned().collect())
    }
}

impl ModuleTable for MemoryStore {
    fn read_module(&self, package: &str) -> Result<Option<ModuleRecord>, StorageError> {
        Ok(self.guard(&self.modules)?.get(package).cloned())
    }

    fn upsert_module(&self, record: &ModuleRecord) -> Result<(), StorageError> {
        self.guard(&self.modules)?
            .insert(record.package_name.clone(), record.clone());
        Ok(())
    }

    fn set_module_status(
        &self,
        package: &str,
        status: ModuleStatus,
    ) -> Result<bool, StorageError> {
        match self.guard(&self.modules)?.get_mut(package) {
            Some(record) => {
                record.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_module(&self, package: &str) -> Result<bool, StorageError> {
        Ok(self.guard(&self.modules)?.remove(package).is_some())
    }

    fn list_modules(&self) -> Result<Vec<ModuleRecord>, StorageError> {
        Ok(self.guard(&self.modules)?.values().cloned().collect())
    }
}

impl<T: Sample> SampleSink<T> for MemoryStore {
    fn bulk_insert(&self, producer: &str, batch: &[T]) -> Result<usize, StorageError> {
        let mut payloads = Vec::with_capacity(batch.len());
        for sample in batch {
            let payload = serde_json::to_value(sample)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            payloads.push((sample.timestamp().timestamp_millis(), payload));
        }

        let mut samples = self.guard(&self.samples)?;
        samples.extend(payloads.into_iter().map(|(timestamp, payload)| StoredSample {
            seq: self.last_seq.fetch_add(1, Ordering::SeqCst) + 1,
            producer: producer.to_string(),
            timestamp,
            payload,
        }));
        drop(samples);
        self.guard(&self.batches)?
            .push((producer.to_string(), batch.len()));
        Ok(batch.len())
    }
}

impl DataMaintenance for MemoryStore {
    fn clear_producer(&self, producer: &str) -> Result<usize, StorageError> {
        let mut samples = self.guard(&self.samples)?;
        let before = samples.len();
        samples.retain(|s| s.producer != producer);
        Ok(before - samples.len())
    }

    fn clear_through(&self, producer: &str, seq: i64) -> Result<usize, StorageError> {
        let mut samples = self.guard(&self.samples)?;
        let before = samples.len();
        samples.retain(|s| s.producer != producer || s.seq > seq);
        Ok(before - samples.len())
    }
}

impl SampleReader for MemoryStore {
    fn producers(&self) -> Result<Vec<String>, StorageError> {
        let samples = self.guard(&self.samples)?;
        let mut producers: Vec<String> = samples.iter().map(|s| s.producer.clone()).collect();
        producers.sort();
        producers.dedup();
        Ok(producers)
    }

    fn samples_after(
        &self,
        producer: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredSample>, StorageError> {
        let samples = self.guard(&self.samples)?;
        Ok(samples
            .iter()
            .filter(|s| s.producer == producer && s.seq > after_seq)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_fault_fails_every_table() {
        let store = MemoryStore::new();
        store.upsert_setting("k", "global", "v").unwrap();

        store.set_failing(true);
        assert!(matches!(
            store.read_setting("k", "global"),
            Err(StorageError::Unavailable(_))
        ));
        assert!(store.list_schedules().is_err());
        assert!(store.list_modules().is_err());

        store.set_failing(false);
        assert_eq!(store.read_setting("k", "global").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_delete_owned_by_only_touches_owner() {
        use crate::scheduler::{Action, Trigger};

        let store = MemoryStore::new();
        let mine = ScheduleEntry::new("a", Trigger::daily(), Action::broadcast("x"))
            .owned_by("org.example.plugin");
        let other = ScheduleEntry::new("b", Trigger::daily(), Action::broadcast("y"));
        store.upsert_schedule(&mine).unwrap();
        store.upsert_schedule(&other).unwrap();

        assert_eq!(store.delete_owned_by("org.example.plugin").unwrap(), 1);
        let left = store.list_schedules().unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "b");
    }
}
