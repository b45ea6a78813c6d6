//! SQLite-backed store.
//!
//! One connection behind a mutex serves all four tables. Timestamps are
//! epoch milliseconds; triggers, actions and manifests are JSON text.

use super::{
    DataMaintenance, ModuleTable, SampleReader, SampleSink, ScheduleTable, SettingsTable,
    StorageError, StoredSample,
};
use crate::buffer::Sample;
use crate::lifecycle::{InstallKind, ModuleRecord, ModuleStatus};
use crate::scheduler::ScheduleEntry;
use crate::settings::Setting;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS settings (
    key TEXT NOT NULL,
    scope TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (key, scope)
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    trigger_json TEXT NOT NULL,
    action_json TEXT NOT NULL,
    last_triggered INTEGER,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_owner ON schedules(owner);

CREATE TABLE IF NOT EXISTS modules (
    package_name TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    version INTEGER NOT NULL,
    status TEXT NOT NULL,
    install_kind TEXT NOT NULL,
    manifest_json TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    producer TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_samples_producer_id ON samples(producer, id);
"#;

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// SQLite store for settings, schedules, modules and samples.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::Unavailable("connection lock poisoned".to_string()))?;
        f(&mut conn)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

type RawSchedule = (String, String, String, String, Option<i64>);

fn decode_schedule(raw: RawSchedule) -> Result<ScheduleEntry, StorageError> {
    let (id, owner, trigger_json, action_json, last) = raw;
    let trigger = serde_json::from_str(&trigger_json)
        .map_err(|e| StorageError::Corrupt(format!("schedule {id} trigger: {e}")))?;
    let action = serde_json::from_str(&action_json)
        .map_err(|e| StorageError::Corrupt(format!("schedule {id} action: {e}")))?;
    Ok(ScheduleEntry {
        id,
        owner,
        trigger,
        action,
        last_triggered: last.and_then(from_ms),
    })
}

type RawModule = (String, String, u32, String, String, String);

fn decode_module(raw: RawModule) -> Result<ModuleRecord, StorageError> {
    let (package_name, display_name, version, status, kind, manifest_json) = raw;
    let status = ModuleStatus::parse(&status).ok_or_else(|| {
        StorageError::Corrupt(format!("module {package_name} status '{status}'"))
    })?;
    let kind = InstallKind::parse(&kind)
        .ok_or_else(|| StorageError::Corrupt(format!("module {package_name} kind '{kind}'")))?;
    let manifest = serde_json::from_str(&manifest_json)
        .map_err(|e| StorageError::Corrupt(format!("module {package_name} manifest: {e}")))?;
    Ok(ModuleRecord {
        package_name,
        display_name,
        version,
        status,
        kind,
        manifest,
    })
}

impl SettingsTable for SqliteStore {
    fn read_setting(&self, key: &str, scope: &str) -> Result<Option<String>, StorageError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1 AND scope = ?2",
                    params![key, scope],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn upsert_setting(&self, key: &str, scope: &str, value: &str) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, scope, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key, scope) DO UPDATE SET value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, scope, value, now_ms()],
            )?;
            Ok(())
        })
    }

    fn set_if_empty(&self, key: &str, scope: &str, value: &str) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO settings (key, scope, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key, scope) DO UPDATE SET value = excluded.value,
                     updated_at = excluded.updated_at
                 WHERE settings.value = ''",
                params![key, scope, value, now_ms()],
            )?;
            Ok(changed == 1)
        })
    }

    fn delete_scope(&self, scope: &str) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM settings WHERE scope = ?1", params![scope])?)
        })
    }

    fn delete_all_settings(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM settings", [])?))
    }

    fn list_settings(&self) -> Result<Vec<Setting>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, scope, value FROM settings ORDER BY scope, key")?;
            let rows = stmt.query_map([], |row| {
                Ok(Setting {
                    key: row.get(0)?,
                    scope: row.get(1)?,
                    value: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

impl ScheduleTable for SqliteStore {
    fn read_schedule(&self, id: &str) -> Result<Option<ScheduleEntry>, StorageError> {
        let raw: Option<RawSchedule> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, owner, trigger_json, action_json, last_triggered
                     FROM schedules WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?)
        })?;
        raw.map(decode_schedule).transpose()
    }

    fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<(), StorageError> {
        let trigger = serde_json::to_string(&entry.trigger)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let action = serde_json::to_string(&entry.action)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let last = entry.last_triggered.map(|t| t.timestamp_millis());
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO schedules (id, owner, trigger_json, action_json, last_triggered, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET owner = excluded.owner,
                     trigger_json = excluded.trigger_json,
                     action_json = excluded.action_json,
                     last_triggered = excluded.last_triggered,
                     updated_at = excluded.updated_at",
                params![entry.id, entry.owner, trigger, action, last, now_ms()],
            )?;
            Ok(())
        })
    }

    fn mark_triggered(&self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE schedules SET last_triggered = ?2 WHERE id = ?1",
                params![id, at.timestamp_millis()],
            )?;
            Ok(())
        })
    }

    fn delete_schedule(&self, id: &str) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])? > 0)
        })
    }

    fn delete_owned_by(&self, owner: &str) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM schedules WHERE owner = ?1", params![owner])?)
        })
    }

    fn delete_all_schedules(&self) -> Result<usize, StorageError> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM schedules", [])?))
    }

    fn list_schedules(&self) -> Result<Vec<ScheduleEntry>, StorageError> {
        let raws: Vec<RawSchedule> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner, trigger_json, action_json, last_triggered
                 FROM schedules ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            match decode_schedule(raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping undecodable schedule"),
            }
        }
        Ok(entries)
    }
}

impl ModuleTable for SqliteStore {
    fn read_module(&self, package: &str) -> Result<Option<ModuleRecord>, StorageError> {
        let raw: Option<RawModule> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT package_name, display_name, version, status, install_kind, manifest_json
                     FROM modules WHERE package_name = ?1",
                    params![package],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        raw.map(decode_module).transpose()
    }

    fn upsert_module(&self, record: &ModuleRecord) -> Result<(), StorageError> {
        let manifest = serde_json::to_string(&record.manifest)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO modules (package_name, display_name, version, status, install_kind,
                     manifest_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(package_name) DO UPDATE SET display_name = excluded.display_name,
                     version = excluded.version,
                     status = excluded.status,
                     install_kind = excluded.install_kind,
                     manifest_json = excluded.manifest_json,
                     updated_at = excluded.updated_at",
                params![
                    record.package_name,
                    record.display_name,
                    record.version,
                    record.status.as_str(),
                    record.kind.as_str(),
                    manifest,
                    now_ms()
                ],
            )?;
            Ok(())
        })
    }

    fn set_module_status(
        &self,
        package: &str,
        status: ModuleStatus,
    ) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE modules SET status = ?2, updated_at = ?3 WHERE package_name = ?1",
                params![package, status.as_str(), now_ms()],
            )? > 0)
        })
    }

    fn delete_module(&self, package: &str) -> Result<bool, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM modules WHERE package_name = ?1",
                params![package],
            )? > 0)
        })
    }

    fn list_modules(&self) -> Result<Vec<ModuleRecord>, StorageError> {
        let raws: Vec<RawModule> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT package_name, display_name, version, status, install_kind, manifest_json
                 FROM modules ORDER BY package_name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        let mut records = Vec::with_capacity(raws.len());
        for raw in raws {
            match decode_module(raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping undecodable module record"),
            }
        }
        Ok(records)
    }
}

impl<T: Sample> SampleSink<T> for SqliteStore {
    fn bulk_insert(&self, producer: &str, batch: &[T]) -> Result<usize, StorageError> {
        let mut rows = Vec::with_capacity(batch.len());
        for sample in batch {
            let payload = serde_json::to_string(sample)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            rows.push((sample.timestamp().timestamp_millis(), payload));
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO samples (producer, timestamp, payload) VALUES (?1, ?2, ?3)",
                )?;
                for (timestamp, payload) in &rows {
                    stmt.execute(params![producer, timestamp, payload])?;
                }
            }
            tx.commit()?;
            Ok(rows.len())
        })
    }
}

impl DataMaintenance for SqliteStore {
    fn clear_producer(&self, producer: &str) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM samples WHERE producer = ?1", params![producer])?)
        })
    }

    fn clear_through(&self, producer: &str, seq: i64) -> Result<usize, StorageError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM samples WHERE producer = ?1 AND id <= ?2",
                params![producer, seq],
            )?)
        })
    }
}

impl SampleReader for SqliteStore {
    fn producers(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT producer FROM samples ORDER BY producer")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    fn samples_after(
        &self,
        producer: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredSample>, StorageError> {
        let raws: Vec<(i64, i64, String)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, payload FROM samples
                 WHERE producer = ?1 AND id > ?2
                 ORDER BY id LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![producer, after_seq, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        raws.into_iter()
            .map(|(seq, timestamp, payload)| {
                let payload = serde_json::from_str(&payload)
                    .map_err(|e| StorageError::Corrupt(format!("sample payload: {e}")))?;
                Ok(StoredSample {
                    seq,
                    producer: producer.to_string(),
                    timestamp,
                    payload,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::CapabilityManifest;
    use crate::scheduler::{Action, Trigger};
    use crate::sensors::PressureSample;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_settings_upsert_and_scope_delete() {
        let store = store();
        store.upsert_setting("status_barometer", "global", "true").unwrap();
        store.upsert_setting("status_barometer", "global", "false").unwrap();
        store.upsert_setting("frequency", "org.example.plugin", "5").unwrap();

        assert_eq!(
            store.read_setting("status_barometer", "global").unwrap(),
            Some("false".to_string())
        );
        assert_eq!(store.list_settings().unwrap().len(), 2);

        assert_eq!(store.delete_scope("org.example.plugin").unwrap(), 1);
        assert_eq!(store.read_setting("frequency", "org.example.plugin").unwrap(), None);
    }

    #[test]
    fn test_set_if_empty_only_fills_blank_rows() {
        let store = store();
        assert!(store.set_if_empty("device_id", "global", "first").unwrap());
        assert!(!store.set_if_empty("device_id", "global", "second").unwrap());
        assert_eq!(
            store.read_setting("device_id", "global").unwrap(),
            Some("first".to_string())
        );

        store.upsert_setting("device_label", "global", "").unwrap();
        assert!(store.set_if_empty("device_label", "global", "laptop").unwrap());
    }

    #[test]
    fn test_schedule_roundtrip_keeps_last_triggered() {
        let store = store();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut entry = ScheduleEntry::new(
            "schedule_sync_data",
            Trigger::every_minutes(30),
            Action::broadcast("sync_data"),
        );
        entry.last_triggered = Some(at);
        store.upsert_schedule(&entry).unwrap();

        let loaded = store.read_schedule("schedule_sync_data").unwrap().unwrap();
        assert_eq!(loaded, entry);

        let later = at + chrono::Duration::minutes(30);
        store.mark_triggered("schedule_sync_data", later).unwrap();
        let loaded = store.read_schedule("schedule_sync_data").unwrap().unwrap();
        assert_eq!(loaded.last_triggered, Some(later));
    }

    #[test]
    fn test_list_schedules_skips_corrupt_rows() {
        let store = store();
        store
            .upsert_schedule(&ScheduleEntry::new(
                "ok",
                Trigger::daily(),
                Action::broadcast("x"),
            ))
            .unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO schedules (id, owner, trigger_json, action_json, updated_at)
                     VALUES ('bad', 'global', 'not json', '{}', 0)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let entries = store.list_schedules().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "ok");
    }

    #[test]
    fn test_module_status_update() {
        let store = store();
        let record = ModuleRecord {
            package_name: "org.example.plugin.steps".to_string(),
            display_name: "Steps".to_string(),
            version: 3,
            status: ModuleStatus::On,
            kind: InstallKind::Installed,
            manifest: CapabilityManifest::default(),
        };
        store.upsert_module(&record).unwrap();
        assert!(store
            .set_module_status(&record.package_name, ModuleStatus::PendingUpdate)
            .unwrap());
        assert!(!store.set_module_status("missing", ModuleStatus::Off).unwrap());

        let loaded = store.read_module(&record.package_name).unwrap().unwrap();
        assert_eq!(loaded.status, ModuleStatus::PendingUpdate);
        assert_eq!(loaded.version, 3);
    }

    fn pressure(at: DateTime<Utc>, hpa: f64) -> PressureSample {
        PressureSample {
            timestamp: at,
            device_id: "dev".to_string(),
            pressure_hpa: hpa,
            accuracy: 3,
        }
    }

    #[test]
    fn test_samples_bulk_insert_and_read_after() {
        let store = store();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let batch: Vec<PressureSample> = (0..5)
            .map(|i| pressure(base + chrono::Duration::seconds(i), 1013.0 + i as f64))
            .collect();

        assert_eq!(store.bulk_insert("barometer", &batch).unwrap(), 5);
        assert_eq!(store.producers().unwrap(), vec!["barometer".to_string()]);

        let all = store.samples_after("barometer", 0, 10).unwrap();
        assert_eq!(all.len(), 5);
        let rows = store.samples_after("barometer", all[1].seq, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].payload["pressure_hpa"], 1015.0);

        assert_eq!(store.clear_producer("barometer").unwrap(), 5);
        assert!(store.producers().unwrap().is_empty());
    }

    #[test]
    fn test_equal_timestamps_page_without_gaps() {
        let store = store();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let batch = vec![pressure(at, 1.0), pressure(at, 2.0), pressure(at, 3.0)];
        store.bulk_insert("barometer", &batch).unwrap();

        let first = store.samples_after("barometer", 0, 2).unwrap();
        let rest = store.samples_after("barometer", first[1].seq, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload["pressure_hpa"], 3.0);
    }

    #[test]
    fn test_sequence_survives_clear() {
        let store = store();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.bulk_insert("barometer", &[pressure(at, 1.0)]).unwrap();
        let before = store.samples_after("barometer", 0, 1).unwrap()[0].seq;

        store.clear_producer("barometer").unwrap();
        store.bulk_insert("barometer", &[pressure(at, 2.0)]).unwrap();
        let after = store.samples_after("barometer", 0, 1).unwrap()[0].seq;
        assert!(after > before);
    }

    #[test]
    fn test_clear_through_keeps_later_samples() {
        let store = store();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store
            .bulk_insert("barometer", &[pressure(at, 1.0), pressure(at, 2.0)])
            .unwrap();
        let uploaded = store.samples_after("barometer", 0, 10).unwrap();
        store.bulk_insert("barometer", &[pressure(at, 3.0)]).unwrap();

        let through = uploaded[1].seq;
        assert_eq!(store.clear_through("barometer", through).unwrap(), 2);
        let left = store.samples_after("barometer", 0, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload["pressure_hpa"], 3.0);
    }
}
