//! Scoped key/value configuration store.

use super::keys::{self, resolve_scope};
use crate::bus::{Notification, NotificationBus};
use crate::storage::SettingsTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One persisted setting row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub scope: String,
    pub value: String,
}

/// Read/write front for the settings table.
///
/// Storage faults never reach callers: reads degrade to the empty string and
/// writes to a no-op, both logged.
#[derive(Clone)]
pub struct SettingsStore {
    table: Arc<dyn SettingsTable>,
    bus: NotificationBus,
}

impl SettingsStore {
    pub fn new(table: Arc<dyn SettingsTable>, bus: NotificationBus) -> Self {
        Self { table, bus }
    }

    /// Value of `key`, or the empty string when unset.
    pub fn get(&self, key: &str, scope: Option<&str>) -> String {
        let scope = resolve_scope(key, scope);
        match self.table.read_setting(key, scope) {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => {
                warn!(key, scope, error = %e, "setting read failed");
                String::new()
            }
        }
    }

    /// Write `value`. Returns true only when the stored value changed.
    pub fn set(&self, key: &str, value: &str, scope: Option<&str>) -> bool {
        let scope = resolve_scope(key, scope);
        let current = match self.table.read_setting(key, scope) {
            Ok(current) => current,
            Err(e) => {
                warn!(key, scope, error = %e, "setting read failed, write skipped");
                return false;
            }
        };

        if current.as_deref() == Some(value) {
            return false;
        }
        if keys::is_write_once(key) {
            match self.table.set_if_empty(key, scope, value) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(key, "ignoring write to write-once setting");
                    return false;
                }
                Err(e) => {
                    warn!(key, scope, error = %e, "setting write failed");
                    return false;
                }
            }
        } else if let Err(e) = self.table.upsert_setting(key, scope, value) {
            warn!(key, scope, error = %e, "setting write failed");
            return false;
        }

        debug!(key, scope, value, "setting changed");
        self.bus.publish(Notification::SettingChanged {
            key: key.to_string(),
            scope: scope.to_string(),
        });
        true
    }

    /// `true` only for the literal value `"true"`.
    pub fn get_bool(&self, key: &str, scope: Option<&str>) -> bool {
        self.get(key, scope) == "true"
    }

    pub fn get_u64(&self, key: &str, scope: Option<&str>) -> Option<u64> {
        self.get(key, scope).trim().parse().ok()
    }

    /// Write `value` only when `key` is currently empty.
    pub fn set_default(&self, key: &str, value: &str, scope: Option<&str>) -> bool {
        if self.get(key, scope).is_empty() {
            self.set(key, value, scope)
        } else {
            false
        }
    }

    /// Delete every setting in `scope`.
    pub fn purge_scope(&self, scope: &str) -> usize {
        match self.table.delete_scope(scope) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(scope, error = %e, "failed to purge settings scope");
                0
            }
        }
    }

    pub fn list(&self) -> Vec<Setting> {
        self.table.list_settings().unwrap_or_else(|e| {
            warn!(error = %e, "failed to list settings");
            Vec::new()
        })
    }

    /// Fill in framework defaults that are still empty.
    pub fn seed_defaults(&self) {
        self.set_default(keys::DEVICE_ID, &uuid::Uuid::new_v4().to_string(), None);
        let label = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        self.set_default(keys::DEVICE_LABEL, &label, None);

        self.set_default(keys::DEBUG_FLAG, "false", None);
        self.set_default(keys::DEBUG_TAG, "ContextSensor", None);
        self.set_default(keys::DEBUG_DB_SLOW, "false", None);
        self.set_default(keys::STATUS_WEBSERVICE, "false", None);
        self.set_default(keys::FREQUENCY_WEBSERVICE, "30", None);
        self.set_default(keys::WEBSERVICE_WIFI_ONLY, "false", None);
        self.set_default(keys::WEBSERVICE_SERVER, keys::DEFAULT_WEBSERVICE_SERVER, None);
        self.set_default(keys::FREQUENCY_CLEAN_OLD_DATA, "0", None);
        self.set_default(
            keys::FREQUENCY_WATCHDOG,
            &keys::DEFAULT_WATCHDOG_SECS.to_string(),
            None,
        );
    }

    /// Drop every setting except device identity, then reseed defaults.
    pub fn reset(&self) {
        let device_id = self.get(keys::DEVICE_ID, None);
        let device_label = self.get(keys::DEVICE_LABEL, None);

        match self.table.delete_all_settings() {
            Ok(removed) => debug!(removed, "settings cleared"),
            Err(e) => warn!(error = %e, "failed to clear settings"),
        }

        if !device_id.is_empty() {
            self.set(keys::DEVICE_ID, &device_id, None);
        }
        if !device_label.is_empty() {
            self.set(keys::DEVICE_LABEL, &device_label, None);
        }
        self.seed_defaults();
    }
}
