//! Built-in module catalog.
//!
//! Maps every built-in module to the status flags that enable it. Most
//! modules have one flag; compound modules run while any of theirs is on.

use crate::settings::keys::*;
use crate::settings::SettingsStore;
use std::collections::BTreeMap;

/// A built-in sensing module and the flags that enable it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinModule {
    pub id: &'static str,
    pub flags: &'static [&'static str],
}

const BUILTINS: &[BuiltinModule] = &[
    BuiltinModule { id: "accelerometer", flags: &[STATUS_ACCELEROMETER] },
    BuiltinModule { id: "applications", flags: &[STATUS_APPLICATIONS] },
    BuiltinModule { id: "barometer", flags: &[STATUS_BAROMETER] },
    BuiltinModule { id: "battery", flags: &[STATUS_BATTERY] },
    BuiltinModule { id: "bluetooth", flags: &[STATUS_BLUETOOTH] },
    BuiltinModule {
        id: "communication",
        flags: &[STATUS_COMMUNICATION_EVENTS, STATUS_CALLS, STATUS_MESSAGES],
    },
    BuiltinModule { id: "esm", flags: &[STATUS_ESM] },
    BuiltinModule { id: "gravity", flags: &[STATUS_GRAVITY] },
    BuiltinModule { id: "gyroscope", flags: &[STATUS_GYROSCOPE] },
    BuiltinModule { id: "installations", flags: &[STATUS_INSTALLATIONS] },
    BuiltinModule { id: "keyboard", flags: &[STATUS_KEYBOARD] },
    BuiltinModule { id: "light", flags: &[STATUS_LIGHT] },
    BuiltinModule { id: "linear_accelerometer", flags: &[STATUS_LINEAR_ACCELEROMETER] },
    BuiltinModule {
        id: "locations",
        flags: &[STATUS_LOCATION_GPS, STATUS_LOCATION_NETWORK],
    },
    BuiltinModule { id: "magnetometer", flags: &[STATUS_MAGNETOMETER] },
    BuiltinModule { id: "mqtt", flags: &[STATUS_MQTT] },
    BuiltinModule { id: "network", flags: &[STATUS_NETWORK_EVENTS] },
    BuiltinModule { id: "processor", flags: &[STATUS_PROCESSOR] },
    BuiltinModule { id: "proximity", flags: &[STATUS_PROXIMITY] },
    BuiltinModule { id: "rotation", flags: &[STATUS_ROTATION] },
    BuiltinModule { id: "screen", flags: &[STATUS_SCREEN] },
    BuiltinModule { id: "telephony", flags: &[STATUS_TELEPHONY] },
    BuiltinModule { id: "temperature", flags: &[STATUS_TEMPERATURE] },
    BuiltinModule { id: "timezone", flags: &[STATUS_TIMEZONE] },
    BuiltinModule { id: "traffic", flags: &[STATUS_NETWORK_TRAFFIC] },
    BuiltinModule { id: "wifi", flags: &[STATUS_WIFI] },
];

/// Set of built-in modules known to the lifecycle manager.
#[derive(Debug, Clone)]
pub struct Catalog {
    modules: Vec<BuiltinModule>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// The standard built-in catalog.
    pub fn builtin() -> Self {
        Self {
            modules: BUILTINS.to_vec(),
        }
    }

    pub fn from_modules(modules: Vec<BuiltinModule>) -> Self {
        Self { modules }
    }

    pub fn modules(&self) -> &[BuiltinModule] {
        &self.modules
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.iter().map(|m| m.id)
    }

    pub fn flags_for(&self, id: &str) -> &[&'static str] {
        self.modules
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.flags)
            .unwrap_or(&[])
    }

    /// Whether any flag of `id` is currently on.
    pub fn is_desired(&self, id: &str, settings: &SettingsStore) -> bool {
        self.flags_for(id)
            .iter()
            .any(|flag| settings.get_bool(flag, None))
    }

    /// Desired on/off state of every built-in module.
    pub fn desired_states(&self, settings: &SettingsStore) -> BTreeMap<String, bool> {
        self.modules
            .iter()
            .map(|m| (m.id.to_string(), self.is_desired(m.id, settings)))
            .collect()
    }
}
