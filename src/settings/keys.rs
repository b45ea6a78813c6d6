//! Well-known setting keys.

/// Scope identifier for framework-wide settings.
pub const GLOBAL_SCOPE: &str = "global";

pub const DEBUG_FLAG: &str = "debug_flag";
pub const DEBUG_TAG: &str = "debug_tag";
pub const DEBUG_DB_SLOW: &str = "debug_db_slow";
pub const STUDY_ID: &str = "study_id";
pub const STUDY_START: &str = "study_start";
pub const DEVICE_ID: &str = "device_id";
pub const DEVICE_LABEL: &str = "device_label";
pub const STATUS_WEBSERVICE: &str = "status_webservice";
pub const FREQUENCY_WEBSERVICE: &str = "frequency_webservice";
pub const WEBSERVICE_WIFI_ONLY: &str = "webservice_wifi_only";
pub const WEBSERVICE_SERVER: &str = "webservice_server";
pub const STATUS_APPLICATIONS: &str = "status_applications";
pub const STATUS_ACCESSIBILITY: &str = "status_accessibility";
pub const STATUS_MQTT: &str = "status_mqtt";
pub const MQTT_USERNAME: &str = "mqtt_username";
pub const MQTT_PASSWORD: &str = "mqtt_password";
pub const MQTT_SERVER: &str = "mqtt_server";
pub const MQTT_PORT: &str = "mqtt_port";
pub const MQTT_PROTOCOL: &str = "mqtt_protocol";
pub const MQTT_KEEP_ALIVE: &str = "mqtt_keep_alive";
pub const MQTT_QOS: &str = "mqtt_qos";

/// Keys that always resolve to [`GLOBAL_SCOPE`], whatever scope the caller passes.
pub const GLOBAL_KEYS: &[&str] = &[
    DEBUG_FLAG,
    DEBUG_TAG,
    DEBUG_DB_SLOW,
    STUDY_ID,
    STUDY_START,
    DEVICE_ID,
    DEVICE_LABEL,
    STATUS_WEBSERVICE,
    FREQUENCY_WEBSERVICE,
    WEBSERVICE_WIFI_ONLY,
    WEBSERVICE_SERVER,
    STATUS_APPLICATIONS,
    STATUS_ACCESSIBILITY,
    STATUS_MQTT,
    MQTT_USERNAME,
    MQTT_PASSWORD,
    MQTT_SERVER,
    MQTT_PORT,
    MQTT_PROTOCOL,
    MQTT_KEEP_ALIVE,
    MQTT_QOS,
];

/// Keys that cannot change once they hold a non-empty value.
pub const WRITE_ONCE_KEYS: &[&str] = &[DEVICE_ID, DEVICE_LABEL];

// Framework tunables (global scope by default, not forced).
pub const FREQUENCY_CLEAN_OLD_DATA: &str = "frequency_clean_old_data";
pub const FREQUENCY_WATCHDOG: &str = "frequency_watchdog";
pub const FREQUENCY_TIMEZONE: &str = "frequency_timezone";
pub const FREQUENCY_BAROMETER: &str = "frequency_barometer";
pub const FREQUENCY_ACCELEROMETER: &str = "frequency_accelerometer";
pub const FREQUENCY_TEMPERATURE: &str = "frequency_temperature";
pub const FREQUENCY_LOCATION: &str = "frequency_location";

// Built-in module flags.
pub const STATUS_ACCELEROMETER: &str = "status_accelerometer";
pub const STATUS_BAROMETER: &str = "status_barometer";
pub const STATUS_BATTERY: &str = "status_battery";
pub const STATUS_BLUETOOTH: &str = "status_bluetooth";
pub const STATUS_CALLS: &str = "status_calls";
pub const STATUS_COMMUNICATION_EVENTS: &str = "status_communication_events";
pub const STATUS_ESM: &str = "status_esm";
pub const STATUS_GRAVITY: &str = "status_gravity";
pub const STATUS_GYROSCOPE: &str = "status_gyroscope";
pub const STATUS_INSTALLATIONS: &str = "status_installations";
pub const STATUS_KEYBOARD: &str = "status_keyboard";
pub const STATUS_LIGHT: &str = "status_light";
pub const STATUS_LINEAR_ACCELEROMETER: &str = "status_linear_accelerometer";
pub const STATUS_LOCATION_GPS: &str = "status_location_gps";
pub const STATUS_LOCATION_NETWORK: &str = "status_location_network";
pub const STATUS_MAGNETOMETER: &str = "status_magnetometer";
pub const STATUS_MESSAGES: &str = "status_messages";
pub const STATUS_NETWORK_EVENTS: &str = "status_network_events";
pub const STATUS_NETWORK_TRAFFIC: &str = "status_network_traffic";
pub const STATUS_PROCESSOR: &str = "status_processor";
pub const STATUS_PROXIMITY: &str = "status_proximity";
pub const STATUS_ROTATION: &str = "status_rotation";
pub const STATUS_SCREEN: &str = "status_screen";
pub const STATUS_TELEPHONY: &str = "status_telephony";
pub const STATUS_TEMPERATURE: &str = "status_temperature";
pub const STATUS_TIMEZONE: &str = "status_timezone";
pub const STATUS_WIFI: &str = "status_wifi";

pub const DEFAULT_WEBSERVICE_SERVER: &str = "https://api.contextsense.org/index.php";
pub const DEFAULT_WATCHDOG_SECS: u64 = 300;

/// Whether `key` is forced into the global scope.
pub fn is_global(key: &str) -> bool {
    GLOBAL_KEYS.contains(&key)
}

pub fn is_write_once(key: &str) -> bool {
    WRITE_ONCE_KEYS.contains(&key)
}

/// Scope a read or write of `key` resolves to.
pub fn resolve_scope<'a>(key: &str, scope: Option<&'a str>) -> &'a str {
    match scope {
        Some(scope) if !is_global(key) && !scope.is_empty() => scope,
        _ => GLOBAL_SCOPE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scope() {
        assert_eq!(resolve_scope(DEVICE_ID, Some("org.example.plugin")), GLOBAL_SCOPE);
        assert_eq!(resolve_scope(STATUS_BAROMETER, None), GLOBAL_SCOPE);
        assert_eq!(resolve_scope("frequency", Some("org.example.plugin")), "org.example.plugin");
        assert_eq!(resolve_scope("frequency", Some("")), GLOBAL_SCOPE);
    }

    #[test]
    fn test_allow_list_is_complete() {
        assert_eq!(GLOBAL_KEYS.len(), 21);
        assert!(WRITE_ONCE_KEYS.iter().all(|k| is_global(k)));
    }
}
