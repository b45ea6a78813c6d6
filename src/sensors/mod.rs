//! Built-in sensing modules.
//!
//! Each module is a [`SensorProducer`] driving one [`SampleSource`] through
//! its own sample buffer. The [`SensorRuntime`] hosts them for the lifecycle
//! manager.

pub mod location;
pub mod noop;
pub mod producer;
pub mod runtime;
pub mod timezone;
pub mod types;

pub use location::{BestFixSource, FixSelection};
pub use noop::NoopSource;
pub use producer::{ProducerOptions, SampleSource, SensorModule, SensorProducer};
pub use runtime::SensorRuntime;
pub use timezone::{host_timezone, TimezoneSource, DEFAULT_TIMEZONE_PERIOD};
pub use types::{LocationFix, MotionSample, PressureSample, TemperatureSample, TimezoneSample};

use crate::storage::SampleSink;
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;

/// Everything the built-in producers need from the host.
#[derive(Clone)]
pub struct SensorSetup {
    pub device_id: String,
    pub timezone: Tz,
    pub timezone_period: Duration,
    pub location: FixSelection,
    pub options: ProducerOptions,
}

/// Storage that accepts every built-in sample type.
pub trait SensorSink:
    SampleSink<PressureSample>
    + SampleSink<MotionSample>
    + SampleSink<TemperatureSample>
    + SampleSink<TimezoneSample>
    + SampleSink<LocationFix>
    + 'static
{
}

impl<K> SensorSink for K where
    K: SampleSink<PressureSample>
        + SampleSink<MotionSample>
        + SampleSink<TemperatureSample>
        + SampleSink<TimezoneSample>
        + SampleSink<LocationFix>
        + 'static
{
}

/// Runtime with the producers this host can serve.
///
/// Timezone is read from the host; motion, environment and location
/// hardware is reported absent.
pub fn builtin_runtime<K: SensorSink>(sink: Arc<K>, setup: SensorSetup) -> SensorRuntime {
    let tz_sink: Arc<dyn SampleSink<TimezoneSample>> = sink.clone();
    let pressure_sink: Arc<dyn SampleSink<PressureSample>> = sink.clone();
    let motion_sink: Arc<dyn SampleSink<MotionSample>> = sink.clone();
    let temperature_sink: Arc<dyn SampleSink<TemperatureSample>> = sink.clone();
    let location_sink: Arc<dyn SampleSink<LocationFix>> = sink;

    let tz_setup = setup.clone();
    let options = setup.options.clone();
    let gyro_options = setup.options.clone();
    let temperature_options = setup.options.clone();
    let location_options = setup.options.clone();
    let selection = setup.location.clone();
    let accel_sink = motion_sink.clone();
    let accel_options = setup.options;

    SensorRuntime::new()
        .register("timezone", move || {
            let source = TimezoneSource::new(
                tz_setup.device_id.clone(),
                tz_setup.timezone,
                tz_setup.timezone_period,
            );
            Box::new(SensorProducer::new(
                "timezone",
                source,
                tz_sink.clone(),
                tz_setup.options.clone(),
            ))
        })
        .register("barometer", move || {
            Box::new(SensorProducer::new(
                "barometer",
                NoopSource::<PressureSample>::new("barometer"),
                pressure_sink.clone(),
                options.clone(),
            ))
        })
        .register("gyroscope", move || {
            Box::new(SensorProducer::new(
                "gyroscope",
                NoopSource::<MotionSample>::new("gyroscope"),
                motion_sink.clone(),
                gyro_options.clone(),
            ))
        })
        .register("accelerometer", move || {
            Box::new(SensorProducer::new(
                "accelerometer",
                NoopSource::<MotionSample>::new("accelerometer"),
                accel_sink.clone(),
                accel_options.clone(),
            ))
        })
        .register("temperature", move || {
            Box::new(SensorProducer::new(
                "temperature",
                NoopSource::<TemperatureSample>::new("temperature"),
                temperature_sink.clone(),
                temperature_options.clone(),
            ))
        })
        .register("locations", move || {
            let source =
                BestFixSource::new(NoopSource::<LocationFix>::new("locations"), selection.clone());
            Box::new(SensorProducer::new(
                "locations",
                source,
                location_sink.clone(),
                location_options.clone(),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Notification, NotificationBus, Topic};
    use crate::lifecycle::{LaunchError, ModuleRuntime};
    use crate::storage::MemoryStore;

    fn setup() -> SensorSetup {
        SensorSetup {
            device_id: "dev".to_string(),
            timezone: Tz::UTC,
            timezone_period: DEFAULT_TIMEZONE_PERIOD,
            location: FixSelection::default(),
            options: ProducerOptions::default(),
        }
    }

    #[test]
    fn test_builtin_runtime_serves_timezone() {
        let store = Arc::new(MemoryStore::new());
        let bus = NotificationBus::new();
        let samples = bus.subscribe(&[Topic::Samples]);
        let mut setup = setup();
        setup.options.bus = Some(bus);
        let runtime = builtin_runtime(store.clone(), setup);

        runtime.start("timezone").unwrap();
        assert!(runtime.is_active("timezone"));
        match samples.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
            Notification::Sample { producer, data } => {
                assert_eq!(producer, "timezone");
                assert_eq!(data["device_id"], "dev");
            }
            other => panic!("unexpected notification {other:?}"),
        }
        assert_eq!(runtime.stop("timezone"), Ok(true));
        assert_eq!(store.batch_sizes("timezone"), vec![1]);
    }

    #[test]
    fn test_running_module_follows_debug_db_slow() {
        use crate::settings::{keys, SettingsStore};

        let store = Arc::new(MemoryStore::new());
        let bus = NotificationBus::new();
        let samples = bus.subscribe(&[Topic::Samples]);
        let settings = SettingsStore::new(store.clone(), NotificationBus::new());
        let mut setup = setup();
        setup.options.bus = Some(bus);
        setup.options.settings = Some(settings.clone());
        let runtime = builtin_runtime(store.clone(), setup);
        let timeout = std::time::Duration::from_secs(5);

        runtime.start("timezone").unwrap();
        samples.recv_timeout(timeout).unwrap();
        settings.set(keys::DEBUG_DB_SLOW, "true", None);
        assert_eq!(runtime.stop("timezone"), Ok(true));
        assert!(store.batch_sizes("timezone").is_empty());

        runtime.start("timezone").unwrap();
        samples.recv_timeout(timeout).unwrap();
        settings.set(keys::DEBUG_DB_SLOW, "false", None);
        assert_eq!(runtime.stop("timezone"), Ok(true));
        assert_eq!(store.batch_sizes("timezone"), vec![1]);
    }

    #[test]
    fn test_builtin_runtime_reports_absent_hardware() {
        let runtime = builtin_runtime(Arc::new(MemoryStore::new()), setup());
        for id in ["barometer", "gyroscope", "accelerometer", "temperature", "locations"] {
            assert!(matches!(runtime.start(id), Err(LaunchError::HardwareAbsent(_))));
        }
        assert_eq!(runtime.start("wifi"), Err(LaunchError::NotFound));
    }
}
