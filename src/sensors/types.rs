//! Sample types produced by the built-in sensors.

use crate::buffer::Sample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ambient air pressure reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSample {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    /// Pressure in hPa (mbar)
    pub pressure_hpa: f64,
    /// Sensor-reported accuracy bucket
    pub accuracy: i32,
}

/// Three-axis motion reading (accelerometer, gyroscope, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub accuracy: i32,
}

/// Ambient temperature reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    /// Degrees Celsius
    pub celsius: f64,
    pub accuracy: i32,
}

/// The device's current IANA timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimezoneSample {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub timezone: String,
}

/// A position fix from one location provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters; smaller is better
    pub accuracy_m: f32,
    pub altitude: Option<f64>,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    /// Provider name, e.g. "gps" or "network"
    pub provider: String,
}

macro_rules! impl_sample {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Sample for $ty {
                fn timestamp(&self) -> DateTime<Utc> {
                    self.timestamp
                }
            }
        )*
    };
}

impl_sample!(
    PressureSample,
    MotionSample,
    TemperatureSample,
    TimezoneSample,
    LocationFix,
);
