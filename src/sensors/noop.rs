//! Placeholder source for sensors this host cannot read.
//!
//! Desktop and server hosts usually lack barometers, gyroscopes and the
//! like. Registering a noop source keeps the module addressable while
//! reporting the hardware as absent, so its status flag gets switched off.

use super::producer::SampleSource;
use crate::buffer::Sample;
use crate::lifecycle::LaunchError;
use std::marker::PhantomData;
use std::time::Duration;

/// A source that never opens.
pub struct NoopSource<T> {
    sensor: String,
    _sample: PhantomData<fn() -> T>,
}

impl<T> NoopSource<T> {
    pub fn new(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            _sample: PhantomData,
        }
    }
}

impl<T: Sample> SampleSource for NoopSource<T> {
    type Sample = T;

    fn open(&mut self) -> Result<(), LaunchError> {
        Err(LaunchError::HardwareAbsent(self.sensor.clone()))
    }

    fn poll(&mut self, timeout: Duration) -> Option<T> {
        std::thread::sleep(timeout);
        None
    }
}
