//! Generic producer worker.
//!
//! A producer owns one acquisition source and one sample buffer. While
//! running, a dedicated thread polls the source and pushes every sample into
//! the buffer; stopping joins the thread after the buffer is flushed.

use crate::buffer::{BufferConfig, Sample, SampleBuffer};
use crate::bus::NotificationBus;
use crate::lifecycle::LaunchError;
use crate::settings::SettingsStore;
use crate::storage::SampleSink;
use crate::transparency::SharedTransparencyLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Acquisition side of a sensor.
pub trait SampleSource: Send + 'static {
    type Sample: Sample;

    /// Acquire the underlying device. Fails with
    /// [`LaunchError::HardwareAbsent`] when the host has no such sensor.
    fn open(&mut self) -> Result<(), LaunchError>;

    /// Wait up to `timeout` for the next sample.
    fn poll(&mut self, timeout: Duration) -> Option<Self::Sample>;

    /// Release the underlying device.
    fn close(&mut self) {}
}

/// A startable, stoppable sensing module.
pub trait SensorModule: Send {
    fn start(&mut self) -> Result<(), LaunchError>;
    /// Stop and wait until the module released its resources.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

/// Shared plumbing handed to each producer.
#[derive(Clone, Default)]
pub struct ProducerOptions {
    pub buffer: BufferConfig,
    pub bus: Option<NotificationBus>,
    pub transparency: Option<SharedTransparencyLog>,
    /// Longest time the worker waits on the source before re-checking for stop.
    pub poll_timeout: Option<Duration>,
    /// Source of `debug_db_slow`, read at every flush
    pub settings: Option<SettingsStore>,
}

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Runs a [`SampleSource`] on its own thread.
pub struct SensorProducer<S: SampleSource> {
    name: String,
    source: Option<S>,
    sink: Arc<dyn SampleSink<S::Sample>>,
    options: ProducerOptions,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<S>>,
}

impl<S: SampleSource> SensorProducer<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        sink: Arc<dyn SampleSink<S::Sample>>,
        options: ProducerOptions,
    ) -> Self {
        Self {
            name: name.into(),
            source: Some(source),
            sink,
            options,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn make_buffer(&self) -> SampleBuffer<S::Sample> {
        let mut buffer =
            SampleBuffer::new(self.name.clone(), self.options.buffer.clone(), self.sink.clone());
        if let Some(bus) = &self.options.bus {
            buffer = buffer.with_bus(bus.clone());
        }
        if let Some(log) = &self.options.transparency {
            buffer = buffer.with_transparency(log.clone());
        }
        if let Some(settings) = &self.options.settings {
            buffer = buffer.with_settings(settings.clone());
        }
        buffer
    }
}

impl<S: SampleSource> SensorModule for SensorProducer<S> {
    fn start(&mut self) -> Result<(), LaunchError> {
        if self.is_running() {
            return Ok(());
        }

        let mut source = self
            .source
            .take()
            .ok_or_else(|| LaunchError::Failed(format!("{} source was lost", self.name)))?;
        if let Err(e) = source.open() {
            self.source = Some(source);
            return Err(e);
        }

        let mut buffer = self.make_buffer();
        let running = self.running.clone();
        let timeout = self.options.poll_timeout.unwrap_or(DEFAULT_POLL_TIMEOUT);
        let name = self.name.clone();
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name(format!("sensor-{name}"))
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Some(sample) = source.poll(timeout) {
                        buffer.push(sample);
                    }
                }
                buffer.flush();
                buffer.close();
                source.close();
                debug!(producer = %name, "producer worker exited");
                source
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                LaunchError::Failed(format!("could not spawn worker: {e}"))
            })?;

        self.handle = Some(handle);
        info!(producer = %self.name, "producer started");
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(source) => self.source = Some(source),
                Err(_) => warn!(producer = %self.name, "producer worker panicked"),
            }
            info!(producer = %self.name, "producer stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.handle.is_some()
    }
}

impl<S: SampleSource> Drop for SensorProducer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
