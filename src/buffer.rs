//! Bounded per-producer sample buffer.
//!
//! Every raw-sensor producer owns one buffer. Each pushed sample is published
//! on the bus right away; storage only sees whole batches of `capacity`
//! samples, written inline or by a dedicated flush worker. A buffer attached
//! to the settings store checks `debug_db_slow` at every flush and discards
//! the batch while it is on.

use crate::bus::{Notification, NotificationBus, Topic};
use crate::settings::{keys, SettingsStore};
use crate::storage::SampleSink;
use crate::transparency::SharedTransparencyLog;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Default number of samples per batch.
pub const DEFAULT_BUFFER_CAPACITY: usize = 250;

/// Batches queued for the flush worker before new ones are dropped.
const FLUSH_QUEUE_DEPTH: usize = 4;

/// A sample that can be buffered and persisted.
pub trait Sample: Serialize + Clone + Send + Sync + 'static {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Where full batches are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write on the pushing thread.
    Inline,
    /// Hand batches to a worker thread so the pushing thread never waits on storage.
    Background,
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub capacity: usize,
    /// When false, full batches are discarded instead of written.
    pub write_enabled: bool,
    pub mode: FlushMode,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            write_enabled: true,
            mode: FlushMode::Background,
        }
    }
}

struct FlushWorker<T> {
    sender: Option<Sender<Vec<T>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Sample> FlushWorker<T> {
    fn spawn(
        producer: String,
        sink: Arc<dyn SampleSink<T>>,
        transparency: Option<SharedTransparencyLog>,
    ) -> Self {
        let (sender, receiver) = bounded::<Vec<T>>(FLUSH_QUEUE_DEPTH);
        let handle = thread::Builder::new()
            .name(format!("flush-{producer}"))
            .spawn(move || {
                for batch in receiver {
                    write_batch(&producer, sink.as_ref(), &batch, transparency.as_ref());
                }
            });

        match handle {
            Ok(handle) => Self {
                sender: Some(sender),
                handle: Some(handle),
            },
            Err(e) => {
                warn!(error = %e, "could not spawn flush worker, writing inline");
                Self {
                    sender: None,
                    handle: None,
                }
            }
        }
    }

    /// Queue a batch. Returns it back when the worker cannot take it.
    fn submit(&self, batch: Vec<T>) -> Result<(), Vec<T>> {
        match &self.sender {
            Some(sender) => sender.try_send(batch).map_err(|e| match e {
                TrySendError::Full(batch) | TrySendError::Disconnected(batch) => batch,
            }),
            None => Err(batch),
        }
    }

    fn is_available(&self) -> bool {
        self.sender.is_some()
    }

    fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("flush worker panicked");
            }
        }
    }
}

impl<T> Drop for FlushWorker<T> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_batch<T: Sample>(
    producer: &str,
    sink: &dyn SampleSink<T>,
    batch: &[T],
    transparency: Option<&SharedTransparencyLog>,
) {
    match sink.bulk_insert(producer, batch) {
        Ok(written) => {
            debug!(producer, written, "batch written");
            if let Some(log) = transparency {
                log.record_batch_written(written as u64);
            }
        }
        Err(e) => {
            warn!(producer, size = batch.len(), error = %e, "batch write failed, dropping");
            if let Some(log) = transparency {
                log.record_batch_dropped();
            }
        }
    }
}

/// In-memory batch of pending samples for one producer.
pub struct SampleBuffer<T: Sample> {
    producer: String,
    config: BufferConfig,
    pending: Vec<T>,
    sink: Arc<dyn SampleSink<T>>,
    worker: Option<FlushWorker<T>>,
    bus: Option<NotificationBus>,
    transparency: Option<SharedTransparencyLog>,
    settings: Option<SettingsStore>,
}

impl<T: Sample> SampleBuffer<T> {
    pub fn new(
        producer: impl Into<String>,
        config: BufferConfig,
        sink: Arc<dyn SampleSink<T>>,
    ) -> Self {
        let producer = producer.into();
        let capacity = config.capacity.max(1);
        Self {
            producer,
            config: BufferConfig { capacity, ..config },
            pending: Vec::with_capacity(capacity),
            sink,
            worker: None,
            bus: None,
            transparency: None,
            settings: None,
        }
    }

    /// Publish every pushed sample on `bus`.
    pub fn with_bus(mut self, bus: NotificationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_transparency(mut self, log: SharedTransparencyLog) -> Self {
        self.transparency = Some(log);
        self
    }

    /// Consult `debug_db_slow` in `settings` before every write.
    pub fn with_settings(mut self, settings: SettingsStore) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Number of samples waiting for the next batch.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append a sample, flushing when the batch is full.
    pub fn push(&mut self, sample: T) {
        if let Some(bus) = &self.bus {
            if bus.has_subscribers(Topic::Samples) {
                match serde_json::to_value(&sample) {
                    Ok(data) => {
                        bus.publish(Notification::Sample {
                            producer: self.producer.clone(),
                            data,
                        });
                    }
                    Err(e) => debug!(producer = %self.producer, error = %e, "sample not serializable"),
                }
            }
        }
        if let Some(log) = &self.transparency {
            log.record_sample();
        }

        self.pending.push(sample);
        if self.pending.len() >= self.config.capacity {
            self.flush_pending();
        }
    }

    /// Write whatever is pending, even a partial batch.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            self.flush_pending();
        }
    }

    /// Stop the flush worker after it has written everything queued.
    ///
    /// Pending samples that never reached a batch are not written; call
    /// [`SampleBuffer::flush`] first to keep them.
    pub fn close(mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }

    fn writes_enabled(&self) -> bool {
        self.config.write_enabled
            && !self
                .settings
                .as_ref()
                .is_some_and(|settings| settings.get_bool(keys::DEBUG_DB_SLOW, None))
    }

    fn flush_pending(&mut self) {
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.config.capacity));

        if !self.writes_enabled() {
            debug!(producer = %self.producer, size = batch.len(), "storage writes disabled, batch skipped");
            if let Some(log) = &self.transparency {
                log.record_batch_skipped();
            }
            return;
        }

        let batch = match self.config.mode {
            FlushMode::Inline => batch,
            FlushMode::Background => {
                let worker = self.worker.get_or_insert_with(|| {
                    FlushWorker::spawn(
                        self.producer.clone(),
                        self.sink.clone(),
                        self.transparency.clone(),
                    )
                });
                if !worker.is_available() {
                    batch
                } else {
                    match worker.submit(batch) {
                        Ok(()) => return,
                        Err(batch) => {
                            warn!(producer = %self.producer, size = batch.len(), "flush queue full, dropping batch");
                            if let Some(log) = &self.transparency {
                                log.record_batch_dropped();
                            }
                            return;
                        }
                    }
                }
            }
        };

        write_batch(
            &self.producer,
            self.sink.as_ref(),
            &batch,
            self.transparency.as_ref(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StorageError};
    use crate::transparency::TransparencyLog;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Tick {
        timestamp: DateTime<Utc>,
        n: u32,
    }

    impl Sample for Tick {
        fn timestamp(&self) -> DateTime<Utc> {
            self.timestamp
        }
    }

    fn tick(n: u32) -> Tick {
        Tick {
            timestamp: Utc::now(),
            n,
        }
    }

    fn inline(capacity: usize) -> BufferConfig {
        BufferConfig {
            capacity,
            write_enabled: true,
            mode: FlushMode::Inline,
        }
    }

    struct SlowSink {
        gate: Mutex<()>,
        inner: MemoryStore,
    }

    impl SampleSink<Tick> for SlowSink {
        fn bulk_insert(&self, producer: &str, batch: &[Tick]) -> Result<usize, StorageError> {
            let _held = self.gate.lock().unwrap();
            self.inner.bulk_insert(producer, batch)
        }
    }

    #[test]
    fn test_capacity_plus_one_writes_one_batch() {
        let store = Arc::new(MemoryStore::new());
        let mut buffer = SampleBuffer::<Tick>::new("ticks", inline(250), store.clone());

        for n in 0..251 {
            buffer.push(tick(n));
        }

        assert_eq!(store.batch_sizes("ticks"), vec![250]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_every_push_is_published() {
        let store = Arc::new(MemoryStore::new());
        let bus = NotificationBus::new();
        let rx = bus.subscribe(&[Topic::Samples]);
        let mut buffer = SampleBuffer::<Tick>::new("ticks", inline(10), store).with_bus(bus);

        buffer.push(tick(7));

        match rx.try_recv().unwrap() {
            Notification::Sample { producer, data } => {
                assert_eq!(producer, "ticks");
                assert_eq!(data["n"], 7);
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn test_writes_disabled_discards_full_batches() {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(TransparencyLog::new());
        let config = BufferConfig {
            write_enabled: false,
            ..inline(5)
        };
        let mut buffer =
            SampleBuffer::<Tick>::new("ticks", config, store.clone()).with_transparency(log.clone());

        for n in 0..12 {
            buffer.push(tick(n));
        }

        assert!(store.batch_sizes("ticks").is_empty());
        assert_eq!(buffer.len(), 2);
        assert_eq!(log.stats().batches_skipped, 2);
        assert_eq!(log.stats().samples_observed, 12);
    }

    #[test]
    fn test_debug_db_slow_is_read_at_each_flush() {
        let store = Arc::new(MemoryStore::new());
        let settings = SettingsStore::new(store.clone(), NotificationBus::new());
        let log = Arc::new(TransparencyLog::new());
        let mut buffer = SampleBuffer::<Tick>::new("ticks", inline(2), store.clone())
            .with_settings(settings.clone())
            .with_transparency(log.clone());

        buffer.push(tick(0));
        buffer.push(tick(1));
        assert_eq!(store.batch_sizes("ticks"), vec![2]);

        settings.set(keys::DEBUG_DB_SLOW, "true", None);
        buffer.push(tick(2));
        buffer.push(tick(3));
        assert_eq!(store.batch_sizes("ticks"), vec![2]);
        assert_eq!(log.stats().batches_skipped, 1);

        settings.set(keys::DEBUG_DB_SLOW, "false", None);
        buffer.push(tick(4));
        buffer.push(tick(5));
        assert_eq!(store.batch_sizes("ticks"), vec![2, 2]);
        assert_eq!(store.sample_count("ticks"), 4);
    }

    #[test]
    fn test_storage_fault_drops_batch() {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(TransparencyLog::new());
        store.set_failing(true);
        let mut buffer =
            SampleBuffer::<Tick>::new("ticks", inline(3), store.clone()).with_transparency(log.clone());

        for n in 0..3 {
            buffer.push(tick(n));
        }
        assert!(buffer.is_empty());
        assert_eq!(log.stats().batches_dropped, 1);

        store.set_failing(false);
        assert_eq!(store.sample_count("ticks"), 0);
    }

    #[test]
    fn test_flush_writes_partial_batch() {
        let store = Arc::new(MemoryStore::new());
        let mut buffer = SampleBuffer::<Tick>::new("ticks", inline(250), store.clone());
        for n in 0..4 {
            buffer.push(tick(n));
        }
        buffer.flush();
        assert_eq!(store.batch_sizes("ticks"), vec![4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_background_flush_does_not_block_push() {
        let sink = Arc::new(SlowSink {
            gate: Mutex::new(()),
            inner: MemoryStore::new(),
        });
        let config = BufferConfig {
            capacity: 2,
            write_enabled: true,
            mode: FlushMode::Background,
        };
        let mut buffer = SampleBuffer::<Tick>::new("ticks", config, sink.clone());

        {
            let _stalled = sink.gate.lock().unwrap();
            for n in 0..6 {
                buffer.push(tick(n));
            }
            assert!(buffer.is_empty());
        }

        buffer.close();
        assert_eq!(sink.inner.batch_sizes("ticks"), vec![2, 2, 2]);
    }
}
