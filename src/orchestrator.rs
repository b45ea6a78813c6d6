//! The coordinating loop.
//!
//! Every activation re-reads the settings, reconciles built-in modules and
//! plugins, keeps the sync and maintenance schedules in line with the
//! settings, fires due schedules and re-arms the watchdog. Between
//! activations the loop sleeps until a setting changes, a package event
//! arrives, a refresh is requested or the watchdog expires.

use crate::bus::{Notification, NotificationBus, Topic};
use crate::lifecycle::{LifecycleManager, PluginStart, ReconcileReport};
use crate::scheduler::{
    Action, ActionDispatcher, DispatchError, Evaluation, SaveOutcome, ScheduleEntry, Scheduler,
    Trigger,
};
use crate::settings::{keys, SettingsStore, GLOBAL_SCOPE};
use crate::storage::{DataMaintenance, SampleReader};
use crate::transparency::SharedTransparencyLog;
use chrono::{DateTime, Utc, Weekday};
use crossbeam_channel::{select, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ACTION_SYNC_DATA: &str = "sync_data";
pub const ACTION_SPACE_MAINTENANCE: &str = "space_maintenance";
pub const ACTION_QUIT_STUDY: &str = "quit_study";

pub const SCHEDULE_SYNC_DATA: &str = "schedule_sync_data";
pub const SCHEDULE_SPACE_MAINTENANCE: &str = "schedule_space_maintenance";

/// `frequency_clean_old_data` values.
const CLEAN_NEVER: u64 = 0;
const CLEAN_WEEKLY: u64 = 1;
const CLEAN_MONTHLY: u64 = 2;
const CLEAN_DAILY: u64 = 3;
const CLEAN_AFTER_SYNC: u64 = 4;

/// Failure reported by a [`SyncService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncError(pub String);

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sync failed: {}", self.0)
    }
}

impl std::error::Error for SyncError {}

/// A producer whose samples were uploaded up to and including `through_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedProducer {
    pub producer: String,
    pub through_seq: i64,
}

/// Uploads stored samples to the collection endpoint.
pub trait SyncService: Send + Sync {
    /// Upload everything not yet uploaded. Returns the producers whose
    /// upload finished, with the last sample each one sent.
    fn sync(&self) -> Result<Vec<SyncedProducer>, SyncError>;
}

/// Handles shared by every component of a running agent.
#[derive(Clone)]
pub struct AgentContext {
    pub settings: SettingsStore,
    pub scheduler: Arc<Scheduler>,
    pub lifecycle: Arc<LifecycleManager>,
    pub bus: NotificationBus,
    pub transparency: SharedTransparencyLog,
    pub maintenance: Arc<dyn DataMaintenance>,
    pub samples: Arc<dyn SampleReader>,
}

/// What happened to a framework schedule during activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleChange {
    Saved(SaveOutcome),
    /// Removed; `true` when an entry existed.
    Removed(bool),
    /// Setting missing or unreadable, entry left as it was.
    Skipped,
}

/// What one activation did.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationReport {
    pub modules: ReconcileReport,
    pub sync_schedule: ScheduleChange,
    pub maintenance_schedule: ScheduleChange,
    pub plugins: Vec<(String, PluginStart)>,
    pub evaluation: Evaluation,
    pub next_activation: DateTime<Utc>,
}

pub struct Orchestrator {
    ctx: AgentContext,
    default_watchdog: Duration,
    sync: Option<Arc<dyn SyncService>>,
    sync_in_flight: Arc<AtomicBool>,
    sync_worker: Mutex<Option<thread::JoinHandle<()>>>,
    next_activation: Mutex<Option<DateTime<Utc>>>,
}

impl Orchestrator {
    pub fn new(ctx: AgentContext, default_watchdog: Duration) -> Self {
        Self {
            ctx,
            default_watchdog,
            sync: None,
            sync_in_flight: Arc::new(AtomicBool::new(false)),
            sync_worker: Mutex::new(None),
            next_activation: Mutex::new(None),
        }
    }

    pub fn with_sync(mut self, sync: Arc<dyn SyncService>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Seed framework defaults. Run once before the first activation.
    pub fn bootstrap(&self) {
        self.ctx.settings.seed_defaults();
        debug!(
            device_id = %self.ctx.settings.get(keys::DEVICE_ID, None),
            "settings seeded"
        );
    }

    /// Watchdog period from settings, falling back to the configured default.
    pub fn watchdog_interval(&self) -> Duration {
        self.ctx
            .settings
            .get_u64(keys::FREQUENCY_WATCHDOG, None)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_watchdog)
    }

    pub fn next_activation(&self) -> Option<DateTime<Utc>> {
        *self
            .next_activation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one full activation pass at `now`.
    pub fn activate(&self, now: DateTime<Utc>) -> ActivationReport {
        let desired = self.ctx.lifecycle.desired_from_settings();
        let modules = self.ctx.lifecycle.reconcile(&desired);

        let sync_schedule = self.reconcile_sync_schedule();
        let maintenance_schedule = self.reconcile_maintenance_schedule();
        let plugins = self.ctx.lifecycle.start_active_plugins();

        let evaluation = self.ctx.scheduler.evaluate(now, &Dispatcher { orchestrator: self });
        for _ in &evaluation.fired {
            self.ctx.transparency.record_schedule_fired();
        }

        let watchdog = chrono::Duration::from_std(self.watchdog_interval())
            .unwrap_or_else(|_| chrono::Duration::seconds(keys::DEFAULT_WATCHDOG_SECS as i64));
        let next_activation = now + watchdog;
        *self
            .next_activation
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(next_activation);

        info!(
            started = modules.started.len(),
            stopped = modules.stopped.len(),
            fired = evaluation.fired.len(),
            next = %next_activation,
            "activation complete"
        );

        ActivationReport {
            modules,
            sync_schedule,
            maintenance_schedule,
            plugins,
            evaluation,
            next_activation,
        }
    }

    /// Keep the sync entry in line with `status_webservice` and
    /// `frequency_webservice`. A frequency of 0 disables sync.
    pub fn reconcile_sync_schedule(&self) -> ScheduleChange {
        let settings = &self.ctx.settings;
        let scheduler = &self.ctx.scheduler;

        if !settings.get_bool(keys::STATUS_WEBSERVICE, None) {
            return ScheduleChange::Removed(scheduler.remove(SCHEDULE_SYNC_DATA));
        }

        let raw = settings.get(keys::FREQUENCY_WEBSERVICE, None);
        let minutes = match raw.trim().parse::<u32>() {
            Ok(minutes) => minutes,
            Err(e) => {
                warn!(value = %raw, error = %e, "invalid sync frequency, sync schedule unchanged");
                return ScheduleChange::Skipped;
            }
        };
        if minutes == 0 {
            debug!("data sync disabled");
            return ScheduleChange::Removed(scheduler.remove(SCHEDULE_SYNC_DATA));
        }

        let entry = ScheduleEntry::new(
            SCHEDULE_SYNC_DATA,
            Trigger::every_minutes(minutes),
            Action::broadcast(ACTION_SYNC_DATA),
        );
        match scheduler.save(entry) {
            Ok(outcome) => {
                if outcome != SaveOutcome::Unchanged {
                    debug!(minutes, "data sync scheduled");
                }
                ScheduleChange::Saved(outcome)
            }
            Err(e) => {
                warn!(error = %e, "could not save sync schedule");
                ScheduleChange::Skipped
            }
        }
    }

    /// Keep the maintenance entry in line with `frequency_clean_old_data`:
    /// 0 never, 1 weekly on Sunday, 2 monthly, 3 daily, 4 right after each
    /// successful sync.
    pub fn reconcile_maintenance_schedule(&self) -> ScheduleChange {
        let raw = self.ctx.settings.get(keys::FREQUENCY_CLEAN_OLD_DATA, None);
        if raw.trim().is_empty() {
            return ScheduleChange::Skipped;
        }
        let frequency = match raw.trim().parse::<u64>() {
            Ok(frequency) => frequency,
            Err(e) => {
                warn!(value = %raw, error = %e, "invalid maintenance frequency");
                return ScheduleChange::Skipped;
            }
        };

        let trigger = match frequency {
            CLEAN_NEVER | CLEAN_AFTER_SYNC => {
                return ScheduleChange::Removed(
                    self.ctx.scheduler.remove(SCHEDULE_SPACE_MAINTENANCE),
                );
            }
            CLEAN_WEEKLY => Trigger::weekly(Weekday::Sun),
            CLEAN_MONTHLY => Trigger::monthly(),
            CLEAN_DAILY => Trigger::daily(),
            other => {
                warn!(value = other, "unknown maintenance frequency");
                return ScheduleChange::Skipped;
            }
        };

        let entry = ScheduleEntry::new(
            SCHEDULE_SPACE_MAINTENANCE,
            trigger,
            Action::broadcast(ACTION_SPACE_MAINTENANCE),
        );
        match self.ctx.scheduler.save(entry) {
            Ok(outcome) => ScheduleChange::Saved(outcome),
            Err(e) => {
                warn!(error = %e, "could not save maintenance schedule");
                ScheduleChange::Skipped
            }
        }
    }

    /// Act on a framework action. Returns false for names the orchestrator
    /// does not handle itself.
    pub fn handle_action(&self, name: &str) -> bool {
        match name {
            ACTION_SYNC_DATA => {
                self.start_sync();
                true
            }
            ACTION_SPACE_MAINTENANCE => {
                self.clear_all_data();
                true
            }
            ACTION_QUIT_STUDY => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Kick off an upload on a worker thread. At most one upload runs at a time.
    pub fn start_sync(&self) -> bool {
        if !self.ctx.settings.get_bool(keys::STATUS_WEBSERVICE, None) {
            debug!("sync requested while webservice is off");
            return false;
        }
        let Some(sync) = self.sync.clone() else {
            debug!("no sync service configured");
            return false;
        };
        if self.sync_in_flight.swap(true, Ordering::SeqCst) {
            debug!("sync already in progress");
            return false;
        }

        let in_flight = InFlight(self.sync_in_flight.clone());
        let settings = self.ctx.settings.clone();
        let maintenance = self.ctx.maintenance.clone();
        let spawned = thread::Builder::new()
            .name("sync".to_string())
            .spawn(move || {
                let _in_flight = in_flight;
                match sync.sync() {
                    Ok(done) => {
                        info!(producers = done.len(), "sync complete");
                        if settings.get_u64(keys::FREQUENCY_CLEAN_OLD_DATA, None)
                            == Some(CLEAN_AFTER_SYNC)
                        {
                            for synced in &done {
                                clear_uploaded(maintenance.as_ref(), synced);
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "sync failed"),
                }
            });

        match spawned {
            Ok(handle) => {
                let previous = self
                    .sync_worker
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(handle);
                if let Some(previous) = previous {
                    if previous.join().is_err() {
                        warn!("previous sync worker panicked");
                    }
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "could not spawn sync worker");
                self.sync_in_flight.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Wait for a running upload, if any.
    pub fn wait_for_sync(&self) {
        let handle = self
            .sync_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("sync worker panicked");
            }
        }
    }

    /// Clear stored samples of every producer.
    pub fn clear_all_data(&self) -> usize {
        let producers = match self.ctx.samples.producers() {
            Ok(producers) => producers,
            Err(e) => {
                warn!(error = %e, "could not list producers for maintenance");
                return 0;
            }
        };
        let cleared: usize = producers
            .iter()
            .map(|producer| clear_producer(self.ctx.maintenance.as_ref(), producer))
            .sum();
        info!(producers = producers.len(), rows = cleared, "space maintenance complete");
        cleared
    }

    /// Return the agent to a fresh state: default settings, no schedules,
    /// no plugins, built-ins stopped as their flags now say.
    pub fn reset(&self) {
        self.ctx.settings.reset();
        let removed = self.ctx.scheduler.clear();
        self.ctx.lifecycle.stop_all_plugins();
        let desired = self.ctx.lifecycle.desired_from_settings();
        self.ctx.lifecycle.reconcile(&desired);
        self.ctx.bus.publish(Notification::Refresh);
        info!(schedules = removed, "agent reset");
    }

    /// Stop every running module and plugin and persist the transparency log.
    pub fn deactivate(&self) {
        self.ctx.lifecycle.deactivate_all();
        self.wait_for_sync();
        if let Err(e) = self.ctx.transparency.save() {
            warn!(error = %e, "could not save transparency log");
        }
        info!("agent deactivated");
    }

    /// Apply one notification. Returns true when a new activation is needed.
    pub fn handle_notification(&self, notification: Notification) -> bool {
        match notification {
            // Module flags and framework tunables are global; scoped values
            // (plugin settings, sync watermarks) never change what runs.
            Notification::SettingChanged { key, scope } => {
                debug!(%key, %scope, "setting changed");
                scope == GLOBAL_SCOPE
            }
            Notification::Refresh => true,
            Notification::PackageAdded { package, replacing } => {
                let outcome = self.ctx.lifecycle.on_package_added(&package, replacing);
                debug!(%package, ?outcome, "package added");
                false
            }
            Notification::PackageRemoved { package, replacing } => {
                let outcome = self.ctx.lifecycle.on_package_removed(&package, replacing);
                debug!(%package, ?outcome, "package removed");
                false
            }
            Notification::Sample { .. } | Notification::Action { .. } => false,
        }
    }

    /// Run until `shutdown` receives a message or disconnects.
    pub fn run(&self, shutdown: &Receiver<()>) {
        let events = self
            .ctx
            .bus
            .subscribe(&[Topic::Settings, Topic::Packages, Topic::Control]);

        self.activate(Utc::now());
        info!("orchestrator running");

        loop {
            let wait = self
                .next_activation()
                .and_then(|next| (next - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);

            select! {
                recv(shutdown) -> _ => break,
                recv(events) -> msg => {
                    let Ok(first) = msg else { break };
                    let mut needs_activation = self.handle_notification(first);
                    for more in events.try_iter() {
                        needs_activation |= self.handle_notification(more);
                    }
                    if needs_activation {
                        self.activate(Utc::now());
                    }
                }
                default(wait) => {
                    debug!("watchdog expired");
                    self.activate(Utc::now());
                }
            }
        }

        self.deactivate();
    }
}

/// Clears the in-flight flag when the sync worker ends, panicking or not.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Samples stored while the upload ran are newer than `through_seq` and stay.
fn clear_uploaded(maintenance: &dyn DataMaintenance, synced: &SyncedProducer) {
    if synced.through_seq <= 0 {
        return;
    }
    match maintenance.clear_through(&synced.producer, synced.through_seq) {
        Ok(rows) => debug!(producer = %synced.producer, rows, "uploaded data cleared"),
        Err(e) => warn!(producer = %synced.producer, error = %e, "could not clear uploaded data"),
    }
}

fn clear_producer(maintenance: &dyn DataMaintenance, producer: &str) -> usize {
    match maintenance.clear_producer(producer) {
        Ok(rows) => {
            debug!(producer, rows, "producer data cleared");
            rows
        }
        Err(e) => {
            warn!(producer, error = %e, "could not clear producer data");
            0
        }
    }
}

/// Routes fired schedules: broadcasts go on the bus (and to the orchestrator
/// itself for framework actions), invocations go to the owning module.
struct Dispatcher<'a> {
    orchestrator: &'a Orchestrator,
}

impl ActionDispatcher for Dispatcher<'_> {
    fn broadcast(&self, entry: &ScheduleEntry, name: &str) -> Result<(), DispatchError> {
        self.orchestrator.ctx.bus.publish(Notification::Action {
            schedule_id: entry.id.clone(),
            name: name.to_string(),
        });
        self.orchestrator.handle_action(name);
        Ok(())
    }

    fn invoke(&self, owner: &str, target: &str) -> Result<(), DispatchError> {
        self.orchestrator
            .ctx
            .lifecycle
            .invoke(owner, target)
            .map_err(|e| DispatchError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{LaunchError, ModuleRuntime, PackageInfo, PluginLauncher};
    use crate::storage::{MemoryStore, SampleSink};
    use crate::sensors::TemperatureSample;
    use crate::transparency::create_shared_log;
    use chrono::TimeZone;
    use chrono_tz::Tz;

    struct NoRuntime;

    impl ModuleRuntime for NoRuntime {
        fn start(&self, _module: &str) -> Result<(), LaunchError> {
            Err(LaunchError::NotFound)
        }

        fn stop(&self, _module: &str) -> Result<bool, LaunchError> {
            Ok(false)
        }
    }

    struct NoPlugins;

    impl PluginLauncher for NoPlugins {
        fn start_bundled(&self, _package: &str) -> Result<bool, LaunchError> {
            Ok(false)
        }

        fn resolve(&self, _package: &str) -> Option<PackageInfo> {
            None
        }

        fn start_installed(&self, _package: &str) -> Result<(), LaunchError> {
            Err(LaunchError::NotFound)
        }

        fn stop(&self, _package: &str) -> bool {
            false
        }

        fn is_running(&self, _package: &str) -> bool {
            false
        }

        fn deliver(&self, _package: &str, _action: &str) -> Result<(), LaunchError> {
            Err(LaunchError::NotFound)
        }
    }

    fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
        let bus = NotificationBus::new();
        let settings = SettingsStore::new(store.clone(), bus.clone());
        let scheduler = Arc::new(Scheduler::new(store.clone(), Tz::UTC));
        let lifecycle = Arc::new(LifecycleManager::new(
            settings.clone(),
            store.clone(),
            scheduler.clone(),
            Arc::new(NoRuntime),
            Arc::new(NoPlugins),
        ));
        let ctx = AgentContext {
            settings,
            scheduler,
            lifecycle,
            bus,
            transparency: create_shared_log(),
            maintenance: store.clone(),
            samples: store,
        };
        let orchestrator = Orchestrator::new(ctx, Duration::from_secs(300));
        orchestrator.bootstrap();
        orchestrator
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_sync_schedule_follows_settings() {
        let o = orchestrator(Arc::new(MemoryStore::new()));
        let settings = &o.context().settings;

        assert_eq!(o.reconcile_sync_schedule(), ScheduleChange::Removed(false));

        settings.set(keys::STATUS_WEBSERVICE, "true", None);
        assert_eq!(
            o.reconcile_sync_schedule(),
            ScheduleChange::Saved(SaveOutcome::Created)
        );
        assert_eq!(
            o.reconcile_sync_schedule(),
            ScheduleChange::Saved(SaveOutcome::Unchanged)
        );

        settings.set(keys::FREQUENCY_WEBSERVICE, "abc", None);
        assert_eq!(o.reconcile_sync_schedule(), ScheduleChange::Skipped);
        assert!(o.context().scheduler.get(SCHEDULE_SYNC_DATA).is_some());

        settings.set(keys::FREQUENCY_WEBSERVICE, "0", None);
        assert_eq!(o.reconcile_sync_schedule(), ScheduleChange::Removed(true));
        assert!(o.context().scheduler.get(SCHEDULE_SYNC_DATA).is_none());
    }

    #[test]
    fn test_maintenance_schedule_frequencies() {
        let o = orchestrator(Arc::new(MemoryStore::new()));
        let settings = &o.context().settings;

        assert_eq!(o.reconcile_maintenance_schedule(), ScheduleChange::Removed(false));

        settings.set(keys::FREQUENCY_CLEAN_OLD_DATA, "1", None);
        o.reconcile_maintenance_schedule();
        let entry = o.context().scheduler.get(SCHEDULE_SPACE_MAINTENANCE).unwrap();
        assert_eq!(entry.trigger, Trigger::weekly(Weekday::Sun));

        settings.set(keys::FREQUENCY_CLEAN_OLD_DATA, "3", None);
        assert_eq!(
            o.reconcile_maintenance_schedule(),
            ScheduleChange::Saved(SaveOutcome::Updated)
        );

        settings.set(keys::FREQUENCY_CLEAN_OLD_DATA, "4", None);
        assert_eq!(o.reconcile_maintenance_schedule(), ScheduleChange::Removed(true));

        settings.set(keys::FREQUENCY_CLEAN_OLD_DATA, "9", None);
        assert_eq!(o.reconcile_maintenance_schedule(), ScheduleChange::Skipped);
    }

    #[test]
    fn test_maintenance_fires_and_clears_samples() {
        let store = Arc::new(MemoryStore::new());
        let o = orchestrator(store.clone());
        let sample = TemperatureSample {
            timestamp: noon(),
            device_id: "dev".to_string(),
            celsius: 20.0,
            accuracy: 1,
        };
        SampleSink::<TemperatureSample>::bulk_insert(store.as_ref(), "temperature", &[sample])
            .unwrap();
        o.context()
            .settings
            .set(keys::FREQUENCY_CLEAN_OLD_DATA, "3", None);

        let report = o.activate(noon());
        assert_eq!(report.evaluation.fired, vec![SCHEDULE_SPACE_MAINTENANCE.to_string()]);
        assert_eq!(store.sample_count("temperature"), 0);
        assert_eq!(o.context().transparency.stats().schedules_fired, 1);

        let again = o.activate(noon() + chrono::Duration::minutes(5));
        assert!(again.evaluation.fired.is_empty());
    }

    #[test]
    fn test_watchdog_rearmed_from_settings() {
        let o = orchestrator(Arc::new(MemoryStore::new()));
        let report = o.activate(noon());
        assert_eq!(report.next_activation, noon() + chrono::Duration::seconds(300));

        o.context().settings.set(keys::FREQUENCY_WATCHDOG, "60", None);
        let report = o.activate(noon());
        assert_eq!(report.next_activation, noon() + chrono::Duration::seconds(60));
        assert_eq!(o.next_activation(), Some(report.next_activation));
    }

    #[test]
    fn test_quit_study_resets_state() {
        let o = orchestrator(Arc::new(MemoryStore::new()));
        let settings = &o.context().settings;
        let device_id = settings.get(keys::DEVICE_ID, None);
        settings.set(keys::STATUS_WEBSERVICE, "true", None);
        o.activate(noon());
        assert!(o.context().scheduler.get(SCHEDULE_SYNC_DATA).is_some());

        assert!(o.handle_action(ACTION_QUIT_STUDY));

        assert!(o.context().scheduler.list().is_empty());
        assert_eq!(settings.get(keys::STATUS_WEBSERVICE, None), "false");
        assert_eq!(settings.get(keys::DEVICE_ID, None), device_id);
    }

    #[test]
    fn test_quit_study_stops_the_rest_of_the_pass() {
        let o = orchestrator(Arc::new(MemoryStore::new()));
        let scheduler = &o.context().scheduler;
        let actions = o.context().bus.subscribe(&[Topic::Actions]);
        scheduler
            .save(ScheduleEntry::new(
                "a_study_end",
                Trigger::daily(),
                Action::broadcast(ACTION_QUIT_STUDY),
            ))
            .unwrap();
        scheduler
            .save(ScheduleEntry::new(
                "b_survey",
                Trigger::daily(),
                Action::broadcast("survey_prompt"),
            ))
            .unwrap();

        let evaluation = scheduler.evaluate(noon(), &Dispatcher { orchestrator: &o });

        assert_eq!(evaluation.fired, vec!["a_study_end".to_string()]);
        let names: Vec<String> = actions
            .try_iter()
            .filter_map(|n| match n {
                Notification::Action { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec![ACTION_QUIT_STUDY.to_string()]);
    }

    struct CountingSync {
        calls: std::sync::atomic::AtomicUsize,
        store: Arc<MemoryStore>,
    }

    fn temperature(celsius: f64) -> TemperatureSample {
        TemperatureSample {
            timestamp: noon(),
            device_id: "dev".to_string(),
            celsius,
            accuracy: 1,
        }
    }

    impl SyncService for CountingSync {
        fn sync(&self) -> Result<Vec<SyncedProducer>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let uploaded = self.store.samples_after("temperature", 0, 100).unwrap();
            let through_seq = uploaded.last().map_or(0, |s| s.seq);
            // A flush landing while the upload is in progress.
            SampleSink::<TemperatureSample>::bulk_insert(
                self.store.as_ref(),
                "temperature",
                &[temperature(21.0)],
            )
            .unwrap();
            Ok(vec![SyncedProducer {
                producer: "temperature".to_string(),
                through_seq,
            }])
        }
    }

    #[test]
    fn test_sync_runs_off_thread_and_clears_after_upload() {
        let store = Arc::new(MemoryStore::new());
        let sync = Arc::new(CountingSync {
            calls: std::sync::atomic::AtomicUsize::new(0),
            store: store.clone(),
        });
        let o = orchestrator(store.clone()).with_sync(sync.clone());
        SampleSink::<TemperatureSample>::bulk_insert(
            store.as_ref(),
            "temperature",
            &[temperature(20.0)],
        )
        .unwrap();

        assert!(!o.start_sync());

        let settings = &o.context().settings;
        settings.set(keys::STATUS_WEBSERVICE, "true", None);
        settings.set(keys::FREQUENCY_CLEAN_OLD_DATA, "4", None);
        assert!(o.start_sync());
        o.wait_for_sync();

        assert_eq!(sync.calls.load(Ordering::SeqCst), 1);
        let left = store.samples_after("temperature", 0, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload["celsius"], 21.0);
    }

    struct PanickingSync {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl SyncService for PanickingSync {
        fn sync(&self) -> Result<Vec<SyncedProducer>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("endpoint handler crashed");
        }
    }

    #[test]
    fn test_panicked_sync_does_not_block_next_sync() {
        let sync = Arc::new(PanickingSync {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let o = orchestrator(Arc::new(MemoryStore::new())).with_sync(sync.clone());
        o.context().settings.set(keys::STATUS_WEBSERVICE, "true", None);

        assert!(o.start_sync());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while o.sync_in_flight.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        // Joins the panicked worker before handing over.
        assert!(o.start_sync());
        o.wait_for_sync();
        assert_eq!(sync.calls.load(Ordering::SeqCst), 2);
        assert!(!o.sync_in_flight.load(Ordering::SeqCst));
    }
}
