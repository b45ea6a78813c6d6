//! Reconciles desired module state with what is actually running.

use super::{
    Catalog, InstallKind, LaunchError, ModuleRecord, ModuleRuntime, ModuleStatus, PluginLauncher,
};
use crate::scheduler::Scheduler;
use crate::settings::SettingsStore;
use crate::storage::ModuleTable;
use crate::transparency::SharedTransparencyLog;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Default package prefix that marks a package as a plugin.
pub const DEFAULT_PLUGIN_PREFIX: &str = "org.contextsense.plugin.";

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    /// Modules that failed to start, with the reason.
    pub failed: Vec<(String, LaunchError)>,
    /// Modules whose flags were switched off because the host lacks them.
    pub disabled: Vec<String>,
}

impl ReconcileReport {
    /// True when the pass started or stopped nothing.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Outcome of [`LifecycleManager::start_plugin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStart {
    AlreadyRunning,
    Bundled,
    Installed,
    /// Known, but its entry point does not resolve.
    Parked,
    NotFound,
    Failed(LaunchError),
}

/// Outcome of a package event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageEvent {
    /// Not a plugin, or a removal that is part of a replace.
    Ignored,
    Installed(PluginStart),
    Updated(Option<PluginStart>),
    /// Installed but not resolvable yet.
    Parked,
    Removed,
}

pub struct LifecycleManager {
    settings: SettingsStore,
    modules: Arc<dyn ModuleTable>,
    scheduler: Arc<Scheduler>,
    runtime: Arc<dyn ModuleRuntime>,
    launcher: Arc<dyn PluginLauncher>,
    catalog: Catalog,
    plugin_prefix: String,
    running: Mutex<BTreeSet<String>>,
    running_plugins: Mutex<BTreeSet<String>>,
    transparency: Option<SharedTransparencyLog>,
}

impl LifecycleManager {
    pub fn new(
        settings: SettingsStore,
        modules: Arc<dyn ModuleTable>,
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn ModuleRuntime>,
        launcher: Arc<dyn PluginLauncher>,
    ) -> Self {
        Self {
            settings,
            modules,
            scheduler,
            runtime,
            launcher,
            catalog: Catalog::builtin(),
            plugin_prefix: DEFAULT_PLUGIN_PREFIX.to_string(),
            running: Mutex::new(BTreeSet::new()),
            running_plugins: Mutex::new(BTreeSet::new()),
            transparency: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_plugin_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.plugin_prefix = prefix.into();
        self
    }

    pub fn with_transparency(mut self, log: SharedTransparencyLog) -> Self {
        self.transparency = Some(log);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn is_plugin(&self, package: &str) -> bool {
        package.starts_with(&self.plugin_prefix)
    }

    /// Built-in modules currently running.
    pub fn running(&self) -> Vec<String> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Plugins started by this manager and not stopped since.
    pub fn running_plugins(&self) -> Vec<String> {
        self.running_plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Desired state of every built-in module from current settings.
    pub fn desired_from_settings(&self) -> BTreeMap<String, bool> {
        self.catalog.desired_states(&self.settings)
    }

    /// Start modules desired on and stop modules desired off.
    ///
    /// Modules already in the wanted state are left alone, so running this
    /// twice with the same map issues no start or stop the second time.
    pub fn reconcile(&self, desired: &BTreeMap<String, bool>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        for (module, &want) in desired {
            let is_running = running.contains(module);

            if want && !is_running {
                match self.runtime.start(module) {
                    Ok(()) => {
                        info!(module = %module, "module started");
                        running.insert(module.clone());
                        report.started.push(module.clone());
                        self.record_start();
                    }
                    Err(LaunchError::HardwareAbsent(what)) => {
                        warn!(module = %module, %what, "hardware absent, disabling module");
                        self.disable(module);
                        report.disabled.push(module.clone());
                        report
                            .failed
                            .push((module.clone(), LaunchError::HardwareAbsent(what)));
                        self.record_failure();
                    }
                    Err(LaunchError::NotFound) => {
                        debug!(module = %module, "module not provided by this host");
                        report.failed.push((module.clone(), LaunchError::NotFound));
                    }
                    Err(e) => {
                        warn!(module = %module, error = %e, "module failed to start");
                        report.failed.push((module.clone(), e));
                        self.record_failure();
                    }
                }
            } else if !want && is_running {
                if self.catalog.is_desired(module, &self.settings) {
                    debug!(module = %module, "module still wanted by another flag, kept");
                    continue;
                }
                if let Err(e) = self.runtime.stop(module) {
                    warn!(module = %module, error = %e, "module stop reported an error");
                }
                info!(module = %module, "module stopped");
                running.remove(module);
                report.stopped.push(module.clone());
            }
        }

        report
    }

    fn disable(&self, module: &str) {
        for flag in self.catalog.flags_for(module) {
            self.settings.set(flag, "false", None);
        }
    }

    /// Start a pluggable module.
    pub fn start_plugin(&self, package: &str) -> PluginStart {
        {
            let mut running = self
                .running_plugins
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if running.contains(package) {
                if self.launcher.is_running(package) {
                    return PluginStart::AlreadyRunning;
                }
                warn!(package, "plugin is no longer running, restarting");
                running.remove(package);
            }
        }

        match self.launcher.start_bundled(package) {
            Ok(true) => {
                self.ensure_bundled_record(package);
                self.mark_running(package);
                info!(package, "bundled plugin started");
                return PluginStart::Bundled;
            }
            Ok(false) => {}
            Err(e) => warn!(package, error = %e, "bundled plugin failed to start"),
        }

        let record = match self.modules.read_module(package) {
            Ok(Some(record)) => record,
            Ok(None) => return PluginStart::NotFound,
            Err(e) => {
                warn!(package, error = %e, "could not read module record");
                return PluginStart::NotFound;
            }
        };

        if self.launcher.resolve(package).is_none() {
            if record.status != ModuleStatus::PendingUpdate {
                self.set_status(package, ModuleStatus::PendingUpdate);
            }
            warn!(package, "plugin entry point missing, parked until next install");
            return PluginStart::Parked;
        }

        match self.launcher.start_installed(package) {
            Ok(()) => {
                self.set_status(package, ModuleStatus::On);
                self.mark_running(package);
                info!(package, "installed plugin started");
                PluginStart::Installed
            }
            Err(e) => {
                warn!(package, error = %e, "installed plugin failed to start");
                self.record_failure();
                PluginStart::Failed(e)
            }
        }
    }

    fn ensure_bundled_record(&self, package: &str) {
        match self.modules.read_module(package) {
            Ok(Some(record)) if record.status == ModuleStatus::On => {}
            Ok(Some(_)) => self.set_status(package, ModuleStatus::On),
            Ok(None) => {
                if let Err(e) = self.modules.upsert_module(&ModuleRecord::bundled(package)) {
                    warn!(package, error = %e, "could not record bundled plugin");
                }
            }
            Err(e) => warn!(package, error = %e, "could not read module record"),
        }
    }

    fn mark_running(&self, package: &str) {
        self.running_plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(package.to_string());
        self.record_start();
    }

    fn set_status(&self, package: &str, status: ModuleStatus) {
        match self.modules.set_module_status(package, status) {
            Ok(true) => debug!(package, %status, "module status updated"),
            Ok(false) => debug!(package, "no module record to update"),
            Err(e) => warn!(package, error = %e, "could not update module status"),
        }
    }

    /// Stop a pluggable module and mark it `Off`.
    pub fn stop_plugin(&self, package: &str) -> bool {
        let found = self.launcher.stop(package);
        self.running_plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(package);
        self.set_status(package, ModuleStatus::Off);
        info!(package, found, "plugin stopped");
        found
    }

    /// Handle a package install or replace.
    pub fn on_package_added(&self, package: &str, replacing: bool) -> PackageEvent {
        if !self.is_plugin(package) {
            return PackageEvent::Ignored;
        }

        let existing = match self.modules.read_module(package) {
            Ok(existing) => existing,
            Err(e) => {
                warn!(package, error = %e, "could not read module record");
                return PackageEvent::Ignored;
            }
        };

        let Some(info) = self.launcher.resolve(package) else {
            warn!(package, "installed package does not resolve yet");
            let record = match existing {
                Some(mut record) => {
                    record.status = ModuleStatus::PendingUpdate;
                    record
                }
                None => ModuleRecord {
                    status: ModuleStatus::PendingUpdate,
                    kind: InstallKind::Installed,
                    ..ModuleRecord::bundled(package)
                },
            };
            self.upsert(&record);
            return PackageEvent::Parked;
        };

        match existing {
            Some(mut record) if replacing => {
                record.display_name = info.display_name;
                record.version = info.version;
                record.manifest = info.manifest;
                record.kind = InstallKind::Installed;
                if record.status == ModuleStatus::PendingUpdate {
                    record.status = ModuleStatus::On;
                }
                self.upsert(&record);
                info!(package, version = record.version, "plugin updated");

                if record.status == ModuleStatus::On {
                    // The binary changed under a running instance.
                    if self.launcher.stop(package) {
                        self.running_plugins
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(package);
                    }
                    PackageEvent::Updated(Some(self.start_plugin(package)))
                } else {
                    PackageEvent::Updated(None)
                }
            }
            _ => {
                self.upsert(&ModuleRecord::installed(package, &info, ModuleStatus::On));
                info!(package, version = info.version, "plugin installed");
                PackageEvent::Installed(self.start_plugin(package))
            }
        }
    }

    /// Handle a package removal. Replacements are ignored.
    pub fn on_package_removed(&self, package: &str, replacing: bool) -> PackageEvent {
        if !self.is_plugin(package) || replacing {
            return PackageEvent::Ignored;
        }

        self.launcher.stop(package);
        self.running_plugins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(package);

        let settings = self.settings.purge_scope(package);
        let schedules = self.scheduler.remove_owned_by(package);
        if let Err(e) = self.modules.delete_module(package) {
            warn!(package, error = %e, "could not delete module record");
        }
        info!(package, settings, schedules, "plugin removed");
        PackageEvent::Removed
    }

    fn upsert(&self, record: &ModuleRecord) {
        if let Err(e) = self.modules.upsert_module(record) {
            warn!(package = %record.package_name, error = %e, "could not save module record");
        }
    }

    /// Records whose desired status is `On`.
    pub fn active_plugins(&self) -> Vec<ModuleRecord> {
        match self.modules.list_modules() {
            Ok(records) => records
                .into_iter()
                .filter(|r| r.status == ModuleStatus::On)
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not list module records");
                Vec::new()
            }
        }
    }

    pub fn records(&self) -> Vec<ModuleRecord> {
        self.modules.list_modules().unwrap_or_else(|e| {
            warn!(error = %e, "could not list module records");
            Vec::new()
        })
    }

    /// Start every `On` plugin not already running.
    pub fn start_active_plugins(&self) -> Vec<(String, PluginStart)> {
        self.active_plugins()
            .into_iter()
            .map(|record| {
                let outcome = self.start_plugin(&record.package_name);
                (record.package_name, outcome)
            })
            .filter(|(_, outcome)| *outcome != PluginStart::AlreadyRunning)
            .collect()
    }

    /// Stop every plugin and mark each `Off`.
    pub fn stop_all_plugins(&self) {
        for record in self.records() {
            if record.status != ModuleStatus::Off {
                self.stop_plugin(&record.package_name);
            }
        }
        for package in self.running_plugins() {
            self.stop_plugin(&package);
        }
    }

    /// Stop everything that is running without touching desired state.
    pub fn deactivate_all(&self) {
        let modules: Vec<String> = std::mem::take(
            &mut *self.running.lock().unwrap_or_else(PoisonError::into_inner),
        )
        .into_iter()
        .collect();
        for module in modules {
            if let Err(e) = self.runtime.stop(&module) {
                warn!(module = %module, error = %e, "module stop reported an error");
            }
            debug!(module = %module, "module deactivated");
        }

        let plugins: Vec<String> = std::mem::take(
            &mut *self
                .running_plugins
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
        .into_iter()
        .collect();
        for package in plugins {
            self.launcher.stop(&package);
            debug!(package = %package, "plugin deactivated");
        }
    }

    /// Deliver a scheduled action to its owning module.
    pub fn invoke(&self, owner: &str, target: &str) -> Result<(), LaunchError> {
        if self.catalog.flags_for(owner).is_empty() {
            self.launcher.deliver(owner, target)
        } else {
            self.runtime.deliver(owner, target)
        }
    }

    fn record_start(&self) {
        if let Some(log) = &self.transparency {
            log.record_module_start();
        }
    }

    fn record_failure(&self) {
        if let Some(log) = &self.transparency {
            log.record_module_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NotificationBus;
    use crate::lifecycle::PackageInfo;
    use crate::settings::keys::{STATUS_BAROMETER, STATUS_LOCATION_GPS, STATUS_LOCATION_NETWORK};
    use crate::storage::{MemoryStore, ModuleTable};
    use chrono_tz::Tz;

    #[derive(Default)]
    struct FakeRuntime {
        absent: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl ModuleRuntime for FakeRuntime {
        fn start(&self, module: &str) -> Result<(), LaunchError> {
            self.calls.lock().unwrap().push(format!("start {module}"));
            if self.absent.iter().any(|a| *a == module) {
                return Err(LaunchError::HardwareAbsent(module.to_string()));
            }
            Ok(())
        }

        fn stop(&self, module: &str) -> Result<bool, LaunchError> {
            self.calls.lock().unwrap().push(format!("stop {module}"));
            Ok(true)
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        bundled: Vec<&'static str>,
        resolvable: Mutex<Vec<String>>,
        started: Mutex<Vec<String>>,
        exited: Mutex<Vec<String>>,
    }

    impl PluginLauncher for FakeLauncher {
        fn start_bundled(&self, package: &str) -> Result<bool, LaunchError> {
            Ok(self.bundled.iter().any(|p| *p == package))
        }

        fn resolve(&self, package: &str) -> Option<PackageInfo> {
            self.resolvable
                .lock()
                .unwrap()
                .iter()
                .any(|p| p == package)
                .then(|| PackageInfo {
                    display_name: "Steps".to_string(),
                    version: 4,
                    manifest: Default::default(),
                })
        }

        fn start_installed(&self, package: &str) -> Result<(), LaunchError> {
            self.started.lock().unwrap().push(package.to_string());
            Ok(())
        }

        fn stop(&self, _package: &str) -> bool {
            true
        }

        fn is_running(&self, package: &str) -> bool {
            !self.exited.lock().unwrap().iter().any(|p| p == package)
        }

        fn deliver(&self, _package: &str, _action: &str) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    const STEPS: &str = "org.contextsense.plugin.steps";

    struct Fixture {
        store: Arc<MemoryStore>,
        settings: SettingsStore,
        runtime: Arc<FakeRuntime>,
        launcher: Arc<FakeLauncher>,
        manager: LifecycleManager,
    }

    fn fixture(runtime: FakeRuntime, launcher: FakeLauncher) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let settings = SettingsStore::new(store.clone(), NotificationBus::new());
        let scheduler = Arc::new(Scheduler::new(store.clone(), Tz::UTC));
        let runtime = Arc::new(runtime);
        let launcher = Arc::new(launcher);
        let manager = LifecycleManager::new(
            settings.clone(),
            store.clone(),
            scheduler,
            runtime.clone(),
            launcher.clone(),
        );
        Fixture {
            store,
            settings,
            runtime,
            launcher,
            manager,
        }
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let f = fixture(FakeRuntime::default(), FakeLauncher::default());
        f.settings.set(STATUS_BAROMETER, "true", None);

        let first = f.manager.reconcile(&f.manager.desired_from_settings());
        assert_eq!(first.started, vec!["barometer".to_string()]);

        let second = f.manager.reconcile(&f.manager.desired_from_settings());
        assert!(second.is_noop());
        assert_eq!(f.runtime.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_compound_module_kept_while_any_flag_on() {
        let f = fixture(FakeRuntime::default(), FakeLauncher::default());
        f.settings.set(STATUS_LOCATION_GPS, "true", None);
        f.settings.set(STATUS_LOCATION_NETWORK, "true", None);
        f.manager.reconcile(&f.manager.desired_from_settings());

        // A stale request to stop locations while network is still on.
        let stale = BTreeMap::from([("locations".to_string(), false)]);
        assert!(f.manager.reconcile(&stale).stopped.is_empty());

        f.settings.set(STATUS_LOCATION_GPS, "false", None);
        f.settings.set(STATUS_LOCATION_NETWORK, "false", None);
        let report = f.manager.reconcile(&f.manager.desired_from_settings());
        assert_eq!(report.stopped, vec!["locations".to_string()]);
    }

    #[test]
    fn test_hardware_absent_turns_flag_off() {
        let runtime = FakeRuntime {
            absent: vec!["barometer"],
            ..FakeRuntime::default()
        };
        let f = fixture(runtime, FakeLauncher::default());
        f.settings.set(STATUS_BAROMETER, "true", None);

        let report = f.manager.reconcile(&f.manager.desired_from_settings());
        assert_eq!(report.disabled, vec!["barometer".to_string()]);
        assert_eq!(f.settings.get(STATUS_BAROMETER, None), "false");
        assert!(f.manager.running().is_empty());
    }

    #[test]
    fn test_bundled_start_synthesizes_record() {
        let launcher = FakeLauncher {
            bundled: vec![STEPS],
            ..FakeLauncher::default()
        };
        let f = fixture(FakeRuntime::default(), launcher);

        assert_eq!(f.manager.start_plugin(STEPS), PluginStart::Bundled);
        assert_eq!(f.manager.start_plugin(STEPS), PluginStart::AlreadyRunning);
        let record = f.store.read_module(STEPS).unwrap().unwrap();
        assert_eq!(record.kind, InstallKind::Bundled);
        assert_eq!(record.status, ModuleStatus::On);
    }

    #[test]
    fn test_unresolvable_record_is_parked_then_recovered() {
        let f = fixture(FakeRuntime::default(), FakeLauncher::default());
        f.store
            .upsert_module(&ModuleRecord {
                kind: InstallKind::Installed,
                ..ModuleRecord::bundled(STEPS)
            })
            .unwrap();

        assert_eq!(f.manager.start_plugin(STEPS), PluginStart::Parked);
        assert_eq!(
            f.store.read_module(STEPS).unwrap().unwrap().status,
            ModuleStatus::PendingUpdate
        );

        f.launcher.resolvable.lock().unwrap().push(STEPS.to_string());
        assert_eq!(
            f.manager.on_package_added(STEPS, true),
            PackageEvent::Updated(Some(PluginStart::Installed))
        );
        let record = f.store.read_module(STEPS).unwrap().unwrap();
        assert_eq!(record.status, ModuleStatus::On);
        assert_eq!(record.version, 4);
    }

    #[test]
    fn test_non_plugin_packages_are_ignored() {
        let f = fixture(FakeRuntime::default(), FakeLauncher::default());
        assert_eq!(
            f.manager.on_package_added("com.example.game", false),
            PackageEvent::Ignored
        );
        assert_eq!(
            f.manager.on_package_removed("com.example.game", false),
            PackageEvent::Ignored
        );
    }

    #[test]
    fn test_stop_plugin_always_marks_off() {
        let f = fixture(FakeRuntime::default(), FakeLauncher::default());
        f.launcher.resolvable.lock().unwrap().push(STEPS.to_string());
        f.manager.on_package_added(STEPS, false);
        assert_eq!(f.launcher.started.lock().unwrap().len(), 1);

        f.manager.stop_plugin(STEPS);
        assert_eq!(
            f.store.read_module(STEPS).unwrap().unwrap().status,
            ModuleStatus::Off
        );
        assert!(f.manager.active_plugins().is_empty());
    }

    #[test]
    fn test_exited_plugin_is_restarted_on_next_pass() {
        let f = fixture(FakeRuntime::default(), FakeLauncher::default());
        f.launcher.resolvable.lock().unwrap().push(STEPS.to_string());
        f.manager.on_package_added(STEPS, false);
        assert!(f.manager.start_active_plugins().is_empty());

        f.launcher.exited.lock().unwrap().push(STEPS.to_string());
        assert_eq!(
            f.manager.start_active_plugins(),
            vec![(STEPS.to_string(), PluginStart::Installed)]
        );
        assert_eq!(f.launcher.started.lock().unwrap().len(), 2);
        assert_eq!(f.manager.running_plugins(), vec![STEPS.to_string()]);
    }
}
