//! Module lifecycle management.
//!
//! Built-in modules are switched by status flags in the settings store;
//! pluggable modules are tracked as [`ModuleRecord`]s and switched by their
//! recorded status. The [`LifecycleManager`] reconciles both against what is
//! actually running.

pub mod catalog;
pub mod launcher;
pub mod manager;
pub mod process;
pub mod record;

pub use catalog::{BuiltinModule, Catalog};
pub use launcher::{LaunchError, ModuleRuntime, PluginLauncher};
pub use manager::{
    LifecycleManager, PackageEvent, PluginStart, ReconcileReport, DEFAULT_PLUGIN_PREFIX,
};
pub use process::{PluginManifest, ProcessLauncher};
pub use record::{CapabilityManifest, InstallKind, ModuleRecord, ModuleStatus, PackageInfo};
