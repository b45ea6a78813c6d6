//! Launch collaborators for built-in and pluggable modules.

use super::PackageInfo;

/// Why a module could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// No module with that id or package is available.
    NotFound,
    /// The host lacks the hardware or resource the module needs.
    HardwareAbsent(String),
    PermissionDenied(String),
    Failed(String),
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::NotFound => write!(f, "Module not found"),
            LaunchError::HardwareAbsent(what) => write!(f, "Hardware not available: {what}"),
            LaunchError::PermissionDenied(what) => write!(f, "Permission denied: {what}"),
            LaunchError::Failed(msg) => write!(f, "Launch failed: {msg}"),
        }
    }
}

impl std::error::Error for LaunchError {}

/// Hosts in-process modules addressed by id.
pub trait ModuleRuntime: Send + Sync {
    /// Start `module`. Starting a running module is a no-op.
    fn start(&self, module: &str) -> Result<(), LaunchError>;

    /// Stop `module` and wait for it to release its resources.
    ///
    /// Returns whether a running instance was found.
    fn stop(&self, module: &str) -> Result<bool, LaunchError>;

    /// Whether `module` has a live instance. Runtimes that cannot tell
    /// report false, so callers fall back to an idempotent start.
    fn is_running(&self, _module: &str) -> bool {
        false
    }

    /// Deliver a named action to a running module.
    fn deliver(&self, _module: &str, _action: &str) -> Result<(), LaunchError> {
        Err(LaunchError::NotFound)
    }
}

/// Starts and stops pluggable modules.
pub trait PluginLauncher: Send + Sync {
    /// Start `package` from the bundled registry. `Ok(false)` when the
    /// registry has no such package.
    fn start_bundled(&self, package: &str) -> Result<bool, LaunchError>;

    /// Metadata for an installed package whose entry point resolves.
    fn resolve(&self, package: &str) -> Option<PackageInfo>;

    fn start_installed(&self, package: &str) -> Result<(), LaunchError>;

    /// Stop any running instance, bundled or installed. Returns whether one was found.
    fn stop(&self, package: &str) -> bool;

    /// Whether an instance started earlier is still alive.
    fn is_running(&self, package: &str) -> bool;

    fn deliver(&self, package: &str, action: &str) -> Result<(), LaunchError>;
}
