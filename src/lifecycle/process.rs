//! Plugin launcher backed by child processes.
//!
//! Installed plugins live under `<plugin_dir>/<package>/` with a
//! `manifest.json` naming the entry point. Bundled plugins are served by an
//! in-process [`ModuleRuntime`].

use super::{CapabilityManifest, LaunchError, ModuleRuntime, PackageInfo, PluginLauncher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Environment variable telling a plugin process its own package name.
pub const PACKAGE_ENV: &str = "CONTEXT_SENSOR_PACKAGE";

/// On-disk description of an installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub display_name: String,
    #[serde(default)]
    pub version: u32,
    /// Executable, relative to the plugin's directory unless absolute.
    pub entry: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub capabilities: CapabilityManifest,
}

pub struct ProcessLauncher {
    plugin_dir: PathBuf,
    bundled: Option<Arc<dyn ModuleRuntime>>,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessLauncher {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            bundled: None,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Serve bundled plugins from `runtime`.
    pub fn with_bundled(mut self, runtime: Arc<dyn ModuleRuntime>) -> Self {
        self.bundled = Some(runtime);
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    fn package_dir(&self, package: &str) -> Option<PathBuf> {
        if package.is_empty() || package.contains(['/', '\\']) || package.starts_with('.') {
            return None;
        }
        Some(self.plugin_dir.join(package))
    }

    pub fn read_manifest(&self, package: &str) -> Result<PluginManifest, LaunchError> {
        let dir = self.package_dir(package).ok_or(LaunchError::NotFound)?;
        let content = std::fs::read_to_string(dir.join(MANIFEST_FILE)).map_err(|e| match e.kind()
        {
            ErrorKind::NotFound => LaunchError::NotFound,
            ErrorKind::PermissionDenied => LaunchError::PermissionDenied(e.to_string()),
            _ => LaunchError::Failed(e.to_string()),
        })?;
        serde_json::from_str(&content)
            .map_err(|e| LaunchError::Failed(format!("invalid manifest for {package}: {e}")))
    }

    fn entry_point(&self, package: &str, manifest: &PluginManifest) -> Option<PathBuf> {
        let entry = self.package_dir(package)?.join(&manifest.entry);
        entry.is_file().then_some(entry)
    }

    /// Packages that have a manifest in the plugin directory.
    pub fn installed_packages(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.plugin_dir) else {
            return Vec::new();
        };
        let mut packages: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(MANIFEST_FILE).is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        packages.sort();
        packages
    }

    fn command(&self, package: &str) -> Result<Command, LaunchError> {
        let manifest = self.read_manifest(package)?;
        let entry = self
            .entry_point(package, &manifest)
            .ok_or(LaunchError::NotFound)?;
        let mut command = Command::new(entry);
        command
            .args(&manifest.args)
            .env(PACKAGE_ENV, package)
            .stdin(Stdio::null());
        if let Some(dir) = self.package_dir(package) {
            command.current_dir(dir);
        }
        Ok(command)
    }
}

fn spawn_error(e: std::io::Error) -> LaunchError {
    match e.kind() {
        ErrorKind::NotFound => LaunchError::NotFound,
        ErrorKind::PermissionDenied => LaunchError::PermissionDenied(e.to_string()),
        _ => LaunchError::Failed(e.to_string()),
    }
}

impl PluginLauncher for ProcessLauncher {
    fn start_bundled(&self, package: &str) -> Result<bool, LaunchError> {
        match &self.bundled {
            Some(runtime) => match runtime.start(package) {
                Ok(()) => Ok(true),
                Err(LaunchError::NotFound) => Ok(false),
                Err(e) => Err(e),
            },
            None => Ok(false),
        }
    }

    fn resolve(&self, package: &str) -> Option<PackageInfo> {
        let manifest = match self.read_manifest(package) {
            Ok(manifest) => manifest,
            Err(LaunchError::NotFound) => return None,
            Err(e) => {
                warn!(package, error = %e, "plugin manifest unreadable");
                return None;
            }
        };
        self.entry_point(package, &manifest)?;
        Some(PackageInfo {
            display_name: manifest.display_name,
            version: manifest.version,
            manifest: manifest.capabilities,
        })
    }

    fn start_installed(&self, package: &str) -> Result<(), LaunchError> {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(child) = children.get_mut(package) {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => debug!(package, %status, "previous plugin process exited"),
                Err(e) => warn!(package, error = %e, "could not poll plugin process"),
            }
            children.remove(package);
        }

        let child = self.command(package)?.spawn().map_err(spawn_error)?;
        info!(package, pid = child.id(), "plugin process started");
        children.insert(package.to_string(), child);
        Ok(())
    }

    fn stop(&self, package: &str) -> bool {
        let bundled = match &self.bundled {
            Some(runtime) => runtime.stop(package).unwrap_or_else(|e| {
                warn!(package, error = %e, "bundled plugin stop failed");
                false
            }),
            None => false,
        };

        let child = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(package);
        let installed = match child {
            Some(mut child) => {
                if let Err(e) = child.kill() {
                    debug!(package, error = %e, "plugin process already gone");
                }
                if let Err(e) = child.wait() {
                    warn!(package, error = %e, "could not reap plugin process");
                }
                info!(package, "plugin process stopped");
                true
            }
            None => false,
        };

        bundled || installed
    }

    fn is_running(&self, package: &str) -> bool {
        let mut children = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = children.get_mut(package) {
            match child.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => {
                    info!(package, %status, "plugin process exited");
                    children.remove(package);
                }
                Err(e) => warn!(package, error = %e, "could not poll plugin process"),
            }
        }
        drop(children);

        self.bundled
            .as_ref()
            .is_some_and(|runtime| runtime.is_running(package))
    }

    fn deliver(&self, package: &str, action: &str) -> Result<(), LaunchError> {
        if let Some(runtime) = &self.bundled {
            match runtime.deliver(package, action) {
                Err(LaunchError::NotFound) => {}
                other => return other,
            }
        }

        let mut child = self
            .command(package)?
            .arg("--action")
            .arg(action)
            .spawn()
            .map_err(spawn_error)?;
        debug!(package, action, "action delivered to plugin");
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        let children = self
            .children
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (package, mut child) in children.drain() {
            let _ = child.kill();
            let _ = child.wait();
            debug!(package, "plugin process reaped");
        }
    }
}
