//! Module records.

use serde::{Deserialize, Serialize};

/// Desired state of a pluggable module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    On,
    Off,
    /// Known but its entry point does not resolve; waits for the next install event.
    PendingUpdate,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::On => "on",
            ModuleStatus::Off => "off",
            ModuleStatus::PendingUpdate => "pending_update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(ModuleStatus::On),
            "off" => Some(ModuleStatus::Off),
            "pending_update" => Some(ModuleStatus::PendingUpdate),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a module reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallKind {
    /// Shipped inside the agent and run in-process.
    Bundled,
    /// Installed separately and run as its own process.
    Installed,
}

impl InstallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallKind::Bundled => "bundled",
            InstallKind::Installed => "installed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bundled" => Some(InstallKind::Bundled),
            "installed" => Some(InstallKind::Installed),
            _ => None,
        }
    }
}

/// Capabilities a module declares when it is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    #[serde(default)]
    pub has_settings: bool,
    #[serde(default)]
    pub has_context_card: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One pluggable module known to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub package_name: String,
    pub display_name: String,
    pub version: u32,
    pub status: ModuleStatus,
    pub kind: InstallKind,
    pub manifest: CapabilityManifest,
}

impl ModuleRecord {
    /// Record for a module that started from the bundled registry.
    pub fn bundled(package: &str) -> Self {
        Self {
            package_name: package.to_string(),
            display_name: package.to_string(),
            version: 0,
            status: ModuleStatus::On,
            kind: InstallKind::Bundled,
            manifest: CapabilityManifest::default(),
        }
    }

    /// Record for an installed module described by `info`.
    pub fn installed(package: &str, info: &PackageInfo, status: ModuleStatus) -> Self {
        Self {
            package_name: package.to_string(),
            display_name: info.display_name.clone(),
            version: info.version,
            status,
            kind: InstallKind::Installed,
            manifest: info.manifest.clone(),
        }
    }
}

/// Metadata the launcher resolves for an installed package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub display_name: String,
    pub version: u32,
    pub manifest: CapabilityManifest,
}
