//! Context Sensor Agent - orchestration layer for device-resident context sensing.
//!
//! The agent keeps dozens of independently toggleable sensing modules under one
//! policy: which modules run, when data is synchronized, when old data is
//! cleared, and how raw samples reach storage without unbounded memory or I/O.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Context Sensor Agent                       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │   ┌──────────────┐      ┌──────────────┐      ┌──────────────┐   │
//! │   │   Settings   │◀────▶│ Orchestrator │─────▶│  Scheduler   │   │
//! │   │ (key,scope)  │      │  (watchdog)  │      │ (triggers)   │   │
//! │   └──────────────┘      └──────────────┘      └──────────────┘   │
//! │          ▲                     │                     │           │
//! │          │                     ▼                     ▼           │
//! │   ┌──────────────┐      ┌──────────────┐      ┌──────────────┐   │
//! │   │  Lifecycle   │─────▶│   Sensors    │─────▶│ SampleBuffer │   │
//! │   │  (modules)   │      │ (producers)  │      │ (batch/flush)│   │
//! │   └──────────────┘      └──────────────┘      └──────────────┘   │
//! │                                                      │           │
//! │                     Notification bus ◀───────────────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use context_sensor_agent::{bus::NotificationBus, settings::SettingsStore, storage::MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let settings = SettingsStore::new(store, NotificationBus::new());
//!
//! settings.set("status_barometer", "true", None);
//! assert_eq!(settings.get("status_barometer", None), "true");
//! ```

pub mod buffer;
pub mod bus;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod sensors;
pub mod settings;
pub mod storage;
pub mod transparency;

#[cfg(feature = "gateway")]
pub mod gateway;

// Re-export key types at crate root for convenience
pub use buffer::{BufferConfig, FlushMode, Sample, SampleBuffer, DEFAULT_BUFFER_CAPACITY};
pub use bus::{Notification, NotificationBus, Topic};
pub use config::{Config, ConfigError};
pub use lifecycle::{
    Catalog, LaunchError, LifecycleManager, ModuleRecord, ModuleRuntime, ModuleStatus,
    PluginLauncher, PluginStart, ReconcileReport,
};
pub use orchestrator::{
    ActivationReport, AgentContext, Orchestrator, ScheduleChange, SyncError, SyncService,
    SyncedProducer,
};
pub use scheduler::{
    Action, ActionDispatcher, Evaluation, SaveOutcome, ScheduleEntry, ScheduleError, Scheduler,
    Trigger,
};
pub use sensors::{FixSelection, SensorRuntime};
pub use settings::{SettingsStore, GLOBAL_SCOPE};
pub use storage::{MemoryStore, SqliteStore, StorageError};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

#[cfg(feature = "gateway")]
pub use gateway::{
    BlockingGatewayClient, GatewayClient, GatewayConfig, GatewayError, GatewaySync,
    SampleUploader,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
