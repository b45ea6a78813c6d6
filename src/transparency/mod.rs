//! Transparency counters for the context sensor agent.
//!
//! Tracks how much was collected, persisted and lost, and which modules and
//! schedules ran, without holding any sample content.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
