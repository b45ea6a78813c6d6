//! Time-trigger scheduler.
//!
//! Entries are persisted with their last firing time, so evaluation is
//! idempotent: calling [`Scheduler::evaluate`] twice at the same instant fires
//! nothing the second time, and a window missed while the agent was down
//! fires exactly once on the next call.

pub mod engine;
pub mod entry;
pub mod trigger;

pub use engine::{ActionDispatcher, Evaluation, SaveOutcome, Scheduler};
pub use entry::{Action, ScheduleEntry};
pub use trigger::Trigger;

use crate::storage::StorageError;

/// Errors returned when saving a schedule entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    EmptyId,
    ZeroInterval,
    EmptyDaySet,
    EmptyMonthSet,
    /// Anchor day outside 1..=31.
    InvalidDay(u32),
    EmptyTarget,
    Storage(StorageError),
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::EmptyId => write!(f, "Schedule id must not be empty"),
            ScheduleError::ZeroInterval => write!(f, "Interval must be at least one minute"),
            ScheduleError::EmptyDaySet => write!(f, "Weekday set must not be empty"),
            ScheduleError::EmptyMonthSet => write!(f, "Month set must not be empty"),
            ScheduleError::InvalidDay(day) => write!(f, "Day {day} is outside 1..=31"),
            ScheduleError::EmptyTarget => write!(f, "Action target must not be empty"),
            ScheduleError::Storage(e) => write!(f, "Schedule storage failed: {e}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<StorageError> for ScheduleError {
    fn from(e: StorageError) -> Self {
        ScheduleError::Storage(e)
    }
}

/// Failure to deliver a fired action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchError(pub String);

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dispatch failed: {}", self.0)
    }
}

impl std::error::Error for DispatchError {}
