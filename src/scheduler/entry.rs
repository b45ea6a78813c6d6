//! Schedule entries and their actions.

use super::Trigger;
use crate::settings::GLOBAL_SCOPE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happens when an entry fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Publish a named action on the notification bus.
    Broadcast { name: String },
    /// Deliver `target` directly to the owning module.
    Invoke { target: String },
}

impl Action {
    pub fn broadcast(name: impl Into<String>) -> Self {
        Action::Broadcast { name: name.into() }
    }

    pub fn invoke(target: impl Into<String>) -> Self {
        Action::Invoke {
            target: target.into(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Action::Broadcast { name } => format!("broadcast {name}"),
            Action::Invoke { target } => format!("invoke {target}"),
        }
    }
}

/// A persisted recurring action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    /// Module that owns the entry, or the global scope for framework entries.
    pub owner: String,
    pub trigger: Trigger,
    pub action: Action,
    pub last_triggered: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn new(id: impl Into<String>, trigger: Trigger, action: Action) -> Self {
        Self {
            id: id.into(),
            owner: GLOBAL_SCOPE.to_string(),
            trigger,
            action,
            last_triggered: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Same owner, trigger and action, ignoring firing history.
    pub fn same_definition(&self, other: &ScheduleEntry) -> bool {
        self.owner == other.owner
            && self.trigger.normalized() == other.trigger.normalized()
            && self.action == other.action
    }
}
