//! In-process notification bus.
//!
//! Producers publish samples, the settings store publishes changes, the
//! scheduler publishes broadcast actions and the package monitor publishes
//! install/remove events. Publishing never blocks: every subscriber owns a
//! bounded channel and a full channel drops the notification for that
//! subscriber only.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_CAPACITY: usize = 10_000;

/// Notification categories a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Samples,
    Settings,
    Actions,
    Packages,
    Control,
}

/// A message carried on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// One sample from a producer, as JSON.
    Sample {
        producer: String,
        data: serde_json::Value,
    },
    /// A setting value changed.
    SettingChanged { key: String, scope: String },
    /// A schedule fired with a broadcast action.
    Action { schedule_id: String, name: String },
    /// A plugin package was installed or replaced.
    PackageAdded { package: String, replacing: bool },
    /// A plugin package was removed.
    PackageRemoved { package: String, replacing: bool },
    /// Request a full reconciliation pass.
    Refresh,
}

impl Notification {
    pub fn topic(&self) -> Topic {
        match self {
            Notification::Sample { .. } => Topic::Samples,
            Notification::SettingChanged { .. } => Topic::Settings,
            Notification::Action { .. } => Topic::Actions,
            Notification::PackageAdded { .. } | Notification::PackageRemoved { .. } => {
                Topic::Packages
            }
            Notification::Refresh => Topic::Control,
        }
    }
}

struct Subscriber {
    topics: Vec<Topic>,
    sender: Sender<Notification>,
}

/// Cloneable handle to a shared bus.
#[derive(Clone, Default)]
pub struct NotificationBus {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the given topics. An empty slice subscribes to all.
    pub fn subscribe(&self, topics: &[Topic]) -> Receiver<Notification> {
        let (sender, receiver) = bounded(SUBSCRIBER_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                topics: topics.to_vec(),
                sender,
            });
        receiver
    }

    /// Deliver `notification` to every interested subscriber.
    ///
    /// Returns the number of subscribers that accepted it. Subscribers whose
    /// receiver was dropped are pruned.
    pub fn publish(&self, notification: Notification) -> usize {
        let topic = notification.topic();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut delivered = 0;
        subscribers.retain(|sub| {
            if !sub.topics.is_empty() && !sub.topics.contains(&topic) {
                return true;
            }
            match sub.sender.try_send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(?topic, "subscriber queue full, dropping notification");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
        delivered
    }

    /// Whether anyone is listening on `topic`.
    pub fn has_subscribers(&self, topic: Topic) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|sub| sub.topics.is_empty() || sub.topics.contains(&topic))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
