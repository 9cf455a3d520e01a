//! Registry change notifications.
//!
//! Subscribers are owned by the [`ConfigStore`](super::ConfigStore) that
//! created them and are dropped with it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::script::Script;

/// What happened to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Installed,
    /// Reinstall of an existing id.
    Updated,
    Edited,
    EditEnabled,
    Moved,
    UninstallQueued,
    UninstallCanceled,
    /// Uninstall finalized; the script is gone.
    Removed,
    /// Body changed on disk and was re-read.
    Modified,
    BlockStateChanged,
    /// Registry-wide settings such as the exclude list.
    PreferencesChanged,
}

/// One change notification.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigEvent {
    /// Snapshot of the affected script after the change, if any.
    pub script: Option<Script>,
    pub kind: EventKind,
    pub data: Value,
}

impl ConfigEvent {
    pub fn new(kind: EventKind, script: Option<Script>, data: Value) -> Self {
        Self { script, kind, data }
    }
}

pub type Subscriber = Arc<dyn Fn(&ConfigEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(crate) struct Observers {
    next_id: Mutex<u64>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
}

impl Observers {
    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            SubscriptionId(*next)
        };
        self.subscribers.lock().push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every subscriber in subscription order.
    ///
    /// Subscribers are called without the list locked, so a subscriber may
    /// subscribe, unsubscribe or mutate the store.
    pub fn notify(&self, event: &ConfigEvent) {
        let subscribers: Vec<_> = self.subscribers.lock().clone();
        for (id, subscriber) in subscribers {
            match panic::catch_unwind(AssertUnwindSafe(|| subscriber(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = ?id, kind = ?event.kind, "Subscriber failed: {:#}", e)
                }
                Err(_) => warn!(subscription = ?id, kind = ?event.kind, "Subscriber panicked"),
            }
        }
    }
}
