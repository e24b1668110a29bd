//! Telemetry for sync passes and guarded mutations.
//!
//! `SyncEvent` carries progress, corrupt-record and integrity reports;
//! `EventBus` fans them out to subscribers. Payload contents never appear in
//! events, only ids, collections, counts and timestamps.

use crate::collection::Collection;
use crate::session::TerminationReason;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A sync pass began.
    #[serde(rename_all = "camelCase")]
    SyncStarted {
        /// Checkpoint the delta is requested after, in ms since Unix epoch.
        after: i64,
        full_resync: bool,
    },
    /// Progress after each collection: changes loaded against the server's count.
    Progress {
        loaded: usize,
        /// Absent when the stats request failed.
        expected: Option<usize>,
    },
    /// One collection's delta was merged and persisted.
    CollectionMerged {
        collection: Collection,
        /// Items in the delta (tombstones included).
        received: usize,
        /// Items in the merged cache.
        total: usize,
    },
    /// Fetching or merging one collection failed; the checkpoint stays put.
    CollectionFailed { collection: Collection, error: String },
    /// A record could not be decrypted and was left out of the working set.
    CorruptRecord {
        collection: Collection,
        id: String,
        error: String,
    },
    /// An update older than a recorded tombstone was dropped.
    StaleUpdateDropped { collection: Collection, id: String },
    /// The checkpoint was persisted, in ms since Unix epoch.
    CheckpointAdvanced { checkpoint: i64 },
    /// The session ended during a pass.
    SessionTerminated { reason: TerminationReason },
    /// A history log does not replay to the entity's current state.
    #[serde(rename_all = "camelCase")]
    IntegrityViolation {
        entity_id: String,
        field: String,
        detail: String,
    },
    /// A guarded mutation was discarded because the fresh read failed.
    MutationAbandoned {
        collection: Collection,
        id: String,
        error: String,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus for publishing sync events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SyncEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn checkpoint(at: i64) -> SyncEvent {
        SyncEvent::CheckpointAdvanced { checkpoint: at }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| seen_clone.lock().unwrap().push(event));
        bus.emit(checkpoint(1000));

        assert_eq!(*seen.lock().unwrap(), vec![checkpoint(1000)]);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&count);
        let sub = bus.subscribe(move |_| {
            first.fetch_add(1, Ordering::Relaxed);
        });
        let second = Arc::clone(&count);
        let _keep = bus.subscribe(move |_| {
            second.fetch_add(10, Ordering::Relaxed);
        });

        bus.emit(checkpoint(1));
        assert_eq!(count.load(Ordering::Relaxed), 11);

        drop(sub);
        bus.emit(checkpoint(2));
        assert_eq!(count.load(Ordering::Relaxed), 21);
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::CorruptRecord {
            collection: Collection::MedicalFile,
            id: "m1".into(),
            error: "Decryption failed".into(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"corruptRecord\""));
        assert!(json.contains("\"collection\":\"medicalFile\""));
        assert!(json.contains("\"id\":\"m1\""));

        let started = serde_json::to_string(&SyncEvent::SyncStarted {
            after: 0,
            full_resync: true,
        })
        .unwrap();
        assert!(started.contains("\"fullResync\":true"));
    }
}
