//! Subscription registry.
//!
//! Maps `WatchKey`s to the observers interested in them, together with the
//! `WatchTarget` needed to re-issue the watch request after a reconnect.
//! Pure data structure: no I/O, no locking. The monitor guards it with its
//! state mutex so replay snapshots are consistent with concurrent edits.
//!
//! Observers are held weakly. The registry never keeps an observer alive;
//! an observer that was dropped without `unwatch` is skipped on delivery and
//! pruned on the next [`SubscriptionRegistry::prune_dead`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKind, WatchKey, WatchTarget};
use crate::error::ObserverError;

use super::events::EntityUpdate;

/// Receives updates for the entities it watches.
///
/// Callbacks run on the channel's delivery thread without any monitor lock
/// held. A returned error or a panic is logged and does not affect delivery
/// to other observers.
pub trait WatchObserver: Send + Sync {
    /// Called once per inbound update for a watched entity.
    ///
    /// # Errors
    ///
    /// Any error is logged by the monitor and otherwise ignored.
    fn on_update(&self, update: &EntityUpdate) -> Result<(), ObserverError>;
}

impl<F> WatchObserver for F
where
    F: Fn(&EntityUpdate) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_update(&self, update: &EntityUpdate) -> Result<(), ObserverError> {
        self(update)
    }
}

/// Unique identifier for an observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(Uuid);

impl ObserverId {
    /// Create a new random observer id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-owning handle to an observer.
///
/// Create one per observer and pass it to both `watch` and `unwatch`.
/// Clones share the same identity.
#[derive(Clone)]
pub struct ObserverHandle {
    id: ObserverId,
    observer: Weak<dyn WatchObserver>,
}

impl ObserverHandle {
    /// Creates a handle for a concrete observer.
    #[must_use]
    pub fn new<O: WatchObserver + 'static>(observer: &Arc<O>) -> Self {
        let weak = Arc::downgrade(observer);
        let observer: Weak<dyn WatchObserver> = weak;
        Self {
            id: ObserverId::new(),
            observer,
        }
    }

    /// Creates a handle for an already type-erased observer.
    #[must_use]
    pub fn from_dyn(observer: &Arc<dyn WatchObserver>) -> Self {
        Self {
            id: ObserverId::new(),
            observer: Arc::downgrade(observer),
        }
    }

    /// The registration identity.
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Whether the observer is still alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.observer.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<dyn WatchObserver>> {
        self.observer.upgrade()
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// One watched entity.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    /// Latest request parameters for the entity.
    pub target: WatchTarget,
    observers: Vec<ObserverHandle>,
    seq: u64,
}

impl SubscriptionEntry {
    /// Registry key.
    #[must_use]
    pub fn key(&self) -> WatchKey {
        self.target.key()
    }

    /// Observers in registration order.
    #[must_use]
    pub fn observers(&self) -> &[ObserverHandle] {
        &self.observers
    }
}

/// Result of [`SubscriptionRegistry::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new entry was created.
    Created,
    /// The observer joined an existing entry.
    ObserverAdded,
    /// The observer was already registered for this entry.
    AlreadyRegistered,
}

/// Result of [`SubscriptionRegistry::remove_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// No such entry, or the observer was not part of it.
    NotRegistered,
    /// Observer removed; others remain.
    ObserverRemoved,
    /// Observer removed and the entry, now empty, was pruned.
    EntryPruned,
}

/// Registry of watched entities.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<WatchKey, SubscriptionEntry>,
    next_seq: u64,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `observer`'s interest in `target`, creating the entry if needed.
    ///
    /// The stored target is replaced with the latest one so replays use the
    /// most recent share UUID.
    pub fn upsert(&mut self, target: WatchTarget, observer: ObserverHandle) -> UpsertOutcome {
        let key = target.key();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.target = target;
            if entry.observers.iter().any(|o| o.id == observer.id) {
                return UpsertOutcome::AlreadyRegistered;
            }
            entry.observers.push(observer);
            return UpsertOutcome::ObserverAdded;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key,
            SubscriptionEntry {
                target,
                observers: vec![observer],
                seq,
            },
        );
        UpsertOutcome::Created
    }

    /// Removes one observer; prunes the entry when it becomes empty.
    pub fn remove_observer(&mut self, key: &WatchKey, observer: ObserverId) -> RemoveOutcome {
        let Some(entry) = self.entries.get_mut(key) else {
            return RemoveOutcome::NotRegistered;
        };
        let before = entry.observers.len();
        entry.observers.retain(|o| o.id != observer);
        if entry.observers.len() == before {
            return RemoveOutcome::NotRegistered;
        }
        if entry.observers.is_empty() {
            self.entries.remove(key);
            return RemoveOutcome::EntryPruned;
        }
        RemoveOutcome::ObserverRemoved
    }

    /// Drops observers whose owner has gone away. Returns the keys of
    /// entries that became empty and were pruned.
    pub fn prune_dead(&mut self) -> Vec<WatchKey> {
        let mut pruned = Vec::new();
        self.entries.retain(|key, entry| {
            entry.observers.retain(ObserverHandle::is_alive);
            if entry.observers.is_empty() {
                pruned.push(key.clone());
                false
            } else {
                true
            }
        });
        pruned
    }

    /// Snapshot of every entry in insertion order.
    #[must_use]
    pub fn all_entries(&self) -> Vec<SubscriptionEntry> {
        let mut out: Vec<SubscriptionEntry> = self.entries.values().cloned().collect();
        out.sort_by_key(|e| e.seq);
        out
    }

    /// True if nobody watches `key`.
    #[must_use]
    pub fn is_empty(&self, key: &WatchKey) -> bool {
        !self.entries.contains_key(key)
    }

    /// Observers of `key`, in registration order.
    #[must_use]
    pub fn observers(&self, key: &WatchKey) -> Vec<ObserverHandle> {
        self.entries
            .get(key)
            .map(|e| e.observers.clone())
            .unwrap_or_default()
    }

    /// Current target for `key`.
    #[must_use]
    pub fn target(&self, key: &WatchKey) -> Option<&WatchTarget> {
        self.entries.get(key).map(|e| &e.target)
    }

    /// Keys of the given kind, in insertion order.
    #[must_use]
    pub fn keys_of(&self, kind: EntityKind) -> Vec<WatchKey> {
        let mut out: Vec<(u64, WatchKey)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(k, e)| (e.seq, k.clone()))
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        out.into_iter().map(|(_, k)| k).collect()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the registry holds no entries at all.
    #[must_use]
    pub fn is_vacant(&self) -> bool {
        self.entries.is_empty()
    }
}
