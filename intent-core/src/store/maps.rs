//! Cluster-shared record and pending maps.
//!
//! Every gate decision and the write it admits happen under the map's entry
//! lock, so concurrent writers for one key are serialized.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::cluster::NodeId;
use crate::data::IntentData;
use crate::key::Key;
use crate::state::IntentState;
use crate::store::event::IntentEvent;

const DEFAULT_EVENT_CAPACITY: usize = 256;

struct CurrentEntry {
    data: IntentData,
    updated_at: Instant,
}

struct PendingEntry {
    data: IntentData,
    queued_at: Instant,
}

/// Pending work announced for whichever node owns the key.
#[derive(Debug, Clone)]
pub struct PendingAnnouncement {
    /// Key with new pending work.
    pub key: Key,
    /// Node that queued the work.
    pub origin: NodeId,
}

/// Key-to-record maps shared by every node of the cluster.
///
/// Stands in for the replicated backing store: each node wraps the same
/// instance in its own [`IntentStore`](crate::store::IntentStore), which adds
/// ownership checks and validation. All per-key updates happen under the
/// map's entry lock so the gate and the write are atomic.
pub struct ReplicatedIntentMaps {
    current: DashMap<Key, CurrentEntry>,
    pending: DashMap<Key, PendingEntry>,
    events_tx: broadcast::Sender<IntentEvent>,
    pending_tx: broadcast::Sender<PendingAnnouncement>,
}

impl Default for ReplicatedIntentMaps {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ReplicatedIntentMaps {
    /// Empty maps whose event channels buffer `event_capacity` messages.
    #[must_use]
    pub fn new(event_capacity: usize) -> Self {
        let capacity = event_capacity.max(1);
        let (events_tx, _) = broadcast::channel(capacity);
        let (pending_tx, _) = broadcast::channel(capacity);
        Self {
            current: DashMap::new(),
            pending: DashMap::new(),
            events_tx,
            pending_tx,
        }
    }

    /// Applies `incoming` if `accept` approves it against the stored record.
    ///
    /// A purge request removes the record instead of storing it. When `notify`
    /// is set the matching lifecycle event is published while the entry lock
    /// is still held, so events for one key leave in commit order.
    pub(crate) fn commit(
        &self,
        incoming: IntentData,
        notify: bool,
        accept: impl FnOnce(Option<&IntentData>, &IntentData) -> bool,
    ) -> bool {
        let now = Instant::now();
        let purge = incoming.state() == IntentState::PurgeReq;
        match self.current.entry(incoming.key().clone()) {
            Entry::Occupied(mut occupied) => {
                if !accept(Some(&occupied.get().data), &incoming) {
                    return false;
                }
                if notify {
                    self.publish(&incoming);
                }
                if purge {
                    occupied.remove();
                } else {
                    occupied.insert(CurrentEntry {
                        data: incoming,
                        updated_at: now,
                    });
                }
            }
            Entry::Vacant(vacant) => {
                // Nothing stored means nothing to purge and nothing to announce.
                if !accept(None, &incoming) || purge {
                    return false;
                }
                if notify {
                    self.publish(&incoming);
                }
                vacant.insert(CurrentEntry {
                    data: incoming,
                    updated_at: now,
                });
            }
        }
        true
    }

    fn publish(&self, data: &IntentData) {
        if let Some(event) = IntentEvent::from_data(data) {
            trace!(key = %data.key(), kind = %event.kind, "publishing intent event");
            let _ = self.events_tx.send(event);
        }
    }

    /// Queues `data` unless newer work or a newer record already exists.
    ///
    /// Re-delivery of the queued version is accepted and announced again.
    pub(crate) fn enqueue_pending(&self, data: &IntentData) -> bool {
        if let Some(current) = self.current.get(data.key())
            && data.version().is_older_than(current.data.version())
        {
            return false;
        }

        let queued = match self.pending.entry(data.key().clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().data.version();
                if data.version().is_newer_than(existing) {
                    occupied.insert(PendingEntry {
                        data: data.clone(),
                        queued_at: Instant::now(),
                    });
                    true
                } else {
                    existing == data.version()
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingEntry {
                    data: data.clone(),
                    queued_at: Instant::now(),
                });
                true
            }
        };

        if queued {
            let _ = self.pending_tx.send(PendingAnnouncement {
                key: data.key().clone(),
                origin: data.origin().clone(),
            });
        }
        queued
    }

    /// Drops the pending entry for `data` unless newer work replaced it.
    pub(crate) fn complete_pending(&self, data: &IntentData) {
        self.pending
            .remove_if(data.key(), |_, entry| !entry.data.version().is_newer_than(data.version()));
    }

    /// Restarts the pending timer of a re-dispatched entry.
    pub(crate) fn touch_pending(&self, key: &Key) {
        if let Some(mut entry) = self.pending.get_mut(key) {
            entry.queued_at = Instant::now();
        }
    }

    /// Stored record for `key`.
    #[must_use]
    pub fn current(&self, key: &Key) -> Option<IntentData> {
        self.current.get(key).map(|entry| entry.data.clone())
    }

    /// Time of the last committed change for `key`.
    #[must_use]
    pub fn updated_at(&self, key: &Key) -> Option<Instant> {
        self.current.get(key).map(|entry| entry.updated_at)
    }

    /// Queued work for `key`.
    #[must_use]
    pub fn pending(&self, key: &Key) -> Option<IntentData> {
        self.pending.get(key).map(|entry| entry.data.clone())
    }

    /// Snapshot of every stored record.
    #[must_use]
    pub fn current_records(&self) -> Vec<IntentData> {
        self.current
            .iter()
            .map(|entry| entry.value().data.clone())
            .collect()
    }

    /// Snapshot of every stored record with its last change time.
    pub(crate) fn current_with_age(&self) -> Vec<(IntentData, Instant)> {
        self.current
            .iter()
            .map(|entry| (entry.value().data.clone(), entry.value().updated_at))
            .collect()
    }

    /// Snapshot of queued work with the time each entry was queued.
    pub(crate) fn pending_with_age(&self) -> Vec<(IntentData, Instant)> {
        self.pending
            .iter()
            .map(|entry| (entry.value().data.clone(), entry.value().queued_at))
            .collect()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Returns true when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Number of queued work entries.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Subscribe to lifecycle events from every node.
    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to pending-work announcements.
    pub fn subscribe_pending(&self) -> broadcast::Receiver<PendingAnnouncement> {
        self.pending_tx.subscribe()
    }
}
