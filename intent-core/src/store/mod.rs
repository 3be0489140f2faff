//! Authoritative intent records, the pending-work queue and lifecycle events.
//!
//! Every node owns an [`IntentStore`] over the shared
//! [`ReplicatedIntentMaps`]. Writes go through two doors:
//!
//! - [`IntentStore::write`] for externally meaningful states, gated by
//!   [`is_update_acceptable`](crate::validator::is_update_acceptable) and
//!   announced to listeners;
//! - `IntentStore::stage` for the engine's own transient progress, which is
//!   recorded for recovery but never announced.
//!
//! Both check partition ownership before touching the maps.

/// Lifecycle events.
pub mod event;
/// Shared backing maps.
pub mod maps;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::cluster::{NodeId, PartitionService};
use crate::data::IntentData;
use crate::intent::Intent;
use crate::key::Key;
use crate::state::IntentState;
use crate::validator::{UpdateVerdict, evaluate_update, is_stage_acceptable};

pub use event::{IntentEvent, IntentEventKind};
pub use maps::{PendingAnnouncement, ReplicatedIntentMaps};

/// Receiver of pending work for keys the local node owns.
pub trait IntentStoreDelegate: Send + Sync {
    /// Hands one unit of work to the compile loop. Must not block.
    fn process(&self, data: IntentData);
}

/// Result of a store write. Writes never fail loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record was committed.
    Applied,
    /// The state layer refused the record.
    Rejected(UpdateVerdict),
    /// The local node does not own the key.
    NotOwner,
}

impl WriteOutcome {
    /// Whether the record was committed.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Node-local handle on the shared intent maps.
pub struct IntentStore {
    maps: Arc<ReplicatedIntentMaps>,
    partitions: Arc<PartitionService>,
    delegate: RwLock<Option<Arc<dyn IntentStoreDelegate>>>,
}

impl IntentStore {
    /// Store for the node identified by `partitions`.
    #[must_use]
    pub fn new(maps: Arc<ReplicatedIntentMaps>, partitions: Arc<PartitionService>) -> Self {
        Self {
            maps,
            partitions,
            delegate: RwLock::new(None),
        }
    }

    /// Node this store writes for.
    #[must_use]
    pub fn local_node(&self) -> &NodeId {
        self.partitions.local_node()
    }

    /// Shared backing maps.
    #[must_use]
    pub fn maps(&self) -> &Arc<ReplicatedIntentMaps> {
        &self.maps
    }

    /// Installs the receiver of locally owned pending work.
    pub fn set_delegate(&self, delegate: Arc<dyn IntentStoreDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Removes the delegate; pending work waits until one is set again.
    pub fn unset_delegate(&self) {
        *self.delegate.write() = None;
    }

    /// Whether the local node owns `key`.
    #[must_use]
    pub fn is_master(&self, key: &Key) -> bool {
        self.partitions.is_mine(key)
    }

    /// Commits `data` if the local node owns its key and the state layer accepts it.
    ///
    /// Accepted parking states are announced to listeners; a purge request
    /// removes the record and announces `PURGED`. Rejections are logged and
    /// reported through the outcome, never raised.
    pub fn write(&self, data: IntentData) -> WriteOutcome {
        if let Err(err) = self.partitions.check_owner(data.key()) {
            debug!(key = %data.key(), error = %err, "dropping write for foreign key");
            return WriteOutcome::NotOwner;
        }

        let key = data.key().clone();
        let (state, version) = (data.state(), data.version());
        let mut verdict = UpdateVerdict::FirstWrite;
        let applied = self.maps.commit(data, true, |current, incoming| {
            verdict = evaluate_update(current, incoming);
            verdict.is_accepted()
        });

        if applied {
            trace!(key = %key, state = %state, version = %version, "intent record committed");
            return WriteOutcome::Applied;
        }

        match verdict {
            UpdateVerdict::TransientTarget => warn!(
                key = %key,
                state = %state,
                version = %version,
                "rejected externally proposed transient state"
            ),
            UpdateVerdict::InstallOverWithdrawal => warn!(
                key = %key,
                state = %state,
                version = %version,
                "policy violation: install proposed over a withdrawn intent"
            ),
            UpdateVerdict::Stale => trace!(key = %key, version = %version, "dropping stale write"),
            UpdateVerdict::NothingToPurge => {
                debug!(key = %key, version = %version, "purge requested for unknown key");
            }
            _ => debug!(key = %key, state = %state, verdict = ?verdict, "write rejected"),
        }
        WriteOutcome::Rejected(verdict)
    }

    /// Records transient progress of the engine's own compile/install loop.
    pub(crate) fn stage(&self, data: IntentData) -> WriteOutcome {
        if !data.state().is_in_progress() {
            warn!(key = %data.key(), state = %data.state(), "refusing to stage a parking state");
            return WriteOutcome::Rejected(UpdateVerdict::IllegalTransition);
        }
        if !self.partitions.is_mine(data.key()) {
            return WriteOutcome::NotOwner;
        }

        let key = data.key().clone();
        let state = data.state();
        if self.maps.commit(data, false, is_stage_acceptable) {
            trace!(key = %key, state = %state, "staged transient state");
            WriteOutcome::Applied
        } else {
            debug!(key = %key, state = %state, "stage rejected");
            WriteOutcome::Rejected(UpdateVerdict::IllegalTransition)
        }
    }

    /// Queues work for `data`'s key and hands it to the delegate when the
    /// local node owns the key; otherwise the owner picks it up from the
    /// shared announcement channel.
    pub fn add_pending(&self, data: IntentData) {
        if !self.maps.enqueue_pending(&data) {
            trace!(key = %data.key(), version = %data.version(), "ignoring superseded pending work");
            return;
        }
        if !self.partitions.is_mine(data.key()) {
            trace!(key = %data.key(), "pending work left for the owning node");
            return;
        }
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.process(data);
        }
    }

    /// Marks the pending entry for `data` as handled.
    pub(crate) fn complete_pending(&self, data: &IntentData) {
        self.maps.complete_pending(data);
    }

    /// Intent stored under `key`.
    #[must_use]
    pub fn get_intent(&self, key: &Key) -> Option<Intent> {
        self.maps.current(key).map(|data| data.intent().clone())
    }

    /// Full record stored under `key`.
    #[must_use]
    pub fn get_intent_data(&self, key: &Key) -> Option<IntentData> {
        self.maps.current(key)
    }

    /// Current state of `key`.
    #[must_use]
    pub fn get_intent_state(&self, key: &Key) -> Option<IntentState> {
        self.maps.current(key).map(|data| data.state())
    }

    /// Installables compiled for `key`, empty when unknown.
    #[must_use]
    pub fn get_installable_intents(&self, key: &Key) -> Vec<Intent> {
        self.maps
            .current(key)
            .map(|data| data.installables().to_vec())
            .unwrap_or_default()
    }

    /// Queued work for `key`.
    #[must_use]
    pub fn get_pending_data(&self, key: &Key) -> Option<IntentData> {
        self.maps.pending(key)
    }

    /// Every stored intent.
    #[must_use]
    pub fn get_intents(&self) -> Vec<Intent> {
        self.maps
            .current_records()
            .into_iter()
            .map(|data| data.intent().clone())
            .collect()
    }

    /// Every stored record.
    #[must_use]
    pub fn get_intent_records(&self) -> Vec<IntentData> {
        self.maps.current_records()
    }

    /// Number of stored records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.maps.len()
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.maps.subscribe()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::cluster::ClusterMembership;
    use crate::intent::IntentPayload;
    use crate::key::{ApplicationId, SequentialIdGenerator};
    use crate::version::Version;

    fn solo_store() -> IntentStore {
        let membership = Arc::new(ClusterMembership::new(NodeId::new("solo")));
        let partitions = Arc::new(PartitionService::new(membership, 14));
        IntentStore::new(Arc::new(ReplicatedIntentMaps::default()), partitions)
    }

    fn intent() -> Intent {
        Intent::builder(
            ApplicationId::new(1, "store"),
            IntentPayload::FlowRule { rules: Vec::new() },
        )
        .id_generator(Arc::new(SequentialIdGenerator::default()))
        .build()
        .unwrap()
    }

    fn submit(intent: &Intent, logical: u64) -> IntentData {
        IntentData::submit(intent.clone(), Version::new(logical, 1), NodeId::new("solo"))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<IntentData>>);

    impl IntentStoreDelegate for Recorder {
        fn process(&self, data: IntentData) {
            self.0.lock().push(data);
        }
    }

    #[test]
    fn replayed_write_emits_one_event() {
        let store = solo_store();
        let mut events = store.subscribe();
        let data = submit(&intent(), 1).with_state(IntentState::Installed);

        assert_eq!(store.write(data.clone()), WriteOutcome::Applied);
        assert_eq!(
            store.write(data),
            WriteOutcome::Rejected(UpdateVerdict::NoOp)
        );
        assert_eq!(events.try_recv().unwrap().kind, IntentEventKind::Installed);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn transient_states_are_staged_silently() {
        let store = solo_store();
        let mut events = store.subscribe();
        let data = submit(&intent(), 1);

        assert!(store.write(data.clone()).is_applied());
        assert!(store.stage(data.with_state(IntentState::Compiling)).is_applied());
        assert_eq!(store.get_intent_state(data.key()), Some(IntentState::Compiling));
        assert_eq!(
            store.write(data.with_state(IntentState::Installing)),
            WriteOutcome::Rejected(UpdateVerdict::TransientTarget)
        );
        assert_eq!(events.try_recv().unwrap().kind, IntentEventKind::InstallReq);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn purge_request_removes_the_record() {
        let store = solo_store();
        let intent = intent();
        let withdrawn = submit(&intent, 1).with_state(IntentState::Withdrawn);
        assert!(store.write(withdrawn).is_applied());

        let mut events = store.subscribe();
        let purge = IntentData::purge(intent.clone(), Version::new(1, 1), NodeId::new("solo"));
        assert!(store.write(purge).is_applied());
        assert!(store.get_intent(intent.key()).is_none());
        assert_eq!(store.count(), 0);
        assert_eq!(events.try_recv().unwrap().kind, IntentEventKind::Purged);
    }

    #[test]
    fn purge_of_unknown_key_is_dropped() {
        let store = solo_store();
        let mut events = store.subscribe();
        let intent = intent();
        let purge = IntentData::purge(intent.clone(), Version::new(1, 1), NodeId::new("solo"));

        assert_eq!(
            store.write(purge),
            WriteOutcome::Rejected(UpdateVerdict::NothingToPurge)
        );
        assert!(store.get_intent(intent.key()).is_none());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn pending_work_reaches_the_delegate_once_per_version() {
        let store = solo_store();
        let recorder = Arc::new(Recorder::default());
        store.set_delegate(Arc::clone(&recorder) as Arc<dyn IntentStoreDelegate>);
        let intent = intent();

        store.add_pending(submit(&intent, 2));
        store.add_pending(submit(&intent, 1));
        store.add_pending(submit(&intent, 2));

        let seen = recorder.0.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|data| data.version() == Version::new(2, 1)));
        assert_eq!(
            store.get_pending_data(intent.key()).map(|data| data.version()),
            Some(Version::new(2, 1))
        );
    }

    #[test]
    fn older_version_arriving_late_never_replaces_a_newer_one() {
        let store = solo_store();
        let mut events = store.subscribe();
        let ids = Arc::new(SequentialIdGenerator::default());
        let key = Key::of("late", &ApplicationId::new(1, "store"));
        let build = || {
            Intent::builder(
                ApplicationId::new(1, "store"),
                IntentPayload::FlowRule { rules: Vec::new() },
            )
            .id_generator(Arc::clone(&ids) as Arc<dyn crate::key::IdGenerator>)
            .key(key.clone())
            .build()
            .unwrap()
        };
        let (older, newer) = (build(), build());
        assert_ne!(older.id(), newer.id());

        store.add_pending(submit(&newer, 2));
        store.add_pending(submit(&older, 1));
        let pending = store.get_pending_data(&key).unwrap();
        assert_eq!(pending.version(), Version::new(2, 1));
        assert_eq!(pending.intent().id(), newer.id());

        assert!(store.write(submit(&newer, 2)).is_applied());
        assert_eq!(
            store.write(submit(&older, 1)),
            WriteOutcome::Rejected(UpdateVerdict::Stale)
        );
        assert_eq!(store.get_intent(&key).unwrap().id(), newer.id());
        assert_eq!(events.try_recv().unwrap().kind, IntentEventKind::InstallReq);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn completed_pending_is_cleared_unless_superseded() {
        let store = solo_store();
        let intent = intent();
        let first = submit(&intent, 1);
        store.add_pending(first.clone());
        store.add_pending(submit(&intent, 2));
        store.complete_pending(&first);
        assert!(store.get_pending_data(intent.key()).is_some());
        store.complete_pending(&submit(&intent, 2));
        assert!(store.get_pending_data(intent.key()).is_none());
    }
}
