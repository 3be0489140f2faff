//! The compile → install → track → recompile control loop.
//!
//! [`IntentManager`] is the public facade. Work for a key reaches the local
//! engine through the store delegate (locally owned submissions), the pending
//! announcement channel (work queued on another node), topology changes, the
//! cleanup sweep and leadership changes. All of it funnels into one per-node
//! dispatcher, which runs at most one attempt per key at a time.

mod cleanup;
mod dispatch;
mod manager;
mod processor;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::cluster::PartitionService;
use crate::compile::CompilerRegistry;
use crate::config::IntentEngineConfig;
use crate::data::{IntentData, UpdateCause};
use crate::install::{InstallCoordinator, InstallerRegistry};
use crate::key::Key;
use crate::metrics::EngineMetrics;
use crate::state::IntentState;
use crate::store::IntentStore;
use crate::tracker::{ObjectiveTracker, TopologyChangeDelegate};
use crate::version::{LogicalClock, Version};

pub use manager::IntentManager;

/// State shared by every task of one engine instance.
pub(crate) struct EngineCore {
    pub(crate) config: IntentEngineConfig,
    pub(crate) store: Arc<IntentStore>,
    pub(crate) partitions: Arc<PartitionService>,
    pub(crate) clock: LogicalClock,
    pub(crate) compilers: Arc<CompilerRegistry>,
    pub(crate) installers: Arc<InstallerRegistry>,
    pub(crate) tracker: Arc<ObjectiveTracker>,
    pub(crate) coordinator: InstallCoordinator,
    pub(crate) metrics: EngineMetrics,
}

impl EngineCore {
    /// Mints a version newer than anything recorded or queued for `key`.
    pub(crate) fn next_version(&self, key: &Key) -> Version {
        if let Some(current) = self.store.get_intent_data(key) {
            self.clock.observe(current.version());
        }
        if let Some(pending) = self.store.get_pending_data(key) {
            self.clock.observe(pending.version());
        }
        self.clock.tick()
    }

    /// Queues a recompilation (or a repeated withdrawal) of the record stored
    /// under `key`. Returns whether work was queued.
    pub(crate) fn recompile(&self, key: &Key, cause: UpdateCause) -> bool {
        let Some(stored) = self.store.get_intent_data(key) else {
            return false;
        };
        if let Some(pending) = self.store.get_pending_data(key)
            && pending.version().is_newer_than(stored.version())
        {
            trace!(key = %key, "newer work already queued; skipping recompilation");
            return false;
        }

        let version = self.next_version(key);
        let origin = self.store.local_node().clone();
        let work = match stored.state() {
            IntentState::Withdrawn | IntentState::PurgeReq => {
                trace!(key = %key, state = %stored.state(), "nothing to recompile");
                return false;
            }
            IntentState::WithdrawReq | IntentState::Withdrawing => {
                IntentData::rewithdraw(&stored, cause, version, origin)
            }
            IntentState::Corrupt if stored.request() == IntentState::WithdrawReq => {
                IntentData::rewithdraw(&stored, cause, version, origin)
            }
            _ => {
                self.metrics.recompilations.increment();
                IntentData::recompile(&stored, cause, version, origin)
            }
        };
        debug!(
            key = %key,
            state = %stored.state(),
            cause = ?cause,
            version = %version,
            "queueing recompilation"
        );
        self.store.add_pending(work);
        true
    }
}

impl TopologyChangeDelegate for EngineCore {
    fn trigger_compile(&self, keys: Vec<Key>, compile_all_failed: bool) {
        for key in &keys {
            if self.partitions.is_mine(key) {
                self.recompile(key, UpdateCause::Topology);
            }
        }
        if compile_all_failed {
            let failed: Vec<_> = self
                .store
                .get_intent_records()
                .into_iter()
                .filter(|data| data.state() == IntentState::Failed)
                .filter(|data| self.partitions.is_mine(data.key()))
                .collect();
            for data in failed {
                self.recompile(data.key(), UpdateCause::Topology);
            }
        }
    }
}
