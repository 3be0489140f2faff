//! Application-facing facade and the background loops of one engine node.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::batch::{IntentOperation, IntentOperations};
use crate::cluster::{ClusterMembership, LeadershipEvent, NodeId, PartitionService};
use crate::compile::{CompilerRegistry, IntentCompiler};
use crate::config::IntentEngineConfig;
use crate::data::{IntentData, UpdateCause};
use crate::engine::dispatch::Dispatcher;
use crate::engine::{EngineCore, cleanup};
use crate::error::IntentError;
use crate::install::{InstallCoordinator, InstallerRegistry, IntentInstaller};
use crate::intent::{Intent, IntentBuilder, IntentKind, IntentPayload};
use crate::key::{ApplicationId, IdGenerator, Key, SequentialIdGenerator};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::state::IntentState;
use crate::store::{
    IntentEvent, IntentStore, IntentStoreDelegate, PendingAnnouncement, ReplicatedIntentMaps,
};
use crate::tracker::{ObjectiveTracker, TopologyChangeDelegate, TopologyEvent};
use crate::version::LogicalClock;

/// Hands locally owned pending work to the dispatcher task.
struct EngineDelegate {
    work: mpsc::UnboundedSender<IntentData>,
}

impl IntentStoreDelegate for EngineDelegate {
    fn process(&self, data: IntentData) {
        if self.work.send(data).is_err() {
            trace!("engine stopped; pending work stays queued");
        }
    }
}

/// Background tasks of a started engine.
struct EngineHandle {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Entry point of the intent engine on one node.
///
/// Requests are asynchronous: [`submit`](Self::submit),
/// [`withdraw`](Self::withdraw) and [`purge`](Self::purge) only queue work,
/// and callers observe progress through [`subscribe`](Self::subscribe).
/// Whichever node owns the key's partition does the work.
pub struct IntentManager {
    core: Arc<EngineCore>,
    membership: Arc<ClusterMembership>,
    ids: Arc<dyn IdGenerator>,
    running: Mutex<Option<EngineHandle>>,
}

impl IntentManager {
    /// Engine for the local node of `membership`, sharing `maps` with the
    /// other nodes of the cluster.
    #[must_use]
    pub fn new(
        config: IntentEngineConfig,
        membership: Arc<ClusterMembership>,
        maps: Arc<ReplicatedIntentMaps>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        if let Err(err) = config.validate() {
            warn!(error = %err, "starting intent engine with questionable configuration");
        }
        let partitions = Arc::new(PartitionService::new(
            Arc::clone(&membership),
            config.partitions.count,
        ));
        let store = Arc::new(IntentStore::new(maps, Arc::clone(&partitions)));
        let installers = Arc::new(InstallerRegistry::new());
        let tracker = Arc::new(ObjectiveTracker::new());
        let coordinator = InstallCoordinator::new(
            Arc::clone(&installers),
            Arc::clone(&tracker),
            config.install.confirmation_timeout,
        );
        let core = EngineCore {
            clock: LogicalClock::new(membership.local_node()),
            compilers: Arc::new(CompilerRegistry::new(config.compile.max_depth)),
            metrics: EngineMetrics::new(),
            config,
            store,
            partitions,
            installers,
            tracker,
            coordinator,
        };
        Self {
            core: Arc::new(core),
            membership,
            ids,
            running: Mutex::new(None),
        }
    }

    /// Single-node engine with private maps and a sequential id generator.
    #[must_use]
    pub fn standalone(config: IntentEngineConfig, node: NodeId) -> Self {
        let maps = Arc::new(ReplicatedIntentMaps::new(config.events.capacity));
        Self::new(
            config,
            Arc::new(ClusterMembership::new(node)),
            maps,
            Arc::new(SequentialIdGenerator::default()),
        )
    }

    /// Starts the background tasks. Must be called from within a tokio
    /// runtime; calling it again while running does nothing.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("intent engine already running");
            return;
        }

        let core = &self.core;
        let dispatcher = Dispatcher::new(Arc::clone(core), core.config.worker_threads);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let announcements = core.store.maps().subscribe_pending();
        let leadership = core.partitions.subscribe();

        let mut tasks = Vec::with_capacity(6);
        tasks.push(tokio::spawn(dispatch_loop(
            Arc::clone(&dispatcher),
            work_rx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(forward_loop(
            Arc::clone(core),
            Arc::clone(&dispatcher),
            announcements,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(leadership_loop(
            Arc::clone(core),
            Arc::clone(&dispatcher),
            leadership,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(cleanup_loop(
            Arc::clone(core),
            Arc::clone(&dispatcher),
            shutdown_rx.clone(),
        )));
        tasks.push(core.partitions.spawn(shutdown_rx));

        core.store.set_delegate(Arc::new(EngineDelegate { work: work_tx }));
        core.tracker
            .set_delegate(Arc::clone(core) as Arc<dyn TopologyChangeDelegate>);
        let resumed = cleanup::dispatch_owned_pending(core, &dispatcher);

        info!(
            node = %core.store.local_node(),
            partitions = core.partitions.local_partitions().len(),
            resumed,
            "intent engine started"
        );
        *running = Some(EngineHandle {
            dispatcher,
            shutdown_tx,
            tasks,
        });
    }

    /// Stops the background tasks and waits for them to exit. Attempts that
    /// already hold a worker run to completion; queued ones are dropped and
    /// stay pending for the next owner.
    pub async fn shutdown(&self) {
        let Some(handle) = self.running.lock().take() else {
            return;
        };
        self.core.store.unset_delegate();
        self.core.tracker.unset_delegate();
        handle.dispatcher.close();
        let _ = handle.shutdown_tx.send(true);
        for task in handle.tasks {
            let _ = task.await;
        }
        info!(
            node = %self.core.store.local_node(),
            in_flight = handle.dispatcher.in_flight(),
            "intent engine stopped"
        );
    }

    /// Whether [`start`](Self::start) ran and [`shutdown`](Self::shutdown) did not.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Feeds topology events into the objective tracker until shutdown.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn attach_topology_feed(
        &self,
        events: mpsc::Receiver<TopologyEvent>,
    ) -> Result<(), IntentError> {
        let mut running = self.running.lock();
        let handle = running.as_mut().ok_or(IntentError::NotRunning)?;
        let shutdown = handle.shutdown_tx.subscribe();
        handle.tasks.push(self.core.tracker.spawn(events, shutdown));
        Ok(())
    }

    /// Builder bound to this engine's id generator.
    pub fn builder(&self, app_id: ApplicationId, payload: IntentPayload) -> IntentBuilder {
        Intent::builder(app_id, payload).id_generator(Arc::clone(&self.ids))
    }

    /// Requests installation of `intent`.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn submit(&self, intent: Intent) -> Result<(), IntentError> {
        self.ensure_running()?;
        let version = self.core.next_version(intent.key());
        debug!(key = %intent.key(), version = %version, "intent submitted");
        self.core.metrics.submissions.increment();
        let data = IntentData::submit(intent, version, self.local_node().clone());
        self.core.store.add_pending(data);
        Ok(())
    }

    /// Requests removal of `intent`'s installables from the environment.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn withdraw(&self, intent: Intent) -> Result<(), IntentError> {
        self.ensure_running()?;
        let version = self.core.next_version(intent.key());
        debug!(key = %intent.key(), version = %version, "intent withdrawn");
        self.core.metrics.withdrawals.increment();
        let data = IntentData::withdraw(intent, version, self.local_node().clone());
        self.core.store.add_pending(data);
        Ok(())
    }

    /// Requests removal of `intent`'s record. Only withdrawn or failed
    /// intents are purged; anything else is logged and left alone.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn purge(&self, intent: Intent) -> Result<(), IntentError> {
        self.ensure_running()?;
        let version = self.core.next_version(intent.key());
        debug!(key = %intent.key(), version = %version, "intent purge requested");
        let data = IntentData::purge(intent, version, self.local_node().clone());
        self.core.store.add_pending(data);
        Ok(())
    }

    /// Withdraws the intent stored under `old` and submits `new`. When both
    /// share a key, or nothing live is stored under `old`, this is a plain
    /// submit.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn replace(&self, old: &Key, new: Intent) -> Result<(), IntentError> {
        self.ensure_running()?;
        if old != new.key()
            && let Some(stored) = self.core.store.get_intent_data(old)
        {
            if stored.request().is_withdrawal() {
                trace!(key = %old, "replaced intent already on its way out");
            } else {
                debug!(old = %old, new = %new.key(), "replacing intent");
                self.withdraw(stored.intent().clone())?;
            }
        }
        self.submit(new)
    }

    /// Applies a batch in order. Empty batches are ignored; operations on
    /// another application's keys are skipped.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn execute(&self, operations: IntentOperations) -> Result<(), IntentError> {
        if operations.is_empty() {
            return Ok(());
        }
        self.ensure_running()?;
        let app_id = operations.app_id().clone();
        for operation in operations {
            if !operation.belongs_to(&app_id) {
                warn!(
                    batch = %app_id,
                    operation = %operation,
                    "skipping operation on another application's intent"
                );
                continue;
            }
            match operation {
                IntentOperation::Submit(intent) => self.submit(intent)?,
                IntentOperation::Withdraw(intent) => self.withdraw(intent)?,
                IntentOperation::Purge(intent) => self.purge(intent)?,
                IntentOperation::Replace { old, new } => self.replace(&old, new)?,
                IntentOperation::Recompile(key) => {
                    self.core.recompile(&key, UpdateCause::Retry);
                }
            }
        }
        Ok(())
    }

    /// Forwards a topology event to the objective tracker, returning the
    /// affected keys and whether failed intents are retried as well.
    pub fn topology_changed(&self, event: &TopologyEvent) -> (Vec<Key>, bool) {
        self.core.tracker.topology_changed(event)
    }

    /// Registers `compiler` for `kind`, returning the one it replaced.
    pub fn register_compiler(
        &self,
        kind: IntentKind,
        compiler: Arc<dyn IntentCompiler>,
    ) -> Option<Arc<dyn IntentCompiler>> {
        self.core.compilers.register(kind, compiler)
    }

    /// Removes the compiler for `kind`.
    pub fn unregister_compiler(&self, kind: IntentKind) -> Option<Arc<dyn IntentCompiler>> {
        self.core.compilers.unregister(kind)
    }

    /// Kinds with a registered compiler.
    #[must_use]
    pub fn compilers(&self) -> Vec<IntentKind> {
        self.core.compilers.kinds()
    }

    /// Registers `installer` for `kind`, returning the one it replaced.
    pub fn register_installer(
        &self,
        kind: IntentKind,
        installer: Arc<dyn IntentInstaller>,
    ) -> Option<Arc<dyn IntentInstaller>> {
        self.core.installers.register(kind, installer)
    }

    /// Removes the installer for `kind`.
    pub fn unregister_installer(&self, kind: IntentKind) -> Option<Arc<dyn IntentInstaller>> {
        self.core.installers.unregister(kind)
    }

    /// Kinds with a registered installer.
    #[must_use]
    pub fn installers(&self) -> Vec<IntentKind> {
        self.core.installers.kinds()
    }

    #[must_use]
    pub fn get_intent(&self, key: &Key) -> Option<Intent> {
        self.core.store.get_intent(key)
    }

    #[must_use]
    pub fn get_intent_state(&self, key: &Key) -> Option<IntentState> {
        self.core.store.get_intent_state(key)
    }

    #[must_use]
    pub fn get_installable_intents(&self, key: &Key) -> Vec<Intent> {
        self.core.store.get_installable_intents(key)
    }

    #[must_use]
    pub fn get_intent_data(&self, key: &Key) -> Option<IntentData> {
        self.core.store.get_intent_data(key)
    }

    #[must_use]
    pub fn get_pending_data(&self, key: &Key) -> Option<IntentData> {
        self.core.store.get_pending_data(key)
    }

    #[must_use]
    pub fn get_intents(&self) -> Vec<Intent> {
        self.core.store.get_intents()
    }

    #[must_use]
    pub fn get_intent_count(&self) -> usize {
        self.core.store.count()
    }

    /// Lifecycle events from every node of the cluster.
    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.core.store.subscribe()
    }

    /// Whether the local node owns `key`.
    #[must_use]
    pub fn is_mine(&self, key: &Key) -> bool {
        self.core.partitions.is_mine(key)
    }

    /// Node currently owning `key`.
    #[must_use]
    pub fn get_leader(&self, key: &Key) -> Option<NodeId> {
        self.core.partitions.get_leader(key)
    }

    /// Whether the local node leads the partition of `app_id`.
    #[must_use]
    pub fn is_local_leader(&self, app_id: &ApplicationId) -> bool {
        self.core.partitions.is_local_leader(app_id)
    }

    #[must_use]
    pub fn local_node(&self) -> &NodeId {
        self.core.store.local_node()
    }

    #[must_use]
    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    #[must_use]
    pub fn partitions(&self) -> &Arc<PartitionService> {
        &self.core.partitions
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<ObjectiveTracker> {
        &self.core.tracker
    }

    #[must_use]
    pub fn config(&self) -> &IntentEngineConfig {
        &self.core.config
    }

    /// Point-in-time copy of the engine counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Runs one cleanup sweep now instead of waiting for the next period.
    ///
    /// # Errors
    ///
    /// [`IntentError::NotRunning`] before [`start`](Self::start).
    pub fn run_cleanup(&self) -> Result<usize, IntentError> {
        let dispatcher = self
            .running
            .lock()
            .as_ref()
            .map(|handle| Arc::clone(&handle.dispatcher))
            .ok_or(IntentError::NotRunning)?;
        Ok(cleanup::sweep(&self.core, &dispatcher))
    }

    fn ensure_running(&self) -> Result<(), IntentError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(IntentError::NotRunning)
        }
    }
}

async fn dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    mut work: mpsc::UnboundedReceiver<IntentData>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = work.recv() => {
                let Some(data) = next else { break };
                dispatcher.dispatch(data);
            }
        }
    }
}

/// Picks up work other nodes queued for keys the local node owns.
async fn forward_loop(
    core: Arc<EngineCore>,
    dispatcher: Arc<Dispatcher>,
    mut announcements: broadcast::Receiver<PendingAnnouncement>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = announcements.recv() => match received {
                Ok(announcement) => {
                    if &announcement.origin == core.store.local_node()
                        || !core.store.is_master(&announcement.key)
                    {
                        continue;
                    }
                    if let Some(data) = core.store.get_pending_data(&announcement.key) {
                        dispatcher.dispatch(data);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "pending announcements lagged; re-dispatching owned work");
                    cleanup::dispatch_owned_pending(&core, &dispatcher);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// Recovers partitions as the local node acquires them.
async fn leadership_loop(
    core: Arc<EngineCore>,
    dispatcher: Arc<Dispatcher>,
    mut leadership: broadcast::Receiver<LeadershipEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = leadership.recv() => match received {
                Ok(event) => {
                    if event.grants(core.store.local_node()) {
                        cleanup::recover_partition(&core, &dispatcher, event.partition);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    for partition in core.partitions.local_partitions() {
                        cleanup::recover_partition(&core, &dispatcher, partition);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

async fn cleanup_loop(
    core: Arc<EngineCore>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = core.config.cleanup.period;
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("intent cleanup shutting down");
                break;
            }
            _ = ticker.tick() => {
                cleanup::sweep(&core, &dispatcher);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn manager() -> IntentManager {
        IntentManager::standalone(IntentEngineConfig::default(), NodeId::new("solo"))
    }

    fn flow_rule(manager: &IntentManager, app: &ApplicationId) -> Intent {
        manager
            .builder(app.clone(), IntentPayload::FlowRule { rules: Vec::new() })
            .build()
            .unwrap()
    }

    #[test]
    fn requests_need_a_running_engine() {
        let manager = manager();
        let intent = flow_rule(&manager, &ApplicationId::new(1, "app"));
        assert!(matches!(manager.submit(intent.clone()), Err(IntentError::NotRunning)));
        assert!(matches!(manager.withdraw(intent), Err(IntentError::NotRunning)));
        assert!(matches!(manager.run_cleanup(), Err(IntentError::NotRunning)));
        assert!(
            manager
                .execute(IntentOperations::builder(ApplicationId::new(1, "app")).build())
                .is_ok()
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_stops() {
        let manager = manager();
        manager.start();
        manager.start();
        assert!(manager.is_running());
        assert_eq!(manager.partitions().local_partitions().len(), 14);

        manager.shutdown().await;
        assert!(!manager.is_running());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn foreign_operations_in_a_batch_are_skipped() {
        let manager = manager();
        manager.start();
        let ours = ApplicationId::new(1, "ours");
        let theirs = ApplicationId::new(2, "theirs");
        let foreign = flow_rule(&manager, &theirs);
        let batch = IntentOperations::builder(ours).submit(foreign).build();

        manager.execute(batch).unwrap();
        assert_eq!(manager.metrics().submissions, 0);
        manager.shutdown().await;
    }
}
