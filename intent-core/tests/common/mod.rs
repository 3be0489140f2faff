//! Fake compilers, installers and cluster wiring shared by the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::future::Future;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use intent_core::{
    ApplicationId, ClusterMembership, CompileError, ConnectPoint, FlowSpec, IdGenerator,
    InstallError, Intent, IntentCompiler, IntentEngineConfig, IntentInstaller, IntentKind,
    IntentManager, IntentOperationContext, IntentPayload, IntentState, Key, NetworkResource,
    NodeId, ReplicatedIntentMaps, SequentialIdGenerator,
};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Short timers so recovery paths run within a test.
pub fn fast_config() -> IntentEngineConfig {
    let mut config = IntentEngineConfig::default();
    config.worker_threads = 4;
    config.cleanup.period = Duration::from_millis(50);
    config.cleanup.pending_timeout = Duration::from_millis(200);
    config.cleanup.transient_timeout = Duration::from_millis(1200);
    config.cleanup.retry_threshold = 3;
    config.install.confirmation_timeout = Duration::from_millis(500);
    config
}

pub fn link(src: &str, dst: &str) -> NetworkResource {
    NetworkResource::Link {
        src: ConnectPoint::new(src, 1),
        dst: ConnectPoint::new(dst, 2),
    }
}

/// Compiles point-to-point intents into one flow rule per link of the
/// currently configured route.
pub struct RouteCompiler {
    ids: Arc<dyn IdGenerator>,
    route: Mutex<Vec<NetworkResource>>,
    reachable: AtomicBool,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl RouteCompiler {
    pub fn new(route: Vec<NetworkResource>) -> Arc<Self> {
        Arc::new(Self {
            ids: Arc::new(SequentialIdGenerator::starting_at(1_000_000)),
            route: Mutex::new(route),
            reachable: AtomicBool::new(true),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_route(&self, route: Vec<NetworkResource>) {
        *self.route.lock() = route;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Time every later compilation takes.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntentCompiler for RouteCompiler {
    async fn compile(&self, intent: &Intent, _previous: &[Intent]) -> Result<Vec<Intent>, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CompileError::PathNotFound {
                key: intent.key().clone(),
            });
        }
        let route = self.route.lock().clone();
        route
            .into_iter()
            .map(|hop| {
                Intent::builder(
                    intent.app_id().clone(),
                    IntentPayload::FlowRule {
                        rules: vec![FlowSpec {
                            device: hop.to_string(),
                            selector: intent.key().to_string(),
                            treatment: "forward".to_string(),
                        }],
                    },
                )
                .id_generator(Arc::clone(&self.ids))
                .key(intent.key().clone())
                .resources([hop])
                .build()
                .map_err(|err| CompileError::Unsatisfiable {
                    key: intent.key().clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Confirm every operation.
    Accept,
    /// Reject every operation.
    Reject,
    /// Confirm uninstalls, reject installs.
    RejectInstalls,
    /// Keep contexts unconfirmed until released.
    Hold,
    /// Confirm every operation after the given time.
    Delay(Duration),
}

/// Installer recording what reached the environment.
pub struct FakeInstaller {
    me: Weak<FakeInstaller>,
    mode: Mutex<InstallMode>,
    held: Mutex<Vec<IntentOperationContext>>,
    pub installs: AtomicUsize,
    pub uninstalls: AtomicUsize,
    live: AtomicUsize,
}

impl FakeInstaller {
    pub fn new(mode: InstallMode) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            mode: Mutex::new(mode),
            held: Mutex::new(Vec::new()),
            installs: AtomicUsize::new(0),
            uninstalls: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        })
    }

    pub fn set_mode(&self, mode: InstallMode) {
        *self.mode.lock() = mode;
    }

    /// Installables currently in the environment.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    /// Confirms every held context.
    pub fn release(&self) {
        let held: Vec<_> = self.held.lock().drain(..).collect();
        for context in held {
            self.confirm(context);
        }
    }

    fn confirm(&self, context: IntentOperationContext) {
        let installed = context.intents_to_install().len();
        let removed = context.intents_to_uninstall().len();
        self.installs.fetch_add(installed, Ordering::SeqCst);
        self.uninstalls.fetch_add(removed, Ordering::SeqCst);
        self.live.fetch_add(installed, Ordering::SeqCst);
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| Some(live.saturating_sub(removed)));
        context.success();
    }
}

impl IntentInstaller for FakeInstaller {
    fn apply(&self, context: IntentOperationContext) {
        let mode = *self.mode.lock();
        match mode {
            InstallMode::Accept => self.confirm(context),
            InstallMode::Reject => context.failed(InstallError::Rejected("device offline".into())),
            InstallMode::RejectInstalls if !context.intents_to_install().is_empty() => {
                context.failed(InstallError::Rejected("table full".into()));
            }
            InstallMode::RejectInstalls => self.confirm(context),
            InstallMode::Hold => self.held.lock().push(context),
            InstallMode::Delay(delay) => {
                let me = self.me.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(installer) = me.upgrade() {
                        installer.confirm(context);
                    }
                });
            }
        }
    }
}

/// One node of a simulated cluster.
pub struct Node {
    pub manager: IntentManager,
    pub compiler: Arc<RouteCompiler>,
    pub installer: Arc<FakeInstaller>,
}

pub fn app() -> ApplicationId {
    ApplicationId::new(7, "org.example.fwd")
}

/// Builds and starts one engine per name over shared maps; every node sees
/// every other node as alive.
pub fn cluster(names: &[&str], config: &IntentEngineConfig, route: &[NetworkResource]) -> Vec<Node> {
    let maps = Arc::new(ReplicatedIntentMaps::new(config.events.capacity));
    let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::default());
    names
        .iter()
        .map(|name| {
            let peers = names
                .iter()
                .filter(|peer| *peer != name)
                .map(|peer| NodeId::new(*peer));
            let membership = Arc::new(ClusterMembership::with_peers(NodeId::new(*name), peers));
            let manager =
                IntentManager::new(config.clone(), membership, Arc::clone(&maps), Arc::clone(&ids));
            let compiler = RouteCompiler::new(route.to_vec());
            let installer = FakeInstaller::new(InstallMode::Accept);
            manager.register_compiler(IntentKind::PointToPoint, compiler.clone());
            manager.register_installer(IntentKind::FlowRule, installer.clone());
            manager.start();
            Node {
                manager,
                compiler,
                installer,
            }
        })
        .collect()
}

pub fn single(config: &IntentEngineConfig, route: &[NetworkResource]) -> Node {
    cluster(&["solo"], config, route).remove(0)
}

pub fn p2p(manager: &IntentManager, name: &str) -> Intent {
    manager
        .builder(
            app(),
            IntentPayload::PointToPoint {
                ingress: ConnectPoint::new("of:1", 1),
                egress: ConnectPoint::new("of:9", 1),
                selector: "ipv4".to_string(),
            },
        )
        .key(Key::of(name, &app()))
        .build()
        .unwrap()
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(manager: &IntentManager, key: &Key, state: IntentState) -> bool {
    eventually(Duration::from_secs(5), move || async move { manager.get_intent_state(key) == Some(state) }).await
}

pub async fn wait_until_gone(manager: &IntentManager, key: &Key) -> bool {
    eventually(Duration::from_secs(5), move || async move { manager.get_intent(key).is_none() }).await
}

/// Next lifecycle event for `key`, skipping other keys.
pub async fn next_event_for(
    events: &mut tokio::sync::broadcast::Receiver<intent_core::IntentEvent>,
    key: &Key,
) -> Option<intent_core::IntentEventKind> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv()).await.ok()?.ok()?;
        if event.key() == key {
            return Some(event.kind);
        }
    }
}
