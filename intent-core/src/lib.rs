//! Distributed intent lifecycle engine.
//!
//! Applications describe desired connectivity as [`Intent`]s. The engine
//! compiles them into installable intents, drives installers through a
//! two-phase install, tracks the resources they depend on and recompiles them
//! when the topology changes. Every intent key is owned by exactly one node
//! of the cluster at a time; all nodes observe the same records and events.

#![warn(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo
)]
#![deny(clippy::unwrap_in_result, clippy::panic_in_result_fn)]

pub mod batch;
pub mod cluster;
pub mod compile;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod hash;
pub mod install;
pub mod intent;
pub mod key;
pub mod metrics;
pub mod state;
pub mod store;
pub mod tracker;
pub mod validator;
pub mod version;

pub use batch::{IntentOperation, IntentOperations, IntentOperationsBuilder};
pub use cluster::{
    ClusterMembership, LeadershipEvent, MembershipUpdate, NodeId, NodeState, PartitionId,
    PartitionService,
};
pub use compile::{CompilerRegistry, IntentCompiler};
pub use config::IntentEngineConfig;
pub use data::{IntentData, UpdateCause};
pub use engine::IntentManager;
pub use error::{ClusterError, CompileError, ConfigError, InstallError, IntentError};
pub use install::{
    InstallerRegistry, IntentInstallationContext, IntentInstaller, IntentOperationContext,
};
pub use intent::{
    ConnectPoint, FlowSpec, Intent, IntentBuilder, IntentKind, IntentPayload, NetworkResource,
    ResourceGroup,
};
pub use key::{ApplicationId, IdGenerator, IntentId, Key, SequentialIdGenerator};
pub use metrics::MetricsSnapshot;
pub use state::IntentState;
pub use store::{
    IntentEvent, IntentEventKind, IntentStore, IntentStoreDelegate, ReplicatedIntentMaps,
    WriteOutcome,
};
pub use tracker::{ObjectiveTracker, TopologyChange, TopologyChangeDelegate, TopologyEvent};
pub use validator::{UpdateVerdict, is_update_acceptable};
pub use version::{LogicalClock, Version};
