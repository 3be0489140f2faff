//! Error types surfaced by the intent engine.
//!
//! Only synchronous misuse is reported through these types. Asynchronous
//! lifecycle failures end up on the intent record itself (`FAILED`/`CORRUPT`).

use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::NodeId;
use crate::intent::IntentKind;
use crate::key::Key;

/// Precondition failures raised while building or registering intents.
#[derive(Debug, Error)]
pub enum IntentError {
    /// The builder was not bound to an identifier generator.
    #[error("no intent id generator bound; build intents through IntentManager::builder or bind one explicitly")]
    MissingIdGenerator,
    /// Priority outside the representable range.
    #[error("intent priority {priority} out of range [{min}, {max}]")]
    InvalidPriority {
        /// Requested priority.
        priority: u32,
        /// Smallest accepted priority.
        min: u16,
        /// Largest accepted priority.
        max: u16,
    },
    /// The engine has not been started yet or was shut down.
    #[error("intent engine is not running")]
    NotRunning,
}

/// Reasons a compile attempt produced no installables.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    /// No path satisfies the intent on the current topology.
    #[error("no path found for intent {key}")]
    PathNotFound {
        /// Key of the intent being compiled.
        key: Key,
    },
    /// Constraints or resources cannot be satisfied.
    #[error("intent {key} is unsatisfiable: {reason}")]
    Unsatisfiable {
        /// Key of the intent being compiled.
        key: Key,
        /// Compiler supplied explanation.
        reason: String,
    },
    /// Nothing is registered for the intent's kind.
    #[error("no compiler registered for intent kind {kind}")]
    NoCompiler {
        /// Kind that could not be dispatched.
        kind: IntentKind,
    },
    /// Compilers kept producing non-installable intents.
    #[error("compilation of {key} exceeded depth {max_depth}")]
    DepthExceeded {
        /// Key of the top-level intent.
        key: Key,
        /// Configured recursion limit.
        max_depth: usize,
    },
}

/// Installation failures reported to the coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstallError {
    /// The environment rejected the operation.
    #[error("installer rejected operation: {0}")]
    Rejected(String),
    /// Nothing is registered for an installable kind.
    #[error("no installer registered for intent kind {kind}")]
    NoInstaller {
        /// Installable kind without an installer.
        kind: IntentKind,
    },
    /// The installer never confirmed the operation.
    #[error("operation {operation} was not confirmed within the configured timeout")]
    ConfirmationTimeout {
        /// Identifier of the unconfirmed operation.
        operation: u64,
    },
    /// The installer dropped its context without reporting.
    #[error("operation {operation} was dropped without a report")]
    Abandoned {
        /// Identifier of the dropped operation.
        operation: u64,
    },
}

/// Ownership and membership failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// Local node attempted to act on a key it does not own.
    #[error("intent {key} is owned by {owner}; local node {local} must not write it")]
    NotOwner {
        /// Key being written.
        key: Key,
        /// Node currently owning the key's partition.
        owner: NodeId,
        /// Identifier for the local node.
        local: NodeId,
    },
    /// Membership view contains no alive node.
    #[error("no active cluster members to own partition {partition}")]
    NoActiveMembers {
        /// Partition without a leader.
        partition: u16,
    },
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read intent engine config '{path}'")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        #[source]
        /// Underlying IO error.
        source: std::io::Error,
    },
    /// TOML did not match the schema.
    #[error("invalid intent engine config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Value parsed but is unusable.
    #[error("invalid intent engine config: {0}")]
    Invalid(String),
}
