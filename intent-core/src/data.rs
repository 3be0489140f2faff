//! Versioned envelope around an intent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::intent::Intent;
use crate::key::Key;
use crate::state::IntentState;
use crate::version::Version;

/// Why a piece of work was scheduled for an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UpdateCause {
    /// Submitted, withdrawn or purged by an application.
    #[default]
    Request,
    /// Topology changed under a tracked resource.
    Topology,
    /// Cleanup or ownership recovery retrying stuck or corrupt work.
    Retry,
}

impl UpdateCause {
    /// Recompilations triggered by the engine rather than an application.
    #[must_use]
    pub const fn is_recompile(self) -> bool {
        matches!(self, Self::Topology | Self::Retry)
    }
}

/// Versioned lifecycle record of one intent.
///
/// Immutable: every mutation returns a new value. Two records holding the same
/// intent at the same version compare equal regardless of the other fields,
/// which makes replaying a write idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentData {
    intent: Intent,
    request: IntentState,
    state: IntentState,
    version: Version,
    origin: NodeId,
    error_count: u32,
    installables: Arc<[Intent]>,
    cause: UpdateCause,
}

impl IntentData {
    /// Fresh request record: `request` is both the requested and the current state.
    #[must_use]
    pub fn new(intent: Intent, request: IntentState, version: Version, origin: NodeId) -> Self {
        Self {
            intent,
            request,
            state: request,
            version,
            origin,
            error_count: 0,
            installables: Arc::from(Vec::new()),
            cause: UpdateCause::Request,
        }
    }

    /// Request to install `intent`.
    #[must_use]
    pub fn submit(intent: Intent, version: Version, origin: NodeId) -> Self {
        Self::new(intent, IntentState::InstallReq, version, origin)
    }

    /// Request to withdraw `intent`.
    #[must_use]
    pub fn withdraw(intent: Intent, version: Version, origin: NodeId) -> Self {
        Self::new(intent, IntentState::WithdrawReq, version, origin)
    }

    /// Request to purge `intent`.
    #[must_use]
    pub fn purge(intent: Intent, version: Version, origin: NodeId) -> Self {
        Self::new(intent, IntentState::PurgeReq, version, origin)
    }

    /// Recompilation request derived from a stored record, keeping its
    /// installables and error count so the compile loop can compare outcomes.
    #[must_use]
    pub fn recompile(stored: &Self, cause: UpdateCause, version: Version, origin: NodeId) -> Self {
        Self {
            intent: stored.intent.clone(),
            request: IntentState::InstallReq,
            state: IntentState::InstallReq,
            version,
            origin,
            error_count: stored.error_count,
            installables: Arc::clone(&stored.installables),
            cause,
        }
    }

    /// Repeated withdrawal of a stored record, keeping its installables and
    /// error count so a persistently failing teardown stops being retried.
    #[must_use]
    pub fn rewithdraw(stored: &Self, cause: UpdateCause, version: Version, origin: NodeId) -> Self {
        Self {
            request: IntentState::WithdrawReq,
            state: IntentState::WithdrawReq,
            version,
            origin,
            cause,
            ..stored.clone()
        }
    }

    /// Wrapped intent.
    #[must_use]
    pub const fn intent(&self) -> &Intent {
        &self.intent
    }

    /// Key of the wrapped intent.
    #[must_use]
    pub fn key(&self) -> &Key {
        self.intent.key()
    }

    /// Requested state, fixed at creation.
    #[must_use]
    pub const fn request(&self) -> IntentState {
        self.request
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> IntentState {
        self.state
    }

    /// Logical version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Node that minted the version.
    #[must_use]
    pub const fn origin(&self) -> &NodeId {
        &self.origin
    }

    /// Consecutive installation failures.
    #[must_use]
    pub const fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Compiled installables, in installation order.
    #[must_use]
    pub fn installables(&self) -> &[Intent] {
        &self.installables
    }

    /// What scheduled this record.
    #[must_use]
    pub const fn cause(&self) -> UpdateCause {
        self.cause
    }

    /// Copy in another state.
    #[must_use]
    pub fn with_state(&self, state: IntentState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// Copy carrying new installables.
    #[must_use]
    pub fn with_installables(&self, installables: Vec<Intent>) -> Self {
        Self {
            installables: Arc::from(installables),
            ..self.clone()
        }
    }

    /// Copy with the error count incremented (saturating).
    #[must_use]
    pub fn with_error(&self) -> Self {
        Self {
            error_count: self.error_count.saturating_add(1),
            ..self.clone()
        }
    }

    /// Copy with the error count cleared after a successful installation.
    #[must_use]
    pub fn with_errors_cleared(&self) -> Self {
        Self {
            error_count: 0,
            ..self.clone()
        }
    }
}

impl PartialEq for IntentData {
    fn eq(&self, other: &Self) -> bool {
        self.intent == other.intent && self.version == other.version
    }
}

impl Eq for IntentData {}
