//! Gate deciding whether a proposed record may replace the stored one.
//!
//! [`evaluate_update`] explains the decision; [`is_update_acceptable`] is the
//! boolean the store consults. Both are pure. Logging of suspicious proposals
//! happens in the store, which is the only caller that acts on the verdict.

use crate::data::IntentData;
use crate::state::IntentState;

/// Outcome of comparing a proposed record against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateVerdict {
    /// Nothing stored yet for the key.
    FirstWrite,
    /// Proposal carries a strictly newer version.
    NewerVersion,
    /// Equal version, legal edge of the lifecycle graph.
    Transition,
    /// Equal version purge request.
    Purge,
    /// Proposal carries a strictly older version.
    Stale,
    /// Equal version, same state as stored.
    NoOp,
    /// Purge request for a key with no stored record.
    NothingToPurge,
    /// Proposal targets a state only the engine's own loop may produce.
    TransientTarget,
    /// Proposal would install over a record that is being torn down.
    InstallOverWithdrawal,
    /// Equal version, no such edge in the lifecycle graph.
    IllegalTransition,
}

impl UpdateVerdict {
    /// Whether the store applies the proposal.
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        matches!(
            self,
            Self::FirstWrite | Self::NewerVersion | Self::Transition | Self::Purge
        )
    }

    /// Rejections that point at a bug upstream rather than an expected race.
    #[must_use]
    pub const fn is_violation(self) -> bool {
        matches!(self, Self::TransientTarget | Self::InstallOverWithdrawal)
    }
}

/// Classifies the proposal `incoming` against `current`.
#[must_use]
pub fn evaluate_update(current: Option<&IntentData>, incoming: &IntentData) -> UpdateVerdict {
    let Some(current) = current else {
        return if incoming.state() == IntentState::PurgeReq {
            UpdateVerdict::NothingToPurge
        } else {
            UpdateVerdict::FirstWrite
        };
    };

    if incoming.version().is_older_than(current.version()) {
        return UpdateVerdict::Stale;
    }
    if incoming.version().is_newer_than(current.version()) {
        return UpdateVerdict::NewerVersion;
    }

    let (from, to) = (current.state(), incoming.state());
    if to == IntentState::PurgeReq {
        return UpdateVerdict::Purge;
    }
    if to.is_transient() {
        return UpdateVerdict::TransientTarget;
    }
    if from == to {
        return UpdateVerdict::NoOp;
    }
    if from.is_withdrawal() && matches!(to, IntentState::Installing | IntentState::Installed) {
        return UpdateVerdict::InstallOverWithdrawal;
    }
    if from.can_transition_to(to) {
        UpdateVerdict::Transition
    } else {
        UpdateVerdict::IllegalTransition
    }
}

/// Whether the store may replace `current` with `incoming`.
#[must_use]
pub fn is_update_acceptable(current: Option<&IntentData>, incoming: &IntentData) -> bool {
    evaluate_update(current, incoming).is_accepted()
}

/// Acceptance rule for the engine's own staging writes of transient progress:
/// never older, and at equal version only along a graph edge.
#[must_use]
pub(crate) fn is_stage_acceptable(current: Option<&IntentData>, incoming: &IntentData) -> bool {
    let Some(current) = current else {
        return true;
    };
    if incoming.version().is_newer_than(current.version()) {
        return true;
    }
    incoming.version() == current.version() && current.state().can_transition_to(incoming.state())
}
