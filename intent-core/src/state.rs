//! Intent lifecycle states and the legal transition graph.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    /// Installation requested by an application.
    InstallReq,
    /// First compilation in progress.
    Compiling,
    /// Installables are being applied to the environment.
    Installing,
    /// Installables are applied.
    Installed,
    /// Recompilation after topology change or installation failure.
    Recompiling,
    /// Make-before-break replacement of an installed intent.
    Reallocating,
    /// Withdrawal requested by an application.
    WithdrawReq,
    /// Installables are being removed from the environment.
    Withdrawing,
    /// Installables are removed.
    Withdrawn,
    /// Compilation or installation failed with no partial effect.
    Failed,
    /// Installation failed after partially applying to the environment.
    Corrupt,
    /// Permanent removal of the record requested.
    PurgeReq,
}

impl IntentState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::InstallReq,
        Self::Compiling,
        Self::Installing,
        Self::Installed,
        Self::Recompiling,
        Self::Reallocating,
        Self::WithdrawReq,
        Self::Withdrawing,
        Self::Withdrawn,
        Self::Failed,
        Self::Corrupt,
        Self::PurgeReq,
    ];

    /// States only the engine's own compile/install loop may produce.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Compiling | Self::Recompiling | Self::Installing | Self::Withdrawing
        )
    }

    /// States the engine's loop passes through while an attempt is running.
    /// Besides the transient states this covers reallocation, which is
    /// visible to readers but announces nothing.
    #[must_use]
    pub const fn is_in_progress(self) -> bool {
        self.is_transient() || matches!(self, Self::Reallocating)
    }

    /// States an external observer may see as the long-lived state of a record.
    #[must_use]
    pub const fn is_parked(self) -> bool {
        !self.is_transient()
    }

    /// Request states an application can ask for.
    #[must_use]
    pub const fn is_request(self) -> bool {
        matches!(self, Self::InstallReq | Self::WithdrawReq | Self::PurgeReq)
    }

    /// States on the way out of the system; nothing may be installed over them.
    #[must_use]
    pub const fn is_withdrawal(self) -> bool {
        matches!(
            self,
            Self::WithdrawReq | Self::Withdrawing | Self::Withdrawn | Self::PurgeReq
        )
    }

    /// States from which a purge request may discard the record.
    #[must_use]
    pub const fn is_purgeable(self) -> bool {
        matches!(self, Self::Withdrawn | Self::Failed)
    }

    /// Direct successors of `self` in the lifecycle graph.
    #[must_use]
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Self::InstallReq => &[Self::Compiling],
            Self::Compiling => &[Self::Installing, Self::Failed],
            Self::Installing => &[
                Self::Installed,
                Self::Recompiling,
                Self::Failed,
                Self::Corrupt,
            ],
            Self::Recompiling => &[Self::Installing, Self::Failed],
            Self::Installed => &[Self::WithdrawReq, Self::Recompiling, Self::Reallocating],
            Self::Reallocating => &[Self::Installed, Self::Failed, Self::Corrupt],
            Self::WithdrawReq => &[Self::Withdrawing],
            Self::Withdrawing => &[Self::Withdrawn, Self::Corrupt],
            Self::Failed | Self::Withdrawn | Self::Corrupt => &[Self::PurgeReq],
            Self::PurgeReq => &[],
        }
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.successors().contains(&next)
    }

    /// Upper-case name as used in logs and the wire format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstallReq => "INSTALL_REQ",
            Self::Compiling => "COMPILING",
            Self::Installing => "INSTALLING",
            Self::Installed => "INSTALLED",
            Self::Recompiling => "RECOMPILING",
            Self::Reallocating => "REALLOCATING",
            Self::WithdrawReq => "WITHDRAW_REQ",
            Self::Withdrawing => "WITHDRAWING",
            Self::Withdrawn => "WITHDRAWN",
            Self::Failed => "FAILED",
            Self::Corrupt => "CORRUPT",
            Self::PurgeReq => "PURGE_REQ",
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_states_are_exactly_the_in_flight_ones() {
        let transient: Vec<_> = IntentState::ALL
            .into_iter()
            .filter(|state| state.is_transient())
            .collect();
        assert_eq!(
            transient,
            vec![
                IntentState::Compiling,
                IntentState::Installing,
                IntentState::Recompiling,
                IntentState::Withdrawing,
            ]
        );
    }

    #[test]
    fn reallocation_is_in_progress_but_not_transient() {
        assert!(IntentState::Reallocating.is_in_progress());
        assert!(!IntentState::Reallocating.is_transient());
        assert!(IntentState::Installing.is_in_progress());
        assert!(!IntentState::Installed.is_in_progress());
    }

    #[test]
    fn purge_request_is_a_sink() {
        assert!(IntentState::PurgeReq.successors().is_empty());
        for state in [IntentState::Failed, IntentState::Withdrawn, IntentState::Corrupt] {
            assert!(state.can_transition_to(IntentState::PurgeReq));
        }
        assert!(!IntentState::Installed.can_transition_to(IntentState::PurgeReq));
    }

    #[test]
    fn no_state_transitions_to_itself() {
        for state in IntentState::ALL {
            assert!(!state.can_transition_to(state), "{state} loops");
        }
    }
}
