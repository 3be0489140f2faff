use std::fmt;

use crate::data::IntentData;
use crate::key::Key;
use crate::state::IntentState;

/// Lifecycle events delivered to listeners, one per accepted parking-state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentEventKind {
    /// Installation requested.
    InstallReq,
    /// Installables applied.
    Installed,
    /// Compilation or installation failed cleanly.
    Failed,
    /// Withdrawal requested.
    WithdrawReq,
    /// Installables removed.
    Withdrawn,
    /// Installation left partial state behind.
    Corrupt,
    /// Record discarded.
    Purged,
}

impl IntentEventKind {
    /// Event emitted when a record lands in `state`, if any.
    #[must_use]
    pub const fn for_state(state: IntentState) -> Option<Self> {
        match state {
            IntentState::InstallReq => Some(Self::InstallReq),
            IntentState::Installed => Some(Self::Installed),
            IntentState::Failed => Some(Self::Failed),
            IntentState::WithdrawReq => Some(Self::WithdrawReq),
            IntentState::Withdrawn => Some(Self::Withdrawn),
            IntentState::Corrupt => Some(Self::Corrupt),
            IntentState::PurgeReq => Some(Self::Purged),
            IntentState::Compiling
            | IntentState::Installing
            | IntentState::Recompiling
            | IntentState::Reallocating
            | IntentState::Withdrawing => None,
        }
    }
}

impl fmt::Display for IntentEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InstallReq => "INSTALL_REQ",
            Self::Installed => "INSTALLED",
            Self::Failed => "FAILED",
            Self::WithdrawReq => "WITHDRAW_REQ",
            Self::Withdrawn => "WITHDRAWN",
            Self::Corrupt => "CORRUPT",
            Self::Purged => "PURGED",
        };
        f.write_str(label)
    }
}

/// Event payload: the record exactly as it was committed.
#[derive(Debug, Clone)]
pub struct IntentEvent {
    /// What happened.
    pub kind: IntentEventKind,
    /// Committed record.
    pub data: IntentData,
}

impl IntentEvent {
    /// Event for a committed record, `None` for states that emit nothing.
    #[must_use]
    pub fn from_data(data: &IntentData) -> Option<Self> {
        IntentEventKind::for_state(data.state()).map(|kind| Self {
            kind,
            data: data.clone(),
        })
    }

    /// Key of the affected intent.
    #[must_use]
    pub fn key(&self) -> &Key {
        self.data.key()
    }
}
