//! Cluster view used to pick exactly one responsible node per intent key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::stable_str_hash;

/// Membership view with incarnation-ordered updates.
pub mod membership;
/// Partition leadership derived from membership.
pub mod partition;

pub use membership::{ClusterMembership, MembershipStats, MembershipUpdate, NodeState};
pub use partition::{LeadershipEvent, PartitionId, PartitionService};

/// Stable logical node identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wraps a node name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Node name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hash identical on every node; used as the node component of versions.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        stable_str_hash(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
