use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cluster::NodeId;

const UPDATE_CAPACITY: usize = 256;

/// Liveness of a member as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Node is healthy and may own partitions.
    Alive,
    /// Node missed heartbeats; it keeps its partitions until declared dead.
    Suspect,
    /// Node failed and its partitions move elsewhere.
    Dead,
    /// Node left gracefully.
    Left,
}

impl NodeState {
    /// Whether a member in this state may lead partitions.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Alive | Self::Suspect)
    }
}

/// Membership change as disseminated between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    /// Member the update describes.
    pub node: NodeId,
    /// Reported state.
    pub state: NodeState,
    /// Incarnation counter supplied by the member.
    pub incarnation: u64,
}

/// Aggregate state counts for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipStats {
    /// Number of `Alive` peers.
    pub alive: usize,
    /// Number of peers under suspicion.
    pub suspect: usize,
    /// Number of peers considered dead.
    pub dead: usize,
    /// Peers that left the cluster.
    pub left: usize,
}

impl MembershipStats {
    /// Total peers tracked locally.
    #[must_use]
    pub const fn total(self) -> usize {
        self.alive + self.suspect + self.dead + self.left
    }
}

struct MemberRecord {
    state: NodeState,
    incarnation: u64,
    last_update: Instant,
}

/// Local view of cluster membership.
///
/// Failure detection is an external concern; this type only merges the
/// updates it is fed and publishes the ones that changed the view.
pub struct ClusterMembership {
    local: NodeId,
    members: DashMap<NodeId, MemberRecord>,
    local_incarnation: AtomicU64,
    updates_tx: broadcast::Sender<MembershipUpdate>,
}

impl ClusterMembership {
    /// Creates a view containing only the local node.
    #[must_use]
    pub fn new(local: NodeId) -> Self {
        let (updates_tx, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            local,
            members: DashMap::new(),
            local_incarnation: AtomicU64::new(0),
            updates_tx,
        }
    }

    /// Creates a view already containing `peers` as alive members.
    #[must_use]
    pub fn with_peers(local: NodeId, peers: impl IntoIterator<Item = NodeId>) -> Self {
        let membership = Self::new(local);
        for peer in peers {
            membership.upsert_member(peer, 0);
        }
        membership
    }

    /// Local node identity.
    #[must_use]
    pub const fn local_node(&self) -> &NodeId {
        &self.local
    }

    /// Current incarnation of the local node.
    #[must_use]
    pub fn local_incarnation(&self) -> u64 {
        self.local_incarnation.load(Ordering::Acquire)
    }

    /// Adds or revives a remote member as alive.
    pub fn upsert_member(&self, node: NodeId, incarnation: u64) {
        self.apply_update(MembershipUpdate {
            node,
            state: NodeState::Alive,
            incarnation,
        });
    }

    /// Marks a remote member as gone after a graceful leave.
    pub fn remove_member(&self, node: &NodeId) {
        let incarnation = self
            .members
            .get(node)
            .map_or(0, |record| record.incarnation);
        self.apply_update(MembershipUpdate {
            node: node.clone(),
            state: NodeState::Left,
            incarnation,
        });
    }

    /// Merges one update and returns whether it changed the view.
    ///
    /// Higher incarnations win; at equal incarnation the state is replaced
    /// only when it differs. Updates about the local node refute suspicion by
    /// bumping the local incarnation and are never stored.
    pub fn apply_update(&self, update: MembershipUpdate) -> bool {
        if update.node == self.local {
            if update.incarnation >= self.local_incarnation() {
                self.local_incarnation.fetch_add(1, Ordering::AcqRel);
            }
            return false;
        }

        let now = Instant::now();
        let mut changed = false;
        self.members
            .entry(update.node.clone())
            .and_modify(|member| {
                if update.incarnation > member.incarnation
                    || (update.incarnation == member.incarnation && member.state != update.state)
                {
                    member.state = update.state;
                    member.incarnation = update.incarnation;
                    member.last_update = now;
                    changed = true;
                }
            })
            .or_insert_with(|| {
                changed = true;
                MemberRecord {
                    state: update.state,
                    incarnation: update.incarnation,
                    last_update: now,
                }
            });

        if changed {
            debug!(node = %update.node, state = ?update.state, "membership changed");
            let _ = self.updates_tx.send(update);
        }
        changed
    }

    /// Applies several updates in order.
    pub fn apply_updates(&self, updates: impl IntoIterator<Item = MembershipUpdate>) {
        for update in updates {
            self.apply_update(update);
        }
    }

    /// State of a member, `Alive` for the local node.
    #[must_use]
    pub fn state_of(&self, node: &NodeId) -> Option<NodeState> {
        if *node == self.local {
            return Some(NodeState::Alive);
        }
        self.members.get(node).map(|record| record.state)
    }

    /// Time since the last accepted update about `node`.
    #[must_use]
    pub fn last_update(&self, node: &NodeId) -> Option<Instant> {
        self.members.get(node).map(|record| record.last_update)
    }

    /// Members eligible to lead partitions, including the local node, sorted.
    #[must_use]
    pub fn active_nodes(&self) -> Vec<NodeId> {
        let mut nodes = Vec::with_capacity(self.members.len() + 1);
        nodes.push(self.local.clone());
        nodes.extend(self.members.iter().filter_map(|entry| {
            entry.value().state.is_active().then(|| entry.key().clone())
        }));
        nodes.sort();
        nodes
    }

    /// Number of tracked remote members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true when no remote members are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Aggregate state counts.
    #[must_use]
    pub fn stats(&self) -> MembershipStats {
        let mut stats = MembershipStats::default();
        for entry in &self.members {
            match entry.value().state {
                NodeState::Alive => stats.alive += 1,
                NodeState::Suspect => stats.suspect += 1,
                NodeState::Dead => stats.dead += 1,
                NodeState::Left => stats.left += 1,
            }
        }
        stats
    }

    /// Subscribe to view changes.
    pub fn subscribe(&self) -> broadcast::Receiver<MembershipUpdate> {
        self.updates_tx.subscribe()
    }
}
