use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cluster::NodeId;
use crate::cluster::membership::ClusterMembership;
use crate::error::ClusterError;
use crate::hash::rendezvous_score;
use crate::key::{ApplicationId, Key};

const EVENT_CAPACITY: usize = 256;

/// Index of a work partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u16);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Leadership of one partition moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipEvent {
    /// Partition whose leader changed.
    pub partition: PartitionId,
    /// Leader before the change, if any.
    pub previous: Option<NodeId>,
    /// Leader after the change; `None` when no member is active.
    pub leader: Option<NodeId>,
}

impl LeadershipEvent {
    /// Whether `node` gained the partition with this change.
    #[must_use]
    pub fn grants(&self, node: &NodeId) -> bool {
        self.leader.as_ref() == Some(node) && self.previous.as_ref() != Some(node)
    }
}

/// Maps keys to partitions and partitions to a single leader.
///
/// Leaders are chosen by rendezvous hashing of the partition id over the
/// active members, so every node holding the same membership view picks the
/// same leader and a membership change only moves the partitions whose
/// winning member changed.
pub struct PartitionService {
    membership: Arc<ClusterMembership>,
    partitions: u16,
    leaders: RwLock<Vec<Option<NodeId>>>,
    events_tx: broadcast::Sender<LeadershipEvent>,
}

impl PartitionService {
    /// Creates the service and computes the initial leaders.
    #[must_use]
    pub fn new(membership: Arc<ClusterMembership>, partitions: u16) -> Self {
        let partitions = partitions.max(1);
        let active = membership.active_nodes();
        let leaders = (0..partitions)
            .map(|partition| Self::elect(PartitionId(partition), &active))
            .collect();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            membership,
            partitions,
            leaders: RwLock::new(leaders),
            events_tx,
        }
    }

    /// Local node identity.
    #[must_use]
    pub fn local_node(&self) -> &NodeId {
        self.membership.local_node()
    }

    /// Number of partitions.
    #[must_use]
    pub const fn partition_count(&self) -> u16 {
        self.partitions
    }

    /// Partition a raw hash falls into.
    #[must_use]
    pub fn partition_for_hash(&self, hash: u64) -> PartitionId {
        let index = hash % u64::from(self.partitions);
        PartitionId(u16::try_from(index).unwrap_or_default())
    }

    /// Partition owning `key`.
    #[must_use]
    pub fn partition_of(&self, key: &Key) -> PartitionId {
        self.partition_for_hash(key.partition_hash())
    }

    /// Cached leader of `partition`.
    #[must_use]
    pub fn leader_of(&self, partition: PartitionId) -> Option<NodeId> {
        self.leaders
            .read()
            .get(usize::from(partition.0))
            .cloned()
            .flatten()
    }

    /// Current owner of `key`.
    #[must_use]
    pub fn get_leader(&self, key: &Key) -> Option<NodeId> {
        self.leader_of(self.partition_of(key))
    }

    /// Whether the local node owns `key` right now.
    #[must_use]
    pub fn is_mine(&self, key: &Key) -> bool {
        self.get_leader(key).as_ref() == Some(self.local_node())
    }

    /// Whether the local node leads work scoped to `app_id` as a whole.
    #[must_use]
    pub fn is_local_leader(&self, app_id: &ApplicationId) -> bool {
        let partition = self.partition_for_hash(app_id.stable_hash());
        self.leader_of(partition).as_ref() == Some(self.local_node())
    }

    /// Ownership check performed before any write.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NoActiveMembers`] when the partition has no leader and
    /// [`ClusterError::NotOwner`] when another node leads it.
    pub fn check_owner(&self, key: &Key) -> Result<(), ClusterError> {
        let partition = self.partition_of(key);
        match self.leader_of(partition) {
            Some(owner) if owner == *self.local_node() => Ok(()),
            Some(owner) => Err(ClusterError::NotOwner {
                key: key.clone(),
                owner,
                local: self.local_node().clone(),
            }),
            None => Err(ClusterError::NoActiveMembers {
                partition: partition.0,
            }),
        }
    }

    /// Partitions the local node currently leads.
    #[must_use]
    pub fn local_partitions(&self) -> Vec<PartitionId> {
        let local = self.local_node();
        self.leaders
            .read()
            .iter()
            .enumerate()
            .filter(|(_, leader)| leader.as_ref() == Some(local))
            .filter_map(|(index, _)| u16::try_from(index).ok().map(PartitionId))
            .collect()
    }

    /// Recomputes leaders from the membership view, publishing one event per
    /// partition whose leader changed.
    pub fn refresh(&self) -> Vec<LeadershipEvent> {
        let active = self.membership.active_nodes();
        let mut events = Vec::new();
        {
            let mut leaders = self.leaders.write();
            for (index, slot) in leaders.iter_mut().enumerate() {
                let Ok(partition) = u16::try_from(index).map(PartitionId) else {
                    continue;
                };
                let leader = Self::elect(partition, &active);
                if *slot != leader {
                    events.push(LeadershipEvent {
                        partition,
                        previous: std::mem::replace(slot, leader.clone()),
                        leader,
                    });
                }
            }
        }

        for event in &events {
            info!(
                partition = %event.partition,
                previous = ?event.previous,
                leader = ?event.leader,
                "partition leadership changed"
            );
            let _ = self.events_tx.send(event.clone());
        }
        events
    }

    /// Subscribe to leadership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.events_tx.subscribe()
    }

    /// Refresh leadership whenever membership changes, until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut updates = service.membership.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    update = updates.recv() => match update {
                        Ok(update) => {
                            debug!(node = %update.node, "refreshing partition leadership");
                            service.refresh();
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            service.refresh();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    fn elect(partition: PartitionId, active: &[NodeId]) -> Option<NodeId> {
        active
            .iter()
            .max_by(|a, b| {
                let item = u64::from(partition.0);
                rendezvous_score(item, a.as_str())
                    .cmp(&rendezvous_score(item, b.as_str()))
                    .then_with(|| b.cmp(a))
            })
            .cloned()
    }
}
