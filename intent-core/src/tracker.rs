//! Resource-to-intent index that turns topology changes into recompilations.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::intent::{NetworkResource, ResourceGroup};
use crate::key::Key;

/// One change reported by the topology or resource subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyChange {
    /// Resource disappeared or went down.
    ResourceDown(NetworkResource),
    /// Resource appeared or came back; may make failed intents satisfiable.
    ResourceUp(NetworkResource),
    /// Resource attributes changed (capacity, weight).
    ResourceUpdated(NetworkResource),
    /// Allocation within a resource group changed.
    ResourceGroupChanged(ResourceGroup),
}

/// Batch of changes observed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEvent {
    /// Changes in the order observed.
    pub changes: Vec<TopologyChange>,
}

impl TopologyEvent {
    /// Event carrying `changes`.
    #[must_use]
    pub fn new(changes: impl IntoIterator<Item = TopologyChange>) -> Self {
        Self {
            changes: changes.into_iter().collect(),
        }
    }
}

/// Receiver of recompilation requests derived from topology changes.
pub trait TopologyChangeDelegate: Send + Sync {
    /// Recompile `keys`; with `compile_all_failed` also retry every failed intent.
    fn trigger_compile(&self, keys: Vec<Key>, compile_all_failed: bool);
}

#[derive(Debug, Default)]
struct Tracked {
    resources: Vec<NetworkResource>,
    group: Option<ResourceGroup>,
}

/// Tracks which intents depend on which resources and resource groups.
#[derive(Default)]
pub struct ObjectiveTracker {
    by_resource: DashMap<NetworkResource, HashSet<Key>>,
    by_group: DashMap<ResourceGroup, HashSet<Key>>,
    tracked: DashMap<Key, Tracked>,
    delegate: RwLock<Option<Arc<dyn TopologyChangeDelegate>>>,
}

impl ObjectiveTracker {
    /// Empty tracker without a delegate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the receiver of recompilation requests.
    pub fn set_delegate(&self, delegate: Arc<dyn TopologyChangeDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    /// Removes the delegate; later changes are only indexed.
    pub fn unset_delegate(&self) {
        *self.delegate.write() = None;
    }

    /// Subscribes `key` to `resources` and `group`, replacing earlier subscriptions.
    pub fn add_tracked_resources(
        &self,
        key: &Key,
        resources: impl IntoIterator<Item = NetworkResource>,
        group: Option<ResourceGroup>,
    ) {
        self.remove_tracked_resources(key);

        let resources: BTreeSet<_> = resources.into_iter().collect();
        for resource in &resources {
            self.by_resource
                .entry(resource.clone())
                .or_default()
                .insert(key.clone());
        }
        if let Some(group) = &group {
            self.by_group
                .entry(group.clone())
                .or_default()
                .insert(key.clone());
        }
        trace!(key = %key, resources = resources.len(), "tracking intent resources");
        self.tracked.insert(
            key.clone(),
            Tracked {
                resources: resources.into_iter().collect(),
                group,
            },
        );
    }

    /// Drops every subscription held by `key`.
    pub fn remove_tracked_resources(&self, key: &Key) {
        let Some((_, tracked)) = self.tracked.remove(key) else {
            return;
        };
        for resource in tracked.resources {
            self.by_resource.remove_if_mut(&resource, |_, keys| {
                keys.remove(key);
                keys.is_empty()
            });
        }
        if let Some(group) = tracked.group {
            self.by_group.remove_if_mut(&group, |_, keys| {
                keys.remove(key);
                keys.is_empty()
            });
        }
    }

    /// Whether `key` holds any subscription.
    #[must_use]
    pub fn is_tracked(&self, key: &Key) -> bool {
        self.tracked.contains_key(key)
    }

    /// Keys subscribed to `resource`.
    #[must_use]
    pub fn keys_for(&self, resource: &NetworkResource) -> Vec<Key> {
        self.by_resource
            .get(resource)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Computes the affected keys of `event` and forwards them to the delegate.
    ///
    /// Returns the sorted affected keys and whether failed intents should be
    /// retried as well.
    pub fn topology_changed(&self, event: &TopologyEvent) -> (Vec<Key>, bool) {
        let mut affected = BTreeSet::new();
        let mut compile_all_failed = false;
        for change in &event.changes {
            match change {
                TopologyChange::ResourceDown(resource)
                | TopologyChange::ResourceUpdated(resource) => {
                    if let Some(keys) = self.by_resource.get(resource) {
                        affected.extend(keys.iter().cloned());
                    }
                }
                TopologyChange::ResourceUp(_) => compile_all_failed = true,
                TopologyChange::ResourceGroupChanged(group) => {
                    if let Some(keys) = self.by_group.get(group) {
                        affected.extend(keys.iter().cloned());
                    }
                }
            }
        }

        let keys: Vec<_> = affected.into_iter().collect();
        if keys.is_empty() && !compile_all_failed {
            return (keys, false);
        }

        debug!(
            affected = keys.len(),
            compile_all_failed, "topology change requires recompilation"
        );
        let delegate = self.delegate.read().clone();
        if let Some(delegate) = delegate {
            delegate.trigger_compile(keys.clone(), compile_all_failed);
        }
        (keys, compile_all_failed)
    }

    /// Feeds events from the topology subsystem until `shutdown` fires,
    /// folding whatever is already queued into one batch.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<TopologyEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => {
                        let Some(mut batch) = event else { break };
                        while let Ok(more) = events.try_recv() {
                            batch.changes.extend(more.changes);
                        }
                        tracker.topology_changed(&batch);
                    }
                }
            }
        })
    }
}
