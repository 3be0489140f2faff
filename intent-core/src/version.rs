//! Lamport versions ordering updates to one key across the cluster.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

/// Lamport timestamp ordering updates to the same key.
///
/// Totally ordered by `(logical, node)`; two versions compare equal only when
/// both components match, so versions minted by different nodes never tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    logical: u64,
    node: u64,
}

impl Version {
    /// Builds a version from raw components.
    #[must_use]
    pub const fn new(logical: u64, node: u64) -> Self {
        Self { logical, node }
    }

    /// Logical counter component.
    #[must_use]
    pub const fn logical(self) -> u64 {
        self.logical
    }

    /// Minting node component.
    #[must_use]
    pub const fn node(self) -> u64 {
        self.node
    }

    /// `self` happened strictly before `other`.
    #[must_use]
    pub fn is_older_than(self, other: Self) -> bool {
        self.cmp(&other) == Ordering::Less
    }

    /// `self` happened strictly after `other`.
    #[must_use]
    pub fn is_newer_than(self, other: Self) -> bool {
        self.cmp(&other) == Ordering::Greater
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.logical, self.node)
    }
}

/// Per-node Lamport clock minting [`Version`]s.
#[derive(Debug)]
pub struct LogicalClock {
    node: u64,
    counter: AtomicU64,
}

impl LogicalClock {
    /// Clock for the given node.
    #[must_use]
    pub fn new(node: &NodeId) -> Self {
        Self {
            node: node.stable_hash(),
            counter: AtomicU64::new(0),
        }
    }

    /// Advances the clock and returns a version newer than anything seen so far.
    pub fn tick(&self) -> Version {
        let logical = self.counter.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        Version::new(logical, self.node)
    }

    /// Merges a version observed from another node so later ticks dominate it.
    pub fn observe(&self, seen: Version) {
        self.counter
            .fetch_max(seen.logical(), AtomicOrdering::AcqRel);
    }

    /// Latest logical value without advancing.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.counter.load(AtomicOrdering::Acquire)
    }
}
