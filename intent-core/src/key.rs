//! Intent identity: application ids, system-assigned intent ids and stable keys.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::hash::{combine, stable_str_hash};

/// Application that owns a set of intents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicationId {
    id: u16,
    name: String,
}

impl ApplicationId {
    /// Creates an application id from its short numeric id and unique name.
    pub fn new(id: u16, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Short numeric identifier.
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    /// Application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash that is identical on every node.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        combine(stable_str_hash(&self.name), u64::from(self.id))
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}

/// System-assigned intent identifier, monotonic per generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentId(u64);

impl IntentId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw identifier value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Source of intent identifiers.
///
/// Handed to the engine at construction; there is no process-global binding.
pub trait IdGenerator: Send + Sync {
    /// Returns the next unused identifier.
    fn next_id(&self) -> IntentId;
}

/// Monotonic in-process identifier generator.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    /// Generator whose first id is `start`.
    #[must_use]
    pub const fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> IntentId {
        IntentId(self.next.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum KeyValue {
    Long(u64),
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(value) => write!(f, "{value:#x}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Stable, application-scoped identity of an intent.
///
/// Content addressed: the same value and application always yield the same
/// key and hash. Equality and ordering use only the hash and the application,
/// so keys from different applications never collide but keys are not unique
/// across applications either.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    hash: u64,
    app_id: ApplicationId,
    value: KeyValue,
}

impl Key {
    /// Key for a numeric value.
    #[must_use]
    pub fn of_long(value: u64, app_id: &ApplicationId) -> Self {
        Self {
            hash: combine(0x4c4f_4e47, value),
            app_id: app_id.clone(),
            value: KeyValue::Long(value),
        }
    }

    /// Key for a string value.
    #[must_use]
    pub fn of(value: impl Into<String>, app_id: &ApplicationId) -> Self {
        let value = value.into();
        Self {
            hash: stable_str_hash(&value),
            app_id: app_id.clone(),
            value: KeyValue::Text(value),
        }
    }

    /// Key derived from a system-assigned intent id.
    #[must_use]
    pub fn from_intent_id(id: IntentId, app_id: &ApplicationId) -> Self {
        Self::of_long(id.value(), app_id)
    }

    /// Content hash of the key value.
    #[must_use]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Hash mixing value and application, used for partition placement.
    #[must_use]
    pub fn partition_hash(&self) -> u64 {
        combine(self.hash, self.app_id.stable_hash())
    }

    /// Owning application.
    #[must_use]
    pub const fn app_id(&self) -> &ApplicationId {
        &self.app_id
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.app_id == other.app_id
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
        self.app_id.hash(state);
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.app_id.cmp(&other.app_id))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id.name, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str) -> ApplicationId {
        ApplicationId::new(7, name)
    }

    #[test]
    fn keys_are_content_addressed() {
        let a = Key::of("h1-h2", &app("fwd"));
        let b = Key::of("h1-h2", &app("fwd"));
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.partition_hash(), b.partition_hash());
    }

    #[test]
    fn same_value_different_app_differs() {
        let a = Key::of("h1-h2", &app("fwd"));
        let b = Key::of("h1-h2", &app("sdnip"));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn ordering_is_total_and_consistent_with_eq() {
        let app = app("fwd");
        let mut keys: Vec<_> = (0..32_u64).map(|v| Key::of_long(v, &app)).collect();
        keys.sort();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn sequential_generator_is_monotonic() {
        let ids = SequentialIdGenerator::default();
        let first = ids.next_id();
        let second = ids.next_id();
        assert!(second > first);
        assert_eq!(first, IntentId::new(1));
    }
}
