//! Units of work flowing from application calls into the store.

use std::fmt;

use crate::intent::Intent;
use crate::key::{ApplicationId, Key};

/// One requested lifecycle change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOperation {
    /// Install (or re-install) the intent.
    Submit(Intent),
    /// Remove the intent's installables from the environment.
    Withdraw(Intent),
    /// Discard the intent's record once it is withdrawn or failed.
    Purge(Intent),
    /// Withdraw whatever is stored under `old` and submit `new` in its place.
    Replace {
        /// Key of the intent being replaced.
        old: Key,
        /// Its successor.
        new: Intent,
    },
    /// Recompile whatever is stored under the key. Engine internal.
    Recompile(Key),
}

impl IntentOperation {
    /// Key the operation acts on.
    #[must_use]
    pub fn key(&self) -> &Key {
        match self {
            Self::Submit(intent)
            | Self::Withdraw(intent)
            | Self::Purge(intent)
            | Self::Replace { new: intent, .. } => intent.key(),
            Self::Recompile(key) => key,
        }
    }

    /// Application owning the affected key.
    #[must_use]
    pub fn app_id(&self) -> &ApplicationId {
        self.key().app_id()
    }

    /// Whether every key the operation touches belongs to `app_id`.
    #[must_use]
    pub fn belongs_to(&self, app_id: &ApplicationId) -> bool {
        match self {
            Self::Replace { old, new } => old.app_id() == app_id && new.app_id() == app_id,
            _ => self.app_id() == app_id,
        }
    }
}

impl fmt::Display for IntentOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submit(intent) => write!(f, "submit {intent}"),
            Self::Withdraw(intent) => write!(f, "withdraw {intent}"),
            Self::Purge(intent) => write!(f, "purge {intent}"),
            Self::Replace { old, new } => write!(f, "replace {old} with {new}"),
            Self::Recompile(key) => write!(f, "recompile {key}"),
        }
    }
}

/// Ordered batch of operations issued by one application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentOperations {
    app_id: ApplicationId,
    operations: Vec<IntentOperation>,
}

impl IntentOperations {
    /// Starts a batch for `app_id`.
    #[must_use]
    pub fn builder(app_id: ApplicationId) -> IntentOperationsBuilder {
        IntentOperationsBuilder {
            app_id,
            operations: Vec::new(),
        }
    }

    /// Issuing application.
    #[must_use]
    pub const fn app_id(&self) -> &ApplicationId {
        &self.app_id
    }

    /// Operations in submission order.
    #[must_use]
    pub fn operations(&self) -> &[IntentOperation] {
        &self.operations
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns true for an empty batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl IntoIterator for IntentOperations {
    type Item = IntentOperation;
    type IntoIter = std::vec::IntoIter<IntentOperation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.into_iter()
    }
}

/// Builder for [`IntentOperations`].
#[must_use]
#[derive(Debug)]
pub struct IntentOperationsBuilder {
    app_id: ApplicationId,
    operations: Vec<IntentOperation>,
}

impl IntentOperationsBuilder {
    /// Adds a submit operation.
    pub fn submit(mut self, intent: Intent) -> Self {
        self.operations.push(IntentOperation::Submit(intent));
        self
    }

    /// Adds a withdraw operation.
    pub fn withdraw(mut self, intent: Intent) -> Self {
        self.operations.push(IntentOperation::Withdraw(intent));
        self
    }

    /// Adds a purge operation.
    pub fn purge(mut self, intent: Intent) -> Self {
        self.operations.push(IntentOperation::Purge(intent));
        self
    }

    /// Adds a replace operation.
    pub fn replace(mut self, old: Key, new: Intent) -> Self {
        self.operations.push(IntentOperation::Replace { old, new });
        self
    }

    /// Adds a recompile operation.
    pub fn recompile(mut self, key: Key) -> Self {
        self.operations.push(IntentOperation::Recompile(key));
        self
    }

    /// Finishes the batch.
    pub fn build(self) -> IntentOperations {
        IntentOperations {
            app_id: self.app_id,
            operations: self.operations,
        }
    }
}
