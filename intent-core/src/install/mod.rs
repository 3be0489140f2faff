//! Installation of compiled intents into the environment.
//!
//! Installers are external collaborators registered per installable kind.
//! The [`InstallCoordinator`] groups an intent's installables by kind, hands
//! each group to its installer as an [`IntentOperationContext`] and collects
//! the reports those contexts send back.

/// Per-attempt and per-operation contexts.
pub mod context;
/// Two-phase installation driver.
pub mod coordinator;

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::intent::IntentKind;

pub use context::{IntentInstallationContext, IntentOperationContext};
pub use coordinator::{InstallCoordinator, InstallOrder, InstallOutcome, InstallationReport};

/// Applies installables of one kind to the environment.
pub trait IntentInstaller: Send + Sync {
    /// Starts the operation described by `context`.
    ///
    /// Must return promptly; confirmation may arrive later from another task
    /// through [`IntentOperationContext::success`] or
    /// [`IntentOperationContext::failed`].
    fn apply(&self, context: IntentOperationContext);
}

/// One installer per installable kind; registering again replaces the previous one.
#[derive(Default)]
pub struct InstallerRegistry {
    installers: DashMap<IntentKind, Arc<dyn IntentInstaller>>,
}

impl InstallerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `installer` for `kind`, returning the one it replaced.
    pub fn register(
        &self,
        kind: IntentKind,
        installer: Arc<dyn IntentInstaller>,
    ) -> Option<Arc<dyn IntentInstaller>> {
        let previous = self.installers.insert(kind, installer);
        if previous.is_some() {
            debug!(kind = %kind, "replaced intent installer");
        }
        previous
    }

    /// Removes the installer for `kind`.
    pub fn unregister(&self, kind: IntentKind) -> Option<Arc<dyn IntentInstaller>> {
        self.installers.remove(&kind).map(|(_, installer)| installer)
    }

    /// Installer registered for `kind`.
    #[must_use]
    pub fn get(&self, kind: IntentKind) -> Option<Arc<dyn IntentInstaller>> {
        self.installers
            .get(&kind)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Kinds with a registered installer, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<IntentKind> {
        let mut kinds: Vec<_> = self.installers.iter().map(|entry| *entry.key()).collect();
        kinds.sort();
        kinds
    }
}
