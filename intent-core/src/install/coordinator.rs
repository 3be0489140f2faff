//! Two-phase replacement of an intent's installables.
//!
//! An attempt removes the old installables and applies the new ones (or the
//! reverse for make-before-break). Each phase hands one operation context per
//! installer kind out and collects the reports over a channel, giving up at
//! the confirmation timeout. The resulting [`InstallationReport`] tells the
//! processor which parking state to write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::data::IntentData;
use crate::error::InstallError;
use crate::install::InstallerRegistry;
use crate::install::context::{IntentInstallationContext, IntentOperationContext};
use crate::intent::{Intent, IntentKind};
use crate::key::Key;
use crate::tracker::ObjectiveTracker;

/// Order of the two phases of a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOrder {
    /// Remove old installables, then apply new ones.
    BreakBeforeMake,
    /// Apply new installables, then remove old ones.
    MakeBeforeBreak {
        /// Pause between the two phases.
        delay: Duration,
    },
}

/// How an installation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Every operation was confirmed.
    Success,
    /// Every operation failed; nothing reached the environment.
    Failed,
    /// Some operations succeeded before others failed.
    Corrupt,
    /// The attempt was superseded between phases; outstanding operations
    /// were awaited, the remaining phase was not started.
    Superseded,
}

/// Summary of a finished attempt.
#[derive(Debug, Clone)]
pub struct InstallationReport {
    /// Overall result.
    pub outcome: InstallOutcome,
    /// Confirmed operations.
    pub succeeded: usize,
    /// Failed operations.
    pub errors: Vec<InstallError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninstall,
    Install,
}

/// Drives installers through uninstall and install phases for one intent at a time.
pub struct InstallCoordinator {
    installers: Arc<InstallerRegistry>,
    tracker: Arc<ObjectiveTracker>,
    confirmation_timeout: Duration,
    next_operation: AtomicU64,
}

impl InstallCoordinator {
    /// Coordinator dispatching to `installers` and keeping `tracker` current.
    #[must_use]
    pub fn new(
        installers: Arc<InstallerRegistry>,
        tracker: Arc<ObjectiveTracker>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            installers,
            tracker,
            confirmation_timeout,
            next_operation: AtomicU64::new(1),
        }
    }

    /// Replaces `to_uninstall`'s installables with `to_install`'s.
    ///
    /// Each phase hands one operation context per installable kind to its
    /// installer and waits until every context reported or the confirmation
    /// timeout passed. A phase that fails skips the remaining phase. When
    /// `superseded` is raised the attempt still waits for operations already
    /// handed out but does not start another phase.
    pub async fn apply(
        &self,
        to_uninstall: Option<IntentData>,
        to_install: Option<IntentData>,
        order: InstallOrder,
        superseded: &AtomicBool,
    ) -> InstallationReport {
        let mut attempt = IntentInstallationContext::new(to_uninstall, to_install);
        let phases = match order {
            InstallOrder::BreakBeforeMake => [Phase::Uninstall, Phase::Install],
            InstallOrder::MakeBeforeBreak { .. } => [Phase::Install, Phase::Uninstall],
        };

        let mut completed = false;
        for (index, phase) in phases.into_iter().enumerate() {
            if superseded.load(Ordering::Acquire) {
                return Self::report(&attempt, InstallOutcome::Superseded);
            }
            if index == 1
                && let InstallOrder::MakeBeforeBreak { delay } = order
                && !delay.is_zero()
            {
                tokio::time::sleep(delay).await;
            }
            let errors_before = attempt.errors().len();
            self.run_phase(&mut attempt, phase).await;
            if attempt.errors().len() > errors_before {
                break;
            }
            self.update_tracking(&attempt, phase);
            completed = index == 1;
        }

        let outcome = if !attempt.has_errors() && completed {
            InstallOutcome::Success
        } else if attempt.succeeded() == 0 {
            InstallOutcome::Failed
        } else {
            InstallOutcome::Corrupt
        };
        Self::report(&attempt, outcome)
    }

    fn report(attempt: &IntentInstallationContext, outcome: InstallOutcome) -> InstallationReport {
        InstallationReport {
            outcome,
            succeeded: attempt.succeeded(),
            errors: attempt.errors(),
        }
    }

    async fn run_phase(&self, attempt: &mut IntentInstallationContext, phase: Phase) {
        let source = match phase {
            Phase::Uninstall => attempt.to_uninstall(),
            Phase::Install => attempt.to_install(),
        };
        let Some(source) = source else {
            return;
        };
        let key = source.key().clone();
        let groups = group_by_kind(source.installables());
        if groups.is_empty() {
            return;
        }

        let (reports_tx, mut reports_rx) = mpsc::unbounded_channel();
        for (kind, intents) in groups {
            let operation = self.next_operation.fetch_add(1, Ordering::Relaxed);
            attempt.add_pending(operation);
            let (to_uninstall, to_install) = match phase {
                Phase::Uninstall => (intents, Vec::new()),
                Phase::Install => (Vec::new(), intents),
            };
            let context = IntentOperationContext::new(
                operation,
                kind,
                key.clone(),
                to_uninstall,
                to_install,
                reports_tx.clone(),
            );
            match self.installers.get(kind) {
                Some(installer) => installer.apply(context),
                None => context.failed(InstallError::NoInstaller { kind }),
            }
        }
        drop(reports_tx);

        let deadline = Instant::now() + self.confirmation_timeout;
        while attempt.pending_count() > 0 {
            match tokio::time::timeout_at(deadline, reports_rx.recv()).await {
                Ok(Some(report)) => {
                    attempt.resolve(report);
                }
                Ok(None) => {
                    attempt.expire(|operation| InstallError::Abandoned { operation });
                }
                Err(_) => {
                    warn!(
                        key = %key,
                        pending = attempt.pending_count(),
                        "installation confirmation timed out"
                    );
                    attempt.expire(|operation| InstallError::ConfirmationTimeout { operation });
                }
            }
        }
        debug!(key = %key, phase = ?phase, errors = attempt.errors().len(), "installation phase finished");
    }

    fn update_tracking(&self, attempt: &IntentInstallationContext, phase: Phase) {
        match phase {
            Phase::Uninstall => {
                if let Some(old) = attempt.to_uninstall()
                    && attempt.to_install().is_none()
                {
                    self.tracker.remove_tracked_resources(old.key());
                }
            }
            Phase::Install => {
                if let Some(new) = attempt.to_install() {
                    track(&self.tracker, new.key(), new.intent(), new.installables());
                }
            }
        }
    }
}

fn group_by_kind(installables: &[Intent]) -> BTreeMap<IntentKind, Vec<Intent>> {
    let mut groups: BTreeMap<IntentKind, Vec<Intent>> = BTreeMap::new();
    for installable in installables {
        groups
            .entry(installable.kind())
            .or_default()
            .push(installable.clone());
    }
    groups
}

fn track(tracker: &ObjectiveTracker, key: &Key, intent: &Intent, installables: &[Intent]) {
    let resources = intent
        .resources()
        .iter()
        .chain(installables.iter().flat_map(|installable| installable.resources()))
        .cloned();
    tracker.add_tracked_resources(key, resources, intent.resource_group().cloned());
}
