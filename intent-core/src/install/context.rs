use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::data::IntentData;
use crate::error::InstallError;
use crate::intent::{Intent, IntentKind};
use crate::key::Key;

/// Completion message an operation context sends back to the coordinator.
#[derive(Debug)]
pub(crate) struct OperationReport {
    pub(crate) operation: u64,
    pub(crate) result: Result<(), InstallError>,
}

/// One installer's share of an installation attempt.
///
/// The installer applies the listed installables to the environment and then
/// calls [`success`](Self::success) or [`failed`](Self::failed) exactly once,
/// from any task. Dropping the context without reporting counts as a failure.
#[derive(Debug)]
pub struct IntentOperationContext {
    operation: u64,
    kind: IntentKind,
    key: Key,
    to_uninstall: Vec<Intent>,
    to_install: Vec<Intent>,
    reporter: Option<mpsc::UnboundedSender<OperationReport>>,
}

impl IntentOperationContext {
    pub(crate) fn new(
        operation: u64,
        kind: IntentKind,
        key: Key,
        to_uninstall: Vec<Intent>,
        to_install: Vec<Intent>,
        reporter: mpsc::UnboundedSender<OperationReport>,
    ) -> Self {
        Self {
            operation,
            kind,
            key,
            to_uninstall,
            to_install,
            reporter: Some(reporter),
        }
    }

    /// Coordinator-assigned operation identifier.
    #[must_use]
    pub const fn operation(&self) -> u64 {
        self.operation
    }

    /// Installable kind handled by this context.
    #[must_use]
    pub const fn kind(&self) -> IntentKind {
        self.kind
    }

    /// Key of the high-level intent.
    #[must_use]
    pub const fn key(&self) -> &Key {
        &self.key
    }

    /// Installables to remove from the environment.
    #[must_use]
    pub fn intents_to_uninstall(&self) -> &[Intent] {
        &self.to_uninstall
    }

    /// Installables to apply to the environment.
    #[must_use]
    pub fn intents_to_install(&self) -> &[Intent] {
        &self.to_install
    }

    /// Reports that the environment confirmed the operation.
    pub fn success(mut self) {
        self.report(Ok(()));
    }

    /// Reports that the environment rejected the operation.
    pub fn failed(mut self, error: InstallError) {
        self.report(Err(error));
    }

    fn report(&mut self, result: Result<(), InstallError>) {
        if let Some(reporter) = self.reporter.take() {
            // the coordinator may have given up on the attempt already
            let _ = reporter.send(OperationReport {
                operation: self.operation,
                result,
            });
        }
    }
}

impl Drop for IntentOperationContext {
    fn drop(&mut self) {
        let operation = self.operation;
        self.report(Err(InstallError::Abandoned { operation }));
    }
}

/// Bookkeeping for one installation attempt of a high-level intent.
///
/// Owned by the coordinator for the duration of the attempt; operation
/// contexts talk to it only through reports.
#[derive(Debug)]
pub struct IntentInstallationContext {
    to_uninstall: Option<IntentData>,
    to_install: Option<IntentData>,
    pending: HashSet<u64>,
    errors: Vec<(u64, InstallError)>,
    succeeded: usize,
}

impl IntentInstallationContext {
    /// Attempt replacing `to_uninstall` with `to_install`; either may be absent.
    #[must_use]
    pub fn new(to_uninstall: Option<IntentData>, to_install: Option<IntentData>) -> Self {
        Self {
            to_uninstall,
            to_install,
            pending: HashSet::new(),
            errors: Vec::new(),
            succeeded: 0,
        }
    }

    /// Record whose installables are removed.
    #[must_use]
    pub const fn to_uninstall(&self) -> Option<&IntentData> {
        self.to_uninstall.as_ref()
    }

    /// Record whose installables are applied.
    #[must_use]
    pub const fn to_install(&self) -> Option<&IntentData> {
        self.to_install.as_ref()
    }

    pub(crate) fn add_pending(&mut self, operation: u64) {
        self.pending.insert(operation);
    }

    /// Applies a report; reports for unknown or already resolved operations are ignored.
    pub(crate) fn resolve(&mut self, report: OperationReport) -> bool {
        if !self.pending.remove(&report.operation) {
            return false;
        }
        match report.result {
            Ok(()) => self.succeeded += 1,
            Err(error) => self.errors.push((report.operation, error)),
        }
        true
    }

    /// Moves every unresolved operation to the error set.
    pub(crate) fn expire(&mut self, error: impl Fn(u64) -> InstallError) {
        let mut expired: Vec<_> = self.pending.drain().collect();
        expired.sort_unstable();
        self.errors
            .extend(expired.into_iter().map(|operation| (operation, error(operation))));
    }

    /// Operations still awaiting a report.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Operations that reported success.
    #[must_use]
    pub const fn succeeded(&self) -> usize {
        self.succeeded
    }

    /// Whether any operation failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Errors collected so far, in resolution order.
    #[must_use]
    pub fn errors(&self) -> Vec<InstallError> {
        self.errors.iter().map(|(_, error)| error.clone()).collect()
    }
}
