//! Lock-free engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Monotonic counter padded to its own cache line.
#[derive(Debug, Default)]
pub struct LockFreeCounter {
    value: CachePadded<AtomicU64>,
}

impl LockFreeCounter {
    /// Zero-initialized counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Adds one.
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `delta`.
    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}

/// Counters maintained by one engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub(crate) submissions: LockFreeCounter,
    pub(crate) withdrawals: LockFreeCounter,
    pub(crate) purges: LockFreeCounter,
    pub(crate) compile_failures: LockFreeCounter,
    pub(crate) install_failures: LockFreeCounter,
    pub(crate) corrupt_outcomes: LockFreeCounter,
    pub(crate) installed: LockFreeCounter,
    pub(crate) recompilations: LockFreeCounter,
    pub(crate) rejected_writes: LockFreeCounter,
    pub(crate) superseded_attempts: LockFreeCounter,
    pub(crate) cleanup_recoveries: LockFreeCounter,
}

impl EngineMetrics {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submissions: self.submissions.get(),
            withdrawals: self.withdrawals.get(),
            purges: self.purges.get(),
            compile_failures: self.compile_failures.get(),
            install_failures: self.install_failures.get(),
            corrupt_outcomes: self.corrupt_outcomes.get(),
            installed: self.installed.get(),
            recompilations: self.recompilations.get(),
            rejected_writes: self.rejected_writes.get(),
            superseded_attempts: self.superseded_attempts.get(),
            cleanup_recoveries: self.cleanup_recoveries.get(),
        }
    }
}

/// Copy of [`EngineMetrics`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Install requests accepted from applications.
    pub submissions: u64,
    /// Withdraw requests accepted from applications.
    pub withdrawals: u64,
    /// Records purged.
    pub purges: u64,
    /// Compile attempts that ended in an error.
    pub compile_failures: u64,
    /// Installation attempts that ended FAILED.
    pub install_failures: u64,
    /// Installation or withdrawal attempts that ended CORRUPT.
    pub corrupt_outcomes: u64,
    /// Attempts that ended INSTALLED.
    pub installed: u64,
    /// Recompilations started by topology changes or retries.
    pub recompilations: u64,
    /// Writes refused by the state layer or the ownership check.
    pub rejected_writes: u64,
    /// Attempts abandoned because newer work arrived for the key.
    pub superseded_attempts: u64,
    /// Records and pending entries recovered by the cleanup sweep.
    pub cleanup_recoveries: u64,
}
