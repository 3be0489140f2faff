//! Recovery of stuck, lost and corrupt work for keys the local node owns.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::cluster::PartitionId;
use crate::data::{IntentData, UpdateCause};
use crate::engine::EngineCore;
use crate::engine::dispatch::Dispatcher;
use crate::key::Key;
use crate::state::IntentState;

/// Periodic sweep: re-dispatches pending work older than the pending timeout,
/// recovers records stuck in a transient state longer than the transient
/// timeout and retries corrupt records below the retry threshold.
///
/// Keys with an attempt running on this node are left alone: that attempt is
/// bounded by the confirmation timeout and writes its own outcome.
///
/// Returns the number of recovered keys.
pub(crate) fn sweep(core: &EngineCore, dispatcher: &Arc<Dispatcher>) -> usize {
    let now = Instant::now();
    let cleanup = &core.config.cleanup;
    let maps = core.store.maps();
    let mut recovered = 0;

    for (data, queued_at) in maps.pending_with_age() {
        if !core.store.is_master(data.key())
            || now.saturating_duration_since(queued_at) < cleanup.pending_timeout
        {
            continue;
        }
        debug!(key = %data.key(), version = %data.version(), "re-dispatching stale pending work");
        maps.touch_pending(data.key());
        dispatcher.dispatch(data);
        recovered += 1;
    }

    for (data, updated_at) in maps.current_with_age() {
        if !core.store.is_master(data.key()) || dispatcher.is_in_flight(data.key()) {
            continue;
        }
        let stuck = data.state().is_in_progress()
            && now.saturating_duration_since(updated_at) >= cleanup.transient_timeout;
        if (stuck || is_retryable(core, &data)) && core.recompile(data.key(), UpdateCause::Retry) {
            recovered += 1;
        }
    }

    if recovered > 0 {
        record_recoveries(core, recovered);
        info!(recovered, "cleanup sweep recovered intents");
    }
    recovered
}

/// Immediate recovery of a partition the local node just acquired: transient
/// records are recovered regardless of age, corrupt records below the retry
/// threshold are retried and queued work is dispatched.
pub(crate) fn recover_partition(
    core: &EngineCore,
    dispatcher: &Arc<Dispatcher>,
    partition: PartitionId,
) -> usize {
    let in_partition = |key: &Key| core.partitions.partition_of(key) == partition;
    let mut recovered = 0;

    // Records go first: a redelivered request would otherwise mark the key as
    // busy and hide a transient record left behind by the previous owner.
    for data in core.store.get_intent_records() {
        if !in_partition(data.key()) || dispatcher.is_in_flight(data.key()) {
            continue;
        }
        if (data.state().is_in_progress() || is_retryable(core, &data))
            && core.recompile(data.key(), UpdateCause::Retry)
        {
            recovered += 1;
        }
    }
    for data in pending_where(core, in_partition) {
        dispatcher.dispatch(data);
        recovered += 1;
    }

    if recovered > 0 {
        record_recoveries(core, recovered);
        info!(partition = %partition, recovered, "recovered work of acquired partition");
    }
    recovered
}

/// Dispatches every queued entry the local node owns.
pub(crate) fn dispatch_owned_pending(core: &EngineCore, dispatcher: &Arc<Dispatcher>) -> usize {
    let owned = pending_where(core, |key| core.store.is_master(key));
    let count = owned.len();
    for data in owned {
        dispatcher.dispatch(data);
    }
    count
}

fn pending_where(core: &EngineCore, filter: impl Fn(&Key) -> bool) -> Vec<IntentData> {
    core.store
        .maps()
        .pending_with_age()
        .into_iter()
        .map(|(data, _)| data)
        .filter(|data| filter(data.key()))
        .collect()
}

fn record_recoveries(core: &EngineCore, recovered: usize) {
    core.metrics
        .cleanup_recoveries
        .add(u64::try_from(recovered).unwrap_or(u64::MAX));
}

fn is_retryable(core: &EngineCore, data: &IntentData) -> bool {
    data.state() == IntentState::Corrupt && data.error_count() < core.config.cleanup.retry_threshold
}
