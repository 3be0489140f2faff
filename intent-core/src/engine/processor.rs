//! One attempt at moving an intent towards its requested state.
//!
//! Request work is recorded first (which announces `INSTALL_REQ` or
//! `WITHDRAW_REQ`), then progresses through staged transient states until a
//! parking state is written. Engine-initiated recompilations compile before
//! staging anything, so an unchanged outcome leaves the stored record alone.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace, warn};

use crate::data::IntentData;
use crate::engine::EngineCore;
use crate::error::CompileError;
use crate::install::{InstallOrder, InstallOutcome, InstallationReport};
use crate::intent::{Intent, same_installables};
use crate::state::IntentState;
use crate::store::WriteOutcome;

pub(crate) async fn process(core: &EngineCore, data: IntentData, superseded: &AtomicBool) {
    core.clock.observe(data.version());
    if !core.store.is_master(data.key()) {
        trace!(key = %data.key(), "key moved to another node; leaving work queued");
        return;
    }

    match data.request() {
        IntentState::InstallReq if data.cause().is_recompile() => {
            recompile(core, &data, superseded).await;
        }
        IntentState::InstallReq => install(core, &data, superseded).await,
        IntentState::WithdrawReq => withdraw(core, &data, superseded).await,
        IntentState::PurgeReq => purge(core, &data),
        other => warn!(key = %data.key(), request = %other, "pending work carries no request"),
    }
    core.store.complete_pending(&data);
}

async fn install(core: &EngineCore, data: &IntentData, superseded: &AtomicBool) {
    let stored = core.store.get_intent_data(data.key());
    if is_outdated(stored.as_ref(), data) {
        return;
    }
    let request = data.with_installables(live_installables(stored.as_ref()));
    if !record_request(core, stored.as_ref(), &request) {
        return;
    }
    if !core.store.stage(request.with_state(IntentState::Compiling)).is_applied() {
        return;
    }

    let compiled = core
        .compilers
        .compile(request.intent(), request.installables())
        .await;
    let live = (!request.installables().is_empty()).then(|| request.clone());
    finish_install(core, &request, live, compiled, superseded).await;
}

async fn recompile(core: &EngineCore, data: &IntentData, superseded: &AtomicBool) {
    let Some(stored) = core.store.get_intent_data(data.key()) else {
        debug!(key = %data.key(), "intent vanished before recompilation");
        return;
    };
    if is_outdated(Some(&stored), data) {
        return;
    }

    let compiled = core
        .compilers
        .compile(data.intent(), stored.installables())
        .await;
    if is_unchanged(&stored, &compiled) {
        debug!(key = %data.key(), state = %stored.state(), "recompilation changed nothing");
        return;
    }

    if stored.state() == IntentState::Installed
        && data.intent().is_non_disruptive()
        && let Ok(installables) = compiled
    {
        reallocate(core, &stored, data, installables, superseded).await;
        return;
    }

    if !core.store.stage(data.with_state(IntentState::Recompiling)).is_applied() {
        return;
    }
    let live = is_live(&stored).then(|| stored.clone());
    finish_install(core, data, live, compiled, superseded).await;
}

async fn finish_install(
    core: &EngineCore,
    data: &IntentData,
    live: Option<IntentData>,
    compiled: Result<Vec<Intent>, CompileError>,
    superseded: &AtomicBool,
) {
    let (installables, compile_failed) = match compiled {
        Ok(installables) => (installables, false),
        Err(err) => {
            core.metrics.compile_failures.increment();
            warn!(key = %data.key(), error = %err, "intent compilation failed");
            (Vec::new(), true)
        }
    };

    let attempt = data
        .with_installables(installables)
        .with_state(IntentState::Installing);
    if !core.store.stage(attempt.clone()).is_applied() {
        return;
    }

    let to_install = (!compile_failed).then(|| attempt.clone());
    let report = core
        .coordinator
        .apply(live.clone(), to_install, InstallOrder::BreakBeforeMake, superseded)
        .await;
    if was_superseded(core, &attempt, &report, superseded) {
        return;
    }

    let record = match (compile_failed, report.outcome) {
        (false, InstallOutcome::Success) => {
            core.metrics.installed.increment();
            attempt
                .with_state(IntentState::Installed)
                .with_errors_cleared()
        }
        (true, InstallOutcome::Success) => attempt.with_state(IntentState::Failed),
        (false, InstallOutcome::Failed) if live.is_none() => {
            core.metrics.install_failures.increment();
            attempt.with_state(IntentState::Failed).with_error()
        }
        _ => {
            // Whatever may still be installed stays on the record for the retry.
            core.metrics.corrupt_outcomes.increment();
            let mut kept = live
                .as_ref()
                .map(|live| live.installables().to_vec())
                .unwrap_or_default();
            kept.extend(attempt.installables().iter().cloned());
            attempt
                .with_installables(kept)
                .with_state(IntentState::Corrupt)
                .with_error()
        }
    };
    conclude(core, record, &report);
}

/// Make-before-break replacement of an installed non-disruptive intent.
async fn reallocate(
    core: &EngineCore,
    stored: &IntentData,
    data: &IntentData,
    installables: Vec<Intent>,
    superseded: &AtomicBool,
) {
    let attempt = data
        .with_installables(installables)
        .with_state(IntentState::Reallocating);
    if !core.store.stage(attempt.clone()).is_applied() {
        return;
    }

    let order = InstallOrder::MakeBeforeBreak {
        delay: core.config.install.non_disruptive_delay,
    };
    let report = core
        .coordinator
        .apply(Some(stored.clone()), Some(attempt.clone()), order, superseded)
        .await;
    if was_superseded(core, &attempt, &report, superseded) {
        return;
    }

    let record = match report.outcome {
        InstallOutcome::Success => {
            core.metrics.installed.increment();
            attempt
                .with_state(IntentState::Installed)
                .with_errors_cleared()
        }
        InstallOutcome::Failed => {
            // New installables never landed; the old ones are still in place.
            core.metrics.install_failures.increment();
            let teardown = core
                .coordinator
                .apply(Some(stored.clone()), None, InstallOrder::BreakBeforeMake, superseded)
                .await;
            if teardown.outcome == InstallOutcome::Success {
                attempt
                    .with_installables(Vec::new())
                    .with_state(IntentState::Failed)
                    .with_error()
            } else {
                core.metrics.corrupt_outcomes.increment();
                attempt
                    .with_installables(stored.installables().to_vec())
                    .with_state(IntentState::Corrupt)
                    .with_error()
            }
        }
        InstallOutcome::Corrupt | InstallOutcome::Superseded => {
            core.metrics.corrupt_outcomes.increment();
            let mut both = stored.installables().to_vec();
            both.extend(attempt.installables().iter().cloned());
            attempt
                .with_installables(both)
                .with_state(IntentState::Corrupt)
                .with_error()
        }
    };
    conclude(core, record, &report);
}

async fn withdraw(core: &EngineCore, data: &IntentData, superseded: &AtomicBool) {
    let Some(stored) = core.store.get_intent_data(data.key()) else {
        debug!(key = %data.key(), "nothing to withdraw");
        return;
    };
    if is_outdated(Some(&stored), data) {
        return;
    }
    let request = data.with_installables(live_installables(Some(&stored)));
    if !record_request(core, Some(&stored), &request) {
        return;
    }
    let attempt = request.with_state(IntentState::Withdrawing);
    if !core.store.stage(attempt.clone()).is_applied() {
        return;
    }

    let to_uninstall = (!attempt.installables().is_empty()).then(|| attempt.clone());
    let report = core
        .coordinator
        .apply(to_uninstall, None, InstallOrder::BreakBeforeMake, superseded)
        .await;
    if was_superseded(core, &attempt, &report, superseded) {
        return;
    }

    let record = if report.outcome == InstallOutcome::Success {
        core.tracker.remove_tracked_resources(attempt.key());
        attempt
            .with_installables(Vec::new())
            .with_state(IntentState::Withdrawn)
            .with_errors_cleared()
    } else {
        core.metrics.corrupt_outcomes.increment();
        attempt.with_state(IntentState::Corrupt).with_error()
    };
    conclude(core, record, &report);
}

fn purge(core: &EngineCore, data: &IntentData) {
    let Some(stored) = core.store.get_intent_data(data.key()) else {
        debug!(key = %data.key(), "nothing to purge");
        return;
    };
    if is_outdated(Some(&stored), data) {
        return;
    }
    if !stored.state().is_purgeable() {
        core.metrics.rejected_writes.increment();
        warn!(
            key = %data.key(),
            state = %stored.state(),
            "refusing to purge an intent that is neither withdrawn nor failed"
        );
        return;
    }

    match core.store.write(data.clone()) {
        WriteOutcome::Applied => {
            core.metrics.purges.increment();
            core.tracker.remove_tracked_resources(data.key());
            info!(key = %data.key(), "intent purged");
        }
        outcome => {
            core.metrics.rejected_writes.increment();
            debug!(key = %data.key(), outcome = ?outcome, "purge not applied");
        }
    }
}

/// Writes the request record, or confirms a redelivered one is resumable.
fn record_request(core: &EngineCore, stored: Option<&IntentData>, request: &IntentData) -> bool {
    match core.store.write(request.clone()) {
        WriteOutcome::Applied => true,
        WriteOutcome::Rejected(_)
            if stored.is_some_and(|stored| {
                stored.version() == request.version() && stored.state() == request.state()
            }) =>
        {
            debug!(key = %request.key(), version = %request.version(), "resuming redelivered request");
            true
        }
        outcome => {
            core.metrics.rejected_writes.increment();
            debug!(key = %request.key(), outcome = ?outcome, "request not recorded");
            false
        }
    }
}

fn conclude(core: &EngineCore, record: IntentData, report: &InstallationReport) {
    let (key, state, errors) = (record.key().clone(), record.state(), record.error_count());
    match core.store.write(record) {
        WriteOutcome::Applied => {
            if state == IntentState::Corrupt {
                warn!(
                    key = %key,
                    error_count = errors,
                    failures = report.errors.len(),
                    "intent left in a corrupt state"
                );
            } else {
                info!(key = %key, state = %state, "intent reached parking state");
            }
        }
        outcome => {
            core.metrics.rejected_writes.increment();
            debug!(key = %key, state = %state, outcome = ?outcome, "final state not recorded");
        }
    }
}

fn was_superseded(
    core: &EngineCore,
    attempt: &IntentData,
    report: &InstallationReport,
    superseded: &AtomicBool,
) -> bool {
    if report.outcome == InstallOutcome::Superseded || superseded.load(Ordering::Acquire) {
        core.metrics.superseded_attempts.increment();
        debug!(key = %attempt.key(), version = %attempt.version(), "attempt superseded");
        return true;
    }
    false
}

fn is_outdated(stored: Option<&IntentData>, data: &IntentData) -> bool {
    let outdated = stored.is_some_and(|stored| stored.version().is_newer_than(data.version()));
    if outdated {
        trace!(key = %data.key(), version = %data.version(), "dropping outdated work");
    }
    outdated
}

/// Whether `data`'s installables are (possibly partially) in the environment.
fn is_live(data: &IntentData) -> bool {
    !data.installables().is_empty()
        && !matches!(data.state(), IntentState::Withdrawn | IntentState::Failed)
}

fn live_installables(stored: Option<&IntentData>) -> Vec<Intent> {
    stored
        .filter(|stored| is_live(stored))
        .map(|stored| stored.installables().to_vec())
        .unwrap_or_default()
}

/// A recompilation reproducing the stored outcome is not applied again.
fn is_unchanged(stored: &IntentData, compiled: &Result<Vec<Intent>, CompileError>) -> bool {
    match (stored.state(), compiled) {
        (IntentState::Failed, Err(_)) => stored.installables().is_empty(),
        (IntentState::Failed | IntentState::Installed, Ok(installables)) => {
            same_installables(stored.installables(), installables)
        }
        _ => false,
    }
}
