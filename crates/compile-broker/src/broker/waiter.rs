//! Completion handshake between a blocking requester and the worker
//!
//! Both sides decide who frees the task under the task's completion lock:
//! the requester frees it if it saw completion, otherwise it clears
//! `should_wait_for_completion` and whoever completes the task frees it.

use super::{BrokerShared, TierRuntime};
use crate::backend::CompilerKind;
use crate::error::BrokerError;
use crate::task::{CompileTask, FreedBy, TaskResult};
use std::sync::Arc;
use std::time::Duration;

/// How a blocking wait ended
pub(crate) enum WaitOutcome {
    /// The task completed; the requester freed it
    Completed(TaskResult),
    /// The external compiler made no progress; the worker will free the task
    Abandoned,
    /// Compilation was disabled before completion
    Disabled,
}

/// Wait for `task` on the requester thread
pub(crate) fn wait_for_completion(shared: &BrokerShared, tier: &TierRuntime, task: Arc<CompileTask>) -> WaitOutcome {
    let mut state = task.completion.lock();
    state.waiter_count += 1;
    debug_assert_eq!(state.waiter_count, 1, "more than one waiter on a blocking task");

    let mut gave_up = false;
    if tier.backend.kind() == CompilerKind::External {
        let slice = Duration::from_millis(shared.config.external_tier_progress_slice_ms);
        let max_idle_slices = shared.config.external_tier_progress_slices_max;
        let mut last_ticks = tier.backend.progress_ticks();
        let mut idle_slices = 0u32;
        while !task.is_complete() && !shared.is_disabled() {
            task.done.wait_for(&mut state, slice);
            if task.is_complete() || shared.is_disabled() {
                break;
            }
            let ticks = tier.backend.progress_ticks();
            if ticks != last_ticks {
                last_ticks = ticks;
                idle_slices = 0;
                continue;
            }
            idle_slices += 1;
            if idle_slices >= max_idle_slices {
                gave_up = true;
                break;
            }
        }
    } else {
        while !task.is_complete() && !shared.is_disabled() {
            task.done.wait(&mut state);
        }
    }
    state.waiter_count -= 1;

    if task.is_complete() {
        drop(state);
        let result = task.result();
        shared.tasks.free(task, FreedBy::Requester);
        return WaitOutcome::Completed(result);
    }

    // Leave the task to whoever completes it
    state.should_wait_for_completion = false;
    drop(state);
    if gave_up {
        tracing::debug!(task = %task, "no compiler progress, requester stops waiting");
        WaitOutcome::Abandoned
    } else {
        WaitOutcome::Disabled
    }
}

/// Publish completion and free the task unless a requester owns it
pub(crate) fn complete(shared: &BrokerShared, task: Arc<CompileTask>, by: FreedBy) {
    let requester_frees = {
        let state = task.completion.lock();
        task.mark_complete();
        let owned = task.is_blocking() && state.should_wait_for_completion;
        if owned {
            task.done.notify_all();
        }
        owned
    };
    if !requester_frees {
        shared.tasks.free(task, by);
    }
}

/// Finish a task that was taken off a queue without compiling
pub(crate) fn finalize_stale(shared: &BrokerShared, task: Arc<CompileTask>) {
    task.method().clear_queued_for_compilation();
    task.set_failure_reason(BrokerError::Stale.to_string());
    shared.stats.record_stale();
    tracing::debug!(task = %task, "stale task");
    complete(shared, task, FreedBy::Stale);
}

/// Wake the requester of a task still being compiled
pub(crate) fn wake_waiter(task: &CompileTask) {
    let _state = task.completion.lock();
    task.done.notify_all();
}
