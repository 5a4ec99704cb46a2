//! Compiler worker threads
//!
//! Each worker serves one tier: it lazily initializes the tier's back-end,
//! then loops pulling tasks from the tier queue, compiling them and
//! publishing the result to waiters and the statistics sink.

mod log;
mod pause;

pub use self::log::{LogEntry, LogEvent};
pub use pause::{PauseGate, PauseGuard};

use crate::backend::{CompileEnv, FailureScope};
use crate::broker::waiter;
use crate::broker::{BrokerShared, TierRuntime};
use crate::error::BrokerError;
use crate::method::Tier;
use crate::queue::{CompileQueue, Dequeued, QueueConsumer};
use crate::task::{CompileTask, FreedBy, TaskResult};
use self::log::CompileLog;
use parking_lot::Mutex;
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

thread_local! {
    static IS_COMPILER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is a compiler worker
pub fn is_compiler_thread() -> bool {
    IS_COMPILER_THREAD.with(|flag| flag.get())
}

/// Identity of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    /// Tier served
    pub tier: Tier,
    /// Index within the tier, in creation order
    pub index: usize,
    /// Thread name
    pub name: String,
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum WorkerState {
    /// Starting up, back-end not yet initialized
    Init = 0,
    /// Compiling a task
    Running = 1,
    /// Waiting for work
    Idle = 2,
    /// Left its loop
    Shutdown = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Init,
            1 => WorkerState::Running,
            2 => WorkerState::Idle,
            _ => WorkerState::Shutdown,
        }
    }
}

/// Broker-side record of one worker thread
pub(crate) struct WorkerHandle {
    info: WorkerInfo,
    state: AtomicU8,
    idle_since: Mutex<Option<Instant>>,
    current_task: Mutex<Option<Arc<CompileTask>>>,
    log: CompileLog,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub(crate) fn new(info: WorkerInfo, log_capacity: usize) -> Self {
        WorkerHandle {
            info,
            state: AtomicU8::new(WorkerState::Init as u8),
            idle_since: Mutex::new(Some(Instant::now())),
            current_task: Mutex::new(None),
            log: CompileLog::new(log_capacity),
            join: Mutex::new(None),
        }
    }

    pub(crate) fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Time since the worker last finished a task
    pub(crate) fn idle_time(&self) -> Duration {
        self.idle_since
            .lock()
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn start_idle_timer(&self) {
        *self.idle_since.lock() = Some(Instant::now());
    }

    fn stop_idle_timer(&self) {
        *self.idle_since.lock() = None;
    }

    pub(crate) fn current_task(&self) -> Option<Arc<CompileTask>> {
        self.current_task.lock().clone()
    }

    pub(crate) fn log_entries(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub(crate) fn set_join_handle(&self, handle: JoinHandle<()>) {
        *self.join.lock() = Some(handle);
    }

    /// Whether the thread has left `compiler_thread_loop`
    pub(crate) fn is_finished(&self) -> bool {
        self.join.lock().as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Join the thread unless called from it
    pub(crate) fn join(&self) {
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(worker = %self.info.name, "compiler thread panicked");
            }
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.info.name)
            .field("state", &self.state())
            .finish()
    }
}

/// The worker's side of the queue protocol
struct WorkerContext<'a> {
    shared: &'a Arc<BrokerShared>,
    tier: &'a Arc<TierRuntime>,
    handle: &'a Arc<WorkerHandle>,
}

impl QueueConsumer for WorkerContext<'_> {
    fn on_empty_queue(&self, queue: &CompileQueue) {
        self.handle.set_state(WorkerState::Idle);
        self.tier.backend.on_empty_queue(queue, &self.handle.info);
    }

    fn should_exit(&self) -> bool {
        self.shared.workers_should_exit()
    }

    fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.shared.config.queue_wait_timeout_ms)
    }

    fn try_retire(&self) -> bool {
        self.shared.pool.maybe_retire(self.shared, self.tier, self.handle)
    }

    fn finalize_stale(&self, task: Arc<CompileTask>) {
        waiter::finalize_stale(self.shared, task);
    }
}

/// Body of a compiler thread
pub(crate) fn compiler_thread_loop(shared: Arc<BrokerShared>, tier: Arc<TierRuntime>, handle: Arc<WorkerHandle>) {
    IS_COMPILER_THREAD.with(|flag| flag.set(true));
    tracing::debug!(worker = %handle.info.name, "compiler thread started");

    if !shared.init_backend(&tier) {
        handle.set_state(WorkerState::Shutdown);
        return;
    }

    let mut arena: Vec<u8> = Vec::with_capacity(tier.config.buffer_size);
    let ctx = WorkerContext {
        shared: &shared,
        tier: &tier,
        handle: &handle,
    };

    loop {
        shared.pause.poll();
        match tier.queue.dequeue_blocking(&ctx) {
            Dequeued::Task(task) => {
                handle.set_state(WorkerState::Running);
                handle.stop_idle_timer();
                invoke_compiler_on_method(&shared, &tier, &handle, &mut arena, task);
                handle.start_idle_timer();
                if shared.config.dynamic_pool_enabled {
                    shared.pool.maybe_grow(&shared, &tier);
                }
            }
            Dequeued::Retire => {
                tier.backend.stopping_compiler_thread(&handle.info);
                tracing::info!(worker = %handle.info.name, idle_ms = handle.idle_time().as_millis() as u64, "compiler thread retired");
                break;
            }
            Dequeued::Exit => break,
        }
    }

    handle.set_state(WorkerState::Shutdown);
    tracing::debug!(worker = %handle.info.name, "compiler thread exiting");
}

fn invoke_compiler_on_method(
    shared: &BrokerShared,
    tier: &TierRuntime,
    handle: &WorkerHandle,
    arena: &mut Vec<u8>,
    task: Arc<CompileTask>,
) {
    let method = task.method().clone();
    *handle.current_task.lock() = Some(task.clone());

    let directive = shared.directives.lookup(&method, tier.backend.kind());
    let should_log = shared.config.log_compilation || directive.log;
    if should_log {
        handle.log.begin(&task);
    }

    let started = Instant::now();
    let mut result = TaskResult::default();
    let mut scope = None;
    let mut invalidated = false;

    if method.has_breakpoints() {
        result.failure_reason = Some("breakpoints are present".into());
    } else if !shared.should_compile_new_jobs() {
        method.clear_queued_for_compilation();
        result.failure_reason = Some("compilation is disabled".into());
    } else {
        if directive.break_at_compile {
            tracing::info!(task = %task, "break at compile");
        }
        for _ in 0..directive.repeat_compilation {
            let mut env = CompileEnv::new(&task, &shared.code_cache, tier.config.blob_kind, &shared.pause, arena);
            tier.backend
                .compile_method(&mut env, &method, task.entry_bci(), false, &directive);
        }

        let mut env = CompileEnv::new(&task, &shared.code_cache, tier.config.blob_kind, &shared.pause, arena);
        tier.backend
            .compile_method(&mut env, &method, task.entry_bci(), true, &directive);
        result.arena_bytes = env.arena_bytes();
        let outcome = env.into_outcome();
        shared.pause.poll();

        result.total_code_size = outcome.total_code_size;
        result.instructions_size = outcome.instructions_size;
        result.inlined_bytecodes = outcome.inlined_bytecodes;
        result.retry_message = outcome.retry_message;
        invalidated = outcome.invalidated;
        match outcome.failure {
            Some((reason, failure_scope)) => {
                result.failure_reason = Some(reason);
                scope = Some(failure_scope);
            }
            None if outcome.installed.is_some() => result.is_success = true,
            None => result.failure_reason = Some("compiler produced no code".into()),
        }
        if let Some(kind) = outcome.code_cache_full {
            shared.handle_code_cache_full(kind);
        }
    }
    let elapsed = started.elapsed();

    if let Some(reason) = &result.failure_reason {
        match scope {
            Some(FailureScope::NotAtTier) if task.is_osr() => {
                method.set_not_osr_compilable(task.tier(), reason, false)
            }
            Some(FailureScope::NotAtTier) => method.set_not_compilable(task.tier(), reason, false),
            Some(FailureScope::Never) => method.set_not_compilable_all(reason),
            _ => {}
        }
        if let Some(retry) = &result.retry_message {
            tracing::debug!(task = %task, retry = %retry, "compile will be retried");
        }
        let error = classify_failure(reason, scope);
        tracing::debug!(task = %task, error = %error, "compile failed");
    } else {
        tier.backend.stats().record(
            task.is_osr(),
            elapsed,
            method.bytecode_size(),
            result.total_code_size,
            result.instructions_size,
        );
        tracing::debug!(task = %task, code_size = result.total_code_size, elapsed_us = elapsed.as_micros() as u64, "compiled");
    }

    shared.stats.record_compile(&task, &result, elapsed, invalidated);
    if should_log {
        let detail = match &result.failure_reason {
            Some(reason) => reason.to_string(),
            None => format!("{} bytes", result.total_code_size),
        };
        handle.log.finish(&task, result.is_success, detail, elapsed);
    }

    *handle.current_task.lock() = None;
    method.clear_queued_for_compilation();
    task.set_result(result);
    waiter::complete(shared, task, FreedBy::Worker);
}

/// Error kind of a failed compile: permanent when the back-end ruled the tier out
fn classify_failure(reason: &str, scope: Option<FailureScope>) -> BrokerError {
    match scope {
        Some(FailureScope::NotAtTier) | Some(FailureScope::Never) => {
            BrokerError::CompilerPermanentFailure(reason.to_string())
        }
        Some(FailureScope::Retry) | None => BrokerError::CompilerBailout(reason.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure("stub bailout", Some(FailureScope::Retry)),
            BrokerError::CompilerBailout("stub bailout".into())
        );
        assert_eq!(
            classify_failure("breakpoints are present", None),
            BrokerError::CompilerBailout("breakpoints are present".into())
        );
        assert!(matches!(
            classify_failure("not compilable at this tier", Some(FailureScope::NotAtTier)),
            BrokerError::CompilerPermanentFailure(_)
        ));
        assert!(matches!(
            classify_failure("never compilable", Some(FailureScope::Never)),
            BrokerError::CompilerPermanentFailure(_)
        ));
    }
}
