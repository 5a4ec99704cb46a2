//! Compile tasks and the task free-list
//!
//! A `CompileTask` is initialized once, published to exactly one queue,
//! completed exactly once by a worker (or by the stale purge), and freed
//! exactly once by whoever owns it at completion time.

use crate::error::BrokerError;
use crate::method::{MethodHandle, Tier, INVOCATION_ENTRY_BCI};
use parking_lot::{Condvar, Mutex};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Sentinel for "not linked into a queue"
pub(crate) const NO_SLOT: usize = usize::MAX;

/// Recycled tasks kept for reuse
const FREE_LIST_MAX: usize = 64;

/// Why a compilation was requested
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileReason {
    /// Invocation counter overflow
    Normal,
    /// Loop back-edge counter overflow
    BackedgeCount,
    /// Tier transition chosen by the tiered policy
    Tiered,
    /// Replay of a recorded compilation
    Replay,
    /// Forced compilation of a method that must be compiled
    MustBeCompiled,
    /// Startup compilation
    Bootstrap,
    /// Recompilation of code invalidated around checkpoint/restore
    CheckpointRestore,
}

impl CompileReason {
    /// Short name used in logs
    pub fn name(self) -> &'static str {
        match self {
            CompileReason::Normal => "count",
            CompileReason::BackedgeCount => "backedge_count",
            CompileReason::Tiered => "tiered",
            CompileReason::Replay => "replay",
            CompileReason::MustBeCompiled => "must_be_compiled",
            CompileReason::Bootstrap => "bootstrap",
            CompileReason::CheckpointRestore => "checkpoint_restore",
        }
    }
}

impl fmt::Display for CompileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compile ID sequence a task draws from
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub enum CompileIdKind {
    /// Method-entry compilation
    Standard,
    /// On-stack replacement
    Osr,
    /// Native wrapper
    Native,
}

/// Result fields, written by the worker before completion is published
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    /// Whether code was produced and installed
    pub is_success: bool,
    /// Why the compilation failed
    pub failure_reason: Option<Cow<'static, str>>,
    /// Whether the back-end asked for a later retry
    pub retry_message: Option<Cow<'static, str>>,
    /// Total size of the installed code
    pub total_code_size: usize,
    /// Size of the instructions section
    pub instructions_size: usize,
    /// Bytecodes inlined into the compiled code
    pub inlined_bytecodes: usize,
    /// Scratch memory used by the compile
    pub arena_bytes: usize,
}

/// Training record attached at enqueue
#[derive(Debug, Clone, Copy)]
pub struct TrainingData {
    /// Queue size right before the task was added
    pub queue_depth: usize,
    /// When the task was added
    pub enqueued_at: Instant,
}

/// Completion handshake state, guarded by the task's completion lock
#[derive(Debug, Default)]
pub(crate) struct CompletionState {
    /// Threads currently waiting (0 or 1)
    pub waiter_count: u8,
    /// Cleared when the requester stops waiting without a result
    pub should_wait_for_completion: bool,
}

/// Who returned a task to the free-list
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FreedBy {
    Worker,
    Requester,
    Stale,
}

/// Initialization parameters for a task
pub(crate) struct TaskParams {
    pub compile_id: u32,
    pub method: MethodHandle,
    pub entry_bci: i32,
    pub tier: Tier,
    pub hot_count: u32,
    pub reason: CompileReason,
    pub is_blocking: bool,
}

/// One compile request in flight
pub struct CompileTask {
    compile_id: u32,
    method: MethodHandle,
    entry_bci: i32,
    tier: Tier,
    hot_count: u32,
    reason: CompileReason,
    requested_at: Instant,
    is_blocking: bool,
    training_data: OnceLock<TrainingData>,

    is_unloaded: AtomicBool,
    is_stale: AtomicBool,
    complete: AtomicBool,
    freed: AtomicBool,
    result: Mutex<TaskResult>,

    pub(crate) completion: Mutex<CompletionState>,
    pub(crate) done: Condvar,

    /// Slot in the owning queue's list; only touched under that queue's lock
    queue_slot: AtomicUsize,
}

impl CompileTask {
    fn new(params: TaskParams) -> Self {
        CompileTask {
            compile_id: params.compile_id,
            method: params.method,
            entry_bci: params.entry_bci,
            tier: params.tier,
            hot_count: params.hot_count,
            reason: params.reason,
            requested_at: Instant::now(),
            is_blocking: params.is_blocking,
            training_data: OnceLock::new(),
            is_unloaded: AtomicBool::new(false),
            is_stale: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            freed: AtomicBool::new(false),
            result: Mutex::new(TaskResult::default()),
            completion: Mutex::new(CompletionState {
                waiter_count: 0,
                should_wait_for_completion: params.is_blocking,
            }),
            done: Condvar::new(),
            queue_slot: AtomicUsize::new(NO_SLOT),
        }
    }

    /// Re-initialize a recycled task in place
    fn reset(&mut self, params: TaskParams) {
        self.compile_id = params.compile_id;
        self.method = params.method;
        self.entry_bci = params.entry_bci;
        self.tier = params.tier;
        self.hot_count = params.hot_count;
        self.reason = params.reason;
        self.requested_at = Instant::now();
        self.is_blocking = params.is_blocking;
        self.training_data.take();
        *self.is_unloaded.get_mut() = false;
        *self.is_stale.get_mut() = false;
        *self.complete.get_mut() = false;
        *self.freed.get_mut() = false;
        *self.result.get_mut() = TaskResult::default();
        *self.completion.get_mut() = CompletionState {
            waiter_count: 0,
            should_wait_for_completion: params.is_blocking,
        };
        *self.queue_slot.get_mut() = NO_SLOT;
    }

    /// Compile ID
    pub fn compile_id(&self) -> u32 {
        self.compile_id
    }

    /// Target method
    pub fn method(&self) -> &MethodHandle {
        &self.method
    }

    /// OSR entry BCI, or `INVOCATION_ENTRY_BCI`
    pub fn entry_bci(&self) -> i32 {
        self.entry_bci
    }

    /// Whether this is an on-stack-replacement compile
    pub fn is_osr(&self) -> bool {
        self.entry_bci != INVOCATION_ENTRY_BCI
    }

    /// Requested tier
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Hotness reported by the requester
    pub fn hot_count(&self) -> u32 {
        self.hot_count
    }

    /// Why the compile was requested
    pub fn reason(&self) -> CompileReason {
        self.reason
    }

    /// When the request was made
    pub fn requested_at(&self) -> Instant {
        self.requested_at
    }

    /// Whether a requester will wait for this task
    pub fn is_blocking(&self) -> bool {
        self.is_blocking
    }

    /// Which ID sequence this task's ID came from
    pub fn id_kind(&self) -> CompileIdKind {
        if self.method.is_native() {
            CompileIdKind::Native
        } else if self.is_osr() {
            CompileIdKind::Osr
        } else {
            CompileIdKind::Standard
        }
    }

    /// Training record, if one was attached at enqueue
    pub fn training_data(&self) -> Option<&TrainingData> {
        self.training_data.get()
    }

    pub(crate) fn attach_training_data(&self, data: TrainingData) {
        let _ = self.training_data.set(data);
    }

    /// Whether the declaring class was unloaded while queued
    pub fn is_unloaded(&self) -> bool {
        self.is_unloaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unloaded(&self) {
        self.is_unloaded.store(true, Ordering::Release);
    }

    /// Whether the task was moved to a stale list
    pub fn is_stale(&self) -> bool {
        self.is_stale.load(Ordering::Acquire)
    }

    pub(crate) fn set_stale(&self) {
        self.is_stale.store(true, Ordering::Release);
    }

    /// Whether the result has been published
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Whether the compile succeeded. Meaningful only once complete.
    pub fn is_success(&self) -> bool {
        self.is_complete() && self.result.lock().is_success
    }

    /// Copy of the result fields
    pub fn result(&self) -> TaskResult {
        self.result.lock().clone()
    }

    /// Whether the task went back to the free-list
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Write the result fields; must precede `mark_complete`
    pub(crate) fn set_result(&self, result: TaskResult) {
        debug_assert!(!self.is_complete(), "result written after completion");
        *self.result.lock() = result;
    }

    pub(crate) fn set_failure_reason(&self, reason: impl Into<Cow<'static, str>>) {
        let mut result = self.result.lock();
        result.is_success = false;
        result.failure_reason = Some(reason.into());
    }

    /// Publish completion. Panics if the task was already complete.
    pub(crate) fn mark_complete(&self) {
        if self.complete.swap(true, Ordering::AcqRel) {
            panic!("compile task {} completed twice", self.compile_id);
        }
    }

    pub(crate) fn queue_slot(&self) -> usize {
        self.queue_slot.load(Ordering::Relaxed)
    }

    pub(crate) fn set_queue_slot(&self, slot: usize) {
        self.queue_slot.store(slot, Ordering::Relaxed);
    }

    /// Current waiter count
    pub fn waiter_count(&self) -> u8 {
        self.completion.lock().waiter_count
    }
}

impl fmt::Display for CompileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let osr = if self.is_osr() { '%' } else { ' ' };
        let blocking = if self.is_blocking { 'b' } else { ' ' };
        let native = if self.method.is_native() { 'n' } else { ' ' };
        write!(
            f,
            "{:>7} {}{}{} {:>2}  {}",
            self.compile_id,
            osr,
            blocking,
            native,
            self.tier,
            self.method.full_name()
        )?;
        if self.is_osr() {
            write!(f, " @ {}", self.entry_bci)?;
        }
        write!(f, " ({} bytes)", self.method.bytecode_size())
    }
}

impl fmt::Debug for CompileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileTask")
            .field("compile_id", &self.compile_id)
            .field("method", &self.method.full_name())
            .field("entry_bci", &self.entry_bci)
            .field("tier", &self.tier)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Task pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPoolStats {
    /// Tasks handed out
    pub allocated: u64,
    /// Of those, reused from the free-list
    pub recycled: u64,
    /// Freed by the worker that completed them
    pub freed_by_worker: u64,
    /// Freed by the blocking requester
    pub freed_by_requester: u64,
    /// Freed by the stale purge
    pub freed_stale: u64,
    /// Tasks currently live
    pub live: usize,
    /// Most tasks live at once
    pub peak_live: usize,
}

impl TaskPoolStats {
    /// Total frees across all paths
    pub fn freed(&self) -> u64 {
        self.freed_by_worker + self.freed_by_requester + self.freed_stale
    }
}

/// Free-list allocator for compile tasks
///
/// `capacity` bounds the number of live tasks; allocation beyond it
/// fails with `OutOfResources`.
pub struct TaskPool {
    free: Mutex<Vec<Arc<CompileTask>>>,
    capacity: usize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    allocated: AtomicU64,
    recycled: AtomicU64,
    freed_by_worker: AtomicU64,
    freed_by_requester: AtomicU64,
    freed_stale: AtomicU64,
}

impl TaskPool {
    /// Create a pool allowing `capacity` live tasks
    pub fn new(capacity: usize) -> Self {
        TaskPool {
            free: Mutex::new(Vec::with_capacity(FREE_LIST_MAX.min(capacity))),
            capacity,
            live: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            freed_by_worker: AtomicU64::new(0),
            freed_by_requester: AtomicU64::new(0),
            freed_stale: AtomicU64::new(0),
        }
    }

    /// Reserve a task. The slot must be initialized before the task is
    /// visible to anyone else.
    pub(crate) fn allocate(&self) -> Result<TaskSlot<'_>, BrokerError> {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.capacity {
                return Err(BrokerError::OutOfResources(format!(
                    "compile task limit of {} reached",
                    self.capacity
                )));
            }
            match self
                .live
                .compare_exchange_weak(live, live + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => live = actual,
            }
        }
        self.peak_live.fetch_max(live + 1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);

        // Only a task nobody else references can be re-initialized in place
        let mut recycled = None;
        let mut free = self.free.lock();
        while let Some(mut candidate) = free.pop() {
            if Arc::get_mut(&mut candidate).is_some() {
                recycled = Some(candidate);
                break;
            }
        }
        drop(free);
        if recycled.is_some() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
        }

        Ok(TaskSlot {
            pool: self,
            recycled,
            armed: true,
        })
    }

    /// Return a completed, unwaited task to the free-list
    pub(crate) fn free(&self, task: Arc<CompileTask>, by: FreedBy) {
        assert!(
            task.is_complete(),
            "freeing compile task {} before completion",
            task.compile_id()
        );
        debug_assert_eq!(task.completion.lock().waiter_count, 0);
        if task.freed.swap(true, Ordering::AcqRel) {
            panic!("compile task {} freed twice", task.compile_id());
        }

        match by {
            FreedBy::Worker => &self.freed_by_worker,
            FreedBy::Requester => &self.freed_by_requester,
            FreedBy::Stale => &self.freed_stale,
        }
        .fetch_add(1, Ordering::Relaxed);
        self.live.fetch_sub(1, Ordering::AcqRel);

        let mut free = self.free.lock();
        if free.len() < FREE_LIST_MAX {
            free.push(task);
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> TaskPoolStats {
        TaskPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            freed_by_worker: self.freed_by_worker.load(Ordering::Relaxed),
            freed_by_requester: self.freed_by_requester.load(Ordering::Relaxed),
            freed_stale: self.freed_stale.load(Ordering::Relaxed),
            live: self.live.load(Ordering::Relaxed),
            peak_live: self.peak_live.load(Ordering::Relaxed),
        }
    }

    /// Maximum live tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A reserved, not yet initialized task
pub(crate) struct TaskSlot<'a> {
    pool: &'a TaskPool,
    recycled: Option<Arc<CompileTask>>,
    armed: bool,
}

impl TaskSlot<'_> {
    /// Initialize the task exactly once and hand it out
    pub(crate) fn initialize(mut self, params: TaskParams) -> Arc<CompileTask> {
        self.armed = false;
        match self.recycled.take() {
            Some(mut task) => match Arc::get_mut(&mut task) {
                Some(inner) => {
                    inner.reset(params);
                    task
                }
                None => Arc::new(CompileTask::new(params)),
            },
            None => Arc::new(CompileTask::new(params)),
        }
    }
}

impl Drop for TaskSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.live.fetch_sub(1, Ordering::AcqRel);
            if let Some(task) = self.recycled.take() {
                let mut free = self.pool.free.lock();
                if free.len() < FREE_LIST_MAX {
                    free.push(task);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ClassHolder, Method};

    fn params(id: u32, method: &MethodHandle) -> TaskParams {
        TaskParams {
            compile_id: id,
            method: method.clone(),
            entry_bci: INVOCATION_ENTRY_BCI,
            tier: 1,
            hot_count: 0,
            reason: CompileReason::Normal,
            is_blocking: false,
        }
    }

    fn method() -> MethodHandle {
        Method::builder(&ClassHolder::new("Foo"), "bar").build()
    }

    #[test]
    fn test_allocate_initialize_free() {
        let pool = TaskPool::new(4);
        let m = method();
        let task = pool.allocate().unwrap().initialize(params(1, &m));
        assert_eq!(task.compile_id(), 1);
        assert!(!task.is_complete());
        assert_eq!(pool.stats().live, 1);

        task.mark_complete();
        pool.free(task, FreedBy::Worker);
        let stats = pool.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.freed_by_worker, 1);
    }

    #[test]
    fn test_recycled_task_is_reset() {
        let pool = TaskPool::new(4);
        let m = method();
        let task = pool.allocate().unwrap().initialize(params(1, &m));
        task.set_failure_reason("boom");
        task.mark_complete();
        pool.free(task, FreedBy::Worker);

        let task = pool.allocate().unwrap().initialize(params(2, &m));
        assert_eq!(task.compile_id(), 2);
        assert!(!task.is_complete());
        assert!(!task.is_freed());
        assert!(task.result().failure_reason.is_none());
        assert_eq!(pool.stats().recycled, 1);
    }

    #[test]
    fn test_capacity_exhausted() {
        let pool = TaskPool::new(1);
        let m = method();
        let _held = pool.allocate().unwrap().initialize(params(1, &m));
        let err = pool.allocate().map(|_| ()).unwrap_err();
        assert!(matches!(err, BrokerError::OutOfResources(_)));
    }

    #[test]
    fn test_dropped_slot_releases_reservation() {
        let pool = TaskPool::new(1);
        drop(pool.allocate().unwrap());
        assert_eq!(pool.stats().live, 0);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_panics() {
        let pool = TaskPool::new(4);
        let m = method();
        let task = pool.allocate().unwrap().initialize(params(1, &m));
        task.mark_complete();
        pool.free(task.clone(), FreedBy::Worker);
        pool.free(task, FreedBy::Requester);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn test_double_completion_panics() {
        let pool = TaskPool::new(4);
        let m = method();
        let task = pool.allocate().unwrap().initialize(params(1, &m));
        task.mark_complete();
        task.mark_complete();
    }

    #[test]
    fn test_display_marks_osr_and_blocking() {
        let pool = TaskPool::new(4);
        let m = method();
        let mut p = params(7, &m);
        p.entry_bci = 13;
        p.is_blocking = true;
        let task = pool.allocate().unwrap().initialize(p);
        let line = task.to_string();
        assert!(line.contains("%b"));
        assert!(line.contains("Foo::bar @ 13"));
    }
}
