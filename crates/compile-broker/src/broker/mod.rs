//! The broker facade
//!
//! `CompileBroker` accepts compile requests, deduplicates them per method,
//! hands them to the tier's queue and optionally blocks the requester until
//! a worker finishes. It also owns the broker-wide state machine:
//!
//! ```text
//! Run ──code cache full (eviction)──▶ StoppedForCodeCache ──space freed──▶ Run
//!  │                                        │
//!  └──────── disable / init failure / code cache full (no eviction) ──▶ disabled (one-way)
//! ```
//!
//! Lock order, outermost first: directives stack, queue, task completion,
//! pool mutation, statistics, recorder. Worker handles are collected under
//! the pool lock and the lock is released before any task lock is taken.

mod registry;
pub(crate) mod waiter;

pub(crate) use registry::TierRuntime;

use crate::backend::{CompilerBackend, CompilerKind, CompilerStatsData};
use crate::code_cache::{CodeBlobKind, CodeCache};
use crate::config::BrokerConfig;
use crate::directives::{Directive, DirectivesStack};
use crate::error::BrokerError;
use crate::method::{InstalledCode, MethodHandle, Tier, INVOCATION_ENTRY_BCI};
use crate::pool::{DynamicPoolController, MemoryProbe, SystemMemoryProbe};
use crate::queue::{CompileQueue, HotnessSelector, QueueStats, TaskSelector};
use crate::recorder::RecompilationRecorder;
use crate::stats::{CompilationEvent, StatisticsSink, StatsSnapshot};
use crate::task::{CompileIdKind, CompileReason, CompileTask, TaskParams, TaskPool, TaskPoolStats};
use crate::thread::{is_compiler_thread, LogEntry, PauseGate, PauseGuard, WorkerInfo, WorkerState};
use crossbeam::channel::Receiver;
use once_cell::sync::OnceCell;
use registry::CompilerRegistry;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::fmt::Write as _;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use waiter::WaitOutcome;

// ============================================================================
// Shared State
// ============================================================================

const JOBS_RUN: u8 = 0;
const JOBS_STOPPED: u8 = 1;
const JOBS_STOPPED_FOR_CODE_CACHE: u8 = 2;
const JOBS_SHUTDOWN: u8 = 3;

const DEFAULT_CODE_SEGMENT: usize = 64 * 1024 * 1024;

static GLOBAL_BROKER: OnceCell<CompileBroker> = OnceCell::new();

/// State shared by the facade and every worker
pub(crate) struct BrokerShared {
    pub(crate) config: BrokerConfig,
    pub(crate) registry: CompilerRegistry,
    pub(crate) code_cache: Arc<CodeCache>,
    pub(crate) directives: Arc<DirectivesStack>,
    pub(crate) stats: StatisticsSink,
    pub(crate) tasks: TaskPool,
    pub(crate) pool: DynamicPoolController,
    pub(crate) pause: Arc<PauseGate>,
    pub(crate) recorder: Option<Arc<RecompilationRecorder>>,
    compile_ids: [AtomicU32; 3],
    initialized: AtomicBool,
    disabled: AtomicBool,
    jobs: AtomicU8,
}

impl BrokerShared {
    /// Whether compilation was disabled for good
    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Whether workers should start new compiles
    pub(crate) fn should_compile_new_jobs(&self) -> bool {
        self.jobs.load(Ordering::Acquire) == JOBS_RUN && !self.is_disabled()
    }

    /// Whether workers should leave their loops
    pub(crate) fn workers_should_exit(&self) -> bool {
        self.is_disabled() || self.jobs.load(Ordering::Acquire) == JOBS_SHUTDOWN
    }

    pub(crate) fn compile_id_assign(&self, kind: CompileIdKind) -> u32 {
        let counter = match kind {
            CompileIdKind::Standard => &self.compile_ids[0],
            CompileIdKind::Osr => &self.compile_ids[1],
            CompileIdKind::Native => &self.compile_ids[2],
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Initialize the tier's back-end once. A failure disables compilation.
    pub(crate) fn init_backend(&self, tier: &TierRuntime) -> bool {
        let result = tier.init.get_or_init(|| {
            let result = tier.backend.initialize();
            match &result {
                Ok(()) => tracing::info!(compiler = tier.backend.name(), tier = tier.level(), "compiler initialized"),
                Err(err) => tracing::warn!(
                    compiler = tier.backend.name(),
                    tier = tier.level(),
                    error = %err,
                    "compiler initialization failed"
                ),
            }
            result
        });
        if result.is_err() {
            self.disable_compilation_permanently();
            return false;
        }
        true
    }

    /// React to a code cache allocation failure
    pub(crate) fn handle_code_cache_full(&self, kind: CodeBlobKind) {
        self.stats.record_code_cache_full();
        if self.config.code_cache_eviction {
            if self
                .jobs
                .compare_exchange(JOBS_RUN, JOBS_STOPPED_FOR_CODE_CACHE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.stats.record_stopped();
                tracing::warn!(?kind, "code cache is full, compilation stopped until space is freed");
            }
        } else {
            tracing::warn!(?kind, "code cache is full, compilation disabled");
            self.disable_compilation_permanently();
        }
    }

    /// Resume accepting jobs if the tier's segment has room again
    pub(crate) fn try_restart(&self, tier: &TierRuntime) -> bool {
        if self.jobs.load(Ordering::Acquire) != JOBS_STOPPED_FOR_CODE_CACHE {
            return false;
        }
        let free = self.code_cache.unallocated_capacity(tier.config.blob_kind);
        if free < self.config.code_cache_restart_headroom {
            return false;
        }
        let restarted = self
            .jobs
            .compare_exchange(JOBS_STOPPED_FOR_CODE_CACHE, JOBS_RUN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if restarted {
            self.stats.record_restarted();
            tracing::info!(tier = tier.level(), free, "code cache has room again, compilation restarted");
        }
        restarted
    }

    /// One-way switch: drain every queue and wake every waiter
    pub(crate) fn disable_compilation_permanently(&self) {
        if self.disabled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::warn!("compilation disabled permanently");

        for tier in self.registry.iter() {
            for task in tier.queue.drain() {
                waiter::finalize_stale(self, task);
            }
            tier.queue.wake_all();
        }

        // Requesters blocked on tasks that are being compiled right now
        for worker in self.pool.all_workers() {
            if let Some(task) = worker.current_task() {
                waiter::wake_waiter(&task);
            }
        }
    }

    fn shut_down(&self) {
        if self.jobs.swap(JOBS_SHUTDOWN, Ordering::AcqRel) == JOBS_SHUTDOWN {
            return;
        }
        self.disable_compilation_permanently();
        for tier in self.registry.iter() {
            tier.queue.wake_all();
        }
        if !is_compiler_thread() {
            self.pool.join_all();
        }
        tracing::info!("compile broker shut down");
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A compile request
#[derive(Debug, Clone)]
pub struct CompileRequest {
    method: MethodHandle,
    osr_bci: i32,
    tier: Tier,
    hot_count: u32,
    reason: CompileReason,
    blocking: bool,
}

impl CompileRequest {
    /// Non-blocking standard compile of `method` at `tier`
    pub fn new(method: MethodHandle, tier: Tier) -> Self {
        CompileRequest {
            method,
            osr_bci: INVOCATION_ENTRY_BCI,
            tier,
            hot_count: 0,
            reason: CompileReason::Normal,
            blocking: false,
        }
    }

    /// OSR entry bytecode index (`INVOCATION_ENTRY_BCI` for a standard compile)
    pub fn osr(mut self, bci: i32) -> Self {
        self.osr_bci = bci;
        self
    }

    /// Profile counter that triggered the request
    pub fn hot_count(mut self, count: u32) -> Self {
        self.hot_count = count;
        self
    }

    /// Why the compile was requested
    pub fn reason(mut self, reason: CompileReason) -> Self {
        self.reason = reason;
        self
    }

    /// Wait for the compile to finish
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }
}

/// What became of a compile request
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    /// Code is installed, either already or by this (blocking) request
    Installed(Arc<InstalledCode>),
    /// A task was queued; the request did not wait
    Queued {
        /// ID of the queued task
        compile_id: u32,
    },
    /// The blocking compile ran and failed
    Failed {
        /// ID of the task
        compile_id: u32,
        /// Failure reason published on the task
        reason: String,
    },
    /// The requester stopped waiting; the task is still owned by the worker
    Abandoned {
        /// ID of the task
        compile_id: u32,
    },
    /// Nothing was queued
    Rejected(BrokerError),
}

impl RequestOutcome {
    /// The installed code, if any
    pub fn into_code(self) -> Option<Arc<InstalledCode>> {
        match self {
            RequestOutcome::Installed(code) => Some(code),
            _ => None,
        }
    }
}

enum Submitted {
    Existing(Arc<InstalledCode>),
    Queued {
        tier: Arc<TierRuntime>,
        task: Arc<CompileTask>,
        compile_id: u32,
    },
}

thread_local! {
    static CLASS_INIT_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Marks the current thread as running a class initializer
///
/// Requests made while a scope is alive never block, so a compile that
/// needs the class being initialized cannot deadlock its requester.
pub struct ClassInitializerScope {
    _not_send: PhantomData<*const ()>,
}

impl ClassInitializerScope {
    /// Enter a class initializer on this thread
    pub fn enter() -> Self {
        CLASS_INIT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ClassInitializerScope { _not_send: PhantomData }
    }

    /// Whether this thread is inside a class initializer
    pub fn is_active() -> bool {
        CLASS_INIT_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for ClassInitializerScope {
    fn drop(&mut self) {
        CLASS_INIT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Installed code that makes `(method, osr_bci, tier)` complete
fn compiled_code(method: &MethodHandle, osr_bci: i32, tier: Tier) -> Option<Arc<InstalledCode>> {
    if osr_bci == INVOCATION_ENTRY_BCI {
        method.code().filter(|code| code.tier() == tier && code.is_entrant())
    } else {
        method.osr_code(osr_bci, tier, false)
    }
}

fn check_prohibited(method: &MethodHandle, osr_bci: i32, tier: Tier, directive: &Directive) -> Result<(), BrokerError> {
    let is_osr = osr_bci != INVOCATION_ENTRY_BCI;
    if directive.exclude {
        if is_osr {
            method.set_not_osr_compilable(tier, "excluded by directive", true);
        } else {
            method.set_not_compilable(tier, "excluded by directive", true);
        }
        return Err(BrokerError::Prohibited("excluded by directive".into()));
    }
    if !directive.enable {
        return Err(BrokerError::Prohibited("disabled by directive".into()));
    }
    if is_osr && method.is_not_osr_compilable(tier) {
        return Err(BrokerError::Prohibited(format!("not OSR compilable at tier {tier}")));
    }
    if !is_osr && method.is_not_compilable(tier) {
        return Err(BrokerError::Prohibited(format!("not compilable at tier {tier}")));
    }
    Ok(())
}

fn id_kind(method: &MethodHandle, osr_bci: i32) -> CompileIdKind {
    if method.is_native() {
        CompileIdKind::Native
    } else if osr_bci != INVOCATION_ENTRY_BCI {
        CompileIdKind::Osr
    } else {
        CompileIdKind::Standard
    }
}

// ============================================================================
// Broker
// ============================================================================

/// The compilation broker
///
/// Dropping the broker shuts it down. `shutdown` joins every worker, so it
/// must not run while a `PauseGuard` from this broker is alive.
pub struct CompileBroker {
    shared: Arc<BrokerShared>,
}

impl CompileBroker {
    /// Start configuring a broker
    pub fn builder(config: BrokerConfig) -> CompileBrokerBuilder {
        CompileBrokerBuilder {
            config,
            backends: FxHashMap::default(),
            code_cache: None,
            memory: None,
            directives: None,
            recorder: None,
            selector: || Box::new(HotnessSelector),
        }
    }

    /// Install `broker` as the process-wide instance
    ///
    /// Fails, handing the broker back, if one is already installed.
    pub fn install_global(broker: CompileBroker) -> Result<&'static CompileBroker, CompileBroker> {
        GLOBAL_BROKER.try_insert(broker).map_err(|(_, rejected)| rejected)
    }

    /// The process-wide instance, if installed
    pub fn global() -> Option<&'static CompileBroker> {
        GLOBAL_BROKER.get()
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Request a compile of `method`
    ///
    /// Returns the installed code when it already exists or when a blocking
    /// request finished successfully; `None` in every other case.
    pub fn request_compile(
        &self,
        method: &MethodHandle,
        osr_bci: i32,
        tier: Tier,
        hot_count: u32,
        reason: CompileReason,
        blocking: bool,
    ) -> Option<Arc<InstalledCode>> {
        let request = CompileRequest::new(method.clone(), tier)
            .osr(osr_bci)
            .hot_count(hot_count)
            .reason(reason)
            .blocking(blocking);
        self.try_request_compile(request).into_code()
    }

    /// Request a compile and report why it did or did not produce code
    pub fn try_request_compile(&self, request: CompileRequest) -> RequestOutcome {
        let submitted = match self.submit(&request) {
            Ok(submitted) => submitted,
            Err(err) => {
                if err.is_silent() {
                    tracing::trace!(method = %request.method.full_name(), tier = request.tier, reason = %err, "request dropped");
                } else {
                    tracing::debug!(method = %request.method.full_name(), tier = request.tier, reason = %err, "request rejected");
                }
                return RequestOutcome::Rejected(err);
            }
        };

        match submitted {
            Submitted::Existing(code) => {
                tracing::trace!(
                    method = %request.method.full_name(),
                    tier = request.tier,
                    reason = %BrokerError::AlreadyComplete,
                    "request answered with installed code"
                );
                RequestOutcome::Installed(code)
            }
            Submitted::Queued { tier, task, compile_id } => {
                if !task.is_blocking() {
                    return RequestOutcome::Queued { compile_id };
                }
                match waiter::wait_for_completion(&self.shared, &tier, task) {
                    WaitOutcome::Completed(result) if result.is_success => {
                        match compiled_code(&request.method, request.osr_bci, request.tier) {
                            Some(code) => RequestOutcome::Installed(code),
                            None => RequestOutcome::Failed {
                                compile_id,
                                reason: "installed code was invalidated".into(),
                            },
                        }
                    }
                    WaitOutcome::Completed(result) => RequestOutcome::Failed {
                        compile_id,
                        reason: result
                            .failure_reason
                            .map(|r| r.into_owned())
                            .unwrap_or_else(|| "compile failed".into()),
                    },
                    WaitOutcome::Abandoned => RequestOutcome::Abandoned { compile_id },
                    WaitOutcome::Disabled => RequestOutcome::Rejected(BrokerError::Unavailable(
                        "compilation was disabled while waiting".into(),
                    )),
                }
            }
        }
    }

    fn submit(&self, request: &CompileRequest) -> Result<Submitted, BrokerError> {
        let shared = &*self.shared;
        let method = &request.method;
        let (osr_bci, level) = (request.osr_bci, request.tier);

        if !shared.initialized.load(Ordering::Acquire) {
            return Err(BrokerError::Unavailable("broker is not initialized".into()));
        }
        let tier = shared
            .registry
            .get(level)
            .ok_or_else(|| BrokerError::Unavailable(format!("tier {level} is not enabled")))?;
        if let Some(err) = tier.init_failure() {
            return Err(BrokerError::BackendInitFailure(err.to_string()));
        }
        if shared.is_disabled() {
            return Err(BrokerError::Unavailable("compilation is disabled".into()));
        }
        shared.try_restart(tier);
        if !shared.should_compile_new_jobs() {
            return Err(BrokerError::Unavailable("compilation is stopped".into()));
        }

        if method.is_abstract() {
            return Err(BrokerError::Prohibited("abstract method".into()));
        }
        if method.is_method_handle_intrinsic() {
            return Err(BrokerError::Prohibited("method handle intrinsic".into()));
        }
        if !method.holder().is_initialized() {
            return Err(BrokerError::Unavailable(format!(
                "class {} is not initialized",
                method.holder().name()
            )));
        }

        if let Some(code) = compiled_code(method, osr_bci, level) {
            return Ok(Submitted::Existing(code));
        }

        let directive = shared.directives.lookup(method, tier.backend.kind());
        check_prohibited(method, osr_bci, level, &directive)?;

        // Native lookup may load classes, so it runs on the requester
        if method.is_native() && !method.is_native_linked() {
            if is_compiler_thread() {
                return Err(BrokerError::Unavailable("native lookup on a compiler thread".into()));
            }
            if !method.link_native() {
                method.set_not_compilable(level, "native lookup failed", false);
                return Err(BrokerError::Prohibited("native lookup failed".into()));
            }
        }

        let blocking = self.decide_blocking(tier, &directive, request.blocking);

        let (task, compile_id) = {
            let mut state = tier.queue.lock();
            if shared.is_disabled() {
                return Err(BrokerError::Unavailable("compilation is disabled".into()));
            }
            if let Some(code) = compiled_code(method, osr_bci, level) {
                return Ok(Submitted::Existing(code));
            }
            check_prohibited(method, osr_bci, level, &directive)?;
            // Per-method bit shared by every tier queue
            if !method.try_claim_queued_for_compilation() {
                return Err(BrokerError::AlreadyInProgress(method.full_name()));
            }

            let compile_id = shared.compile_id_assign(id_kind(method, osr_bci));
            if let Some(range) = &shared.config.compile_id_range {
                if !range.contains(compile_id) {
                    if osr_bci == INVOCATION_ENTRY_BCI {
                        method.set_not_compilable(level, "compile id outside the debug range", true);
                    } else {
                        method.set_not_osr_compilable(level, "compile id outside the debug range", true);
                    }
                    method.clear_queued_for_compilation();
                    return Err(BrokerError::Prohibited(format!("compile id {compile_id} outside the debug range")));
                }
            }

            let slot = match shared.tasks.allocate() {
                Ok(slot) => slot,
                Err(err) => {
                    method.clear_queued_for_compilation();
                    return Err(err);
                }
            };
            let task = slot.initialize(TaskParams {
                compile_id,
                method: method.clone(),
                entry_bci: osr_bci,
                tier: level,
                hot_count: request.hot_count,
                reason: request.reason,
                is_blocking: blocking,
            });
            tier.queue.enqueue(&mut state, task.clone(), shared.config.record_training_data);
            (task, compile_id)
        };
        tracing::debug!(task = %task, reason = %request.reason, "compile queued");

        Ok(Submitted::Queued {
            tier: tier.clone(),
            task,
            compile_id,
        })
    }

    fn decide_blocking(&self, tier: &TierRuntime, directive: &Directive, requested: bool) -> bool {
        let background = directive
            .background_compilation
            .unwrap_or(self.shared.config.background_compilation_default);
        let blocking = requested || !background;
        if !blocking {
            return false;
        }
        if is_compiler_thread() || ClassInitializerScope::is_active() {
            return false;
        }
        if tier.backend.kind() == CompilerKind::External && !tier.is_backend_ready() {
            return false;
        }
        true
    }

    // ------------------------------------------------------------------------
    // Broker-wide state
    // ------------------------------------------------------------------------

    /// Next compile ID of `kind`. IDs are never reused.
    pub fn compile_id_assign(&self, kind: CompileIdKind) -> u32 {
        self.shared.compile_id_assign(kind)
    }

    /// Stop compiling for good, failing every queued task as stale
    pub fn disable_compilation_permanently(&self) {
        self.shared.disable_compilation_permanently();
    }

    /// Report a code cache allocation failure in the `kind` segment
    pub fn handle_code_cache_full(&self, kind: CodeBlobKind) {
        self.shared.handle_code_cache_full(kind);
    }

    /// Stop or resume taking new jobs. Has no effect once disabled.
    pub fn set_accept_new_jobs(&self, accept: bool) {
        let (from, to) = if accept {
            (JOBS_STOPPED, JOBS_RUN)
        } else {
            (JOBS_RUN, JOBS_STOPPED)
        };
        if self
            .shared
            .jobs
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::info!(accept, "compile broker job acceptance changed");
        }
    }

    /// Whether compilation was disabled for good
    pub fn is_compilation_disabled(&self) -> bool {
        self.shared.is_disabled()
    }

    /// Whether new compile requests are accepted
    pub fn is_accepting_jobs(&self) -> bool {
        self.shared.should_compile_new_jobs()
    }

    /// Whether `initialize` completed
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// Report every queued method. Call only at a quiescent point.
    pub fn mark_all_queued_methods_on_stack(&self, visitor: &mut dyn FnMut(&MethodHandle)) {
        for tier in self.shared.registry.iter() {
            tier.queue.mark_methods_on_stack(visitor);
        }
    }

    /// Decompile `method`'s code for `(entry_bci, tier)`
    ///
    /// The code is made not entrant, detached and its space released. The
    /// event goes to the recorder, if one is attached.
    pub fn decompile(&self, method: &MethodHandle, entry_bci: i32, tier: Tier) -> bool {
        let Some(code) = method.detach_code(entry_bci, tier) else {
            return false;
        };
        self.shared.code_cache.release(code.region());
        tracing::debug!(
            method = %method.full_name(),
            compile_id = code.compile_id(),
            entry_bci,
            tier,
            "decompiled"
        );
        if let Some(recorder) = &self.shared.recorder {
            recorder.record(method, entry_bci, tier);
        }
        if let Some(runtime) = self.shared.registry.get(tier) {
            self.shared.try_restart(runtime);
        }
        true
    }

    /// Park every worker at its next safe point until the guard drops
    pub fn pause_compiler_threads(&self) -> PauseGuard {
        self.shared.pause.pause()
    }

    /// Disable compilation and join every worker
    pub fn shutdown(&self) {
        self.shared.shut_down();
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Broker configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// The code cache
    pub fn code_cache(&self) -> &Arc<CodeCache> {
        &self.shared.code_cache
    }

    /// The directives stack
    pub fn directives(&self) -> &Arc<DirectivesStack> {
        &self.shared.directives
    }

    /// The pause gate workers poll
    pub fn pause_gate(&self) -> &Arc<PauseGate> {
        &self.shared.pause
    }

    /// Enabled tiers, ascending
    pub fn tiers(&self) -> Vec<Tier> {
        self.shared.registry.levels()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Receive every completion event from now on
    pub fn subscribe(&self) -> Receiver<CompilationEvent> {
        self.shared.stats.subscribe()
    }

    /// Queue counters for `tier`
    pub fn queue_stats(&self, tier: Tier) -> Option<QueueStats> {
        self.shared.registry.get(tier).map(|t| t.queue.stats())
    }

    /// Task pool counters
    pub fn task_pool_stats(&self) -> TaskPoolStats {
        self.shared.tasks.stats()
    }

    /// Back-end counters for `tier`
    pub fn backend_stats(&self, tier: Tier) -> Option<CompilerStatsData> {
        self.shared.registry.get(tier).map(|t| t.backend.stats().snapshot())
    }

    /// Live workers of `tier`
    pub fn worker_count(&self, tier: Tier) -> usize {
        self.shared.pool.worker_count(tier)
    }

    /// Most workers `tier` ever had at once
    pub fn peak_worker_count(&self, tier: Tier) -> usize {
        self.shared.pool.peak_worker_count(tier)
    }

    /// Identity and state of each live worker of `tier`
    pub fn workers(&self, tier: Tier) -> Vec<(WorkerInfo, WorkerState)> {
        self.shared
            .pool
            .workers(tier)
            .iter()
            .map(|w| (w.info().clone(), w.state()))
            .collect()
    }

    /// Compile log of worker `index` of `tier`
    pub fn thread_log(&self, tier: Tier, index: usize) -> Option<Vec<LogEntry>> {
        self.shared
            .pool
            .workers(tier)
            .iter()
            .find(|w| w.info().index == index)
            .map(|w| w.log_entries())
    }

    /// Render every queue and every in-flight compile
    pub fn print_compile_queues(&self) -> String {
        let mut out = String::new();
        for tier in self.shared.registry.iter() {
            let _ = tier.queue.print(&mut out);
        }
        let _ = writeln!(out, "Current compiles:");
        for worker in self.shared.pool.all_workers() {
            if let Some(task) = worker.current_task() {
                let _ = writeln!(out, "  {}: {}", worker.info().name, task);
            }
        }
        out
    }
}

impl Drop for CompileBroker {
    fn drop(&mut self) {
        self.shared.shut_down();
    }
}

impl std::fmt::Debug for CompileBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileBroker")
            .field("tiers", &self.shared.registry.levels())
            .field("disabled", &self.shared.is_disabled())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Configures and starts a `CompileBroker`
pub struct CompileBrokerBuilder {
    config: BrokerConfig,
    backends: FxHashMap<Tier, Arc<dyn CompilerBackend>>,
    code_cache: Option<Arc<CodeCache>>,
    memory: Option<Box<dyn MemoryProbe>>,
    directives: Option<Arc<DirectivesStack>>,
    recorder: Option<Arc<RecompilationRecorder>>,
    selector: fn() -> Box<dyn TaskSelector>,
}

impl CompileBrokerBuilder {
    /// Back-end compiler for `tier`
    pub fn backend(mut self, tier: Tier, backend: Arc<dyn CompilerBackend>) -> Self {
        self.backends.insert(tier, backend);
        self
    }

    /// Code cache shared with the back-ends
    pub fn code_cache(mut self, code_cache: Arc<CodeCache>) -> Self {
        self.code_cache = Some(code_cache);
        self
    }

    /// Free-memory source for the dynamic pool
    pub fn memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.memory = Some(probe);
        self
    }

    /// Directives stack consulted for every request and compile
    pub fn directives(mut self, directives: Arc<DirectivesStack>) -> Self {
        self.directives = Some(directives);
        self
    }

    /// Recorder notified of every decompilation
    pub fn recorder(mut self, recorder: Arc<RecompilationRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Selection policy, one instance per queue
    pub fn selector(mut self, selector: fn() -> Box<dyn TaskSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Validate the configuration, create the queues and start the workers
    pub fn initialize(self) -> Result<CompileBroker, BrokerError> {
        self.config
            .validate()
            .map_err(|err| BrokerError::Unavailable(format!("invalid configuration: {err}")))?;

        let mut registry = CompilerRegistry::default();
        for tier in self.config.tiers.iter().filter(|t| t.enabled) {
            let backend = self.backends.get(&tier.level).cloned().ok_or_else(|| {
                BrokerError::BackendInitFailure(format!("no compiler registered for tier {}", tier.level))
            })?;
            if backend.kind() != tier.compiler {
                tracing::warn!(
                    tier = tier.level,
                    configured = tier.compiler.name(),
                    actual = backend.kind().name(),
                    "compiler kind does not match the tier configuration"
                );
            }
            let queue = CompileQueue::new(
                format!("{} compile queue", tier.compiler.name().to_uppercase()),
                tier.level,
                (self.selector)(),
            );
            registry.insert(TierRuntime::new(tier.clone(), queue, backend));
        }

        let levels = registry.levels();
        let jobs = if self.config.accept_new_jobs_default {
            JOBS_RUN
        } else {
            JOBS_STOPPED
        };
        let shared = Arc::new(BrokerShared {
            tasks: TaskPool::new(self.config.max_live_tasks),
            pool: DynamicPoolController::new(
                levels.iter().copied(),
                self.memory.unwrap_or_else(|| Box::new(SystemMemoryProbe)),
            ),
            code_cache: self.code_cache.unwrap_or_else(|| {
                Arc::new(CodeCache::with_segments(
                    DEFAULT_CODE_SEGMENT / 8,
                    DEFAULT_CODE_SEGMENT,
                    DEFAULT_CODE_SEGMENT,
                ))
            }),
            directives: self.directives.unwrap_or_default(),
            stats: StatisticsSink::new(),
            pause: Arc::new(PauseGate::new()),
            recorder: self.recorder,
            compile_ids: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
            initialized: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            jobs: AtomicU8::new(jobs),
            registry,
            config: self.config,
        });

        for tier in shared.registry.iter() {
            let count = if shared.config.dynamic_pool_enabled {
                1
            } else {
                tier.config.max_workers
            };
            if let Err(err) = shared.pool.start(&shared, tier, count) {
                shared.shut_down();
                return Err(BrokerError::OutOfResources(format!(
                    "failed to start compiler threads for tier {}: {err}",
                    tier.level()
                )));
            }
        }

        shared.initialized.store(true, Ordering::Release);
        tracing::info!(
            tiers = ?levels,
            dynamic_pool = shared.config.dynamic_pool_enabled,
            "compile broker initialized"
        );
        Ok(CompileBroker { shared })
    }
}
