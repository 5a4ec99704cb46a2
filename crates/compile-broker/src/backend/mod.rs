//! Back-end compiler interface
//!
//! A back-end turns one method into generated code. Workers call it with a
//! `CompileEnv` that carries the task, the worker's buffer arena and the
//! code cache; the back-end reports success by installing code through the
//! environment and failure by recording a reason with a `FailureScope`.

pub mod stub;

use crate::code_cache::{CodeBlobKind, CodeCache};
use crate::directives::Directive;
use crate::error::BrokerError;
use crate::method::{InstalledCode, MethodHandle, Tier};
use crate::queue::CompileQueue;
use crate::task::CompileTask;
use crate::thread::{PauseGate, WorkerInfo};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Which family of compiler serves a tier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerKind {
    /// Fast profiling compiler
    C1,
    /// Optimizing compiler
    C2,
    /// Out-of-process or foreign compiler with its own progress counter
    External,
}

impl CompilerKind {
    /// Lowercase name, as used in configs and directive files
    pub fn name(self) -> &'static str {
        match self {
            CompilerKind::C1 => "c1",
            CompilerKind::C2 => "c2",
            CompilerKind::External => "external",
        }
    }
}

/// Back-end lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The compiler runtime could not be set up
    #[error("Compiler initialization failed: {0}")]
    InitFailed(String),
}

/// How far a compile failure reaches
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureScope {
    /// Only this attempt failed; a later request may succeed
    Retry,
    /// The method cannot be compiled at this tier
    NotAtTier,
    /// The method can never be compiled
    Never,
}

/// Compiler back-end
///
/// Implementations are shared between all workers of their tier and must be
/// thread-safe. `compile_method` runs on a worker thread with no broker
/// locks held.
pub trait CompilerBackend: Send + Sync {
    /// Get the compiler name
    fn name(&self) -> &str;

    /// Compiler family
    fn kind(&self) -> CompilerKind;

    /// One-time initialization, run lazily by the first worker of the tier
    fn initialize(&self) -> Result<(), BackendError>;

    /// Compile `method`, entering at `entry_bci`
    ///
    /// Success is reported by installing code through `env` (only when
    /// `install_code` is set); failure by `env.record_failure`.
    fn compile_method(
        &self,
        env: &mut CompileEnv<'_>,
        method: &MethodHandle,
        entry_bci: i32,
        install_code: bool,
        directive: &Directive,
    );

    /// Called by a worker that found its queue empty. No queue lock is held.
    fn on_empty_queue(&self, _queue: &CompileQueue, _worker: &WorkerInfo) {}

    /// Called by a worker that is about to retire
    fn stopping_compiler_thread(&self, _worker: &WorkerInfo) {}

    /// Progress counter polled by blocking requesters. `None` means the
    /// back-end does not publish progress.
    fn progress_ticks(&self) -> Option<u64> {
        None
    }

    /// Per-back-end statistics
    fn stats(&self) -> &CompilerStatistics;
}

// ============================================================================
// Compiler statistics
// ============================================================================

/// Timing and size counters for one kind of compile
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PhaseData {
    /// Accumulated compile time
    pub time: Duration,
    /// Bytecodes compiled
    pub bytes: u64,
    /// Compiles counted
    pub count: u32,
}

impl PhaseData {
    fn update(&mut self, elapsed: Duration, bytes: usize) {
        self.time += elapsed;
        self.bytes += bytes as u64;
        self.count += 1;
    }
}

/// Snapshot of a back-end's statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompilerStatsData {
    /// Method-entry compiles
    pub standard: PhaseData,
    /// On-stack-replacement compiles
    pub osr: PhaseData,
    /// Total installed code size
    pub nmethods_size: u64,
    /// Installed instruction bytes
    pub nmethods_code_size: u64,
}

/// Per-back-end statistics, updated by workers after each successful compile
#[derive(Debug, Default)]
pub struct CompilerStatistics {
    data: Mutex<CompilerStatsData>,
}

impl CompilerStatistics {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(
        &self,
        is_osr: bool,
        elapsed: Duration,
        bytecodes: usize,
        code_size: usize,
        instructions_size: usize,
    ) {
        let mut data = self.data.lock();
        if is_osr {
            data.osr.update(elapsed, bytecodes);
        } else {
            data.standard.update(elapsed, bytecodes);
        }
        data.nmethods_size += code_size as u64;
        data.nmethods_code_size += instructions_size as u64;
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> CompilerStatsData {
        *self.data.lock()
    }
}

// ============================================================================
// Compile environment
// ============================================================================

/// What a compile produced, collected by the worker afterwards
#[derive(Debug, Default)]
pub(crate) struct CompileOutcome {
    pub installed: Option<Arc<InstalledCode>>,
    pub failure: Option<(Cow<'static, str>, FailureScope)>,
    pub retry_message: Option<Cow<'static, str>>,
    pub code_cache_full: Option<CodeBlobKind>,
    pub invalidated: bool,
    pub total_code_size: usize,
    pub instructions_size: usize,
    pub inlined_bytecodes: usize,
}

/// Per-compile environment handed to the back-end
pub struct CompileEnv<'a> {
    task: &'a CompileTask,
    code_cache: &'a CodeCache,
    blob_kind: CodeBlobKind,
    pause: &'a PauseGate,
    arena: &'a mut Vec<u8>,
    outcome: CompileOutcome,
}

impl<'a> CompileEnv<'a> {
    pub(crate) fn new(
        task: &'a CompileTask,
        code_cache: &'a CodeCache,
        blob_kind: CodeBlobKind,
        pause: &'a PauseGate,
        arena: &'a mut Vec<u8>,
    ) -> Self {
        arena.clear();
        CompileEnv {
            task,
            code_cache,
            blob_kind,
            pause,
            arena,
            outcome: CompileOutcome::default(),
        }
    }

    /// Task being compiled
    pub fn task(&self) -> &CompileTask {
        self.task
    }

    /// Compile ID of the task
    pub fn compile_id(&self) -> u32 {
        self.task.compile_id()
    }

    /// Requested tier
    pub fn tier(&self) -> Tier {
        self.task.tier()
    }

    /// Allocate code space and install the result on the method
    ///
    /// On a full code cache the failure is recorded here and the broker is
    /// told once the compile returns.
    pub fn install_code(
        &mut self,
        total_size: usize,
        instructions_size: usize,
    ) -> Result<Arc<InstalledCode>, BrokerError> {
        let region = match self.code_cache.allocate(self.blob_kind, total_size) {
            Ok(region) => region,
            Err(full) => {
                tracing::warn!(
                    compile_id = self.task.compile_id(),
                    requested = full.requested,
                    available = full.available,
                    "{}",
                    full
                );
                self.outcome.code_cache_full = Some(full.kind);
                self.record_failure("code cache is full", FailureScope::Retry);
                return Err(BrokerError::CodeCacheExhausted(full.kind));
            }
        };

        let code = Arc::new(InstalledCode::new(
            self.task.compile_id(),
            self.task.tier(),
            self.task.entry_bci(),
            region,
            instructions_size.min(total_size),
        ));
        self.task.method().install(code.clone());
        self.outcome.total_code_size = total_size;
        self.outcome.instructions_size = code.instructions_size();
        self.outcome.installed = Some(code.clone());
        Ok(code)
    }

    /// Record sizes for a compile that does not install (repeat runs)
    pub fn record_code_size(&mut self, total_size: usize, instructions_size: usize) {
        self.outcome.total_code_size = total_size;
        self.outcome.instructions_size = instructions_size.min(total_size);
    }

    /// Record why the compile failed. Only the first failure is kept.
    pub fn record_failure(&mut self, reason: impl Into<Cow<'static, str>>, scope: FailureScope) {
        if self.outcome.failure.is_none() {
            self.outcome.failure = Some((reason.into(), scope));
        }
    }

    /// Record that dependencies changed while compiling
    pub fn record_invalidation(&mut self) {
        self.outcome.invalidated = true;
        self.record_failure("dependencies invalidated during compilation", FailureScope::Retry);
    }

    /// Ask for a later retry with a message
    pub fn set_retry_message(&mut self, message: impl Into<Cow<'static, str>>) {
        self.outcome.retry_message = Some(message.into());
    }

    /// Count inlined bytecodes
    pub fn record_inlined_bytecodes(&mut self, count: usize) {
        self.outcome.inlined_bytecodes += count;
    }

    /// Whether a failure has been recorded
    pub fn failing(&self) -> bool {
        self.outcome.failure.is_some()
    }

    /// The worker's scratch buffer, cleared before each compile
    pub fn arena_mut(&mut self) -> &mut Vec<u8> {
        self.arena
    }

    /// Honor a pending pause request between compile phases
    pub fn checkpoint(&self) {
        self.pause.poll();
    }

    pub(crate) fn arena_bytes(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn into_outcome(self) -> CompileOutcome {
        self.outcome
    }
}
