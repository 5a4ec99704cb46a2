//! Stub compiler backend
//!
//! Produces fake code of a configurable size. Used by tests, benches and the
//! `cbroker` driver to exercise the broker without a real code generator.

use super::{BackendError, CompileEnv, CompilerBackend, CompilerKind, CompilerStatistics, FailureScope};
use crate::directives::Directive;
use crate::method::{MethodHandle, MethodId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What every compile of the stub does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBehavior {
    /// Install `code_size` bytes of code
    Succeed {
        /// Size of the fake code
        code_size: usize,
    },
    /// Recoverable failure
    Bailout,
    /// Fails and marks the method not compilable at this tier
    NotAtTier,
    /// Fails and marks the method never compilable
    Never,
}

/// One-shot gate that blocks until opened
#[derive(Debug, Default)]
pub struct Latch {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Latch {
    /// Create a closed latch
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the latch and release all waiters
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    /// Whether the latch is open
    pub fn is_open(&self) -> bool {
        *self.open.lock()
    }

    /// Block until the latch opens
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

/// Record of one stub compile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubCompile {
    /// Compile ID
    pub compile_id: u32,
    /// Method compiled
    pub method: MethodId,
    /// Entry BCI
    pub entry_bci: i32,
    /// Whether installation was requested
    pub install_code: bool,
}

/// Configurable fake compiler
pub struct StubCompiler {
    name: String,
    kind: CompilerKind,
    delay: Duration,
    behavior: Mutex<StubBehavior>,
    init_error: Option<String>,
    init_gate: Option<Arc<Latch>>,
    compile_gate: Option<Arc<Latch>>,
    publishes_progress: bool,
    progress: AtomicU64,
    init_count: AtomicU64,
    compiles: Mutex<Vec<StubCompile>>,
    stats: CompilerStatistics,
}

impl StubCompiler {
    /// Create a stub that instantly installs 256 bytes of code
    pub fn new(name: impl Into<String>) -> Self {
        StubCompiler {
            name: name.into(),
            kind: CompilerKind::C1,
            delay: Duration::ZERO,
            behavior: Mutex::new(StubBehavior::Succeed { code_size: 256 }),
            init_error: None,
            init_gate: None,
            compile_gate: None,
            publishes_progress: true,
            progress: AtomicU64::new(0),
            init_count: AtomicU64::new(0),
            compiles: Mutex::new(Vec::new()),
            stats: CompilerStatistics::new(),
        }
    }

    /// Set the compiler family
    pub fn with_kind(mut self, kind: CompilerKind) -> Self {
        self.kind = kind;
        self
    }

    /// Time each compile takes
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Outcome of every compile
    pub fn with_behavior(self, behavior: StubBehavior) -> Self {
        *self.behavior.lock() = behavior;
        self
    }

    /// Make `initialize` fail
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    /// Hold `initialize` until the latch opens
    pub fn with_init_gate(mut self, gate: Arc<Latch>) -> Self {
        self.init_gate = Some(gate);
        self
    }

    /// Hold every compile until the latch opens
    pub fn with_compile_gate(mut self, gate: Arc<Latch>) -> Self {
        self.compile_gate = Some(gate);
        self
    }

    /// Never advance the progress counter (external kind only)
    pub fn without_progress(mut self) -> Self {
        self.publishes_progress = false;
        self
    }

    /// Change the outcome of later compiles
    pub fn set_behavior(&self, behavior: StubBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Compiles started so far
    pub fn compile_count(&self) -> usize {
        self.compiles.lock().len()
    }

    /// Times `initialize` ran
    pub fn init_count(&self) -> u64 {
        self.init_count.load(Ordering::Relaxed)
    }

    /// Every compile so far, in start order
    pub fn compiles(&self) -> Vec<StubCompile> {
        self.compiles.lock().clone()
    }

    fn tick(&self) {
        if self.publishes_progress {
            self.progress.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl CompilerBackend for StubCompiler {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CompilerKind {
        self.kind
    }

    fn initialize(&self) -> Result<(), BackendError> {
        self.init_count.fetch_add(1, Ordering::Relaxed);
        if let Some(gate) = &self.init_gate {
            gate.wait();
        }
        match &self.init_error {
            Some(message) => Err(BackendError::InitFailed(message.clone())),
            None => Ok(()),
        }
    }

    fn compile_method(
        &self,
        env: &mut CompileEnv<'_>,
        method: &MethodHandle,
        entry_bci: i32,
        install_code: bool,
        _directive: &Directive,
    ) {
        self.compiles.lock().push(StubCompile {
            compile_id: env.compile_id(),
            method: method.id(),
            entry_bci,
            install_code,
        });

        if let Some(gate) = &self.compile_gate {
            gate.wait();
        }

        // Two phases with a pause checkpoint between them
        let half = self.delay / 2;
        if !half.is_zero() {
            std::thread::sleep(half);
        }
        self.tick();
        env.checkpoint();
        env.arena_mut().resize(method.bytecode_size() * 8, 0);
        if !half.is_zero() {
            std::thread::sleep(self.delay - half);
        }
        self.tick();

        let behavior = *self.behavior.lock();
        match behavior {
            StubBehavior::Succeed { code_size } => {
                env.record_inlined_bytecodes(method.bytecode_size() / 4);
                if install_code {
                    // A full code cache is recorded on the environment
                    let _ = env.install_code(code_size, code_size * 3 / 4);
                } else {
                    env.record_code_size(code_size, code_size * 3 / 4);
                }
            }
            StubBehavior::Bailout => env.record_failure("stub bailout", FailureScope::Retry),
            StubBehavior::NotAtTier => {
                env.record_failure("not compilable at this tier", FailureScope::NotAtTier)
            }
            StubBehavior::Never => env.record_failure("never compilable", FailureScope::Never),
        }
    }

    fn progress_ticks(&self) -> Option<u64> {
        match self.kind {
            CompilerKind::External => Some(self.progress.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    fn stats(&self) -> &CompilerStatistics {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_latch_releases_waiters() {
        let latch = Latch::new();
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        assert!(!latch.is_open());
        latch.open();
        waiter.join().unwrap();
        assert!(latch.is_open());
    }

    #[test]
    fn test_init_failure() {
        let stub = StubCompiler::new("broken").failing_init("no code generator");
        assert!(matches!(stub.initialize(), Err(BackendError::InitFailed(_))));
        assert_eq!(stub.init_count(), 1);
    }

    #[test]
    fn test_progress_only_for_external() {
        let c1 = StubCompiler::new("c1");
        assert_eq!(c1.progress_ticks(), None);
        let ext = StubCompiler::new("ext")
            .with_kind(CompilerKind::External)
            .without_progress();
        ext.tick();
        assert_eq!(ext.progress_ticks(), Some(0));
    }
}
