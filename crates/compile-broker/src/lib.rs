//! Compile Broker
//!
//! This crate provides the compilation broker of a tiered JIT runtime:
//! - **Tasks**: one record per compile request, recycled through a free-list (`task` module)
//! - **Queues**: per-tier intrusive queues with a pluggable selection policy (`queue` module)
//! - **Workers**: compiler threads that pull tasks and drive a back-end (`thread` module)
//! - **Broker**: request deduplication, blocking requests, shutdown (`broker` module)
//! - **Dynamic pool**: grows and retires workers under load and memory pressure (`pool` module)
//! - **Directives**: per-method compilation policy (`directives` module)
//! - **Recorder**: captures decompilations around checkpoint/restore and replays them (`recorder` module)
//! - **Statistics**: per-tier timings, counters and completion events (`stats` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use compile_broker::{BrokerConfig, CompileBroker, CompileReason, StubCompiler};
//!
//! let config = BrokerConfig::single_tier(TierConfig::c1(1));
//! let broker = CompileBroker::builder(config)
//!     .backend(1, Arc::new(StubCompiler::new("c1")))
//!     .initialize()?;
//!
//! let code = broker.request_compile(&method, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Collaborator Models
// ============================================================================

/// Method and class metadata consumed by the broker
pub mod method;

/// Segmented generated-code cache
pub mod code_cache;

/// Back-end compiler interface and the stub back-end
pub mod backend;

// ============================================================================
// Core Modules
// ============================================================================

/// Error types
pub mod error;

/// Broker and tier configuration
pub mod config;

/// Compile tasks and the task free-list
pub mod task;

/// Per-tier compile queues
pub mod queue;

/// Compiler worker threads
pub mod thread;

/// Dynamic worker pool sizing
pub mod pool;

/// Per-method compilation directives
pub mod directives;

/// Decompilation recording across checkpoint/restore
pub mod recorder;

/// Compilation statistics and completion events
pub mod stats;

/// The broker facade
pub mod broker;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::stub::{Latch, StubBehavior, StubCompiler};
pub use backend::{BackendError, CompileEnv, CompilerBackend, CompilerKind, CompilerStatistics, FailureScope};
pub use broker::{ClassInitializerScope, CompileBroker, CompileBrokerBuilder, CompileRequest, RequestOutcome};
pub use code_cache::{CodeBlobKind, CodeCache, CodeCacheFull, CodeRegion};
pub use config::{BrokerConfig, CompileIdRange, ConfigError, TierConfig};
pub use directives::{Directive, DirectiveError, DirectiveSet, DirectivesStack, MethodPattern};
pub use error::BrokerError;
pub use method::{ClassHolder, InstalledCode, Method, MethodHandle, MethodId, Tier, INVOCATION_ENTRY_BCI, TIER_LIMIT};
pub use pool::{FixedMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use queue::{CompileQueue, FifoSelector, HotnessSelector, QueueStats, TaskSelector};
pub use recorder::{RecompilationRecorder, RecorderError, ReplaySummary};
pub use stats::{CompilationEvent, StatisticsSink, StatsSnapshot, TierStats};
pub use task::{CompileIdKind, CompileReason, CompileTask, TaskPool, TaskPoolStats, TaskResult};
pub use thread::{LogEntry, LogEvent, PauseGate, PauseGuard, WorkerInfo, WorkerState};
