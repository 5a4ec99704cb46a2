//! Compilation statistics and completion events

use crate::method::{MethodId, Tier};
use crate::task::{CompileTask, TaskResult};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Budget for the last-method strings, including separator and terminator
pub const LAST_METHOD_BUDGET: usize = 40;

/// Posted once per finished compile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilationEvent {
    /// Compile ID
    pub compile_id: u32,
    /// Tier
    pub tier: Tier,
    /// Method compiled
    pub method_id: MethodId,
    /// Whether code was installed
    pub is_success: bool,
    /// Whether this was an OSR compile
    pub is_osr: bool,
    /// Installed code size
    pub total_code_size: usize,
    /// Bytecodes inlined
    pub inlined_bytecodes: usize,
    /// Scratch memory used
    pub arena_bytes: usize,
}

/// Counters for one tier (or all tiers)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierStats {
    /// Total compile time
    pub total_time: Duration,
    /// Longest single compile
    pub peak_time: Duration,
    /// Compiles that installed code
    pub success_count: u64,
    /// Compiles that failed
    pub bailout_count: u64,
    /// Compiles invalidated while running
    pub invalidated_count: u64,
    /// Successful standard compiles
    pub standard_count: u64,
    /// Successful OSR compiles
    pub osr_count: u64,
    /// Bytecodes compiled by standard compiles
    pub standard_bytes: u64,
    /// Bytecodes compiled by OSR compiles
    pub osr_bytes: u64,
    /// Generated code size
    pub total_code_size: u64,
    /// Generated instruction bytes
    pub instructions_size: u64,
}

impl TierStats {
    fn record(&mut self, task: &CompileTask, result: &TaskResult, elapsed: Duration, invalidated: bool) {
        self.total_time += elapsed;
        self.peak_time = self.peak_time.max(elapsed);
        if result.is_success {
            self.success_count += 1;
            let bytes = task.method().bytecode_size() as u64;
            if task.is_osr() {
                self.osr_count += 1;
                self.osr_bytes += bytes;
            } else {
                self.standard_count += 1;
                self.standard_bytes += bytes;
            }
            self.total_code_size += result.total_code_size as u64;
            self.instructions_size += result.instructions_size as u64;
        } else if invalidated {
            self.invalidated_count += 1;
        } else {
            self.bailout_count += 1;
        }
    }

    /// Total compiles counted
    pub fn compile_count(&self) -> u64 {
        self.success_count + self.bailout_count + self.invalidated_count
    }
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    /// Across all tiers
    pub total: TierStats,
    /// Per tier
    pub tiers: BTreeMap<Tier, TierStats>,
    /// Tasks dropped as stale
    pub stale_count: u64,
    /// Code cache full events
    pub code_cache_full_count: u64,
    /// Times compilation was stopped for a full code cache
    pub stopped_count: u64,
    /// Times compilation restarted after space was freed
    pub restarted_count: u64,
    /// Last method compiled (successfully or not)
    pub last_method: String,
    /// Last method whose compile failed
    pub last_failed_method: String,
    /// Why that compile failed
    pub last_failure_reason: Option<String>,
}

/// Aggregates statistics and fans completion events out to subscribers
#[derive(Default)]
pub struct StatisticsSink {
    inner: Mutex<StatsSnapshot>,
    subscribers: Mutex<Vec<Sender<CompilationEvent>>>,
}

impl StatisticsSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one finished compile and post its event
    pub(crate) fn record_compile(&self, task: &CompileTask, result: &TaskResult, elapsed: Duration, invalidated: bool) {
        let method = task.method();
        let short_name = short_method_name(method.holder().name(), method.name(), LAST_METHOD_BUDGET);
        {
            let mut stats = self.inner.lock();
            stats.total.record(task, result, elapsed, invalidated);
            stats
                .tiers
                .entry(task.tier())
                .or_default()
                .record(task, result, elapsed, invalidated);
            if !result.is_success {
                stats.last_failed_method = short_name.clone();
                stats.last_failure_reason = result.failure_reason.as_ref().map(|r| r.to_string());
            }
            stats.last_method = short_name;
        }

        self.post(CompilationEvent {
            compile_id: task.compile_id(),
            tier: task.tier(),
            method_id: method.id(),
            is_success: result.is_success,
            is_osr: task.is_osr(),
            total_code_size: result.total_code_size,
            inlined_bytecodes: result.inlined_bytecodes,
            arena_bytes: result.arena_bytes,
        });
    }

    pub(crate) fn record_stale(&self) {
        self.inner.lock().stale_count += 1;
    }

    pub(crate) fn record_code_cache_full(&self) {
        self.inner.lock().code_cache_full_count += 1;
    }

    pub(crate) fn record_stopped(&self) {
        self.inner.lock().stopped_count += 1;
    }

    pub(crate) fn record_restarted(&self) {
        self.inner.lock().restarted_count += 1;
    }

    fn post(&self, event: CompilationEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Receive every completion event from now on
    pub fn subscribe(&self) -> Receiver<CompilationEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().clone()
    }
}

/// `class method` cut to fit `max - 1` characters
///
/// Leading characters of the class name go first; if the method name alone
/// does not fit, the class is dropped and the method name loses its tail.
pub fn short_method_name(class: &str, method: &str, max: usize) -> String {
    let class_len = class.chars().count();
    let method_len = method.chars().count();
    if method_len + 2 > max {
        return method.chars().take(max.saturating_sub(1)).collect();
    }
    if class_len + method_len + 2 > max {
        let keep = max - method_len - 2;
        if keep == 0 {
            return method.to_string();
        }
        let class_tail: String = class.chars().skip(class_len - keep).collect();
        return format!("{} {}", class_tail, method);
    }
    format!("{} {}", class, method)
}
