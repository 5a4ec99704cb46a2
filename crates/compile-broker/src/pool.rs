//! Dynamic worker pool sizing
//!
//! Workers grow with queue depth, bounded by free memory and code cache
//! headroom, and retire last-in-first-out after idling. Growth is
//! advisory: a failed thread spawn just leaves the pool smaller.

use crate::broker::{BrokerShared, TierRuntime};
use crate::method::Tier;
use crate::thread::{compiler_thread_loop, WorkerHandle, WorkerInfo};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Source of the free-memory figure used when growing the pool
pub trait MemoryProbe: Send + Sync {
    /// Bytes of memory available for new compiler threads
    fn available_bytes(&self) -> u64;
}

/// Reads `MemAvailable` from `/proc/meminfo`; unbounded elsewhere
#[derive(Debug, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_mem_available(&text))
            .unwrap_or(u64::MAX)
    }
}

fn parse_mem_available(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Constant free-memory figure
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct TierCounts {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Default)]
struct PoolState {
    /// Live workers per tier, in creation order
    workers: FxHashMap<Tier, Vec<Arc<WorkerHandle>>>,
    /// Workers that left their loop and still need joining
    retired: Vec<Arc<WorkerHandle>>,
}

/// Owns every worker and decides when to add or retire them
pub(crate) struct DynamicPoolController {
    mutation: Mutex<PoolState>,
    counts: FxHashMap<Tier, TierCounts>,
    memory: Box<dyn MemoryProbe>,
}

impl DynamicPoolController {
    pub(crate) fn new(tiers: impl IntoIterator<Item = Tier>, memory: Box<dyn MemoryProbe>) -> Self {
        DynamicPoolController {
            mutation: Mutex::new(PoolState::default()),
            counts: tiers.into_iter().map(|t| (t, TierCounts::default())).collect(),
            memory,
        }
    }

    /// Spawn the initial workers of a tier
    pub(crate) fn start(&self, shared: &Arc<BrokerShared>, tier: &Arc<TierRuntime>, count: usize) -> io::Result<()> {
        let mut state = self.mutation.lock();
        let workers = state.workers.entry(tier.config.level).or_default();
        for _ in 0..count {
            let handle = spawn_worker(shared, tier, workers.len())?;
            workers.push(handle);
            self.publish_count(tier.config.level, workers.len());
        }
        Ok(())
    }

    /// Add workers if the queue is deep and resources allow
    pub(crate) fn maybe_grow(&self, shared: &Arc<BrokerShared>, tier: &Arc<TierRuntime>) {
        let config = &tier.config;
        let current = self.worker_count(config.level);
        if current >= config.max_workers {
            return;
        }

        let queue_depth = tier.queue.len();
        let free_memory = self.memory.available_bytes();
        let headroom = shared.code_cache.unallocated_capacity(config.blob_kind) as u64;
        let desired = config
            .max_workers
            .min(queue_depth / config.tasks_per_thread)
            .min(clamp_usize(free_memory / config.per_worker_memory_budget))
            .min(clamp_usize(headroom / config.per_worker_code_budget));
        if desired <= current {
            return;
        }

        // Someone else is already growing the pool
        let Some(mut state) = self.mutation.try_lock() else {
            return;
        };
        reap_retired(&mut state);
        let workers = state.workers.entry(config.level).or_default();
        while workers.len() < desired {
            if shared.workers_should_exit() {
                break;
            }
            match spawn_worker(shared, tier, workers.len()) {
                Ok(handle) => {
                    tracing::info!(
                        worker = %handle.info().name,
                        queue_depth,
                        free_memory,
                        code_cache_headroom = headroom,
                        "added compiler thread"
                    );
                    workers.push(handle);
                    self.publish_count(config.level, workers.len());
                }
                Err(err) => {
                    tracing::warn!(tier = config.level, error = %err, "failed to start compiler thread");
                    break;
                }
            }
        }
    }

    /// Whether `handle` may leave its loop now
    pub(crate) fn maybe_retire(&self, shared: &BrokerShared, tier: &TierRuntime, handle: &Arc<WorkerHandle>) -> bool {
        let config = &tier.config;
        if !shared.config.dynamic_pool_enabled || !shared.config.reduce_workers_on_idle {
            return false;
        }
        if (handle.idle_time().as_millis() as u64) < config.retire_idle_ms {
            return false;
        }

        let mut state = self.mutation.lock();
        reap_retired(&mut state);
        let Some(workers) = state.workers.get_mut(&config.level) else {
            return false;
        };
        if workers.len() <= config.min_workers.max(1) {
            return false;
        }
        // Only the most recently created worker may retire
        match workers.last() {
            Some(last) if Arc::ptr_eq(last, handle) => {}
            _ => return false,
        }
        let retired = workers.pop();
        let remaining = workers.len();
        self.publish_count(config.level, remaining);
        if let Some(retired) = retired {
            state.retired.push(retired);
        }
        tracing::info!(worker = %handle.info().name, remaining, "retiring compiler thread");
        true
    }

    fn publish_count(&self, tier: Tier, count: usize) {
        if let Some(counts) = self.counts.get(&tier) {
            counts.current.store(count, Ordering::Release);
            counts.peak.fetch_max(count, Ordering::Relaxed);
        }
    }

    /// Live workers of `tier`
    pub(crate) fn worker_count(&self, tier: Tier) -> usize {
        self.counts
            .get(&tier)
            .map(|c| c.current.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Most workers `tier` ever had at once
    pub(crate) fn peak_worker_count(&self, tier: Tier) -> usize {
        self.counts
            .get(&tier)
            .map(|c| c.peak.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Live workers of `tier`, in creation order
    pub(crate) fn workers(&self, tier: Tier) -> Vec<Arc<WorkerHandle>> {
        self.mutation
            .lock()
            .workers
            .get(&tier)
            .cloned()
            .unwrap_or_default()
    }

    /// Every live worker
    pub(crate) fn all_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.mutation.lock().workers.values().flatten().cloned().collect()
    }

    /// Join every worker, live or retired. Workers must already be exiting.
    pub(crate) fn join_all(&self) {
        let handles: Vec<Arc<WorkerHandle>> = {
            let mut state = self.mutation.lock();
            let mut handles: Vec<_> = state.retired.drain(..).collect();
            handles.extend(state.workers.values().flatten().cloned());
            handles
        };
        for handle in handles {
            handle.join();
        }
    }
}

/// Join retired workers whose threads already exited
fn reap_retired(state: &mut PoolState) {
    if state.retired.is_empty() {
        return;
    }
    let (finished, running): (Vec<_>, Vec<_>) = state.retired.drain(..).partition(|h| h.is_finished());
    state.retired = running;
    for handle in finished {
        handle.join();
    }
}

fn clamp_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Start one compiler thread for `tier`
fn spawn_worker(shared: &Arc<BrokerShared>, tier: &Arc<TierRuntime>, index: usize) -> io::Result<Arc<WorkerHandle>> {
    let name = format!("{} CompilerThread{}", tier.backend.kind().name().to_uppercase(), index);
    let handle = Arc::new(WorkerHandle::new(
        WorkerInfo {
            tier: tier.config.level,
            index,
            name: name.clone(),
        },
        shared.config.thread_log_capacity,
    ));

    let join = {
        let shared = shared.clone();
        let tier = tier.clone();
        let handle = handle.clone();
        std::thread::Builder::new()
            .name(name)
            .spawn(move || compiler_thread_loop(shared, tier, handle))?
    };
    handle.set_join_handle(join);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::Latch;
    use std::time::Duration;

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000 kB\nMemAvailable:    2048 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(2048 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_fixed_probe() {
        assert_eq!(FixedMemoryProbe(42).available_bytes(), 42);
    }

    fn retired_worker(index: usize, body: impl FnOnce() + Send + 'static) -> Arc<WorkerHandle> {
        let handle = Arc::new(WorkerHandle::new(
            WorkerInfo {
                tier: 2,
                index,
                name: format!("C2 CompilerThread{index}"),
            },
            4,
        ));
        handle.set_join_handle(std::thread::spawn(body));
        handle
    }

    #[test]
    fn test_reap_joins_only_exited_workers() {
        let gate = Latch::new();
        let exited = retired_worker(1, || {});
        let waiting = {
            let gate = gate.clone();
            retired_worker(2, move || gate.wait())
        };
        while !exited.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut state = PoolState::default();
        state.retired.push(exited);
        state.retired.push(waiting.clone());
        reap_retired(&mut state);
        assert_eq!(state.retired.len(), 1);
        assert!(Arc::ptr_eq(&state.retired[0], &waiting));

        gate.open();
        while !waiting.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        reap_retired(&mut state);
        assert!(state.retired.is_empty());
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_usize(7), 7);
    }
}
