//! Per-tier compile queues
//!
//! Requesters enqueue under the queue lock; workers block on the "new work"
//! condition and pull one task per selection pass. Tasks that must not run
//! are moved to a stale list and finalized outside the lock.

mod list;
mod selector;

pub use selector::{Candidate, FifoSelector, HotnessSelector, Selection, TaskSelector};

use crate::method::{MethodHandle, Tier};
use crate::task::{CompileTask, TrainingData};
use list::TaskList;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Queue counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Queue name
    pub name: String,
    /// Tier served
    pub tier: Tier,
    /// Tasks currently queued
    pub size: usize,
    /// Largest size seen
    pub peak_size: usize,
    /// Tasks ever added
    pub total_added: u64,
    /// Tasks ever removed (selected or made stale)
    pub total_removed: u64,
}

/// State guarded by the queue lock
pub(crate) struct QueueState {
    list: TaskList,
    peak_size: usize,
    total_added: u64,
    total_removed: u64,
    stale: Vec<Arc<CompileTask>>,
}

/// What the worker side of `dequeue_blocking` needs from the broker
pub(crate) trait QueueConsumer {
    /// Empty-queue hook; runs without the queue lock
    fn on_empty_queue(&self, queue: &CompileQueue);
    /// Compilation is permanently off or the broker is shutting down
    fn should_exit(&self) -> bool;
    /// Bounded wait on an empty queue
    fn wait_timeout(&self) -> Duration;
    /// Asked after a timed-out wait on a still-empty queue; runs without the queue lock
    fn try_retire(&self) -> bool;
    /// Finalize a task taken off the stale list; runs without the queue lock
    fn finalize_stale(&self, task: Arc<CompileTask>);
}

/// Result of a blocking dequeue
pub(crate) enum Dequeued {
    Task(Arc<CompileTask>),
    Retire,
    Exit,
}

/// FIFO-with-policy queue for one tier
pub struct CompileQueue {
    name: String,
    tier: Tier,
    state: Mutex<QueueState>,
    new_work: Condvar,
    /// Mirror of the list length for lock-free reads
    size: AtomicUsize,
    selector: Box<dyn TaskSelector>,
}

impl CompileQueue {
    /// Create an empty queue
    pub fn new(name: impl Into<String>, tier: Tier, selector: Box<dyn TaskSelector>) -> Self {
        CompileQueue {
            name: name.into(),
            tier,
            state: Mutex::new(QueueState {
                list: TaskList::new(),
                peak_size: 0,
                total_added: 0,
                total_removed: 0,
                stale: Vec::new(),
            }),
            new_work: Condvar::new(),
            size: AtomicUsize::new(0),
            selector,
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tier served
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Tasks currently queued (racy snapshot)
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Whether the queue is empty (racy snapshot)
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the selection policy
    pub fn selector_name(&self) -> &str {
        self.selector.name()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock()
    }

    /// Append a fresh task. Caller holds the queue lock.
    pub(crate) fn enqueue(&self, state: &mut QueueState, task: Arc<CompileTask>, record_training: bool) {
        if record_training {
            task.attach_training_data(TrainingData {
                queue_depth: state.list.len(),
                enqueued_at: Instant::now(),
            });
        }
        task.method().set_queued_for_compilation();
        tracing::trace!(queue = %self.name, task = %task, "enqueue");

        state.list.push_back(task);
        state.total_added += 1;
        state.peak_size = state.peak_size.max(state.list.len());
        self.size.store(state.list.len(), Ordering::Release);
        self.new_work.notify_all();
    }

    fn remove_slot(&self, state: &mut QueueState, slot: usize) -> Arc<CompileTask> {
        let removed = state.list.unlink(slot);
        state.total_removed += 1;
        self.size.store(state.list.len(), Ordering::Release);
        removed
    }

    /// Wait for work and pick one task
    pub(crate) fn dequeue_blocking(&self, consumer: &dyn QueueConsumer) -> Dequeued {
        let mut state = self.state.lock();
        loop {
            if consumer.should_exit() {
                return Dequeued::Exit;
            }

            if state.list.is_empty() {
                MutexGuard::unlocked(&mut state, || consumer.on_empty_queue(self));
                if consumer.should_exit() {
                    return Dequeued::Exit;
                }
                if !state.list.is_empty() {
                    continue;
                }
                let timed_out = self
                    .new_work
                    .wait_for(&mut state, consumer.wait_timeout())
                    .timed_out();
                if timed_out
                    && state.list.is_empty()
                    && !consumer.should_exit()
                    && MutexGuard::unlocked(&mut state, || consumer.try_retire())
                {
                    return Dequeued::Retire;
                }
                continue;
            }

            let selection = {
                let mut candidates = state
                    .list
                    .iter()
                    .map(|(slot, task)| Candidate { slot, task: &**task });
                self.selector.select(&mut candidates, Instant::now())
            };
            for slot in selection.stale {
                let task = self.remove_slot(&mut state, slot);
                task.set_stale();
                state.stale.push(task);
            }
            let chosen = selection.chosen.map(|slot| self.remove_slot(&mut state, slot));
            if !state.stale.is_empty() {
                self.purge_stale(&mut state, consumer);
            }
            if let Some(task) = chosen {
                tracing::trace!(queue = %self.name, task = %task, "dequeue");
                return Dequeued::Task(task);
            }
        }
    }

    /// Finalize everything on the stale list with the lock released
    fn purge_stale(&self, state: &mut MutexGuard<'_, QueueState>, consumer: &dyn QueueConsumer) {
        let stale = std::mem::take(&mut state.stale);
        MutexGuard::unlocked(state, || {
            for task in stale {
                consumer.finalize_stale(task);
            }
        });
    }

    /// Make every active task stale and hand back the whole stale list
    pub(crate) fn drain(&self) -> Vec<Arc<CompileTask>> {
        let mut state = self.state.lock();
        while let Some(slot) = state.list.head() {
            let task = self.remove_slot(&mut state, slot);
            task.set_stale();
            state.stale.push(task);
        }
        let drained = std::mem::take(&mut state.stale);
        self.new_work.notify_all();
        drained
    }

    /// Wake every waiting worker
    pub(crate) fn wake_all(&self) {
        let _state = self.state.lock();
        self.new_work.notify_all();
    }

    /// Report the method of every queued task
    pub fn mark_methods_on_stack(&self, visitor: &mut dyn FnMut(&MethodHandle)) {
        let state = self.state.lock();
        for (_, task) in state.list.iter() {
            visitor(task.method());
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            name: self.name.clone(),
            tier: self.tier,
            size: state.list.len(),
            peak_size: state.peak_size,
            total_added: state.total_added,
            total_removed: state.total_removed,
        }
    }

    /// Print queued tasks one per line
    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(out, "{} ({} tasks, selector {}):", self.name, state.list.len(), self.selector.name())?;
        if state.list.is_empty() {
            return writeln!(out, "  Empty");
        }
        for (_, task) in state.list.iter() {
            writeln!(out, "{}", task)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CompileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileQueue")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .field("size", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ClassHolder, Method, INVOCATION_ENTRY_BCI};
    use crate::task::{CompileReason, FreedBy, TaskParams, TaskPool};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicBool;

    struct TestConsumer {
        exit: AtomicBool,
        retire: bool,
        stale: PlMutex<Vec<u32>>,
        pool: Arc<TaskPool>,
    }

    impl TestConsumer {
        fn new(pool: Arc<TaskPool>, retire: bool) -> Self {
            TestConsumer {
                exit: AtomicBool::new(false),
                retire,
                stale: PlMutex::new(Vec::new()),
                pool,
            }
        }
    }

    impl QueueConsumer for TestConsumer {
        fn on_empty_queue(&self, _queue: &CompileQueue) {}
        fn should_exit(&self) -> bool {
            self.exit.load(Ordering::Acquire)
        }
        fn wait_timeout(&self) -> Duration {
            Duration::from_millis(10)
        }
        fn try_retire(&self) -> bool {
            self.retire
        }
        fn finalize_stale(&self, task: Arc<CompileTask>) {
            self.stale.lock().push(task.compile_id());
            task.method().clear_queued_for_compilation();
            task.mark_complete();
            self.pool.free(task, FreedBy::Stale);
        }
    }

    fn new_task(pool: &TaskPool, id: u32, method: &MethodHandle) -> Arc<CompileTask> {
        pool.allocate().unwrap().initialize(TaskParams {
            compile_id: id,
            method: method.clone(),
            entry_bci: INVOCATION_ENTRY_BCI,
            tier: 1,
            hot_count: 0,
            reason: CompileReason::Normal,
            is_blocking: false,
        })
    }

    fn queue() -> CompileQueue {
        CompileQueue::new("C1 compile queue", 1, Box::new(HotnessSelector))
    }

    #[test]
    fn test_enqueue_marks_method_and_counts() {
        let pool = TaskPool::new(8);
        let q = queue();
        let m = Method::builder(&ClassHolder::new("A"), "a").build();
        {
            let mut state = q.lock();
            q.enqueue(&mut state, new_task(&pool, 1, &m), true);
        }
        assert!(m.is_queued_for_compilation());
        let stats = q.stats();
        assert_eq!((stats.size, stats.peak_size, stats.total_added), (1, 1, 1));
    }

    #[test]
    fn test_dequeue_picks_task_and_purges_stale() {
        let pool = Arc::new(TaskPool::new(8));
        let q = queue();
        let holder = ClassHolder::new("A");
        let old = Method::builder(&holder, "old").build();
        let fresh = Method::builder(&holder, "fresh").build();
        {
            let mut state = q.lock();
            q.enqueue(&mut state, new_task(&pool, 1, &old), false);
            q.enqueue(&mut state, new_task(&pool, 2, &fresh), false);
        }
        old.mark_old();

        let consumer = TestConsumer::new(pool.clone(), false);
        match q.dequeue_blocking(&consumer) {
            Dequeued::Task(task) => assert_eq!(task.compile_id(), 2),
            _ => panic!("expected a task"),
        }
        assert_eq!(*consumer.stale.lock(), vec![1]);
        assert!(!old.is_queued_for_compilation());
        assert_eq!(q.stats().total_removed, 2);
        assert_eq!(pool.stats().freed_stale, 1);
    }

    #[test]
    fn test_empty_queue_retires_or_exits() {
        let pool = Arc::new(TaskPool::new(8));
        let q = queue();
        let retiring = TestConsumer::new(pool.clone(), true);
        assert!(matches!(q.dequeue_blocking(&retiring), Dequeued::Retire));

        let exiting = TestConsumer::new(pool, false);
        exiting.exit.store(true, Ordering::Release);
        assert!(matches!(q.dequeue_blocking(&exiting), Dequeued::Exit));
    }

    #[test]
    fn test_drain_returns_all_tasks_stale() {
        let pool = TaskPool::new(8);
        let q = queue();
        let holder = ClassHolder::new("A");
        {
            let mut state = q.lock();
            for id in 1..=3 {
                let m = Method::builder(&holder, format!("m{}", id)).build();
                q.enqueue(&mut state, new_task(&pool, id, &m), false);
            }
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 3);
        assert!(drained.iter().all(|t| t.is_stale()));
        assert!(q.is_empty());
    }

    #[test]
    fn test_mark_methods_on_stack_visits_queued() {
        let pool = TaskPool::new(8);
        let q = queue();
        let m = Method::builder(&ClassHolder::new("A"), "a").build();
        {
            let mut state = q.lock();
            q.enqueue(&mut state, new_task(&pool, 1, &m), false);
        }
        let mut seen = Vec::new();
        q.mark_methods_on_stack(&mut |method| seen.push(method.id()));
        assert_eq!(seen, vec![m.id()]);
    }
}
