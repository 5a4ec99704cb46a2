//! Cooperative pause gate for compiler threads
//!
//! A quiescent operation calls `pause()` and holds the guard; workers park
//! the next time they `poll()` and resume when the last guard drops.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct GateState {
    pausers: usize,
    parked: usize,
}

/// Block-now flag polled by workers
#[derive(Debug, Default)]
pub struct PauseGate {
    requested: AtomicBool,
    state: Mutex<GateState>,
    resumed: Condvar,
    parked_changed: Condvar,
}

impl PauseGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a pause is requested
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Park while a pause is requested
    pub fn poll(&self) {
        if !self.requested.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        if state.pausers == 0 {
            return;
        }
        state.parked += 1;
        self.parked_changed.notify_all();
        while state.pausers > 0 {
            self.resumed.wait(&mut state);
        }
        state.parked -= 1;
        self.parked_changed.notify_all();
    }

    /// Request a pause; workers resume when the guard drops
    pub fn pause(self: &Arc<Self>) -> PauseGuard {
        let mut state = self.state.lock();
        state.pausers += 1;
        self.requested.store(true, Ordering::Release);
        PauseGuard { gate: self.clone() }
    }

    /// Threads currently parked
    pub fn parked_count(&self) -> usize {
        self.state.lock().parked
    }

    /// Wait until at least `count` threads are parked. Returns false on timeout.
    pub fn wait_for_parked(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.parked < count {
            if self.parked_changed.wait_until(&mut state, deadline).timed_out() {
                return state.parked >= count;
            }
        }
        true
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.pausers -= 1;
        if state.pausers == 0 {
            self.requested.store(false, Ordering::Release);
            self.resumed.notify_all();
        }
    }
}

/// Holds compiler threads paused until dropped
#[derive(Debug)]
#[must_use = "compiler threads resume as soon as the guard is dropped"]
pub struct PauseGuard {
    gate: Arc<PauseGate>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}
