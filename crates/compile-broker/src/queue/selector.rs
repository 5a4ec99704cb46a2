//! Task selection policies

use crate::task::CompileTask;
use std::cmp::Ordering;
use std::time::Instant;

/// A queued task offered to a selector, in insertion order
#[derive(Clone, Copy)]
pub struct Candidate<'a> {
    /// Queue slot of the task
    pub slot: usize,
    /// The task
    pub task: &'a CompileTask,
}

/// Result of one selection pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Selection {
    /// Slot of the task to run next
    pub chosen: Option<usize>,
    /// Slots of tasks that must not run and go to the stale list
    pub stale: Vec<usize>,
}

/// Policy for picking the next task from a non-empty queue
pub trait TaskSelector: Send + Sync {
    /// Selector name for diagnostics
    fn name(&self) -> &str;

    /// Pick one task. Runs under the queue lock.
    fn select(&self, candidates: &mut dyn Iterator<Item = Candidate<'_>>, now: Instant) -> Selection;
}

/// Whether the task's method was redefined or its class unloaded
fn is_obsolete(task: &CompileTask) -> bool {
    let method = task.method();
    if method.holder().is_unloaded() {
        task.mark_unloaded();
        return true;
    }
    method.is_old()
}

/// Plain insertion order
#[derive(Debug, Default)]
pub struct FifoSelector;

impl TaskSelector for FifoSelector {
    fn name(&self) -> &str {
        "fifo"
    }

    fn select(&self, candidates: &mut dyn Iterator<Item = Candidate<'_>>, _now: Instant) -> Selection {
        let mut selection = Selection::default();
        for candidate in candidates {
            if is_obsolete(candidate.task) {
                selection.stale.push(candidate.slot);
            } else {
                selection.chosen = Some(candidate.slot);
                break;
            }
        }
        selection
    }
}

/// Blocking requests first, then OSR, then the hottest method
///
/// Hotness is the request's hot count per millisecond spent in the queue.
/// Equal ranks keep insertion order.
#[derive(Debug, Default)]
pub struct HotnessSelector;

#[derive(Debug, Clone, Copy)]
struct Rank {
    blocking: bool,
    osr: bool,
    rate: f64,
}

impl Rank {
    fn of(task: &CompileTask, now: Instant) -> Self {
        let age_ms = now.saturating_duration_since(task.requested_at()).as_millis() as f64;
        Rank {
            blocking: task.is_blocking(),
            osr: task.is_osr(),
            rate: task.hot_count() as f64 / (age_ms + 1.0),
        }
    }

    fn cmp(&self, other: &Rank) -> Ordering {
        self.blocking
            .cmp(&other.blocking)
            .then(self.osr.cmp(&other.osr))
            .then(self.rate.partial_cmp(&other.rate).unwrap_or(Ordering::Equal))
    }
}

impl TaskSelector for HotnessSelector {
    fn name(&self) -> &str {
        "hotness"
    }

    fn select(&self, candidates: &mut dyn Iterator<Item = Candidate<'_>>, now: Instant) -> Selection {
        let mut selection = Selection::default();
        let mut best: Option<Rank> = None;
        for candidate in candidates {
            if is_obsolete(candidate.task) {
                selection.stale.push(candidate.slot);
                continue;
            }
            let rank = Rank::of(candidate.task, now);
            // Strictly greater only, so ties stay FIFO
            if best.map_or(true, |b| rank.cmp(&b) == Ordering::Greater) {
                best = Some(rank);
                selection.chosen = Some(candidate.slot);
            }
        }
        selection
    }
}
