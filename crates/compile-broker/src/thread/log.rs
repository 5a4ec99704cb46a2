//! Per-thread compile log (bounded ring of recent events)

use crate::method::Tier;
use crate::task::CompileTask;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Kind of log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEvent {
    /// Compile started
    Begin,
    /// Compile produced code
    Done,
    /// Compile failed
    Failure,
}

/// One entry in a worker's compile log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Compile ID
    pub compile_id: u32,
    /// Tier
    pub tier: Tier,
    /// `Class::method`, with `@ bci` for OSR
    pub method: String,
    /// What happened
    pub event: LogEvent,
    /// Compile time, for finished entries
    pub elapsed: Option<Duration>,
    /// Failure reason or code size
    pub detail: Option<String>,
}

pub(crate) struct CompileLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl CompileLog {
    pub(crate) fn new(capacity: usize) -> Self {
        CompileLog {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn push(&self, entry: LogEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    fn method_label(task: &CompileTask) -> String {
        if task.is_osr() {
            format!("{} @ {}", task.method().full_name(), task.entry_bci())
        } else {
            task.method().full_name()
        }
    }

    pub(crate) fn begin(&self, task: &CompileTask) {
        self.push(LogEntry {
            compile_id: task.compile_id(),
            tier: task.tier(),
            method: Self::method_label(task),
            event: LogEvent::Begin,
            elapsed: None,
            detail: None,
        });
    }

    pub(crate) fn finish(&self, task: &CompileTask, success: bool, detail: String, elapsed: Duration) {
        self.push(LogEntry {
            compile_id: task.compile_id(),
            tier: task.tier(),
            method: Self::method_label(task),
            event: if success { LogEvent::Done } else { LogEvent::Failure },
            elapsed: Some(elapsed),
            detail: Some(detail),
        });
    }

    pub(crate) fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ClassHolder, Method, INVOCATION_ENTRY_BCI};
    use crate::task::{CompileReason, TaskParams, TaskPool};

    #[test]
    fn test_ring_keeps_newest() {
        let pool = TaskPool::new(8);
        let method = Method::builder(&ClassHolder::new("A"), "a").build();
        let log = CompileLog::new(2);
        for id in 1..=3 {
            let task = pool.allocate().unwrap().initialize(TaskParams {
                compile_id: id,
                method: method.clone(),
                entry_bci: INVOCATION_ENTRY_BCI,
                tier: 1,
                hot_count: 0,
                reason: CompileReason::Normal,
                is_blocking: false,
            });
            log.begin(&task);
        }
        let ids: Vec<u32> = log.entries().iter().map(|e| e.compile_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
