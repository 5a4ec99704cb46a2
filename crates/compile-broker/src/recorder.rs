//! Decompilation recording across checkpoint/restore
//!
//! While a record window is open, every decompilation is remembered. When
//! the window closes the recorded methods are resubmitted as compile
//! requests so warm-up after restore does not wait for profiling to
//! trigger each compile again. Records hold weak references, so a class
//! unloaded in between is simply skipped.

use crate::broker::{CompileBroker, CompileRequest, RequestOutcome};
use crate::method::{ClassHolder, Method, MethodHandle, Tier};
use crate::task::CompileReason;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Recorder misuse
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecorderError {
    /// `begin_recording` while a window is open
    #[error("A recording window is already open")]
    AlreadyRecording,

    /// `finish_and_replay` without an open window
    #[error("No recording window is open")]
    NotRecording,
}

struct DecompilationRecord {
    holder: Weak<ClassHolder>,
    method: Weak<Method>,
    bci: i32,
    tier: Tier,
}

impl DecompilationRecord {
    fn live_method(&self) -> Option<MethodHandle> {
        let holder = self.holder.upgrade()?;
        if holder.is_unloaded() {
            return None;
        }
        self.method.upgrade()
    }
}

/// Outcome of `finish_and_replay`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Requests submitted to the broker
    pub submitted: usize,
    /// Of those, requests the broker queued
    pub queued: usize,
    /// Records skipped because their class was unloaded
    pub skipped_unloaded: usize,
}

static GLOBAL: Lazy<Arc<RecompilationRecorder>> = Lazy::new(|| Arc::new(RecompilationRecorder::new()));

/// Records decompilations during a checkpoint/restore window
#[derive(Default)]
pub struct RecompilationRecorder {
    active: AtomicBool,
    records: Mutex<Option<Vec<DecompilationRecord>>>,
}

impl RecompilationRecorder {
    /// Create a recorder with no open window
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide recorder
    pub fn global() -> Arc<RecompilationRecorder> {
        GLOBAL.clone()
    }

    /// Open a record window
    pub fn begin_recording(&self) -> Result<(), RecorderError> {
        let mut records = self.records.lock();
        if records.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }
        *records = Some(Vec::new());
        self.active.store(true, Ordering::Release);
        tracing::info!("recording decompilations");
        Ok(())
    }

    /// Whether a window is open
    pub fn is_recording(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remember a decompilation. Returns false when no window is open.
    pub fn record(&self, method: &MethodHandle, bci: i32, tier: Tier) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        let mut records = self.records.lock();
        match records.as_mut() {
            Some(list) => {
                list.push(DecompilationRecord {
                    holder: Arc::downgrade(method.holder()),
                    method: Arc::downgrade(method),
                    bci,
                    tier,
                });
                tracing::trace!(method = %method.full_name(), bci, tier, "recorded decompilation");
                true
            }
            None => false,
        }
    }

    /// Records held by the open window
    pub fn record_count(&self) -> usize {
        self.records.lock().as_ref().map_or(0, Vec::len)
    }

    /// Close the window and resubmit every recorded method that is still live
    pub fn finish_and_replay(&self, broker: &CompileBroker) -> Result<ReplaySummary, RecorderError> {
        let records = {
            let mut records = self.records.lock();
            let taken = records.take().ok_or(RecorderError::NotRecording)?;
            self.active.store(false, Ordering::Release);
            taken
        };

        let mut summary = ReplaySummary::default();
        for record in records {
            let Some(method) = record.live_method() else {
                summary.skipped_unloaded += 1;
                continue;
            };
            let request = CompileRequest::new(method, record.tier)
                .osr(record.bci)
                .reason(CompileReason::CheckpointRestore);
            summary.submitted += 1;
            if matches!(broker.try_request_compile(request), RequestOutcome::Queued { .. }) {
                summary.queued += 1;
            }
        }
        tracing::info!(
            submitted = summary.submitted,
            queued = summary.queued,
            skipped = summary.skipped_unloaded,
            "replayed recorded decompilations"
        );
        Ok(summary)
    }

    /// Report every recorded method that is still live
    pub fn metadata_visit(&self, visitor: &mut dyn FnMut(&MethodHandle)) {
        let records = self.records.lock();
        if let Some(list) = records.as_ref() {
            for method in list.iter().filter_map(DecompilationRecord::live_method) {
                visitor(&method);
            }
        }
    }
}
