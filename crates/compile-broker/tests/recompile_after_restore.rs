//! Decompilations recorded across a checkpoint/restore window are replayed
//! as compile requests once the window closes.

mod common;

use common::*;
use compile_broker::{
    ClassHolder, CompileBroker, CompileReason, Method, RecompilationRecorder, RecorderError, TierConfig,
    INVOCATION_ENTRY_BCI,
};
use std::sync::Arc;

const TIER: u8 = 2;

fn broker_with_recorder(recorder: Arc<RecompilationRecorder>) -> CompileBroker {
    CompileBroker::builder(single_tier(TierConfig::c2(TIER), 1))
        .backend(TIER, Arc::new(c2_stub("c2")))
        .recorder(recorder)
        .initialize()
        .unwrap()
}

#[test]
fn test_replay_recompiles_recorded_methods() {
    let recorder = Arc::new(RecompilationRecorder::new());
    let broker = broker_with_recorder(recorder.clone());
    let events = broker.subscribe();
    let m1 = Method::builder(&ClassHolder::new("Restored"), "loop").bytecode_size(80).build();
    let m2 = Method::builder(&ClassHolder::new("Restored2"), "call").bytecode_size(12).build();

    recorder.begin_recording().unwrap();
    assert!(recorder.record(&m1, 13, TIER));
    assert!(recorder.record(&m2, INVOCATION_ENTRY_BCI, TIER));
    assert!(recorder.record(&m1, 13, TIER));
    assert_eq!(recorder.record_count(), 3);

    let summary = recorder.finish_and_replay(&broker).unwrap();
    assert!(!recorder.is_recording());
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.queued, 2);
    assert_eq!(summary.skipped_unloaded, 0);

    for _ in 0..2 {
        assert!(events.recv_timeout(WAIT).unwrap().is_success);
    }
    assert!(m1.osr_code(13, TIER, true).is_some());
    assert!(m2.code().is_some());
    assert_eq!(recorder.finish_and_replay(&broker), Err(RecorderError::NotRecording));
}

#[test]
fn test_unloaded_class_is_not_replayed() {
    let recorder = Arc::new(RecompilationRecorder::new());
    let broker = broker_with_recorder(recorder.clone());
    let gone = ClassHolder::new("Gone");
    let m1 = Method::builder(&gone, "loop").build();
    let m2 = method("Kept", "call");

    recorder.begin_recording().unwrap();
    recorder.record(&m1, 13, TIER);
    recorder.record(&m2, INVOCATION_ENTRY_BCI, TIER);
    recorder.record(&m1, 13, TIER);
    gone.unload();

    let summary = recorder.finish_and_replay(&broker).unwrap();
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.skipped_unloaded, 2);
    assert!(wait_until(WAIT, || m2.code().is_some()));
    assert!(m1.osr_code(13, TIER, false).is_none());
    assert!(!m1.is_queued_for_compilation());
}

#[test]
fn test_decompile_feeds_recorder() {
    let recorder = Arc::new(RecompilationRecorder::new());
    let broker = broker_with_recorder(recorder.clone());
    let m = method("Deopt", "hot");

    let code = broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, TIER, 0, CompileReason::Normal, true)
        .unwrap();
    assert!(!broker.decompile(&m, INVOCATION_ENTRY_BCI, TIER + 1));

    // Outside a window the decompile is not remembered
    assert!(broker.decompile(&m, INVOCATION_ENTRY_BCI, TIER));
    assert!(!code.is_entrant());
    assert_eq!(recorder.record_count(), 0);

    let again = broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, TIER, 0, CompileReason::Normal, true)
        .unwrap();
    recorder.begin_recording().unwrap();
    assert!(broker.decompile(&m, INVOCATION_ENTRY_BCI, TIER));
    assert_eq!(recorder.record_count(), 1);
    let mut pinned = Vec::new();
    recorder.metadata_visit(&mut |method| pinned.push(method.id()));
    assert_eq!(pinned, vec![m.id()]);

    let summary = recorder.finish_and_replay(&broker).unwrap();
    assert_eq!(summary.queued, 1);
    assert!(wait_until(WAIT, || m.code().is_some()));
    let replayed = m.code().unwrap();
    assert!(replayed.compile_id() > again.compile_id());
}
