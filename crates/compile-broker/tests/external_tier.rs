//! Blocking requests against the external compiler tier, which are polled
//! for progress and abandoned when the compiler stalls.

mod common;

use common::*;
use compile_broker::{
    CompileBroker, CompileRequest, CompilerKind, Latch, RequestOutcome, StubCompiler, TierConfig, WorkerState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EXTERNAL_TIER: u8 = 5;

fn external_broker(stub: Arc<StubCompiler>, slice_ms: u64, slices_max: u32) -> CompileBroker {
    let mut config = single_tier(TierConfig::external(EXTERNAL_TIER), 1);
    config.external_tier_progress_slice_ms = slice_ms;
    config.external_tier_progress_slices_max = slices_max;
    CompileBroker::builder(config)
        .backend(EXTERNAL_TIER, stub)
        .initialize()
        .unwrap()
}

fn external_stub() -> StubCompiler {
    StubCompiler::new("external").with_kind(CompilerKind::External)
}

#[test]
fn test_stalled_compiler_is_abandoned() {
    let gate = Latch::new();
    let stub = Arc::new(external_stub().without_progress().with_compile_gate(gate.clone()));
    let broker = external_broker(stub, 20, 5);
    assert!(wait_for_workers(&broker, EXTERNAL_TIER, WorkerState::Idle));

    let m = method("Graal", "stuck");
    let started = Instant::now();
    let outcome = broker.try_request_compile(CompileRequest::new(m.clone(), EXTERNAL_TIER).blocking(true));
    let waited = started.elapsed();
    let live_while_stalled = broker.task_pool_stats().live;
    gate.open();

    assert!(matches!(outcome, RequestOutcome::Abandoned { compile_id: 1 }), "{outcome:?}");
    assert!(waited >= Duration::from_millis(100));
    assert_eq!(live_while_stalled, 1);

    assert!(wait_until(WAIT, || broker.task_pool_stats().freed_by_worker == 1));
    let pool = broker.task_pool_stats();
    assert_eq!(pool.freed_by_requester, 0);
    assert_eq!(pool.live, 0);
    assert!(m.code().is_some());
}

#[test]
fn test_progressing_compiler_is_awaited() {
    let stub = Arc::new(external_stub().with_delay(Duration::from_millis(60)));
    let broker = external_broker(stub, 20, 5);
    assert!(wait_for_workers(&broker, EXTERNAL_TIER, WorkerState::Idle));

    let outcome = broker.try_request_compile(CompileRequest::new(method("Graal", "busy"), EXTERNAL_TIER).blocking(true));
    assert!(matches!(outcome, RequestOutcome::Installed(_)), "{outcome:?}");
    assert_eq!(broker.task_pool_stats().freed_by_requester, 1);
}

#[test]
fn test_uninitialized_external_compiler_never_blocks() {
    let init_gate = Latch::new();
    let stub = Arc::new(external_stub().with_init_gate(init_gate.clone()));
    let broker = external_broker(stub, 20, 5);
    let events = broker.subscribe();

    let outcome = broker.try_request_compile(CompileRequest::new(method("Graal", "early"), EXTERNAL_TIER).blocking(true));
    init_gate.open();

    assert!(matches!(outcome, RequestOutcome::Queued { .. }), "{outcome:?}");
    assert!(events.recv_timeout(WAIT).unwrap().is_success);
}
