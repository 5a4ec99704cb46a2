//! End-to-end broker scenarios: blocking requests, deduplication,
//! shutdown with queued work, code cache exhaustion and request filtering.

mod common;

use common::*;
use compile_broker::{
    BrokerError, ClassHolder, ClassInitializerScope, CodeBlobKind, CodeCache, CompileIdRange, CompileReason,
    CompileRequest, Latch, LogEvent, Method, RequestOutcome, StubBehavior, StubCompiler, TierConfig,
    WorkerState, INVOCATION_ENTRY_BCI,
};
use std::sync::{Arc, Barrier};
use std::thread;

// ============================================================================
// Seed scenarios
// ============================================================================

#[test]
fn test_simple_blocking_request() {
    let stub = Arc::new(StubCompiler::new("c1"));
    let broker = c1_broker(1, stub.clone());
    let events = broker.subscribe();
    let m = method("Foo", "bar");

    let code = broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .expect("blocking compile installs code");

    assert_eq!(code.compile_id(), 1);
    assert!(Arc::ptr_eq(&m.code().unwrap(), &code));
    assert!(!m.is_queued_for_compilation());

    let event = events.recv_timeout(WAIT).unwrap();
    assert_eq!(event.compile_id, 1);
    assert!(event.is_success);
    assert!(events.try_recv().is_err());

    let pool = broker.task_pool_stats();
    assert_eq!(pool.allocated, 1);
    assert_eq!(pool.freed_by_requester, 1);
    assert_eq!(pool.freed(), 1);
    assert_eq!(pool.live, 0);
    assert_eq!(stub.compile_count(), 1);
}

#[test]
fn test_dedup_under_contention() {
    let gate = Latch::new();
    let stub = Arc::new(StubCompiler::new("c1").with_compile_gate(gate.clone()));
    let broker = c1_broker(2, stub.clone());
    let events = broker.subscribe();
    let m = method("Foo", "contended");
    let barrier = Barrier::new(8);

    let outcomes: Vec<RequestOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    broker.try_request_compile(CompileRequest::new(m.clone(), 1))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    gate.open();

    let queued = outcomes
        .iter()
        .filter(|o| matches!(o, RequestOutcome::Queued { .. }))
        .count();
    let in_progress = outcomes
        .iter()
        .filter(|o| matches!(o, RequestOutcome::Rejected(BrokerError::AlreadyInProgress(_))))
        .count();
    assert_eq!(queued, 1);
    assert_eq!(in_progress, 7);
    assert_eq!(broker.queue_stats(1).unwrap().total_added, 1);

    let event = events.recv_timeout(WAIT).unwrap();
    assert_eq!(event.method_id, m.id());
    assert!(wait_until(WAIT, || broker.task_pool_stats().live == 0));
    assert!(events.try_recv().is_err());
    assert_eq!(stub.compile_count(), 1);
}

/// Requests at every (tier, entry) pair for one method, released together
const CROSS_TIER_REQUESTS: [(u8, i32); 6] = [
    (1, INVOCATION_ENTRY_BCI),
    (2, INVOCATION_ENTRY_BCI),
    (1, 5),
    (2, 5),
    (1, 9),
    (2, 9),
];

#[test]
fn test_dedup_across_tiers_and_entries() {
    let gate = Latch::new();
    let config = compile_broker::BrokerConfig {
        dynamic_pool_enabled: false,
        tiers: vec![TierConfig::c1(1).with_workers(1), TierConfig::c2(2).with_workers(1)],
        ..compile_broker::BrokerConfig::default()
    };
    let broker = compile_broker::CompileBroker::builder(config)
        .backend(1, Arc::new(StubCompiler::new("c1").with_compile_gate(gate.clone())))
        .backend(2, Arc::new(c2_stub("c2").with_compile_gate(gate.clone())))
        .initialize()
        .unwrap();
    let added = |broker: &compile_broker::CompileBroker| {
        broker.queue_stats(1).unwrap().total_added + broker.queue_stats(2).unwrap().total_added
    };

    let mut queued_per_round = Vec::new();
    let mut added_per_round = Vec::new();
    let mut marked = Vec::new();
    for round in 0..40 {
        let m = method("CrossTier", &format!("m{round}"));
        let before = added(&broker);
        let barrier = Barrier::new(CROSS_TIER_REQUESTS.len());
        let outcomes: Vec<RequestOutcome> = thread::scope(|s| {
            let handles: Vec<_> = CROSS_TIER_REQUESTS
                .iter()
                .map(|&(tier, bci)| {
                    let (broker, barrier, m) = (&broker, &barrier, &m);
                    s.spawn(move || {
                        barrier.wait();
                        broker.try_request_compile(CompileRequest::new(m.clone(), tier).osr(bci))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        queued_per_round.push(
            outcomes
                .iter()
                .filter(|o| matches!(o, RequestOutcome::Queued { .. }))
                .count(),
        );
        added_per_round.push(added(&broker) - before);
        marked.push(m.is_queued_for_compilation());
    }
    gate.open();

    assert!(queued_per_round.iter().all(|&q| q == 1), "{queued_per_round:?}");
    assert!(added_per_round.iter().all(|&a| a == 1), "{added_per_round:?}");
    assert!(marked.iter().all(|&m| m));
    assert!(wait_until(WAIT, || broker.task_pool_stats().live == 0));
    assert_eq!(broker.task_pool_stats().allocated, 40);
}

#[test]
fn test_stale_tasks_after_disable() {
    let init_gate = Latch::new();
    let stub = Arc::new(c2_stub("c2").with_init_gate(init_gate.clone()));
    let broker = c2_broker(single_tier(TierConfig::c2(2), 1), stub.clone());
    let methods: Vec<_> = (0..5).map(|i| method("Stale", &format!("m{i}"))).collect();

    let outcomes: Vec<RequestOutcome> = thread::scope(|s| {
        let handles: Vec<_> = methods
            .iter()
            .map(|m| {
                let broker = &broker;
                s.spawn(move || broker.try_request_compile(CompileRequest::new(m.clone(), 2).blocking(true)))
            })
            .collect();

        let all_queued = wait_until(WAIT, || broker.queue_stats(2).unwrap().size == 5);
        broker.disable_compilation_permanently();
        assert!(all_queued);
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    init_gate.open();

    let stale_reason = BrokerError::Stale.to_string();
    for outcome in &outcomes {
        let stale = matches!(outcome, RequestOutcome::Failed { reason, .. } if *reason == stale_reason);
        let unavailable = matches!(outcome, RequestOutcome::Rejected(BrokerError::Unavailable(_)));
        assert!(stale || unavailable, "unexpected outcome {outcome:?}");
    }
    assert_eq!(broker.stats().stale_count, 5);
    let pool = broker.task_pool_stats();
    assert_eq!(pool.freed(), 5);
    assert_eq!(pool.live, 0);
    assert!(methods.iter().all(|m| !m.is_queued_for_compilation()));

    assert!(wait_for_workers(&broker, 2, WorkerState::Shutdown));
    assert_eq!(stub.compile_count(), 0);
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(method("Stale", "late"), 2)),
        RequestOutcome::Rejected(BrokerError::Unavailable(_))
    ));
}

// ============================================================================
// Code cache
// ============================================================================

fn small_cache_config(eviction: bool) -> compile_broker::BrokerConfig {
    let mut config = single_tier(TierConfig::c1(1), 1);
    config.code_cache_eviction = eviction;
    config.code_cache_restart_headroom = 600;
    config
}

#[test]
fn test_code_cache_full_with_eviction_stops_and_restarts() {
    let cache = Arc::new(CodeCache::with_segments(4096, 1000, 4096));
    let stub = Arc::new(StubCompiler::new("c1").with_behavior(StubBehavior::Succeed { code_size: 600 }));
    let broker = c1_broker_with_cache(small_cache_config(true), cache.clone(), stub);
    let (m1, m2, m3) = (method("Cache", "one"), method("Cache", "two"), method("Cache", "three"));

    assert!(broker.request_compile(&m1, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true).is_some());

    let outcome = broker.try_request_compile(CompileRequest::new(m2.clone(), 1).blocking(true));
    assert!(matches!(outcome, RequestOutcome::Failed { ref reason, .. } if reason == "code cache is full"));
    assert!(!m2.is_not_compilable(1));
    assert!(!broker.is_accepting_jobs());
    assert!(!broker.is_compilation_disabled());

    let stats = broker.stats();
    assert_eq!(stats.code_cache_full_count, 1);
    assert_eq!(stats.stopped_count, 1);

    // Not enough headroom yet
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(m3.clone(), 1)),
        RequestOutcome::Rejected(BrokerError::Unavailable(_))
    ));

    assert!(broker.decompile(&m1, INVOCATION_ENTRY_BCI, 1));
    assert!(m1.code().is_none());
    assert_eq!(cache.unallocated_capacity(CodeBlobKind::Profiled), 1000);
    assert!(broker.is_accepting_jobs());
    assert_eq!(broker.stats().restarted_count, 1);

    assert!(broker.request_compile(&m3, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true).is_some());
}

#[test]
fn test_code_cache_full_without_eviction_disables() {
    let cache = Arc::new(CodeCache::with_segments(4096, 1000, 4096));
    let stub = Arc::new(StubCompiler::new("c1").with_behavior(StubBehavior::Succeed { code_size: 600 }));
    let broker = c1_broker_with_cache(small_cache_config(false), cache, stub);

    let m1 = method("Cache", "one");
    assert!(broker.request_compile(&m1, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true).is_some());
    let m2 = method("Cache", "two");
    assert!(broker.request_compile(&m2, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true).is_none());

    assert!(broker.is_compilation_disabled());
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(method("Cache", "three"), 1)),
        RequestOutcome::Rejected(BrokerError::Unavailable(_))
    ));
    assert!(wait_for_workers(&broker, 1, WorkerState::Shutdown));
    assert!(wait_until(WAIT, || broker.task_pool_stats().live == 0));
}

// ============================================================================
// Request filtering
// ============================================================================

#[test]
fn test_backend_init_failure_disables_compilation() {
    let stub = Arc::new(StubCompiler::new("broken").failing_init("no code generator"));
    let broker = c1_broker(1, stub.clone());

    assert!(wait_until(WAIT, || broker.is_compilation_disabled()));
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(method("A", "a"), 1)),
        RequestOutcome::Rejected(BrokerError::BackendInitFailure(_))
    ));
    assert!(wait_for_workers(&broker, 1, WorkerState::Shutdown));
    assert_eq!(stub.init_count(), 1);
}

#[test]
fn test_already_compiled_returns_existing_code() {
    let broker = c1_broker(1, Arc::new(StubCompiler::new("c1")));
    let m = method("Foo", "twice");

    let first = broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .unwrap();
    let second = broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, false)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(broker.queue_stats(1).unwrap().total_added, 1);
}

#[test]
fn test_osr_and_standard_ids_are_separate() {
    let broker = c1_broker(1, Arc::new(StubCompiler::new("c1")));
    let m = method("Loop", "run");

    let osr = broker
        .try_request_compile(CompileRequest::new(m.clone(), 1).osr(13).hot_count(60_000).reason(CompileReason::BackedgeCount).blocking(true))
        .into_code()
        .unwrap();
    assert!(osr.is_osr());
    assert_eq!(osr.entry_bci(), 13);
    assert_eq!(osr.compile_id(), 1);
    assert!(m.osr_code(13, 1, true).is_some());
    assert!(m.code().is_none());

    let standard = broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .unwrap();
    assert_eq!(standard.compile_id(), 1);
}

#[test]
fn test_directive_exclusion() {
    let stub = Arc::new(StubCompiler::new("c1"));
    let broker = c1_broker(1, stub.clone());
    broker
        .directives()
        .push_json(r#"{ "match": "Foo::bar", "Exclude": true }"#)
        .unwrap();

    let excluded = method("Foo", "bar");
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(excluded.clone(), 1)),
        RequestOutcome::Rejected(BrokerError::Prohibited(_))
    ));
    assert!(excluded.is_not_compilable(1));
    assert!(broker
        .request_compile(&method("Foo", "baz"), INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .is_some());
    assert_eq!(stub.compile_count(), 1);
}

#[test]
fn test_compile_id_range() {
    let mut config = single_tier(TierConfig::c1(1), 1);
    config.compile_id_range = Some(CompileIdRange { start: 2, stop: 3 });
    let broker = compile_broker::CompileBroker::builder(config)
        .backend(1, Arc::new(StubCompiler::new("c1")))
        .initialize()
        .unwrap();

    let (m1, m2, m3) = (method("Range", "a"), method("Range", "b"), method("Range", "c"));
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(m1.clone(), 1)),
        RequestOutcome::Rejected(BrokerError::Prohibited(_))
    ));
    assert!(m1.is_not_compilable(1));

    let code = broker
        .request_compile(&m2, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .unwrap();
    assert_eq!(code.compile_id(), 2);
    assert!(broker
        .request_compile(&m3, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .is_none());
}

#[test]
fn test_native_methods() {
    let broker = c1_broker(1, Arc::new(StubCompiler::new("c1")));
    let holder = ClassHolder::new("Natives");

    let unlinkable = Method::builder(&holder, "missing").native(false).build();
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(unlinkable.clone(), 1)),
        RequestOutcome::Rejected(BrokerError::Prohibited(_))
    ));
    assert!(unlinkable.is_not_compilable(1));

    let linkable = Method::builder(&holder, "present").native(true).build();
    let code = broker
        .request_compile(&linkable, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .unwrap();
    assert!(linkable.is_native_linked());
    assert_eq!(code.compile_id(), 1);
}

#[test]
fn test_not_at_tier_failure_prohibits_recompile() {
    let stub = Arc::new(StubCompiler::new("c1").with_behavior(StubBehavior::NotAtTier));
    let broker = c1_broker(1, stub);
    let m = method("Hard", "m");

    let outcome = broker.try_request_compile(CompileRequest::new(m.clone(), 1).blocking(true));
    assert!(matches!(outcome, RequestOutcome::Failed { compile_id: 1, .. }));
    assert!(m.is_not_compilable(1));
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(m, 1)),
        RequestOutcome::Rejected(BrokerError::Prohibited(_))
    ));
    assert_eq!(broker.stats().total.bailout_count, 1);
}

#[test]
fn test_breakpoints_skip_compile() {
    let stub = Arc::new(StubCompiler::new("c1"));
    let broker = c1_broker(1, stub.clone());
    let m = method("Debug", "stepped");
    m.set_breakpoints(true);

    let outcome = broker.try_request_compile(CompileRequest::new(m.clone(), 1).blocking(true));
    assert!(matches!(outcome, RequestOutcome::Failed { ref reason, .. } if reason == "breakpoints are present"));
    assert_eq!(stub.compile_count(), 0);
    assert!(!m.is_queued_for_compilation());
}

// ============================================================================
// Blocking decisions
// ============================================================================

#[test]
fn test_class_initializer_forces_background() {
    let broker = c1_broker(1, Arc::new(StubCompiler::new("c1")));
    let events = broker.subscribe();
    let m = method("Init", "clinit_helper");

    let outcome = {
        let _scope = ClassInitializerScope::enter();
        broker.try_request_compile(CompileRequest::new(m.clone(), 1).blocking(true))
    };
    assert!(matches!(outcome, RequestOutcome::Queued { compile_id: 1 }));
    assert!(events.recv_timeout(WAIT).unwrap().is_success);
}

#[test]
fn test_background_compilation_directive_forces_blocking() {
    let broker = c1_broker(1, Arc::new(StubCompiler::new("c1")));
    broker
        .directives()
        .push_json(r#"{ "match": "Sync::*", "BackgroundCompilation": false }"#)
        .unwrap();

    let m = method("Sync", "now");
    let outcome = broker.try_request_compile(CompileRequest::new(m.clone(), 1));
    assert!(matches!(outcome, RequestOutcome::Installed(_)));
    assert!(m.code().is_some());
    assert_eq!(broker.task_pool_stats().freed_by_requester, 1);
}

// ============================================================================
// Workers
// ============================================================================

#[test]
fn test_repeat_compilation_directive() {
    let stub = Arc::new(StubCompiler::new("c1"));
    let broker = c1_broker(1, stub.clone());
    broker
        .directives()
        .push_json(r#"{ "match": "Rep::*", "RepeatCompilation": 2 }"#)
        .unwrap();

    let m = method("Rep", "eat");
    assert!(broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .is_some());
    let installs: Vec<bool> = stub.compiles().iter().map(|c| c.install_code).collect();
    assert_eq!(installs, vec![false, false, true]);
    assert_eq!(broker.code_cache().region_count(), 1);
}

#[test]
fn test_thread_log_records_compiles() {
    let mut config = single_tier(TierConfig::c1(1), 1);
    config.log_compilation = true;
    let broker = compile_broker::CompileBroker::builder(config)
        .backend(1, Arc::new(StubCompiler::new("c1")))
        .initialize()
        .unwrap();

    let m = method("Logged", "m");
    assert!(broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .is_some());

    let log = broker.thread_log(1, 0).unwrap();
    let events: Vec<LogEvent> = log.iter().map(|e| e.event).collect();
    assert_eq!(events, vec![LogEvent::Begin, LogEvent::Done]);
    assert!(log[1].elapsed.is_some());
    assert!(broker.thread_log(1, 7).is_none());
}

#[test]
fn test_pause_parks_workers_mid_compile() {
    let broker = c1_broker(1, Arc::new(StubCompiler::new("c1")));
    let events = broker.subscribe();

    let guard = broker.pause_compiler_threads();
    assert!(matches!(
        broker.try_request_compile(CompileRequest::new(method("Paused", "m"), 1)),
        RequestOutcome::Queued { .. }
    ));
    let parked = broker.pause_gate().wait_for_parked(1, WAIT);
    let early = events.try_recv();
    drop(guard);

    assert!(parked);
    assert!(early.is_err());
    assert!(events.recv_timeout(WAIT).unwrap().is_success);
}

#[test]
fn test_queued_methods_visible_at_quiescent_point() {
    let gate = Latch::new();
    let stub = Arc::new(StubCompiler::new("c1").with_compile_gate(gate.clone()));
    let broker = c1_broker(1, stub.clone());
    let events = broker.subscribe();
    let (first, second) = (method("Queue", "first"), method("Queue", "second"));

    broker.try_request_compile(CompileRequest::new(first.clone(), 1));
    let started = wait_until(WAIT, || stub.compile_count() == 1);
    broker.try_request_compile(CompileRequest::new(second.clone(), 1));

    let mut seen = Vec::new();
    broker.mark_all_queued_methods_on_stack(&mut |m| seen.push(m.id()));
    let printed = broker.print_compile_queues();
    gate.open();

    assert!(started);
    assert_eq!(seen, vec![second.id()]);
    assert!(printed.contains("C1 compile queue"));
    assert!(printed.contains("Queue::second"));
    assert!(printed.contains("Current compiles:"));
    assert!(printed.contains("Queue::first"));

    for _ in 0..2 {
        assert!(events.recv_timeout(WAIT).unwrap().is_success);
    }
}
