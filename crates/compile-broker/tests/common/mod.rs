//! Shared helpers for broker integration tests

#![allow(dead_code)]

use compile_broker::{
    BrokerConfig, ClassHolder, CodeCache, CompileBroker, CompilerKind, Method, MethodHandle, StubCompiler,
    TierConfig, Tier, WorkerState,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn method(class: &str, name: &str) -> MethodHandle {
    Method::builder(&ClassHolder::new(class), name).bytecode_size(32).build()
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Static single-tier config with `workers` threads
pub fn single_tier(tier: TierConfig, workers: usize) -> BrokerConfig {
    let mut tier = tier.with_workers(workers);
    tier.min_workers = 1;
    BrokerConfig::single_tier(tier)
}

/// Tier 1 broker with one C1 stub back-end
pub fn c1_broker(workers: usize, stub: Arc<StubCompiler>) -> CompileBroker {
    CompileBroker::builder(single_tier(TierConfig::c1(1), workers))
        .backend(1, stub)
        .initialize()
        .unwrap()
}

/// Tier 2 broker with one C2 stub back-end
pub fn c2_broker(config: BrokerConfig, stub: Arc<StubCompiler>) -> CompileBroker {
    CompileBroker::builder(config).backend(2, stub).initialize().unwrap()
}

pub fn c2_stub(name: &str) -> StubCompiler {
    StubCompiler::new(name).with_kind(CompilerKind::C2)
}

/// Tier 1 broker over an explicit code cache
pub fn c1_broker_with_cache(config: BrokerConfig, cache: Arc<CodeCache>, stub: Arc<StubCompiler>) -> CompileBroker {
    CompileBroker::builder(config)
        .backend(1, stub)
        .code_cache(cache)
        .initialize()
        .unwrap()
}

/// Wait until every worker of `tier` reached `state`
pub fn wait_for_workers(broker: &CompileBroker, tier: Tier, state: WorkerState) -> bool {
    wait_until(WAIT, || broker.workers(tier).iter().all(|(_, s)| *s == state))
}
