use compile_broker::{
    BrokerConfig, ClassHolder, CompileBroker, CompileReason, CompileRequest, Method, MethodHandle, StubCompiler,
    TierConfig, INVOCATION_ENTRY_BCI,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

const BATCH: usize = 256;

fn broker(workers: usize) -> CompileBroker {
    let tier = TierConfig::c1(1).with_workers(workers);
    let mut config = BrokerConfig::single_tier(tier);
    config.max_live_tasks = BATCH * 2;
    CompileBroker::builder(config)
        .backend(1, Arc::new(StubCompiler::new("c1")))
        .initialize()
        .unwrap()
}

fn methods(count: usize) -> Vec<MethodHandle> {
    let holder = ClassHolder::new("Bench");
    (0..count)
        .map(|i| Method::builder(&holder, format!("m{i}")).bytecode_size(64).build())
        .collect()
}

fn bench_submit_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_and_drain");
    group.throughput(Throughput::Elements(BATCH as u64));

    for workers in [1, 2, 4] {
        let broker = broker(workers);
        let events = broker.subscribe();
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter_batched(
                || methods(BATCH),
                |batch| {
                    for m in batch {
                        broker.try_request_compile(CompileRequest::new(m, 1));
                    }
                    for _ in 0..BATCH {
                        events.recv_timeout(Duration::from_secs(10)).unwrap();
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_already_compiled(c: &mut Criterion) {
    let broker = broker(1);
    let m = methods(1).remove(0);
    broker
        .request_compile(&m, INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, true)
        .unwrap();

    c.bench_function("request_already_compiled", |b| {
        b.iter(|| broker.request_compile(black_box(&m), INVOCATION_ENTRY_BCI, 1, 0, CompileReason::Normal, false))
    });
}

criterion_group!(benches, bench_submit_and_drain, bench_already_compiled);
criterion_main!(benches);
