//! Drive the broker with a synthetic tiered workload (`cbroker simulate`).
//!
//! Application threads call hot methods and escalate them from the cheapest
//! configured tier to the most expensive one once cheap code exists. A small
//! share of requests are OSR or blocking. Optionally a checkpoint/restore
//! window decompiles part of the code and replays it afterwards.

use super::load_config;
use anyhow::{anyhow, bail, Context};
use compile_broker::{
    ClassHolder, CompileBroker, CompileReason, CompileRequest, CompilerKind, DirectivesStack, Method,
    MethodHandle, RecompilationRecorder, ReplaySummary, RequestOutcome, StubCompiler, Tier, INVOCATION_ENTRY_BCI,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const CLASSES: usize = 16;

/// Options for one simulation run
pub struct SimulateOptions {
    pub config: Option<PathBuf>,
    pub directives: Option<PathBuf>,
    pub methods: usize,
    pub threads: usize,
    pub requests: usize,
    pub blocking_ratio: f64,
    pub compile_us: u64,
    pub restore_cycle: bool,
    pub seed: Option<u64>,
    pub json: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    installed: u64,
    queued: u64,
    failed: u64,
    abandoned: u64,
    rejected: u64,
}

impl Tally {
    fn count(&mut self, outcome: &RequestOutcome) {
        match outcome {
            RequestOutcome::Installed(_) => self.installed += 1,
            RequestOutcome::Queued { .. } => self.queued += 1,
            RequestOutcome::Failed { .. } => self.failed += 1,
            RequestOutcome::Abandoned { .. } => self.abandoned += 1,
            RequestOutcome::Rejected(_) => self.rejected += 1,
        }
    }

    fn merge(&mut self, other: Tally) {
        self.installed += other.installed;
        self.queued += other.queued;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
        self.rejected += other.rejected;
    }

    fn total(&self) -> u64 {
        self.installed + self.queued + self.failed + self.abandoned + self.rejected
    }
}

pub fn execute(opts: SimulateOptions) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&opts.blocking_ratio) {
        bail!("--blocking-ratio must be between 0 and 1, got {}", opts.blocking_ratio);
    }
    if opts.methods == 0 || opts.threads == 0 {
        bail!("--methods and --threads must be non-zero");
    }

    let config = load_config(opts.config.as_deref())?;
    let seed = opts.seed.unwrap_or_else(rand::random);

    let mut builder = CompileBroker::builder(config.clone()).recorder(RecompilationRecorder::global());
    for tier in config.tiers.iter().filter(|t| t.enabled) {
        let delay = Duration::from_micros(opts.compile_us * cost_factor(tier.compiler));
        let stub = StubCompiler::new(format!("{} stub", tier.compiler.name()))
            .with_kind(tier.compiler)
            .with_delay(delay);
        builder = builder.backend(tier.level, Arc::new(stub));
    }
    if let Some(path) = &opts.directives {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let stack = Arc::new(DirectivesStack::new());
        stack
            .push_json(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        builder = builder.directives(stack);
    }

    let broker = CompileBroker::install_global(builder.initialize()?)
        .map_err(|_| anyhow!("a compile broker is already installed"))?;
    let tiers = broker.tiers();
    let (Some(&low), Some(&high)) = (tiers.first(), tiers.last()) else {
        bail!("no tiers configured");
    };
    tracing::info!(seed, ?tiers, "starting simulation");

    let methods = build_methods(opts.methods);
    let started = Instant::now();
    let tally = run_workload(broker, &methods, &opts, seed, low, high)?;
    drain(broker)?;
    let elapsed = started.elapsed();

    let replay = if opts.restore_cycle {
        let summary = restore_cycle(broker, &methods)?;
        drain(broker)?;
        Some(summary)
    } else {
        None
    };

    if opts.json {
        print_json(broker, &tally, replay.as_ref(), seed, elapsed)?;
    } else {
        print_text(broker, &tally, replay.as_ref(), seed, elapsed);
    }
    broker.shutdown();
    Ok(())
}

fn cost_factor(kind: CompilerKind) -> u64 {
    match kind {
        CompilerKind::C1 => 1,
        CompilerKind::C2 => 5,
        CompilerKind::External => 10,
    }
}

fn build_methods(count: usize) -> Vec<MethodHandle> {
    let classes: Vec<Arc<ClassHolder>> = (0..CLASSES.min(count))
        .map(|i| ClassHolder::new(format!("app/Class{i}")))
        .collect();
    (0..count)
        .map(|i| {
            Method::builder(&classes[i % classes.len()], format!("method{i}"))
                .bytecode_size(16 + (i * 37) % 900)
                .build()
        })
        .collect()
}

fn run_workload(
    broker: &'static CompileBroker,
    methods: &[MethodHandle],
    opts: &SimulateOptions,
    seed: u64,
    low: Tier,
    high: Tier,
) -> anyhow::Result<Tally> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(opts.threads);
        for i in 0..opts.threads {
            let handle = thread::Builder::new()
                .name(format!("app-{i}"))
                .spawn_scoped(scope, move || {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                    let mut tally = Tally::default();
                    for _ in 0..opts.requests {
                        let request = next_request(&mut rng, methods, opts.blocking_ratio, low, high);
                        tally.count(&broker.try_request_compile(request));
                    }
                    tally
                })?;
            handles.push(handle);
        }

        let mut total = Tally::default();
        for handle in handles {
            let tally = handle.join().map_err(|_| anyhow!("application thread panicked"))?;
            total.merge(tally);
        }
        Ok(total)
    })
}

fn next_request(rng: &mut StdRng, methods: &[MethodHandle], blocking_ratio: f64, low: Tier, high: Tier) -> CompileRequest {
    // Squaring skews the pick toward the first methods
    let r: f64 = rng.gen();
    let method = methods[((r * r) * methods.len() as f64) as usize % methods.len()].clone();

    let tier = match method.code() {
        Some(code) if code.tier() == low => high,
        _ => low,
    };
    let mut request = CompileRequest::new(method, tier)
        .hot_count(rng.gen_range(1..10_000))
        .blocking(rng.gen_bool(blocking_ratio));
    if rng.gen_ratio(1, 10) {
        request = request.osr(rng.gen_range(1..64)).reason(CompileReason::BackedgeCount);
    } else {
        request = request.reason(CompileReason::Tiered);
    }
    request
}

fn drain(broker: &CompileBroker) -> anyhow::Result<()> {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let queued: usize = broker
            .tiers()
            .into_iter()
            .filter_map(|tier| broker.queue_stats(tier))
            .map(|q| q.size)
            .sum();
        if queued == 0 && broker.task_pool_stats().live == 0 {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("compile queues did not drain: {} tasks queued", queued);
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn restore_cycle(broker: &CompileBroker, methods: &[MethodHandle]) -> anyhow::Result<ReplaySummary> {
    let recorder = RecompilationRecorder::global();
    recorder.begin_recording()?;
    let mut decompiled = 0;
    for method in methods.iter().step_by(4) {
        if let Some(code) = method.code() {
            if broker.decompile(method, INVOCATION_ENTRY_BCI, code.tier()) {
                decompiled += 1;
            }
        }
    }
    tracing::info!(decompiled, recorded = recorder.record_count(), "restore window closing");
    Ok(recorder.finish_and_replay(broker)?)
}

fn print_text(broker: &CompileBroker, tally: &Tally, replay: Option<&ReplaySummary>, seed: u64, elapsed: Duration) {
    let stats = broker.stats();
    let pool = broker.task_pool_stats();

    println!("seed {}  elapsed {:.3}s", seed, elapsed.as_secs_f64());
    println!(
        "requests {}: installed {}  queued {}  failed {}  abandoned {}  rejected {}",
        tally.total(),
        tally.installed,
        tally.queued,
        tally.failed,
        tally.abandoned,
        tally.rejected
    );
    println!();
    println!("{:<6} {:>9} {:>9} {:>8} {:>12} {:>10} {:>8}", "tier", "compiles", "bailouts", "osr", "code bytes", "total ms", "workers");
    for tier in broker.tiers() {
        let t = stats.tiers.get(&tier).cloned().unwrap_or_default();
        println!(
            "{:<6} {:>9} {:>9} {:>8} {:>12} {:>10.1} {:>4}/{:<3}",
            tier,
            t.success_count,
            t.bailout_count,
            t.osr_count,
            t.total_code_size,
            t.total_time.as_secs_f64() * 1000.0,
            broker.worker_count(tier),
            broker.peak_worker_count(tier),
        );
    }
    println!();
    println!(
        "tasks: allocated {}  recycled {}  peak live {}  freed by worker {} / requester {} / stale {}",
        pool.allocated, pool.recycled, pool.peak_live, pool.freed_by_worker, pool.freed_by_requester, pool.freed_stale
    );
    println!(
        "code cache: {} bytes in {} regions, full {} times (stopped {}, restarted {})",
        broker.code_cache().total_used(),
        broker.code_cache().region_count(),
        stats.code_cache_full_count,
        stats.stopped_count,
        stats.restarted_count
    );
    if !stats.last_method.is_empty() {
        println!("last compiled: {}", stats.last_method);
    }
    if let Some(reason) = &stats.last_failure_reason {
        println!("last failure: {} ({})", stats.last_failed_method, reason);
    }
    if let Some(replay) = replay {
        println!(
            "restore replay: submitted {}  queued {}  skipped unloaded {}",
            replay.submitted, replay.queued, replay.skipped_unloaded
        );
    }
}

fn print_json(
    broker: &CompileBroker,
    tally: &Tally,
    replay: Option<&ReplaySummary>,
    seed: u64,
    elapsed: Duration,
) -> anyhow::Result<()> {
    let pool = broker.task_pool_stats();
    let tiers: Vec<_> = broker
        .tiers()
        .into_iter()
        .map(|tier| {
            json!({
                "tier": tier,
                "queue": broker.queue_stats(tier),
                "backend": broker.backend_stats(tier),
                "workers": broker.worker_count(tier),
                "peak_workers": broker.peak_worker_count(tier),
            })
        })
        .collect();

    let report = json!({
        "seed": seed,
        "elapsed_ms": elapsed.as_millis() as u64,
        "requests": {
            "installed": tally.installed,
            "queued": tally.queued,
            "failed": tally.failed,
            "abandoned": tally.abandoned,
            "rejected": tally.rejected,
        },
        "stats": broker.stats(),
        "tiers": tiers,
        "task_pool": {
            "allocated": pool.allocated,
            "recycled": pool.recycled,
            "freed_by_worker": pool.freed_by_worker,
            "freed_by_requester": pool.freed_by_requester,
            "freed_stale": pool.freed_stale,
            "live": pool.live,
            "peak_live": pool.peak_live,
        },
        "code_cache": {
            "used": broker.code_cache().total_used(),
            "regions": broker.code_cache().region_count(),
            "full_count": broker.code_cache().full_count(),
        },
        "replay": replay.map(|r| json!({
            "submitted": r.submitted,
            "queued": r.queued,
            "skipped_unloaded": r.skipped_unloaded,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
