use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::time::Instant;

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;

use floodgate::Behavior;
use floodgate::Context;
use floodgate::Floodgate;
use floodgate::FlowRule;
use floodgate::Grade;
use floodgate::MilliClock;
use floodgate::Node;
use floodgate::PacerController;
use floodgate::RejectController;
use floodgate::StatConfig;
use floodgate::StatNode;
use floodgate::TrafficShaper;
use floodgate::WarmUpController;

// Thresholds high enough that nothing ever blocks or queues; we are
// measuring the bookkeeping, not the verdicts.
const LIMIT: f64 = 1_000_000_000.0;

fn bench_node_writes(c: &mut Criterion, node: Arc<StatNode>) {
    let mut group = c.benchmark_group("StatNode-Write");

    group.bench_function("single-threaded", |b| {
        b.iter(|| {
            black_box(node.as_ref()).add_pass(1);
        })
    });

    for threads in [2, 4, 8].iter() {
        let num_threads = *threads;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-threads", num_threads)),
            &num_threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let mut handles = Vec::with_capacity(n);

                    for _ in 0..n {
                        let node = Arc::clone(&node);
                        let bar = Arc::clone(&barrier);
                        let iters_per_thread = iters / n as u64;

                        handles.push(thread::spawn(move || {
                            bar.wait(); // Wait for the start signal
                            for _ in 0..iters_per_thread {
                                black_box(node.as_ref()).add_pass(1);
                            }
                        }));
                    }

                    // Synchronize the start across all threads
                    barrier.wait();
                    let start = Instant::now();

                    for handle in handles {
                        let _ = handle.join();
                    }

                    start.elapsed()
                });
            },
        );
    }
    group.finish();
}

fn bench_node_reads(c: &mut Criterion, node: Arc<StatNode>) {
    let mut group = c.benchmark_group("StatNode-Read");

    group.bench_function("pass_qps", |b| {
        b.iter(|| {
            let _ = black_box(node.as_ref()).pass_qps();
        })
    });

    group.bench_function("total_qps", |b| {
        b.iter(|| {
            let _ = black_box(node.as_ref()).total_qps();
        })
    });

    group.finish();
}

fn bench_controller(
    group_name: &str,
    c: &mut Criterion,
    controller: Arc<dyn TrafficShaper>,
    node: Arc<StatNode>,
) {
    let mut group = c.benchmark_group(group_name);

    group.bench_function("single-threaded", |b| {
        b.iter(|| {
            let _ = black_box(controller.as_ref()).check(node.as_ref(), 1, false);
        })
    });

    group.finish();
}

fn bench_gate(c: &mut Criterion, gate: Arc<Floodgate>) {
    let mut group = c.benchmark_group("Gate-EnterExit");

    group.bench_function("single-threaded", |b| {
        let mut ctx = Context::new("bench");
        b.iter(|| {
            let guard = gate.enter(&mut ctx, "bench.op").expect("never blocks");
            let _ = black_box(guard).exit(&mut ctx);
        })
    });

    for threads in [2, 4, 8].iter() {
        let num_threads = *threads;
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}-threads", num_threads)),
            &num_threads,
            |b, &n| {
                b.iter_custom(|iters| {
                    let barrier = Arc::new(Barrier::new(n + 1));
                    let mut handles = Vec::with_capacity(n);

                    for _ in 0..n {
                        let gate = Arc::clone(&gate);
                        let bar = Arc::clone(&barrier);
                        let iters_per_thread = iters / n as u64;

                        handles.push(thread::spawn(move || {
                            let mut ctx = Context::new("bench");
                            bar.wait();
                            for _ in 0..iters_per_thread {
                                let guard =
                                    gate.enter(&mut ctx, "bench.op").expect("never blocks");
                                let _ = black_box(guard).exit(&mut ctx);
                            }
                        }));
                    }

                    barrier.wait();
                    let start = Instant::now();

                    for handle in handles {
                        let _ = handle.join();
                    }

                    start.elapsed()
                });
            },
        );
    }
    group.finish();
}

fn run_all_benches(c: &mut Criterion) {
    let clock = MilliClock::new();
    let config = StatConfig::default();

    // --- 1. Raw statistics ---

    let node = Arc::new(StatNode::new(&config, clock.clone()));
    bench_node_writes(c, Arc::clone(&node));
    bench_node_reads(c, Arc::clone(&node));

    // --- 2. Individual controllers against a live node ---

    let reject: Arc<dyn TrafficShaper> = Arc::new(RejectController::new(
        LIMIT,
        Grade::Qps,
        config.occupy_timeout_ms,
        clock.clone(),
    ));
    bench_controller("Reject-Check", c, reject, Arc::clone(&node));

    let pacer: Arc<dyn TrafficShaper> =
        Arc::new(PacerController::new(LIMIT, 500, clock.clone()));
    bench_controller("Pacer-Check", c, pacer, Arc::clone(&node));

    let warm_up: Arc<dyn TrafficShaper> = Arc::new(
        WarmUpController::new(LIMIT, 10, 3, clock.clone()).expect("valid parameters"),
    );
    bench_controller("WarmUp-Check", c, warm_up, Arc::clone(&node));

    // --- 3. The whole admission path, rule table included ---

    let gate = Arc::new(
        Floodgate::with_rules(
            config,
            vec![
                FlowRule::new("bench.op", Grade::Qps, LIMIT)
                    .with_behavior(Behavior::Reject),
            ],
        )
        .expect("valid rule"),
    );
    bench_gate(c, gate);
}

criterion_group!(benches, run_all_benches);
criterion_main!(benches);
