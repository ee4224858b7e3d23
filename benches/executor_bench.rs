#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_truncation)]
//! Executor benchmarks comparing the three strategies

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use taskmux::executor::{ExecutionRequest, Executor};
use taskmux::{ExecutorConfig, Strategy, Task, TaskKind};

fn executor() -> Executor {
    // The worker binary is resolved from the parent of the bench's directory.
    Executor::builder().config(ExecutorConfig::from_env()).build()
}

fn batch(num_tasks: usize, job: &str, input: &serde_json::Value, kind: TaskKind) -> Vec<Task> {
    (0..num_tasks)
        .map(|i| {
            Task::builder()
                .id(format!("task_{i}"))
                .kind(kind)
                .job(job, input.clone())
                .build()
                .unwrap()
        })
        .collect()
}

/// Per-task overhead of each strategy with a trivial payload
fn bench_dispatch_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_overhead");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor = executor();

    for strategy in [Strategy::Thread, Strategy::Cooperative] {
        for num_tasks in [10, 100, 1000] {
            group.throughput(Throughput::Elements(num_tasks as u64));
            group.bench_with_input(
                BenchmarkId::new(strategy.as_str(), num_tasks),
                &num_tasks,
                |b, &num_tasks| {
                    b.iter(|| {
                        rt.block_on(async {
                            let request = ExecutionRequest::builder()
                                .tasks(batch(num_tasks, "echo", &json!(null), TaskKind::IoBound))
                                .strategy(strategy)
                                .max_concurrency(8)
                                .build()
                                .unwrap();
                            black_box(executor.execute(request).await.unwrap())
                        })
                    });
                },
            );
        }
    }
    group.finish();
}

/// CPU-bound batch: thread and process should scale, cooperative should not
fn bench_cpu_bound(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_bound");
    group.sample_size(10);
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor = executor();
    let workers = num_cpus::get().min(8);

    for strategy in Strategy::ALL {
        group.bench_function(strategy.as_str(), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let request = ExecutionRequest::builder()
                        .tasks(batch(
                            workers * 2,
                            "sum_range",
                            &json!({"n": 2_000_000}),
                            TaskKind::CpuBound,
                        ))
                        .strategy(strategy)
                        .max_concurrency(workers)
                        .build()
                        .unwrap();
                    black_box(executor.execute(request).await.unwrap())
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch_overhead, bench_cpu_bound);
criterion_main!(benches);
