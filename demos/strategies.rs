//! Runs the same two batches under every strategy and prints timings.
//!
//! The I/O-bound batch sleeps; every strategy overlaps the sleeps. The
//! CPU-bound batch sums large ranges; only the thread and process
//! strategies spread it over several cores.
//!
//! Run with:
//! ```bash
//! cargo build --bin taskmux-worker
//! cargo run --example strategies
//! ```

use serde_json::json;
use std::time::{Duration, Instant};
use taskmux::executor::{ExecutionRequest, Executor};
use taskmux::{ExecutionReport, OutcomeStatus, Strategy, Task, TaskKind};

const TASKS: usize = 8;

fn io_batch() -> taskmux::Result<Vec<Task>> {
    (0..TASKS)
        .map(|i| {
            Task::builder()
                .id(format!("io-{i}"))
                .job("sleep", json!({"ms": 200, "value": i}))
                .build()
        })
        .collect()
}

fn cpu_batch() -> taskmux::Result<Vec<Task>> {
    (0..TASKS)
        .map(|i| {
            Task::builder()
                .id(format!("cpu-{i}"))
                .kind(TaskKind::CpuBound)
                .job("sum_range", json!({"n": 50_000_000}))
                .build()
        })
        .collect()
}

fn print_row(label: &str, strategy: Strategy, report: &ExecutionReport, wall: Duration) {
    println!(
        "   {label:<4} {:<12} {:>10}  {}/{} ok  ({:?})",
        strategy.as_str(),
        format!("{wall:.1?}"),
        report.count(OutcomeStatus::Success),
        report.len(),
        report.overall_status()
    );
}

#[tokio::main]
async fn main() -> taskmux::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    println!("=== taskmux: one batch, three strategies ===\n");
    let executor = Executor::new();

    for strategy in Strategy::ALL {
        let caps = strategy.capabilities();
        println!(
            "{strategy}: cpu_parallelism={} isolates_memory={} forced_cancellation={}",
            caps.provides_cpu_parallelism, caps.isolates_memory, caps.forced_cancellation
        );

        for (label, tasks) in [("io", io_batch()?), ("cpu", cpu_batch()?)] {
            let request = ExecutionRequest::builder()
                .tasks(tasks)
                .strategy(strategy)
                .max_concurrency(4)
                .timeout(Duration::from_secs(60))
                .build()?;

            let start = Instant::now();
            match executor.execute(request).await {
                Ok(report) => print_row(label, strategy, &report, start.elapsed()),
                Err(e) => println!("   {label:<4} {:<12} skipped: {e}", strategy.as_str()),
            }
        }
        println!();
    }

    Ok(())
}
