//! Jobs every registry built with [`JobRegistry::builtin`] knows.

use super::JobRegistry;
use crate::error::TaskError;
use crate::task::{TaskContext, TaskResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Iterations between cancellation checks in `sum_range`.
const CHECK_EVERY: u64 = 1 << 16;

#[derive(Deserialize)]
struct SleepInput {
    ms: u64,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct SumRangeInput {
    n: u64,
}

#[derive(Deserialize)]
struct MessageInput {
    #[serde(default)]
    message: String,
}

pub(super) fn register_all(registry: &mut JobRegistry) {
    registry
        .register_blocking("echo", |input, _| Ok(input))
        .register("sleep", sleep)
        .register_blocking("sum_range", sum_range)
        .register_blocking("fail", |input, _| {
            let input: MessageInput = serde_json::from_value(input)?;
            Err(TaskError::Failed(input.message))
        })
        .register_blocking("panic", |input, _| {
            let input: MessageInput = serde_json::from_value(input)?;
            panic!("{}", input.message)
        });
}

async fn sleep(input: Value, ctx: TaskContext) -> TaskResult {
    let input: SleepInput = serde_json::from_value(input)?;
    ctx.sleep(Duration::from_millis(input.ms)).await?;
    Ok(input.value)
}

fn sum_range(input: Value, ctx: &TaskContext) -> TaskResult {
    let input: SumRangeInput = serde_json::from_value(input)?;
    let mut total: u64 = 0;
    for i in 0..input.n {
        if i % CHECK_EVERY == 0 {
            ctx.checkpoint()?;
        }
        total = total.wrapping_add(i);
    }
    Ok(json!(total))
}
