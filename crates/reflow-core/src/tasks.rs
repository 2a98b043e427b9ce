//! Engine-provided tasks
//!
//! Workflow bodies must not call non-deterministic primitives directly
//! (clock, randomness, uuid, sleep, outbound I/O). These helpers wrap them
//! as tasks: the first run records the produced value in the event log, and
//! replay re-serves the recorded value, so a replayed workflow takes the
//! identical control-flow path.
//!
//! Identical invocations (same helper, same arguments) share one stable id
//! and therefore one recorded value; vary an argument to obtain independent
//! samples.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

use crate::errors::EngineError;
use crate::scheduler::WorkflowCtx;
use crate::task::{Task, TaskArgs, TaskInvocation};

/// Current wall-clock instant, recorded on first run
pub fn now() -> Task {
    Task::new("now", |_inv| async { Ok(json!(Utc::now().to_rfc3339())) })
}

/// Random v4 UUID, recorded on first run
pub fn uuid4() -> Task {
    Task::new("uuid4", |_inv| async {
        Ok(json!(uuid::Uuid::new_v4().to_string()))
    })
}

/// Random integer in `[a, b]`, recorded on first run
pub fn random_int() -> Task {
    Task::new("random_int", |inv: TaskInvocation| async move {
        let a: i64 = inv.arg_as(0)?;
        let b: i64 = inv.arg_as(1)?;
        if a > b {
            return Err(EngineError::Execution(format!(
                "random_int: empty range [{a}, {b}]"
            )));
        }
        Ok(json!(rand::thread_rng().gen_range(a..=b)))
    })
}

/// Random value from `start, start+step, … < stop`, recorded on first run
pub fn random_range() -> Task {
    Task::new("random_range", |inv: TaskInvocation| async move {
        let start: i64 = inv.arg_as(0)?;
        let stop: i64 = inv.arg_as(1)?;
        let step: i64 = inv.arg(2).map_or(Ok(1), |v| {
            serde_json::from_value(v.clone()).map_err(EngineError::from)
        })?;

        if step <= 0 || stop <= start {
            return Err(EngineError::Execution(format!(
                "random_range: empty range [{start}, {stop}) step {step}"
            )));
        }

        let span = (stop - start + step - 1) / step;
        let index = rand::thread_rng().gen_range(0..span);
        Ok(json!(start + index * step))
    })
}

/// Durable sleep: waits on first run, skips instantly on replay
pub fn sleep() -> Task {
    Task::new("sleep_$0", |inv: TaskInvocation| async move {
        let seconds: f64 = inv.arg_as(0)?;
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        Ok(json!(seconds))
    })
}

/// Run another workflow as a child execution and return its output
pub fn call_workflow() -> Task {
    Task::new("call_workflow_$0", |inv: TaskInvocation| async move {
        let name: String = inv.arg_as(0)?;
        let input = inv.arg(1).cloned().unwrap_or(Value::Null);
        inv.ctx.run_child_workflow(name, input).await
    })
}

/// Run several task invocations concurrently, results in input order
pub async fn parallel(
    ctx: &WorkflowCtx,
    calls: Vec<(Task, TaskArgs)>,
) -> Result<Vec<Value>, EngineError> {
    ctx.join(calls).await
}

/// Thread a value through a sequence of stages, each receiving the previous
/// stage's output as its single positional argument
pub async fn pipeline(
    ctx: &WorkflowCtx,
    stages: &[Task],
    input: Value,
) -> Result<Value, EngineError> {
    let mut value = input;
    for stage in stages {
        value = ctx.task(stage, TaskArgs::positional([value])).await?;
    }
    Ok(value)
}

impl WorkflowCtx {
    /// Deterministic wall-clock read (see [`now`])
    pub async fn now(&self) -> Result<DateTime<Utc>, EngineError> {
        let value = self.task(&now(), TaskArgs::new()).await?;
        let raw: String = serde_json::from_value(value)?;
        raw.parse()
            .map_err(|e| EngineError::Execution(format!("invalid recorded instant: {e}")))
    }

    /// Deterministic UUID (see [`uuid4`])
    pub async fn uuid4(&self) -> Result<String, EngineError> {
        let value = self.task(&uuid4(), TaskArgs::new()).await?;
        serde_json::from_value(value).map_err(EngineError::from)
    }

    /// Deterministic random integer in `[a, b]`
    pub async fn random_int(&self, a: i64, b: i64) -> Result<i64, EngineError> {
        let value = self
            .task(&random_int(), TaskArgs::positional([json!(a), json!(b)]))
            .await?;
        serde_json::from_value(value).map_err(EngineError::from)
    }

    /// Deterministic random value from a stepped range
    pub async fn random_range(
        &self,
        start: i64,
        stop: i64,
        step: i64,
    ) -> Result<i64, EngineError> {
        let value = self
            .task(
                &random_range(),
                TaskArgs::positional([json!(start), json!(stop), json!(step)]),
            )
            .await?;
        serde_json::from_value(value).map_err(EngineError::from)
    }

    /// Durable sleep (skipped on replay)
    pub async fn sleep(&self, duration: Duration) -> Result<(), EngineError> {
        self.task(
            &sleep(),
            TaskArgs::positional([json!(duration.as_secs_f64())]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RunOptions, WorkflowRuntime};
    use crate::workflow::Workflow;

    #[tokio::test]
    async fn test_now_is_recorded_and_replayed() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("clock", |ctx: WorkflowCtx| async move {
            let instant = ctx.now().await?;
            Ok(json!(instant.to_rfc3339()))
        }));

        let first = runtime.run("clock", RunOptions::new()).await.unwrap();
        let output = first.output().and_then(|v| v.as_data()).cloned().unwrap();

        let replayed = runtime
            .run(
                "clock",
                RunOptions::new()
                    .with_execution_id(&first.execution_id)
                    .force_replay(),
            )
            .await
            .unwrap();

        // The recorded instant is re-served, not re-read
        assert_eq!(
            replayed.output().and_then(|v| v.as_data()),
            Some(&output)
        );
    }

    #[tokio::test]
    async fn test_random_int_bounds() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("dice", |ctx: WorkflowCtx| async move {
            let roll = ctx.random_int(1, 6).await?;
            Ok(json!(roll))
        }));

        let ctx = runtime.run("dice", RunOptions::new()).await.unwrap();
        let roll = ctx
            .output()
            .and_then(|v| v.as_data())
            .and_then(|v| v.as_i64())
            .unwrap();
        assert!((1..=6).contains(&roll));
    }

    #[tokio::test]
    async fn test_random_range_respects_step() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("stepped", |ctx: WorkflowCtx| async move {
            let value = ctx.random_range(10, 20, 5).await?;
            Ok(json!(value))
        }));

        let ctx = runtime.run("stepped", RunOptions::new()).await.unwrap();
        let value = ctx
            .output()
            .and_then(|v| v.as_data())
            .and_then(|v| v.as_i64())
            .unwrap();
        assert!(value == 10 || value == 15);
    }

    #[tokio::test]
    async fn test_uuid4_shape() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("ident", |ctx: WorkflowCtx| async move {
            let id = ctx.uuid4().await?;
            Ok(json!(id))
        }));

        let ctx = runtime.run("ident", RunOptions::new()).await.unwrap();
        let id = ctx
            .output()
            .and_then(|v| v.as_data())
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_pipeline_threads_value() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("sum_chain", |ctx: WorkflowCtx| async move {
            let add_one = Task::new("add_one", |inv: TaskInvocation| async move {
                let n: i64 = inv.arg_as(0)?;
                Ok(json!(n + 1))
            });
            let double = Task::new("double", |inv: TaskInvocation| async move {
                let n: i64 = inv.arg_as(0)?;
                Ok(json!(n * 2))
            });
            pipeline(&ctx, &[add_one, double], ctx.input()).await
        }));

        let ctx = runtime
            .run("sum_chain", RunOptions::new().with_input(json!(4)))
            .await
            .unwrap();
        assert_eq!(ctx.output().and_then(|v| v.as_data()), Some(&json!(10)));
    }

    #[tokio::test]
    async fn test_call_workflow_records_child_output() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("child", |ctx: WorkflowCtx| async move {
            Ok(json!(format!("child got {}", ctx.input())))
        }));
        runtime.register(Workflow::new("parent", |ctx: WorkflowCtx| async move {
            ctx.subworkflow("child", json!(7)).await
        }));

        let ctx = runtime.run("parent", RunOptions::new()).await.unwrap();
        assert_eq!(
            ctx.output().and_then(|v| v.as_data()),
            Some(&json!("child got 7"))
        );

        // The child ran as its own persisted execution
        let started = ctx
            .events
            .iter()
            .find(|e| e.name == "call_workflow_child")
            .unwrap();
        assert!(started.source_id.starts_with("call_workflow_child_"));
    }

    #[tokio::test]
    async fn test_call_workflow_unknown_child_fails_task() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("parent", |ctx: WorkflowCtx| async move {
            ctx.subworkflow("ghost", Value::Null).await
        }));

        let ctx = runtime.run("parent", RunOptions::new()).await.unwrap();
        assert!(ctx.failed());
    }
}
