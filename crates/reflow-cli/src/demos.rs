//! Built-in demo catalog
//!
//! A small set of workflows exercising the engine end to end: plain tasks,
//! retries with fallback, parallel fan-out, pause points, and a pipeline.
//! Selected with `reflow exec demos <workflow>`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use reflow_core::{
    tasks, EngineError, Task, TaskArgs, TaskInvocation, Workflow, WorkflowCatalog, WorkflowCtx,
};

/// The demo workflows, registered into a fresh catalog
pub fn catalog() -> Arc<WorkflowCatalog> {
    let catalog = Arc::new(WorkflowCatalog::new());

    catalog.register(Workflow::new("hello_world", |ctx: WorkflowCtx| async move {
        let say_hello = Task::new("say_hello", |inv: TaskInvocation| async move {
            let name: String = inv.arg_as(0)?;
            Ok(json!(format!("Hello, {name}")))
        });
        ctx.task(&say_hello, TaskArgs::positional([ctx.input()])).await
    }));

    catalog.register(Workflow::new("fallback_after_timeout", |ctx: WorkflowCtx| async move {
        let slow_fetch = Task::builder("slow_fetch")
            .timeout(Duration::from_secs(3))
            .fallback(|_inv| async { Ok(json!("ok")) })
            .build(|_inv| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("too late"))
            });
        ctx.task(&slow_fetch, TaskArgs::new()).await
    }));

    catalog.register(Workflow::new("task_parallel", |ctx: WorkflowCtx| async move {
        let measure = Task::new("measure_$0", |inv: TaskInvocation| async move {
            let word: String = inv.arg_as(0)?;
            Ok(json!(word.len()))
        });

        let words: Vec<String> = ctx.input_as()?;
        let inputs: Vec<Value> = words.iter().map(|w| json!(w)).collect();
        let lengths = ctx.map(&measure, inputs).await?;

        let mut result = Map::new();
        for (word, length) in words.into_iter().zip(lengths) {
            result.insert(word, length);
        }
        Ok(Value::Object(result))
    }));

    catalog.register(Workflow::new("multiple_pause_points", |ctx: WorkflowCtx| async move {
        ctx.pause("verify_setup").await?;
        ctx.pause("validate_data").await?;
        ctx.pause("final_approval").await?;
        Ok(json!("approved"))
    }));

    catalog.register(Workflow::new("simple_pipeline", |ctx: WorkflowCtx| async move {
        let add_one = Task::new("add_one", |inv: TaskInvocation| async move {
            let n: i64 = inv.arg_as(0)?;
            Ok(json!(n + 1))
        });
        let square = Task::new("square", |inv: TaskInvocation| async move {
            let n: i64 = inv.arg_as(0)?;
            Ok(json!(n * n))
        });
        tasks::pipeline(&ctx, &[add_one, square], ctx.input()).await
    }));

    catalog.register(Workflow::new("determinism", |ctx: WorkflowCtx| async move {
        let stamp = ctx.now().await?;
        let token = ctx.uuid4().await?;
        let roll = ctx.random_int(1, 6).await?;
        Ok(json!({
            "stamp": stamp.to_rfc3339(),
            "token": token,
            "roll": roll,
        }))
    }));

    catalog.register(Workflow::new("subflows", |ctx: WorkflowCtx| async move {
        let input = ctx.input();
        let greeting = ctx.subworkflow("hello_world", input).await?;
        Ok(json!({ "greeting": greeting }))
    }));

    catalog
}

/// Resolve a catalog by name; only built-in catalogs exist in the CLI
pub fn resolve(name: &str) -> Result<Arc<WorkflowCatalog>, EngineError> {
    match name {
        "demos" => Ok(catalog()),
        other => Err(EngineError::WorkflowNotFound(format!(
            "unknown catalog '{other}' (available: demos)"
        ))),
    }
}
