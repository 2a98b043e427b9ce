//! Minimal workflow: one task, one run, replay of the finished execution.
//!
//! Run with: cargo run -p reflow-core --example hello_world

use reflow_core::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let runtime = WorkflowRuntime::in_memory();

    runtime.register(Workflow::new("hello_world", |ctx: WorkflowCtx| async move {
        let say_hello = Task::new("say_hello", |inv: TaskInvocation| async move {
            let name: String = inv.arg_as(0)?;
            Ok(json!(format!("Hello, {name}")))
        });
        ctx.task(&say_hello, TaskArgs::positional([ctx.input()])).await
    }));

    let ctx = runtime
        .run("hello_world", RunOptions::new().with_input(json!("Joe")))
        .await?;

    println!("output: {:?}", ctx.summary().output);
    println!("events recorded: {}", ctx.events.len());

    // Running again with the same execution id returns the stored context
    // without re-executing the task
    let again = runtime
        .run(
            "hello_world",
            RunOptions::new().with_execution_id(&ctx.execution_id),
        )
        .await?;
    println!("replayed events: {}", again.events.len());

    Ok(())
}
