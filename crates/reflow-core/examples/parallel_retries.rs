//! Parallel fan-out combined with retry and fallback policies.
//!
//! Run with: cargo run -p reflow-core --example parallel_retries

use std::time::Duration;

use reflow_core::prelude::*;
use serde_json::{json, Value};

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let runtime = WorkflowRuntime::in_memory();

    runtime.register(Workflow::new("inventory_check", |ctx: WorkflowCtx| async move {
        let check = Task::builder("check_$0")
            .retry_max_attempts(2)
            .retry_delay(Duration::from_millis(100))
            .fallback(|inv: TaskInvocation| async move {
                // Unreachable warehouses report unknown stock
                let warehouse: String = inv.arg_as(0)?;
                Ok(json!({ "warehouse": warehouse, "stock": Value::Null }))
            })
            .build(|inv: TaskInvocation| async move {
                let warehouse: String = inv.arg_as(0)?;
                if warehouse == "offline-site" {
                    return Err(EngineError::Execution("unreachable".to_string()));
                }
                Ok(json!({ "warehouse": warehouse, "stock": warehouse.len() * 10 }))
            });

        let warehouses = [json!("north"), json!("south"), json!("offline-site")];
        let stocks = ctx.map(&check, warehouses).await?;
        Ok(json!(stocks))
    }));

    let ctx = runtime.run("inventory_check", RunOptions::new()).await?;
    println!("output: {:#?}", ctx.summary().output);

    for event in &ctx.events {
        println!("{:<25} {}", event.kind.to_string(), event.source_id);
    }

    Ok(())
}
