//! Human-in-the-loop pauses: the run suspends at each named reference and
//! continues on the next `run` with the same execution id.
//!
//! Run with: cargo run -p reflow-core --example pause_and_resume

use reflow_core::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let runtime = WorkflowRuntime::in_memory();

    runtime.register(Workflow::new("approval_flow", |ctx: WorkflowCtx| async move {
        ctx.pause("manager_signoff").await?;
        let amount = ctx.pause_for_input("final_amount").await?;
        Ok(json!({ "approved": true, "amount": amount }))
    }));

    let first = runtime.run("approval_flow", RunOptions::new()).await?;
    println!("after run 1: {}", first.status());

    let second = runtime
        .run(
            "approval_flow",
            RunOptions::new().with_execution_id(&first.execution_id),
        )
        .await?;
    println!("after run 2: {}", second.status());

    // The third run supplies the input the workflow is waiting for
    let third = runtime
        .run(
            "approval_flow",
            RunOptions::new()
                .with_execution_id(&first.execution_id)
                .with_input(json!(1250)),
        )
        .await?;
    println!("after run 3: {} {:?}", third.status(), third.summary().output);

    Ok(())
}
