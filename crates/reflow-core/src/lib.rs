//! Reflow core — a durable workflow engine with deterministic replay
//!
//! Workflows are async functions that invoke tasks through a
//! [`WorkflowCtx`]; every observable step is recorded in an append-only
//! event log, and a run can resume from the exact point it last produced
//! output after a crash, a pause, or a forced replay.
//!
//! ```no_run
//! use reflow_core::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), EngineError> {
//! let runtime = WorkflowRuntime::in_memory();
//! runtime.register(Workflow::new("hello_world", |ctx: WorkflowCtx| async move {
//!     let say_hello = Task::new("say_hello", |inv: TaskInvocation| async move {
//!         let name: String = inv.arg_as(0)?;
//!         Ok(json!(format!("Hello, {name}")))
//!     });
//!     ctx.task(&say_hello, TaskArgs::positional([ctx.input()])).await
//! }));
//!
//! let ctx = runtime
//!     .run("hello_world", RunOptions::new().with_input(json!("Joe")))
//!     .await?;
//! assert!(ctx.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod context;
pub mod errors;
pub mod event;
pub mod governor;
pub mod graph;
pub mod hashing;
pub mod output;
pub mod runtime;
pub mod scheduler;
pub mod secrets;
pub mod store;
pub mod task;
pub mod tasks;
pub mod workflow;

pub use cache::{CacheBackend, FileCacheBackend, InMemoryCacheBackend};
pub use catalog::WorkflowCatalog;
pub use config::{CatalogSettings, ExecutorSettings, ReflowConfig, SecuritySettings};
pub use context::{ContextSummary, ExecutionContext, ExecutionStatus};
pub use errors::{EngineError, FailureInfo, TimeoutScope};
pub use event::{
    pause_source_id, workflow_source_id, EventValue, ExecutionEvent, ExecutionEventKind,
    RetryState,
};
pub use governor::{ResourceGovernor, ResourceRequest};
pub use graph::{graph, TaskGraph};
pub use hashing::{canonical_json, stable_hash, stable_task_id};
pub use output::{
    InlineOutputStorage, LocalFileStorage, OutputStorage, SerializerKind, StoredValue,
};
pub use runtime::{RunOptions, WorkflowRuntime, WorkflowRuntimeBuilder};
pub use scheduler::{EngineServices, WorkflowCtx};
pub use secrets::{EncryptedFileSecretManager, EnvSecretManager, SecretManager};
pub use store::{ContextStore, InMemoryContextStore, StoreError};
pub use task::{CachePolicy, Task, TaskArgs, TaskBuilder, TaskInvocation, TaskOptions};
pub use workflow::{Workflow, WorkflowBuilder};

/// Commonly used types for building and running workflows
pub mod prelude {
    pub use crate::errors::EngineError;
    pub use crate::runtime::{RunOptions, WorkflowRuntime};
    pub use crate::scheduler::WorkflowCtx;
    pub use crate::task::{Task, TaskArgs, TaskInvocation};
    pub use crate::workflow::Workflow;
}
