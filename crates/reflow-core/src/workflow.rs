//! Workflow definitions
//!
//! A workflow is an async function driven by the scheduler through a
//! [`WorkflowCtx`]. Within the body, every suspension point is a context
//! method (task invocation, parallel group, sleep, pause, subworkflow);
//! no other ambient suspension is permitted, and non-deterministic
//! primitives must go through the engine-provided helper tasks so replay
//! retakes the same control-flow path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::errors::EngineError;
use crate::output::OutputStorage;
use crate::scheduler::WorkflowCtx;

/// Future returned by workflow functions
pub type WorkflowFuture = BoxFuture<'static, Result<Value, EngineError>>;

/// A workflow body
pub type WorkflowFn = Arc<dyn Fn(WorkflowCtx) -> WorkflowFuture + Send + Sync>;

struct WorkflowInner {
    name: String,
    version: u32,
    timeout: Duration,
    output_storage: Option<Arc<dyn OutputStorage>>,
    func: WorkflowFn,
}

/// A named, versioned workflow program
#[derive(Clone)]
pub struct Workflow {
    inner: Arc<WorkflowInner>,
}

impl Workflow {
    /// Create a workflow with default options (version 1, no timeout)
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        Self::builder(name).build(func)
    }

    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            version: 1,
            timeout: Duration::ZERO,
            output_storage: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    /// Workflow-level wall-clock budget (zero = unbounded)
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn output_storage(&self) -> Option<Arc<dyn OutputStorage>> {
        self.inner.output_storage.clone()
    }

    pub(crate) fn call(&self, ctx: WorkflowCtx) -> WorkflowFuture {
        (self.inner.func)(ctx)
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Builder for [`Workflow`]
pub struct WorkflowBuilder {
    name: String,
    version: u32,
    timeout: Duration,
    output_storage: Option<Arc<dyn OutputStorage>>,
}

impl WorkflowBuilder {
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_storage(mut self, storage: Arc<dyn OutputStorage>) -> Self {
        self.output_storage = Some(storage);
        self
    }

    pub fn build<F, Fut>(self, func: F) -> Workflow
    where
        F: Fn(WorkflowCtx) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        Workflow {
            inner: Arc::new(WorkflowInner {
                name: self.name,
                version: self.version,
                timeout: self.timeout,
                output_storage: self.output_storage,
                func: Arc::new(move |ctx| Box::pin(func(ctx))),
            }),
        }
    }
}
