//! Workflow runtime
//!
//! The outer envelope around the scheduler. It owns the run lifecycle:
//! load-or-create the context, emit `WORKFLOW_STARTED` (idempotently),
//! append `WORKFLOW_RESUMED` when continuing a paused run, drive the
//! workflow body, and close the log with exactly one terminal event.
//! The pause control signal is trapped here and is not a failure; a failed
//! workflow is still a completed persisted record.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{info, instrument};

use crate::cache::{CacheBackend, FileCacheBackend};
use crate::catalog::WorkflowCatalog;
use crate::config::ReflowConfig;
use crate::context::ExecutionContext;
use crate::errors::{EngineError, FailureInfo, TimeoutScope};
use crate::event::{
    pause_source_id, workflow_source_id, EventValue, ExecutionEvent, ExecutionEventKind,
};
use crate::governor::ResourceGovernor;
use crate::output::{LocalFileStorage, OutputStorage};
use crate::scheduler::{EngineServices, RunState, WorkflowCtx};
use crate::secrets::{EncryptedFileSecretManager, EnvSecretManager, SecretManager};
use crate::store::{ContextStore, InMemoryContextStore, StoreError};
use crate::workflow::Workflow;

/// Options for one `run` call
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Workflow input for a new run, or the replacement input supplied when
    /// resuming a pause-with-input point
    pub input: Option<Value>,

    /// Attach to an existing execution instead of creating a new one
    pub execution_id: Option<String>,

    /// Re-drive a finished execution against its own log
    pub force_replay: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn force_replay(mut self) -> Self {
        self.force_replay = true;
        self
    }
}

/// The workflow engine façade
pub struct WorkflowRuntime {
    services: Arc<EngineServices>,
}

impl WorkflowRuntime {
    pub fn new(services: Arc<EngineServices>) -> Self {
        Self { services }
    }

    /// Runtime with in-memory collaborators (tests, single-process use)
    pub fn in_memory() -> Self {
        Self::new(Arc::new(EngineServices::with_defaults(
            ReflowConfig::default(),
        )))
    }

    pub fn builder() -> WorkflowRuntimeBuilder {
        WorkflowRuntimeBuilder::new()
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.services.catalog
    }

    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.services.store
    }

    /// Register a workflow in the catalog
    pub fn register(&self, workflow: Workflow) {
        self.services.catalog.register(workflow);
    }

    /// Execute a workflow
    ///
    /// - No `execution_id`: create a new context and run.
    /// - With `execution_id` and a finished context: return it unchanged,
    ///   unless `force_replay` re-drives it against its own log.
    /// - With `execution_id` and a paused context: append
    ///   `WORKFLOW_RESUMED` (rewriting the input if one is supplied) and
    ///   continue from the pause point.
    #[instrument(skip(self, options), fields(workflow = name))]
    pub async fn run(
        &self,
        name: &str,
        options: RunOptions,
    ) -> Result<ExecutionContext, EngineError> {
        let workflow = self.services.catalog.get(name)?;

        match options.execution_id {
            None => {
                let ctx =
                    ExecutionContext::new(name, options.input.unwrap_or(Value::Null));
                info!(execution_id = %ctx.execution_id, "starting new execution");
                self.services.store.save(&ctx).await?;
                drive(self.services.clone(), workflow, ctx, None, false).await
            }
            Some(execution_id) => {
                let ctx = self
                    .services
                    .store
                    .get(&execution_id)
                    .await
                    .map_err(|e| match e {
                        StoreError::ContextNotFound(id) => EngineError::ContextNotFound(id),
                        other => EngineError::Store(other),
                    })?;

                if ctx.finished() && !options.force_replay {
                    info!(%execution_id, "returning stored finished execution");
                    return Ok(ctx);
                }

                drive(
                    self.services.clone(),
                    workflow,
                    ctx,
                    options.input,
                    options.force_replay,
                )
                .await
            }
        }
    }

    /// Fetch a stored context without running anything
    pub async fn inspect(&self, execution_id: &str) -> Result<ExecutionContext, EngineError> {
        self.services
            .store
            .get(execution_id)
            .await
            .map_err(|e| match e {
                StoreError::ContextNotFound(id) => EngineError::ContextNotFound(id),
                other => EngineError::Store(other),
            })
    }
}

/// Drive one workflow execution to completion, pause, or failure.
///
/// Boxed so `call_workflow` can recurse through the same envelope.
pub(crate) fn drive(
    services: Arc<EngineServices>,
    workflow: Workflow,
    mut ctx: ExecutionContext,
    resume_input: Option<Value>,
    force_replay: bool,
) -> BoxFuture<'static, Result<ExecutionContext, EngineError>> {
    Box::pin(async move {
        if ctx.finished() && !force_replay {
            return Ok(ctx);
        }

        let wf_source = workflow_source_id(&ctx.name, &ctx.execution_id);

        // Restore the pause balance before handing tokens to the body
        if ctx.paused() {
            let (pause_source, reference) = match ctx.last_pause() {
                Some(pause) => (
                    pause.source_id.clone(),
                    pause.value.as_data().cloned().unwrap_or(Value::Null),
                ),
                None => (pause_source_id(&wf_source, "unknown"), Value::Null),
            };

            if let Some(input) = resume_input {
                ctx.input = input;
            }

            let name = ctx.name.clone();
            ctx.append(ExecutionEvent::new(
                ExecutionEventKind::WorkflowResumed,
                pause_source,
                name,
                EventValue::data(reference),
            ));
        }

        // First event of any non-empty log
        if !ctx.started() {
            let name = ctx.name.clone();
            let input = ctx.input.clone();
            ctx.append(ExecutionEvent::new(
                ExecutionEventKind::WorkflowStarted,
                &wf_source,
                name,
                EventValue::data(input),
            ));
        }

        let state = Arc::new(RunState {
            execution_id: ctx.execution_id.clone(),
            workflow_name: ctx.name.clone(),
            input: ctx.input.clone(),
            ctx: tokio::sync::Mutex::new(ctx),
            services: services.clone(),
        });
        let wf_ctx = WorkflowCtx::new(state.clone());

        {
            let snapshot = state.ctx.lock().await.clone();
            services.store.save(&snapshot).await?;
        }

        // Drive the body, bounded by the workflow-level budget
        let body = workflow.call(wf_ctx);
        let result = if workflow.timeout().is_zero() {
            body.await
        } else {
            match tokio::time::timeout(workflow.timeout(), body).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    scope: TimeoutScope::Workflow,
                    name: state.workflow_name.clone(),
                    id: state.execution_id.clone(),
                    seconds: workflow.timeout().as_secs(),
                }),
            }
        };

        // Exactly one terminal event closes the log
        let mut finished = state.ctx.lock().await.clone();
        let name = finished.name.clone();
        match result {
            Ok(output) => {
                if !finished.finished() {
                    let payload = match workflow.output_storage() {
                        Some(storage) => EventValue::Stored {
                            output: storage.store(&wf_source, output)?,
                        },
                        None => EventValue::data(output),
                    };
                    finished.append(ExecutionEvent::new(
                        ExecutionEventKind::WorkflowCompleted,
                        &wf_source,
                        name,
                        payload,
                    ));
                }
            }
            Err(EngineError::Paused { reference }) => {
                let pause_source = pause_source_id(&wf_source, &reference);
                if !finished.contains(&pause_source, ExecutionEventKind::WorkflowPaused) {
                    finished.append(ExecutionEvent::new(
                        ExecutionEventKind::WorkflowPaused,
                        pause_source,
                        name,
                        EventValue::data(Value::String(reference)),
                    ));
                }
            }
            Err(error) => {
                if !finished.finished() {
                    finished.append(ExecutionEvent::new(
                        ExecutionEventKind::WorkflowFailed,
                        &wf_source,
                        name,
                        EventValue::Failure {
                            error: FailureInfo::from_error(&error),
                        },
                    ));
                }
            }
        }

        services.store.save(&finished).await?;
        Ok(finished)
    })
}

/// Builder assembling the engine's collaborators
pub struct WorkflowRuntimeBuilder {
    config: ReflowConfig,
    store: Option<Arc<dyn ContextStore>>,
    secrets: Option<Arc<dyn SecretManager>>,
    output_storage: Option<Arc<dyn OutputStorage>>,
    cache: Option<Arc<dyn CacheBackend>>,
    catalog: Option<Arc<WorkflowCatalog>>,
}

impl WorkflowRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: ReflowConfig::default(),
            store: None,
            secrets: None,
            output_storage: None,
            cache: None,
            catalog: None,
        }
    }

    pub fn config(mut self, config: ReflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn ContextStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretManager>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn output_storage(mut self, storage: Arc<dyn OutputStorage>) -> Self {
        self.output_storage = Some(storage);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn catalog(mut self, catalog: Arc<WorkflowCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Assemble the runtime. Collaborators not provided explicitly are
    /// derived from configuration: encrypted file secrets under `home` when
    /// an encryption key is configured, file-backed cache at `cache_path`,
    /// and file-backed output storage at `local_storage_path`.
    pub fn build(self) -> WorkflowRuntime {
        let config = self.config;

        let secrets: Arc<dyn SecretManager> = match self.secrets {
            Some(secrets) => secrets,
            None => match &config.security.encryption_key {
                Some(key) => {
                    let path = std::path::Path::new(&config.home).join("secrets.json");
                    match EncryptedFileSecretManager::new(path, key) {
                        Ok(manager) => Arc::new(manager),
                        Err(e) => {
                            tracing::warn!(error = %e, "invalid encryption key; falling back to env secrets");
                            Arc::new(EnvSecretManager::new())
                        }
                    }
                }
                None => Arc::new(EnvSecretManager::new()),
            },
        };

        let services = EngineServices {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryContextStore::new())),
            secrets,
            output_storage: self.output_storage.unwrap_or_else(|| {
                Arc::new(LocalFileStorage::new(
                    &config.local_storage_path,
                    config.serializer,
                ))
            }),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(FileCacheBackend::new(&config.cache_path))),
            governor: ResourceGovernor::new(config.executor.clone()),
            catalog: self
                .catalog
                .unwrap_or_else(|| Arc::new(WorkflowCatalog::new())),
            config,
        };
        WorkflowRuntime::new(Arc::new(services))
    }
}

impl Default for WorkflowRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskArgs, TaskInvocation};
    use serde_json::json;

    fn hello_runtime() -> WorkflowRuntime {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("hello_world", |ctx: WorkflowCtx| async move {
            let say_hello = Task::new("say_hello", |inv: TaskInvocation| async move {
                let name: String = inv.arg_as(0)?;
                Ok(json!(format!("Hello, {name}")))
            });
            ctx.task(&say_hello, TaskArgs::positional([ctx.input()])).await
        }));
        runtime
    }

    #[tokio::test]
    async fn test_run_unknown_workflow() {
        let runtime = WorkflowRuntime::in_memory();
        let result = runtime.run("missing", RunOptions::new()).await;
        assert!(matches!(result, Err(EngineError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_run_unknown_execution_id() {
        let runtime = hello_runtime();
        let result = runtime
            .run(
                "hello_world",
                RunOptions::new().with_execution_id("missing"),
            )
            .await;
        assert!(matches!(result, Err(EngineError::ContextNotFound(_))));
    }

    #[tokio::test]
    async fn test_successful_run_closes_log() {
        let runtime = hello_runtime();
        let ctx = runtime
            .run("hello_world", RunOptions::new().with_input(json!("Joe")))
            .await
            .unwrap();

        assert!(ctx.succeeded());
        assert_eq!(
            ctx.output().and_then(|v| v.as_data()),
            Some(&json!("Hello, Joe"))
        );
        assert_eq!(ctx.events[0].kind, ExecutionEventKind::WorkflowStarted);
        assert_eq!(
            ctx.events.last().unwrap().kind,
            ExecutionEventKind::WorkflowCompleted
        );
    }

    #[tokio::test]
    async fn test_uncaught_error_records_workflow_failed() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("doomed", |ctx: WorkflowCtx| async move {
            let boom = Task::new("boom", |_inv| async {
                Err::<Value, _>(EngineError::Execution("kaput".to_string()))
            });
            ctx.task(&boom, TaskArgs::new()).await
        }));

        let ctx = runtime.run("doomed", RunOptions::new()).await.unwrap();
        assert!(ctx.failed());
        assert!(!ctx.succeeded());

        let terminal = ctx.events.last().unwrap();
        assert_eq!(terminal.kind, ExecutionEventKind::WorkflowFailed);
        assert!(terminal
            .value
            .as_failure()
            .unwrap()
            .message
            .contains("kaput"));
    }

    #[tokio::test]
    async fn test_workflow_can_catch_task_failure() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(Workflow::new("resilient", |ctx: WorkflowCtx| async move {
            let boom = Task::new("boom", |_inv| async {
                Err::<Value, _>(EngineError::Execution("kaput".to_string()))
            });
            match ctx.task(&boom, TaskArgs::new()).await {
                Ok(value) => Ok(value),
                Err(_) => Ok(json!("recovered")),
            }
        }));

        let ctx = runtime.run("resilient", RunOptions::new()).await.unwrap();
        assert!(ctx.succeeded());
        assert_eq!(
            ctx.output().and_then(|v| v.as_data()),
            Some(&json!("recovered"))
        );
    }

    #[tokio::test]
    async fn test_workflow_timeout_fails_run() {
        let runtime = WorkflowRuntime::in_memory();
        runtime.register(
            Workflow::builder("slow")
                .timeout(std::time::Duration::from_millis(20))
                .build(|ctx: WorkflowCtx| async move {
                    let nap = Task::new("nap", |_inv| async {
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        Ok(Value::Null)
                    });
                    ctx.task(&nap, TaskArgs::new()).await
                }),
        );

        let ctx = runtime.run("slow", RunOptions::new()).await.unwrap();
        assert!(ctx.failed());
        let failure = ctx.events.last().unwrap().value.as_failure().unwrap();
        assert_eq!(failure.kind, "timeout");
    }

    #[tokio::test]
    async fn test_finished_run_is_returned_unchanged() {
        let runtime = hello_runtime();
        let first = runtime
            .run("hello_world", RunOptions::new().with_input(json!("Joe")))
            .await
            .unwrap();

        let second = runtime
            .run(
                "hello_world",
                RunOptions::new().with_execution_id(&first.execution_id),
            )
            .await
            .unwrap();

        assert_eq!(second.execution_id, first.execution_id);
        assert_eq!(second.events.len(), first.events.len());
    }

    #[tokio::test]
    async fn test_force_replay_preserves_output_and_events() {
        let runtime = hello_runtime();
        let first = runtime
            .run("hello_world", RunOptions::new().with_input(json!("Joe")))
            .await
            .unwrap();

        let replayed = runtime
            .run(
                "hello_world",
                RunOptions::new()
                    .with_execution_id(&first.execution_id)
                    .force_replay(),
            )
            .await
            .unwrap();

        assert_eq!(replayed.execution_id, first.execution_id);
        assert_eq!(
            replayed.output().and_then(|v| v.as_data()),
            first.output().and_then(|v| v.as_data())
        );

        let key = |e: &ExecutionEvent| (e.source_id.clone(), e.kind);
        let mut before: Vec<_> = first.events.iter().map(key).collect();
        let mut after: Vec<_> = replayed.events.iter().map(key).collect();
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_inspect_round_trip() {
        let runtime = hello_runtime();
        let ctx = runtime
            .run("hello_world", RunOptions::new().with_input(json!("Joe")))
            .await
            .unwrap();

        let loaded = runtime.inspect(&ctx.execution_id).await.unwrap();
        assert_eq!(loaded.events.len(), ctx.events.len());

        assert!(matches!(
            runtime.inspect("missing").await,
            Err(EngineError::ContextNotFound(_))
        ));
    }
}
