//! Replay scheduler
//!
//! Drives a workflow body against its execution context. The event log is
//! the replay oracle: before a task executes, the scheduler looks up its
//! terminal event by stable source id. A hit means this invocation already
//! ran — the recorded value (or failure) is fed back and nothing is
//! appended. A miss means live execution through the task state machine:
//!
//! ```text
//! (start) → TASK_STARTED → cache? → execute under timeout
//!    ├─ success        → TASK_COMPLETED
//!    ├─ pause signal   → unwind to the workflow runtime
//!    └─ error          → retry* → fallback | rollback + TASK_FAILED
//! ```
//!
//! Parallel groups fan out on the worker pool; branches append under the
//! context lock and results are gathered in input order. Branch interleaving
//! is immaterial because every event carries a unique source id.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::cache::CacheBackend;
use crate::catalog::WorkflowCatalog;
use crate::config::ReflowConfig;
use crate::context::ExecutionContext;
use crate::errors::{EngineError, FailureInfo, TimeoutScope};
use crate::event::{EventValue, ExecutionEvent, ExecutionEventKind, RetryState};
use crate::governor::ResourceGovernor;
use crate::hashing::stable_task_id;
use crate::output::{InlineOutputStorage, OutputStorage, StoredValue};
use crate::secrets::{EnvSecretManager, SecretManager};
use crate::store::{ContextStore, InMemoryContextStore};
use crate::task::{Task, TaskArgs, TaskInvocation};

/// Shared engine collaborators threaded through every execution
pub struct EngineServices {
    pub store: Arc<dyn ContextStore>,
    pub secrets: Arc<dyn SecretManager>,
    pub output_storage: Arc<dyn OutputStorage>,
    pub cache: Arc<dyn CacheBackend>,
    pub governor: ResourceGovernor,
    pub catalog: Arc<WorkflowCatalog>,
    pub config: ReflowConfig,
}

impl EngineServices {
    /// In-memory defaults: used by tests and single-process embedding
    pub fn with_defaults(config: ReflowConfig) -> Self {
        Self {
            store: Arc::new(InMemoryContextStore::new()),
            secrets: Arc::new(EnvSecretManager::new()),
            output_storage: Arc::new(InlineOutputStorage),
            cache: Arc::new(crate::cache::InMemoryCacheBackend::new()),
            governor: ResourceGovernor::new(config.executor.clone()),
            catalog: Arc::new(WorkflowCatalog::new()),
            config,
        }
    }
}

/// Per-execution state shared between the runtime and every task invocation
pub(crate) struct RunState {
    pub(crate) execution_id: String,
    pub(crate) workflow_name: String,
    pub(crate) input: Value,
    pub(crate) ctx: tokio::sync::Mutex<ExecutionContext>,
    pub(crate) services: Arc<EngineServices>,
}

/// Handle a workflow body uses to reach the engine
///
/// Every suspension point of a workflow is a method on this handle. The
/// handle is cheap to clone and is what parallel branches carry onto worker
/// tasks.
#[derive(Clone)]
pub struct WorkflowCtx {
    pub(crate) state: Arc<RunState>,
}

impl WorkflowCtx {
    pub(crate) fn new(state: Arc<RunState>) -> Self {
        Self { state }
    }

    /// The workflow input (rewritten input after a pause-with-input resume)
    pub fn input(&self) -> Value {
        self.state.input.clone()
    }

    /// Input deserialized into a concrete type
    pub fn input_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_value(self.state.input.clone()).map_err(EngineError::from)
    }

    pub fn execution_id(&self) -> &str {
        &self.state.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.state.workflow_name
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.state.services
    }

    // =========================================================================
    // Suspension points
    // =========================================================================

    /// Invoke a task. On replay the recorded terminal value is returned and
    /// nothing is appended.
    pub async fn task(&self, task: &Task, args: TaskArgs) -> Result<Value, EngineError> {
        let full_name = task.full_name(&args);
        let source_id = task.source_id(&args);

        if let Some(terminal) = self.lookup_terminal(&source_id).await {
            debug!(%source_id, "replaying recorded task terminal");
            return self.settle_replay(task, &terminal);
        }

        self.run_task_live(task, args, full_name, source_id).await
    }

    /// Run several task invocations concurrently; results in input order
    pub async fn join(
        &self,
        calls: Vec<(Task, TaskArgs)>,
    ) -> Result<Vec<Value>, EngineError> {
        let mut handles = Vec::with_capacity(calls.len());
        for (task, args) in calls {
            let ctx = self.clone();
            handles.push(tokio::spawn(async move {
                // The worker pool bounds parallel dispatch; sequential task
                // invocations outside a group are not gated
                let _worker = ctx.state.services.governor.acquire_worker().await;
                ctx.task(&task, args).await
            }));
        }

        // Gather every branch before surfacing an error so no branch is
        // still appending events once the group settles
        let mut settled = Vec::with_capacity(handles.len());
        for handle in handles {
            settled.push(
                handle
                    .await
                    .map_err(|e| EngineError::Execution(format!("parallel task panicked: {e}"))),
            );
        }

        let mut results = Vec::with_capacity(settled.len());
        for outcome in settled {
            results.push(outcome??);
        }
        Ok(results)
    }

    /// Fan one task out over a list of inputs, one invocation per element
    pub async fn map(
        &self,
        task: &Task,
        inputs: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>, EngineError> {
        let calls = inputs
            .into_iter()
            .map(|input| (task.clone(), TaskArgs::positional([input])))
            .collect();
        self.join(calls).await
    }

    /// Invoke another workflow as a child run with its own execution id.
    /// The parent records the child's output, so replay does not re-run it.
    pub async fn subworkflow(&self, name: &str, input: Value) -> Result<Value, EngineError> {
        self.task(
            &crate::tasks::call_workflow(),
            TaskArgs::positional([json!(name), input]),
        )
        .await
    }

    /// Fan one workflow out over a list of inputs, one child execution per
    /// element; results in input order
    pub async fn map_workflows(
        &self,
        name: &str,
        inputs: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Value>, EngineError> {
        let task = crate::tasks::call_workflow();
        let calls = inputs
            .into_iter()
            .map(|input| (task.clone(), TaskArgs::positional([json!(name), input])))
            .collect();
        self.join(calls).await
    }

    /// Suspend the run at a named reference. The next `run` with the same
    /// execution id continues past this point.
    pub async fn pause(&self, reference: &str) -> Result<Value, EngineError> {
        self.pause_impl(reference, false).await
    }

    /// Suspend and, on resume, observe the input supplied by the caller
    pub async fn pause_for_input(&self, reference: &str) -> Result<Value, EngineError> {
        self.pause_impl(reference, true).await
    }

    // =========================================================================
    // Task state machine
    // =========================================================================

    async fn lookup_terminal(&self, source_id: &str) -> Option<ExecutionEvent> {
        let ctx = self.state.ctx.lock().await;
        ctx.task_terminal(source_id).cloned()
    }

    fn settle_replay(
        &self,
        task: &Task,
        terminal: &ExecutionEvent,
    ) -> Result<Value, EngineError> {
        match terminal.kind {
            ExecutionEventKind::TaskCompleted => self.resolve_value(task, &terminal.value),
            ExecutionEventKind::TaskFailed => match terminal.value.as_failure() {
                Some(info) => Err(info.to_error()),
                None => Err(EngineError::Execution(format!(
                    "task {} failed",
                    terminal.name
                ))),
            },
            _ => Err(EngineError::Execution(format!(
                "unexpected terminal event {} for {}",
                terminal.kind, terminal.source_id
            ))),
        }
    }

    /// Dereference an event payload into its literal value
    fn resolve_value(&self, task: &Task, value: &EventValue) -> Result<Value, EngineError> {
        match value {
            EventValue::Data { value } => Ok(value.clone()),
            EventValue::Stored { output } => {
                if let StoredValue::Inline { value } = output {
                    return Ok(value.clone());
                }
                match task.options().output_storage.as_ref() {
                    Some(storage) => storage.resolve(output),
                    None => self.state.services.output_storage.resolve(output),
                }
            }
            EventValue::Null => Ok(Value::Null),
            other => Err(EngineError::Execution(format!(
                "task terminal carries unexpected payload: {other:?}"
            ))),
        }
    }

    async fn run_task_live(
        &self,
        task: &Task,
        args: TaskArgs,
        full_name: String,
        source_id: String,
    ) -> Result<Value, EngineError> {
        let options = task.options().clone();
        let services = self.state.services.clone();

        self.append(vec![ExecutionEvent::new(
            ExecutionEventKind::TaskStarted,
            &source_id,
            &full_name,
            EventValue::data(args.to_record()),
        )])
        .await?;

        // Cache shortcut: a hit bypasses execution entirely
        if let Some(policy) = &options.cache {
            if let Some(hit) = services.cache.get(&source_id, policy.version.as_deref()) {
                debug!(%source_id, "task cache hit");
                return self
                    .finish_completed(task, &source_id, &full_name, hit, false)
                    .await;
            }
        }

        let _claim = services.governor.claim(&options.resources);

        // Secrets are injected into kwargs and never recorded in events
        let mut kwargs = args.kwargs.clone();
        if !options.secret_requests.is_empty() {
            let secrets = match services.secrets.get(&options.secret_requests).await {
                Ok(secrets) => secrets,
                Err(e) => return self.fail_task(&source_id, &full_name, e).await,
            };
            kwargs.insert("secrets".to_string(), json!(secrets));
        }

        let invocation = TaskInvocation {
            args: args.args.clone(),
            kwargs,
            ctx: self.clone(),
        };

        let timeout = self.effective_timeout(&options.timeout);

        // Initial attempt
        let first_error = match self
            .attempt(task, &invocation, timeout, &full_name, &source_id)
            .await
        {
            Ok(value) => {
                return self
                    .finish_completed(task, &source_id, &full_name, value, true)
                    .await;
            }
            Err(e) if e.is_pause() => return Err(e),
            Err(e) => e,
        };

        // Retry loop
        let mut last_error = first_error;
        if options.retry_max_attempts > 0 {
            let mut delay = options.retry_delay;
            let ceiling = Duration::from_secs(Task::BACKOFF_CEILING_SECS);

            for attempt in 1..=options.retry_max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(options.retry_backoff).min(ceiling);

                let state = RetryState {
                    attempt,
                    max_attempts: options.retry_max_attempts,
                    delay_secs: delay.as_secs(),
                    backoff: options.retry_backoff,
                };

                self.append(vec![ExecutionEvent::new(
                    ExecutionEventKind::TaskRetryStarted,
                    &source_id,
                    &full_name,
                    EventValue::Retry {
                        state: state.clone(),
                    },
                )])
                .await?;

                match self
                    .attempt(task, &invocation, timeout, &full_name, &source_id)
                    .await
                {
                    Ok(value) => {
                        self.append(vec![ExecutionEvent::new(
                            ExecutionEventKind::TaskRetryCompleted,
                            &source_id,
                            &full_name,
                            EventValue::Retry { state },
                        )])
                        .await?;
                        return self
                            .finish_completed(task, &source_id, &full_name, value, true)
                            .await;
                    }
                    Err(e) if e.is_pause() => return Err(e),
                    Err(e) => {
                        self.append(vec![ExecutionEvent::new(
                            ExecutionEventKind::TaskRetryFailed,
                            &source_id,
                            &full_name,
                            EventValue::Retry { state },
                        )])
                        .await?;
                        last_error = e;
                    }
                }
            }
        }

        // Exhausted: fallback, then rollback, then fail
        if let Some(fallback) = options.fallback.clone() {
            self.append(vec![ExecutionEvent::new(
                ExecutionEventKind::TaskFallbackStarted,
                &source_id,
                &full_name,
                EventValue::Null,
            )])
            .await?;

            match fallback(invocation.clone()).await {
                Ok(value) => {
                    self.append(vec![ExecutionEvent::new(
                        ExecutionEventKind::TaskFallbackCompleted,
                        &source_id,
                        &full_name,
                        EventValue::data(value.clone()),
                    )])
                    .await?;
                    return self
                        .finish_completed(task, &source_id, &full_name, value, true)
                        .await;
                }
                Err(e) => last_error = e,
            }
        } else if let Some(rollback) = options.rollback.clone() {
            self.append(vec![ExecutionEvent::new(
                ExecutionEventKind::TaskRollbackStarted,
                &source_id,
                &full_name,
                EventValue::Null,
            )])
            .await?;

            if let Err(e) = rollback(invocation.clone()).await {
                warn!(%source_id, error = %e, "rollback failed");
            }

            self.append(vec![ExecutionEvent::new(
                ExecutionEventKind::TaskRollbackCompleted,
                &source_id,
                &full_name,
                EventValue::Null,
            )])
            .await?;
        }

        let error = if options.retry_max_attempts > 0 {
            EngineError::RetryExhausted {
                cause: last_error.to_string(),
                attempts: options.retry_max_attempts,
                delay_secs: options.retry_delay.as_secs(),
                backoff: options.retry_backoff,
            }
        } else {
            last_error
        };

        self.fail_task(&source_id, &full_name, error).await
    }

    async fn attempt(
        &self,
        task: &Task,
        invocation: &TaskInvocation,
        timeout: Duration,
        full_name: &str,
        source_id: &str,
    ) -> Result<Value, EngineError> {
        let future = (task.func())(invocation.clone());
        if timeout.is_zero() {
            future.await
        } else {
            match tokio::time::timeout(timeout, future).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    scope: TimeoutScope::Task,
                    name: full_name.to_string(),
                    id: source_id.to_string(),
                    seconds: timeout.as_secs(),
                }),
            }
        }
    }

    async fn finish_completed(
        &self,
        task: &Task,
        source_id: &str,
        full_name: &str,
        value: Value,
        store_in_cache: bool,
    ) -> Result<Value, EngineError> {
        let payload = match task.options().output_storage.as_ref() {
            Some(storage) => EventValue::Stored {
                output: storage.store(source_id, value.clone())?,
            },
            None => EventValue::data(value.clone()),
        };

        self.append(vec![ExecutionEvent::new(
            ExecutionEventKind::TaskCompleted,
            source_id,
            full_name,
            payload,
        )])
        .await?;

        if store_in_cache {
            if let Some(policy) = &task.options().cache {
                self.state.services.cache.set(
                    source_id,
                    &value,
                    policy.ttl,
                    policy.version.as_deref(),
                );
            }
        }

        Ok(value)
    }

    async fn fail_task(
        &self,
        source_id: &str,
        full_name: &str,
        error: EngineError,
    ) -> Result<Value, EngineError> {
        self.append(vec![ExecutionEvent::new(
            ExecutionEventKind::TaskFailed,
            source_id,
            full_name,
            EventValue::Failure {
                error: FailureInfo::from_error(&error),
            },
        )])
        .await?;
        Err(error)
    }

    async fn pause_impl(&self, reference: &str, wait_for_input: bool) -> Result<Value, EngineError> {
        let task_name = format!("pause_{reference}");
        let args = [json!(reference)];
        let source_id = stable_task_id(&task_name, &args, &Map::new());

        if let Some(terminal) = self.lookup_terminal(&source_id).await {
            // This pause point already ran: the run was resumed past it
            debug!(%source_id, "skipping completed pause point");
            return match terminal.kind {
                ExecutionEventKind::TaskCompleted if wait_for_input => Ok(self.input()),
                ExecutionEventKind::TaskCompleted => Ok(terminal
                    .value
                    .as_data()
                    .cloned()
                    .unwrap_or(Value::Null)),
                _ => Err(EngineError::Execution(format!(
                    "pause point {reference} has unexpected terminal"
                ))),
            };
        }

        // Record the pause frame so replay skips it, then unwind to the
        // workflow runtime which emits WORKFLOW_PAUSED
        self.append(vec![
            ExecutionEvent::new(
                ExecutionEventKind::TaskStarted,
                &source_id,
                &task_name,
                EventValue::data(json!(reference)),
            ),
            ExecutionEvent::new(
                ExecutionEventKind::TaskCompleted,
                &source_id,
                &task_name,
                EventValue::data(json!(reference)),
            ),
        ])
        .await?;

        Err(EngineError::Paused {
            reference: reference.to_string(),
        })
    }

    // =========================================================================
    // Log plumbing
    // =========================================================================

    fn effective_timeout(&self, task_timeout: &Duration) -> Duration {
        if !task_timeout.is_zero() {
            *task_timeout
        } else {
            Duration::from_secs(self.state.services.config.executor.default_timeout)
        }
    }

    /// Append a batch of events and persist the context. Branches of a
    /// parallel group serialize here.
    pub(crate) async fn append(&self, events: Vec<ExecutionEvent>) -> Result<(), EngineError> {
        let snapshot = {
            let mut ctx = self.state.ctx.lock().await;
            for event in events {
                ctx.append(event);
            }
            ctx.clone()
        };
        self.state.services.store.save(&snapshot).await?;
        Ok(())
    }

    /// Run a child workflow through the runtime envelope (used by the
    /// `call_workflow` engine task)
    pub(crate) fn run_child_workflow(
        &self,
        name: String,
        input: Value,
    ) -> futures::future::BoxFuture<'static, Result<Value, EngineError>> {
        let services = self.state.services.clone();
        Box::pin(async move {
            let workflow = services.catalog.get(&name)?;
            let child = ExecutionContext::new(&name, input);
            let finished =
                crate::runtime::drive(services.clone(), workflow, child, None, false).await?;

            if finished.failed() {
                let message = finished
                    .events
                    .iter()
                    .rev()
                    .find_map(|e| e.value.as_failure())
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| format!("subworkflow {name} failed"));
                return Err(EngineError::Execution(message));
            }
            if finished.paused() {
                return Err(EngineError::Execution(format!(
                    "subworkflow {name} paused; pause is only supported at the top level"
                )));
            }

            match finished.output() {
                Some(EventValue::Stored { output }) => services.output_storage.resolve(output),
                Some(value) => Ok(value.as_data().cloned().unwrap_or(Value::Null)),
                None => Ok(Value::Null),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;

    fn test_state(events: Vec<ExecutionEvent>) -> WorkflowCtx {
        let mut ctx = ExecutionContext::new("w", json!("input"));
        for event in events {
            ctx.append(event);
        }

        let services = Arc::new(EngineServices::with_defaults(ReflowConfig::default()));
        WorkflowCtx::new(Arc::new(RunState {
            execution_id: ctx.execution_id.clone(),
            workflow_name: "w".to_string(),
            input: ctx.input.clone(),
            ctx: tokio::sync::Mutex::new(ctx),
            services,
        }))
    }

    #[tokio::test]
    async fn test_live_task_appends_frame() {
        let ctx = test_state(vec![]);
        let task = Task::new("double", |inv: TaskInvocation| async move {
            let n: i64 = inv.arg_as(0)?;
            Ok(json!(n * 2))
        });

        let result = ctx.task(&task, TaskArgs::positional([json!(21)])).await.unwrap();
        assert_eq!(result, json!(42));

        let log = ctx.state.ctx.lock().await;
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[0].kind, ExecutionEventKind::TaskStarted);
        assert_eq!(log.events[1].kind, ExecutionEventKind::TaskCompleted);
        assert_eq!(log.events[0].source_id, log.events[1].source_id);
    }

    #[tokio::test]
    async fn test_replay_returns_recorded_value_without_execution() {
        let task = Task::new("boom", |_inv| async {
            Err::<Value, _>(EngineError::Execution("must not run".to_string()))
        });
        let source_id = task.source_id(&TaskArgs::positional([json!(1)]));

        let ctx = test_state(vec![
            ExecutionEvent::new(
                ExecutionEventKind::TaskStarted,
                &source_id,
                "boom",
                EventValue::Null,
            ),
            ExecutionEvent::new(
                ExecutionEventKind::TaskCompleted,
                &source_id,
                "boom",
                EventValue::data(json!("recorded")),
            ),
        ]);

        let result = ctx.task(&task, TaskArgs::positional([json!(1)])).await.unwrap();
        assert_eq!(result, json!("recorded"));

        // Nothing new appended
        let log = ctx.state.ctx.lock().await;
        assert_eq!(log.events.len(), 2);
    }

    #[tokio::test]
    async fn test_replay_of_failed_task_raises_again() {
        let task = Task::new("boom", |_inv| async { Ok(json!("fresh")) });
        let source_id = task.source_id(&TaskArgs::new());

        let ctx = test_state(vec![ExecutionEvent::new(
            ExecutionEventKind::TaskFailed,
            &source_id,
            "boom",
            EventValue::Failure {
                error: FailureInfo::from_error(&EngineError::Execution("recorded failure".into())),
            },
        )]);

        let result = ctx.task(&task, TaskArgs::new()).await;
        match result {
            Err(EngineError::Execution(message)) => assert_eq!(message, "recorded failure"),
            other => panic!("expected recorded failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_task_emits_task_failed() {
        let ctx = test_state(vec![]);
        let task = Task::new("boom", |_inv| async {
            Err::<Value, _>(EngineError::Execution("nope".to_string()))
        });

        let result = ctx.task(&task, TaskArgs::new()).await;
        assert!(result.is_err());

        let log = ctx.state.ctx.lock().await;
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[1].kind, ExecutionEventKind::TaskFailed);
        assert_eq!(log.events[1].value.as_failure().unwrap().message, "nope");
    }

    #[tokio::test]
    async fn test_retry_framing_order() {
        let ctx = test_state(vec![]);

        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_in_task = calls.clone();
        let task = Task::builder("flaky")
            .retry_max_attempts(2)
            .retry_delay(Duration::from_millis(1))
            .build(move |_inv| {
                let calls = calls_in_task.clone();
                async move {
                    let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        Err(EngineError::Execution("flaky".to_string()))
                    } else {
                        Ok(json!("ok"))
                    }
                }
            });

        let result = ctx.task(&task, TaskArgs::new()).await.unwrap();
        assert_eq!(result, json!("ok"));

        let log = ctx.state.ctx.lock().await;
        let kinds: Vec<ExecutionEventKind> = log.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ExecutionEventKind::TaskStarted,
                ExecutionEventKind::TaskRetryStarted,
                ExecutionEventKind::TaskRetryFailed,
                ExecutionEventKind::TaskRetryStarted,
                ExecutionEventKind::TaskRetryCompleted,
                ExecutionEventKind::TaskCompleted,
            ]
        );
        // Attempt counters are 1-based and strictly increasing
        assert_eq!(log.events[1].value.as_retry().unwrap().attempt, 1);
        assert_eq!(log.events[3].value.as_retry().unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_raises_retry_error() {
        let ctx = test_state(vec![]);
        let task = Task::builder("always_fails")
            .retry_max_attempts(2)
            .retry_delay(Duration::from_millis(1))
            .build(|_inv| async { Err::<Value, _>(EngineError::Execution("nope".to_string())) });

        let result = ctx.task(&task, TaskArgs::new()).await;
        match result {
            Err(EngineError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }

        let log = ctx.state.ctx.lock().await;
        let retries = log
            .events
            .iter()
            .filter(|e| e.kind == ExecutionEventKind::TaskRetryStarted)
            .count();
        assert_eq!(retries, 2);
        assert_eq!(
            log.events.last().unwrap().kind,
            ExecutionEventKind::TaskFailed
        );
    }

    #[tokio::test]
    async fn test_fallback_value_becomes_result() {
        let ctx = test_state(vec![]);
        let task = Task::builder("fragile")
            .fallback(|_inv| async { Ok(json!("fallback value")) })
            .build(|_inv| async { Err::<Value, _>(EngineError::Execution("broken".to_string())) });

        let result = ctx.task(&task, TaskArgs::new()).await.unwrap();
        assert_eq!(result, json!("fallback value"));

        let log = ctx.state.ctx.lock().await;
        let kinds: Vec<ExecutionEventKind> = log.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ExecutionEventKind::TaskStarted,
                ExecutionEventKind::TaskFallbackStarted,
                ExecutionEventKind::TaskFallbackCompleted,
                ExecutionEventKind::TaskCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_rollback_is_compensation_only() {
        let ctx = test_state(vec![]);

        let rolled_back = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = rolled_back.clone();
        let task = Task::builder("risky")
            .rollback(move |_inv| {
                let flag = flag.clone();
                async move {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .build(|_inv| async { Err::<Value, _>(EngineError::Execution("broken".to_string())) });

        let result = ctx.task(&task, TaskArgs::new()).await;
        assert!(result.is_err());
        assert!(rolled_back.load(std::sync::atomic::Ordering::SeqCst));

        let log = ctx.state.ctx.lock().await;
        let kinds: Vec<ExecutionEventKind> = log.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ExecutionEventKind::TaskStarted,
                ExecutionEventKind::TaskRollbackStarted,
                ExecutionEventKind::TaskRollbackCompleted,
                ExecutionEventKind::TaskFailed,
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_feeds_policy_chain() {
        let ctx = test_state(vec![]);
        let task = Task::builder("slow")
            .timeout(Duration::from_millis(20))
            .fallback(|_inv| async { Ok(json!("ok")) })
            .build(|_inv| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("too late"))
            });

        let result = ctx.task(&task, TaskArgs::new()).await.unwrap();
        assert_eq!(result, json!("ok"));
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_execution() {
        let ctx = test_state(vec![]);
        let task = Task::builder("cached")
            .cache()
            .build(|_inv| async { Err::<Value, _>(EngineError::Execution("must not run".into())) });

        let source_id = task.source_id(&TaskArgs::new());
        ctx.state
            .services
            .cache
            .set(&source_id, &json!("from cache"), None, None);

        let result = ctx.task(&task, TaskArgs::new()).await.unwrap();
        assert_eq!(result, json!("from cache"));

        let log = ctx.state.ctx.lock().await;
        let kinds: Vec<ExecutionEventKind> = log.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ExecutionEventKind::TaskStarted,
                ExecutionEventKind::TaskCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_join_preserves_input_order() {
        let ctx = test_state(vec![]);
        let task = Task::new("delayed_echo", |inv: TaskInvocation| async move {
            let n: u64 = inv.arg_as(0)?;
            // Later inputs finish first
            tokio::time::sleep(Duration::from_millis(30 - n * 10)).await;
            Ok(json!(n))
        });

        let results = ctx
            .map(&task, [json!(0), json!(1), json!(2)])
            .await
            .unwrap();
        assert_eq!(results, vec![json!(0), json!(1), json!(2)]);

        // Three distinct task frames, one per input
        let log = ctx.state.ctx.lock().await;
        let started: Vec<&ExecutionEvent> = log
            .events
            .iter()
            .filter(|e| e.kind == ExecutionEventKind::TaskStarted)
            .collect();
        assert_eq!(started.len(), 3);
        let mut sources: Vec<&str> = started.iter().map(|e| e.source_id.as_str()).collect();
        sources.dedup();
        assert_eq!(sources.len(), 3);
    }

    #[tokio::test]
    async fn test_pause_records_frame_and_unwinds() {
        let ctx = test_state(vec![]);
        let result = ctx.pause("approval").await;

        match result {
            Err(EngineError::Paused { reference }) => assert_eq!(reference, "approval"),
            other => panic!("expected pause signal, got {other:?}"),
        }

        let log = ctx.state.ctx.lock().await;
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[0].name, "pause_approval");
        assert_eq!(log.events[1].kind, ExecutionEventKind::TaskCompleted);
    }

    #[tokio::test]
    async fn test_completed_pause_is_skipped() {
        // Prime the log with a completed pause frame, as after a resume
        let probe = test_state(vec![]);
        let _ = probe.pause("approval").await;
        let events = probe.state.ctx.lock().await.events.clone();

        let ctx = test_state(events);
        let result = ctx.pause("approval").await.unwrap();
        assert_eq!(result, json!("approval"));
    }

    #[tokio::test]
    async fn test_pause_for_input_returns_rewritten_input() {
        let probe = test_state(vec![]);
        let _ = probe.pause_for_input("name").await;
        let events = probe.state.ctx.lock().await.events.clone();

        // The resumed run carries the caller-supplied input
        let ctx = test_state(events);
        let got = ctx.pause_for_input("name").await.unwrap();
        assert_eq!(got, json!("input"));
    }
}
