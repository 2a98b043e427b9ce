//! Task definitions
//!
//! A task is an async function over JSON arguments wrapped with execution
//! policies: retries, timeout, fallback, rollback, secret injection, output
//! storage, and caching. Tasks are built once (the builder plays the role of
//! a decorator) and invoked through the workflow context, which assigns each
//! invocation its stable id and drives the task state machine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::errors::EngineError;
use crate::governor::ResourceRequest;
use crate::hashing::stable_task_id;
use crate::output::OutputStorage;
use crate::scheduler::WorkflowCtx;

/// Future returned by task functions
pub type TaskFuture = BoxFuture<'static, Result<Value, EngineError>>;

/// A task body: JSON in, JSON out
pub type TaskFn = Arc<dyn Fn(TaskInvocation) -> TaskFuture + Send + Sync>;

/// Arguments of one task invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: impl IntoIterator<Item = Value>) -> Self {
        Self {
            args: args.into_iter().collect(),
            kwargs: Map::new(),
        }
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// JSON record of the arguments, used as the `TASK_STARTED` payload
    pub fn to_record(&self) -> Value {
        serde_json::json!({
            "args": self.args,
            "kwargs": self.kwargs,
        })
    }
}

impl From<Vec<Value>> for TaskArgs {
    fn from(args: Vec<Value>) -> Self {
        Self::positional(args)
    }
}

/// What a task body receives: its arguments plus the workflow context, so a
/// task can itself invoke nested tasks through the scheduler
#[derive(Clone)]
pub struct TaskInvocation {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub ctx: WorkflowCtx,
}

impl TaskInvocation {
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Positional argument deserialized into a concrete type
    pub fn arg_as<T: DeserializeOwned>(&self, index: usize) -> Result<T, EngineError> {
        let value = self.args.get(index).cloned().ok_or_else(|| {
            EngineError::Execution(format!("missing positional argument {index}"))
        })?;
        serde_json::from_value(value).map_err(EngineError::from)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    pub fn kwarg_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, EngineError> {
        let value = self
            .kwargs
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::Execution(format!("missing keyword argument '{key}'")))?;
        serde_json::from_value(value).map_err(EngineError::from)
    }

    /// Injected secret value (from `secret_requests`)
    pub fn secret(&self, name: &str) -> Result<String, EngineError> {
        self.kwargs
            .get("secrets")
            .and_then(|s| s.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| EngineError::SecretNotFound(name.to_string()))
    }
}

impl fmt::Debug for TaskInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskInvocation")
            .field("args", &self.args)
            .field("kwargs", &self.kwargs.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Cache policy for a task
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
    pub ttl: Option<Duration>,
    pub version: Option<String>,
}

/// Execution policies attached to a task
#[derive(Clone, Default)]
pub struct TaskOptions {
    /// Upper bound on retries after the initial call (0 = no retries)
    pub retry_max_attempts: u32,

    /// Base delay between attempts
    pub retry_delay: Duration,

    /// Multiplicative backoff factor, capped at [`Task::BACKOFF_CEILING`]
    pub retry_backoff: f64,

    /// Per-attempt wall-clock budget (zero = unbounded)
    pub timeout: Duration,

    /// Alternative body invoked when all retries exhaust; its return value
    /// becomes the task result
    pub fallback: Option<TaskFn>,

    /// Compensation invoked before failing when there is no fallback; does
    /// not change the failure outcome
    pub rollback: Option<TaskFn>,

    /// Secret names injected into kwargs under `secrets`
    pub secret_requests: Vec<String>,

    /// Indirection for the stored `TASK_COMPLETED` value
    pub output_storage: Option<Arc<dyn OutputStorage>>,

    /// Cache consulted at the stable task id before execution
    pub cache: Option<CachePolicy>,

    /// Advisory resource claim while the task runs
    pub resources: ResourceRequest,
}

struct TaskInner {
    name: String,
    func: TaskFn,
    options: TaskOptions,
}

/// A named, policy-wrapped unit of work
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Cap on the delay a backoff can grow to, in seconds
    pub const BACKOFF_CEILING_SECS: u64 = 600;

    /// Create a task with default options
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        Self::builder(name).build(func)
    }

    /// Start building a task with explicit options
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            name: name.into(),
            options: TaskOptions {
                retry_delay: Duration::from_secs(1),
                retry_backoff: 2.0,
                ..TaskOptions::default()
            },
        }
    }

    /// The name template (may contain `$0`, `$1`, … and `$kwarg` holes)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &TaskOptions {
        &self.inner.options
    }

    pub(crate) fn func(&self) -> TaskFn {
        self.inner.func.clone()
    }

    /// Per-call logical name: the template with argument placeholders
    /// substituted
    pub fn full_name(&self, args: &TaskArgs) -> String {
        let mut name = self.inner.name.clone();
        if !name.contains('$') {
            return name;
        }

        // Longest keys first so `$repo_url` is not clobbered by `$repo`
        let mut keys: Vec<&String> = args.kwargs.keys().collect();
        keys.sort_by_key(|k| std::cmp::Reverse(k.len()));
        for key in keys {
            name = name.replace(&format!("${key}"), &render(&args.kwargs[key]));
        }

        for index in (0..args.args.len()).rev() {
            name = name.replace(&format!("${index}"), &render(&args.args[index]));
        }
        name
    }

    /// The stable id of one invocation: the replay/dedup key
    pub fn source_id(&self, args: &TaskArgs) -> String {
        let full_name = self.full_name(args);
        stable_task_id(&full_name, &args.args, &args.kwargs)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("retry_max_attempts", &self.inner.options.retry_max_attempts)
            .field("timeout", &self.inner.options.timeout)
            .finish()
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Builder for [`Task`] — the "decorator with options"
pub struct TaskBuilder {
    name: String,
    options: TaskOptions,
}

impl TaskBuilder {
    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.options.retry_max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.options.retry_delay = delay;
        self
    }

    pub fn retry_backoff(mut self, backoff: f64) -> Self {
        self.options.retry_backoff = backoff;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn fallback<F, Fut>(mut self, func: F) -> Self
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        self.options.fallback = Some(Arc::new(move |inv| Box::pin(func(inv))));
        self
    }

    pub fn rollback<F, Fut>(mut self, func: F) -> Self
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        self.options.rollback = Some(Arc::new(move |inv| Box::pin(func(inv))));
        self
    }

    pub fn secret_requests(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options.secret_requests = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_storage(mut self, storage: Arc<dyn OutputStorage>) -> Self {
        self.options.output_storage = Some(storage);
        self
    }

    pub fn cache(mut self) -> Self {
        self.options.cache = Some(CachePolicy::default());
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache.get_or_insert_with(CachePolicy::default).ttl = Some(ttl);
        self
    }

    pub fn cache_version(mut self, version: impl Into<String>) -> Self {
        self.options
            .cache
            .get_or_insert_with(CachePolicy::default)
            .version = Some(version.into());
        self
    }

    pub fn resources(mut self, resources: ResourceRequest) -> Self {
        self.options.resources = resources;
        self
    }

    pub fn build<F, Fut>(self, func: F) -> Task
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, EngineError>> + Send + 'static,
    {
        Task {
            inner: Arc::new(TaskInner {
                name: self.name,
                func: Arc::new(move |inv| Box::pin(func(inv))),
                options: self.options,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Task {
        Task::new("noop", |_inv| async { Ok(Value::Null) })
    }

    #[test]
    fn test_builder_defaults() {
        let task = noop();
        assert_eq!(task.name(), "noop");
        assert_eq!(task.options().retry_max_attempts, 0);
        assert_eq!(task.options().retry_delay, Duration::from_secs(1));
        assert_eq!(task.options().retry_backoff, 2.0);
        assert_eq!(task.options().timeout, Duration::ZERO);
        assert!(task.options().fallback.is_none());
        assert!(task.options().cache.is_none());
    }

    #[test]
    fn test_builder_options() {
        let task = Task::builder("fetch")
            .retry_max_attempts(3)
            .retry_delay(Duration::from_millis(50))
            .timeout(Duration::from_secs(5))
            .secret_requests(["api_key"])
            .cache_ttl(Duration::from_secs(60))
            .cache_version("v2")
            .build(|_inv| async { Ok(Value::Null) });

        assert_eq!(task.options().retry_max_attempts, 3);
        assert_eq!(task.options().timeout, Duration::from_secs(5));
        assert_eq!(task.options().secret_requests, vec!["api_key".to_string()]);

        let cache = task.options().cache.as_ref().unwrap();
        assert_eq!(cache.ttl, Some(Duration::from_secs(60)));
        assert_eq!(cache.version.as_deref(), Some("v2"));
    }

    #[test]
    fn test_full_name_substitution() {
        let task = Task::new("get_stars_$0", |_inv| async { Ok(Value::Null) });
        let args = TaskArgs::positional([json!("python/cpython")]);
        assert_eq!(task.full_name(&args), "get_stars_python/cpython");
    }

    #[test]
    fn test_full_name_kwarg_substitution() {
        let task = Task::new("notify_$channel", |_inv| async { Ok(Value::Null) });
        let args = TaskArgs::new().with_kwarg("channel", json!("ops"));
        assert_eq!(task.full_name(&args), "notify_ops");
    }

    #[test]
    fn test_full_name_without_holes() {
        let task = noop();
        assert_eq!(task.full_name(&TaskArgs::new()), "noop");
    }

    #[test]
    fn test_source_id_varies_with_args() {
        let task = noop();
        let a = task.source_id(&TaskArgs::positional([json!(1)]));
        let b = task.source_id(&TaskArgs::positional([json!(2)]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_source_id_stable_under_kwarg_order() {
        let task = noop();
        let a = task.source_id(
            &TaskArgs::new()
                .with_kwarg("x", json!(1))
                .with_kwarg("y", json!(2)),
        );
        let b = task.source_id(
            &TaskArgs::new()
                .with_kwarg("y", json!(2))
                .with_kwarg("x", json!(1)),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_args_record() {
        let args = TaskArgs::positional([json!("Joe")]).with_kwarg("greeting", json!("Hello"));
        assert_eq!(
            args.to_record(),
            json!({"args": ["Joe"], "kwargs": {"greeting": "Hello"}})
        );
    }
}
