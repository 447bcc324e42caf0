//! Launcher: turn a function into a submit-site for a chosen backend kind.
//!
//! A [`Launcher`] pairs a callable with a job kind and default job options;
//! each `submit` stamps out a fresh job. The "current engine" is always an
//! explicit value, either passed per call or bound with
//! [`bind`](Launcher::bind); there is no process-wide default engine.

use std::time::Duration;

use crate::core::engine::{Engine, EngineHandle};
use crate::core::error::{EngineError, EngineResult};
use crate::core::job::{Callable, Job, JobBuilder, JobCtx, JobKind};
use crate::core::value::{TaskArg, TaskArgs, TaskValue};
use crate::extend::SubprocessJob;

enum LauncherTarget {
    Callable(Callable),
    /// Command template; `{0}`, `{1}`, ... are replaced by positional args.
    Command(String),
}

/// A reusable submit-site for one function (or command template).
///
/// # Example
///
/// ```no_run
/// use jobflow::{Engine, EngineSetting, Launcher, TaskArgs};
/// use serde_json::json;
///
/// # fn main() -> Result<(), jobflow::EngineError> {
/// let add = Launcher::thread("add", |ctx| {
///     Ok(json!(ctx.args().int(0)? + ctx.args().int(1)?))
/// });
///
/// Engine::scope(EngineSetting::default(), |engine| {
///     let add = add.bind(engine);
///     let value = add.call(TaskArgs::positional([1i64, 2i64]), None)?;
///     assert_eq!(value, json!(3));
///     Ok(())
/// })?
/// # }
/// ```
pub struct Launcher {
    kind: JobKind,
    target: LauncherTarget,
    name: String,
    retries: u32,
    retry_delay: Duration,
    wait_interval: Option<Duration>,
    engine: Option<EngineHandle>,
}

impl Launcher {
    fn new(kind: JobKind, target: LauncherTarget, name: String) -> Self {
        Self {
            kind,
            target,
            name,
            retries: 0,
            retry_delay: Duration::ZERO,
            wait_interval: None,
            engine: None,
        }
    }

    /// Launcher for local (inline) jobs.
    pub fn local<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JobCtx) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        Self::new(
            JobKind::Local,
            LauncherTarget::Callable(Callable::Sync(std::sync::Arc::new(f))),
            name.into(),
        )
    }

    /// Launcher for thread-pool jobs.
    pub fn thread<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JobCtx) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        Self::new(
            JobKind::Thread,
            LauncherTarget::Callable(Callable::Sync(std::sync::Arc::new(f))),
            name.into(),
        )
    }

    /// Launcher for process-pool jobs running a registered task.
    pub fn process(task: impl Into<String>) -> Self {
        let task = task.into();
        Self::new(
            JobKind::Process,
            LauncherTarget::Callable(Callable::Named(task.clone())),
            task,
        )
    }

    /// Launcher for distributed jobs running a registered task.
    pub fn distributed(task: impl Into<String>) -> Self {
        let task = task.into();
        Self::new(
            JobKind::Distributed,
            LauncherTarget::Callable(Callable::Named(task.clone())),
            task,
        )
    }

    /// Launcher for subprocess jobs from a command template. Placeholders
    /// `{0}`, `{1}`, ... are substituted by positional argument values at
    /// submit time; future arguments are not supported here.
    pub fn command(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self::new(
            JobKind::Thread,
            LauncherTarget::Command(template.into()),
            name.into(),
        )
    }

    /// Default retry policy for submitted jobs.
    #[must_use]
    pub fn retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retries = max_attempts;
        self.retry_delay = delay;
        self
    }

    /// Default condition re-evaluation interval for submitted jobs.
    #[must_use]
    pub fn wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = Some(interval);
        self
    }

    /// Bind a default engine so `submit`/`call` need no engine argument.
    #[must_use]
    pub fn bind(mut self, engine: &Engine) -> Self {
        self.engine = Some(engine.handle());
        self
    }

    fn bound(&self) -> EngineResult<&EngineHandle> {
        self.engine.as_ref().ok_or(EngineError::NotRunning)
    }

    fn builder(&self, args: TaskArgs) -> EngineResult<JobBuilder> {
        let mut builder = match &self.target {
            LauncherTarget::Callable(callable) => {
                Job::builder(self.kind.clone(), callable.clone()).args(args)
            }
            LauncherTarget::Command(template) => {
                SubprocessJob::new(render_template(template, &args)?).into_builder()
            }
        };
        builder = builder.name(self.name.clone());
        if self.retries > 0 {
            builder = builder.retries(self.retries, self.retry_delay);
        }
        if let Some(interval) = self.wait_interval {
            builder = builder.wait_interval(interval);
        }
        Ok(builder)
    }

    /// Build a job and submit it to `engine`; returns the job handle.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running or a command template receives
    /// non-value arguments.
    pub fn submit_to(&self, engine: &Engine, args: TaskArgs) -> EngineResult<Job> {
        let job = self.builder(args)?.build();
        engine.submit_one(job.clone())?;
        Ok(job)
    }

    /// Build a job and submit it to the bound engine.
    ///
    /// # Errors
    ///
    /// Fails when no engine is bound or submission fails.
    pub fn submit(&self, args: TaskArgs) -> EngineResult<Job> {
        let handle = self.bound()?.clone();
        let job = self.builder(args)?.build();
        handle.submit(job.clone())?;
        Ok(job)
    }

    /// Submit to the bound engine and block for the result.
    ///
    /// # Errors
    ///
    /// The job's stored error on failure, or [`EngineError::Timeout`].
    pub fn call(&self, args: TaskArgs, timeout: Option<Duration>) -> Result<TaskValue, EngineError> {
        let job = self.submit(args)?;
        job.result(timeout)
    }

    /// Submit to the bound engine and await the result.
    ///
    /// # Errors
    ///
    /// The job's stored error on failure.
    pub async fn call_async(&self, args: TaskArgs) -> Result<TaskValue, EngineError> {
        let job = self.submit(args)?;
        job.future().result_async().await.map_err(EngineError::from)
    }
}

fn render_template(template: &str, args: &TaskArgs) -> EngineResult<String> {
    let (positional, _named) = args.parts();
    let mut rendered = template.to_string();
    for (idx, arg) in positional.iter().enumerate() {
        let TaskArg::Value(value) = arg else {
            return Err(EngineError::InvalidConfig(
                "command templates accept value arguments only".into(),
            ));
        };
        let text = match value {
            TaskValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&format!("{{{idx}}}"), &text);
    }
    Ok(rendered)
}
