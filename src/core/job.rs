//! Job records: identity, callable, lifecycle state, and the builder API.
//!
//! A [`Job`] is a cheap-to-clone handle over shared state. Users construct
//! jobs through the kind helpers ([`Job::local`], [`Job::thread`],
//! [`Job::process`], [`Job::distributed`], [`Job::streaming`]), submit them to
//! an [`crate::Engine`], and observe them through the handle or its
//! [`JobFuture`]. All lifecycle transitions are driven by the scheduler.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::backend::CancelFlag;
use crate::core::condition::Condition;
use crate::core::engine::{EngineHandle, EngineShared};
use crate::core::error::{EngineError, EngineResult, JobError};
use crate::core::future::{JobFuture, StreamHandle, StreamSink};
use crate::core::value::{TaskArgs, TaskValue};

/// Default minimum interval between condition re-evaluations for one job.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Opaque unique job identifier, assigned at construction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&JobId> for JobId {
    fn from(value: &JobId) -> Self {
        value.clone()
    }
}

impl Serialize for JobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self(String::deserialize(deserializer)?))
    }
}

/// Lifecycle status of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Constructed but not yet submitted.
    Created,
    /// Submitted, waiting for its condition and capacity.
    Pending,
    /// Dispatched to a backend.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error, retries exhausted.
    Failed,
    /// Cancelled by the user or the engine.
    Cancelled,
}

impl JobStatus {
    /// True for `done`, `failed`, and `cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Backend selector attached to each job.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Run inline on the scheduler task.
    Local,
    /// Offload to the engine's OS-thread pool.
    Thread,
    /// Offload to the engine's child-process pool.
    Process,
    /// Delegate to an external worker cluster.
    Distributed,
    /// A user-registered backend.
    Extension(String),
}

impl JobKind {
    /// Canonical lowercase name of the kind.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Thread => "thread",
            Self::Process => "process",
            Self::Distributed => "distributed",
            Self::Extension(name) => name,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        match value {
            "local" => Self::Local,
            "thread" => Self::Thread,
            "process" => Self::Process,
            "distributed" => Self::Distributed,
            other => Self::Extension(other.to_string()),
        }
    }
}

impl Serialize for JobKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for JobKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from(String::deserialize(deserializer)?.as_str()))
    }
}

/// Retry policy: how many times to re-pend a failed job, and how long to
/// gate each retry behind an `AfterTimepoint`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub max_attempts: u32,
    /// Delay before a retry becomes runnable again.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Execution context handed to native callables.
pub struct JobCtx {
    pub(crate) job_id: JobId,
    pub(crate) args: crate::core::value::ResolvedArgs,
    pub(crate) engine: EngineHandle,
    pub(crate) cancel: CancelFlag,
}

impl JobCtx {
    /// The job's resolved arguments, futures already substituted.
    #[must_use]
    pub fn args(&self) -> &crate::core::value::ResolvedArgs {
        &self.args
    }

    /// Handle back to the owning engine, for submitting follow-up jobs.
    #[must_use]
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Cooperative cancellation flag. Long-running callables should poll
    /// this and bail out when set.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Id of the job being executed.
    #[must_use]
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

/// Native function callable signature.
pub type SyncFn = Arc<dyn Fn(&JobCtx) -> anyhow::Result<TaskValue> + Send + Sync>;

/// Generator-producing callable signature.
pub type ProducerFn = Arc<dyn Fn(&JobCtx, &StreamSink) -> anyhow::Result<()> + Send + Sync>;

/// The unit of work a job wraps.
#[derive(Clone)]
pub enum Callable {
    /// A native closure; runnable on the local and thread backends.
    Sync(SyncFn),
    /// A generator-producing closure yielding a lazy sequence.
    Producer(ProducerFn),
    /// A registry-resolved task name; runnable on the process and
    /// distributed backends, where arguments travel serialized.
    Named(String),
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Sync(..)"),
            Self::Producer(_) => f.write_str("Producer(..)"),
            Self::Named(name) => write!(f, "Named({name})"),
        }
    }
}

pub(crate) struct JobState {
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_poll: Option<Instant>,
    pub streaming: bool,
    pub cancel_requested: bool,
    pub dep_condition: Option<Condition>,
    pub retry_gate: Option<Condition>,
    pub cancel_flag: Option<CancelFlag>,
}

pub(crate) struct JobInner {
    pub id: JobId,
    pub name: String,
    pub kind: JobKind,
    pub callable: Callable,
    pub args: TaskArgs,
    pub base_condition: Condition,
    pub retry: RetryPolicy,
    pub wait_interval: Duration,
    pub state: Mutex<JobState>,
    pub cv: Condvar,
    pub notify: Notify,
    pub future: JobFuture,
    pub engine: Mutex<Weak<EngineShared>>,
}

/// A stateful record of one unit of work.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Start building a local (inline) job from a native closure.
    pub fn local<F>(f: F) -> JobBuilder
    where
        F: Fn(&JobCtx) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        JobBuilder::new(JobKind::Local, Callable::Sync(Arc::new(f)))
    }

    /// Start building a thread-pool job from a native closure.
    pub fn thread<F>(f: F) -> JobBuilder
    where
        F: Fn(&JobCtx) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        JobBuilder::new(JobKind::Thread, Callable::Sync(Arc::new(f)))
    }

    /// Start building a process-pool job from a registered task name.
    pub fn process(task: impl Into<String>) -> JobBuilder {
        JobBuilder::new(JobKind::Process, Callable::Named(task.into()))
    }

    /// Start building a distributed job from a registered task name.
    pub fn distributed(task: impl Into<String>) -> JobBuilder {
        JobBuilder::new(JobKind::Distributed, Callable::Named(task.into()))
    }

    /// Start building a generator-producing job on the given backend kind.
    pub fn streaming<F>(kind: JobKind, f: F) -> JobBuilder
    where
        F: Fn(&JobCtx, &StreamSink) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        JobBuilder::new(kind, Callable::Producer(Arc::new(f)))
    }

    /// Start building a job with an explicit kind and callable.
    #[must_use]
    pub fn builder(kind: JobKind, callable: Callable) -> JobBuilder {
        JobBuilder::new(kind, callable)
    }

    /// The job's unique id.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.inner.id
    }

    /// Human-readable job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Backend selector.
    #[must_use]
    pub fn kind(&self) -> &JobKind {
        &self.inner.kind
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.inner.state.lock().status
    }

    /// Number of attempts made so far (0 before the first run).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    /// The retry policy this job was built with.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    /// The user-supplied condition (dependency and retry gates excluded).
    #[must_use]
    pub fn condition(&self) -> &Condition {
        &self.inner.base_condition
    }

    /// Handle to the job's eventual result.
    #[must_use]
    pub fn future(&self) -> JobFuture {
        self.inner.future.clone()
    }

    /// The lazy-sequence handle, once a producer job has been dispatched.
    #[must_use]
    pub fn stream(&self) -> Option<StreamHandle> {
        self.inner.future.stream()
    }

    /// Construction timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.state.lock().created_at
    }

    /// When the latest attempt started running, if the job ever ran.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().started_at
    }

    /// When the job reached a terminal status, if it has.
    #[must_use]
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().stopped_at
    }

    /// Submit this job to an engine; shorthand for `engine.submit_one`.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running or the job was already
    /// submitted.
    pub fn submit_to(&self, engine: &crate::Engine) -> EngineResult<JobFuture> {
        engine.submit_one(self.clone())
    }

    /// Request cancellation. Idempotent; valid from any non-terminal status.
    ///
    /// # Errors
    ///
    /// Fails when the job is not bound to a running engine.
    pub fn cancel(&self) -> EngineResult<()> {
        self.engine_handle().cancel(self.id())
    }

    /// Re-submit a terminal job; resets the attempt counter and clears the
    /// stored result.
    ///
    /// # Errors
    ///
    /// Fails when the job is not terminal or its engine is gone.
    pub fn rerun(&self) -> EngineResult<()> {
        let status = self.status();
        if !status.is_terminal() {
            return Err(EngineError::InvalidState {
                expected: "done, failed, or cancelled".into(),
                actual: status,
            });
        }
        self.engine_handle().rerun(self.id())
    }

    /// Block until the job reaches `target` or any terminal status; returns
    /// the status reached.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when the deadline passes first. Job state is
    /// untouched on timeout.
    pub fn wait(&self, target: JobStatus, timeout: Option<Duration>) -> EngineResult<JobStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            if state.status == target || state.status.is_terminal() {
                return Ok(state.status);
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.cv.wait_until(&mut state, deadline).timed_out() {
                        return Err(EngineError::Timeout);
                    }
                }
                None => self.inner.cv.wait(&mut state),
            }
        }
    }

    /// Async analogue of [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when the deadline passes first.
    pub async fn wait_async(
        &self,
        target: JobStatus,
        timeout: Option<Duration>,
    ) -> EngineResult<JobStatus> {
        let waiting = async {
            loop {
                let notified = self.inner.notify.notified();
                {
                    let state = self.inner.state.lock();
                    if state.status == target || state.status.is_terminal() {
                        return state.status;
                    }
                }
                notified.await;
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, waiting)
                .await
                .map_err(|_| EngineError::Timeout),
            None => Ok(waiting.await),
        }
    }

    /// Block until terminal and return the result value.
    ///
    /// # Errors
    ///
    /// The stored [`JobError`] when the job failed or was cancelled, or
    /// [`EngineError::Timeout`].
    pub fn result(&self, timeout: Option<Duration>) -> Result<TaskValue, EngineError> {
        self.inner.future.result(timeout)
    }

    /// Block until terminal and return the stored error, if any.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when the deadline passes first.
    pub fn exception(&self, timeout: Option<Duration>) -> Result<Option<JobError>, EngineError> {
        self.inner.future.exception(timeout)
    }

    // ---- crate-internal: scheduler-side state management ----

    pub(crate) fn callable(&self) -> &Callable {
        &self.inner.callable
    }

    pub(crate) fn args(&self) -> &TaskArgs {
        &self.inner.args
    }

    pub(crate) fn bind_engine(&self, shared: &Arc<EngineShared>) {
        *self.inner.engine.lock() = Arc::downgrade(shared);
    }

    pub(crate) fn engine_handle(&self) -> EngineHandle {
        EngineHandle::from_weak(self.inner.engine.lock().clone())
    }

    /// Move to a new status, maintaining timestamp invariants and waking
    /// status waiters. Returns the previous status.
    pub(crate) fn apply_status(&self, new_status: JobStatus) -> JobStatus {
        let old = {
            let mut state = self.inner.state.lock();
            let old = state.status;
            state.status = new_status;
            match new_status {
                JobStatus::Running => state.started_at = Some(Utc::now()),
                JobStatus::Pending => state.stopped_at = None,
                s if s.is_terminal() => state.stopped_at = Some(Utc::now()),
                _ => {}
            }
            old
        };
        self.inner.cv.notify_all();
        self.inner.notify.notify_waiters();
        old
    }

    /// The user condition conjoined with dependency and retry gates.
    pub(crate) fn effective_condition(&self) -> Condition {
        let state = self.inner.state.lock();
        let mut parts = vec![self.inner.base_condition.clone()];
        if let Some(dep) = &state.dep_condition {
            parts.push(dep.clone());
        }
        if let Some(gate) = &state.retry_gate {
            parts.push(gate.clone());
        }
        if parts.len() == 1 {
            parts.pop().unwrap_or(Condition::Always)
        } else {
            Condition::AllSatisfied(parts)
        }
    }

    /// True when the job's wait interval has elapsed since the last poll;
    /// records this poll.
    pub(crate) fn poll_due(&self, now: Instant) -> bool {
        let mut state = self.inner.state.lock();
        let due = state
            .last_poll
            .map_or(true, |last| now.duration_since(last) >= self.inner.wait_interval);
        if due {
            state.last_poll = Some(now);
        }
        due
    }

    pub(crate) fn set_dep_condition(&self, condition: Option<Condition>) {
        self.inner.state.lock().dep_condition = condition;
    }

    pub(crate) fn arm_retry(&self, gate: Condition) {
        let mut state = self.inner.state.lock();
        state.retry_gate = Some(gate);
        state.last_poll = None;
    }

    pub(crate) fn begin_dispatch(&self, cancel: CancelFlag, streaming: bool) {
        let mut state = self.inner.state.lock();
        state.attempts += 1;
        state.cancel_flag = Some(cancel);
        state.streaming = streaming;
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.inner.state.lock().streaming
    }

    /// Flag the job as cancel-requested and trip its cooperative cancel
    /// flag, if one is armed.
    pub(crate) fn request_cancel(&self) {
        let mut state = self.inner.state.lock();
        state.cancel_requested = true;
        if let Some(flag) = &state.cancel_flag {
            flag.cancel();
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.state.lock().cancel_requested
    }

    /// Reset for a rerun: attempts and gates cleared, result slot emptied.
    pub(crate) fn reset_for_rerun(&self) {
        {
            let mut state = self.inner.state.lock();
            state.attempts = 0;
            state.retry_gate = None;
            state.cancel_requested = false;
            state.cancel_flag = None;
            state.streaming = false;
            state.last_poll = None;
        }
        self.inner.future.reset();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("status", &self.status())
            .finish()
    }
}

type BuilderDoneCallback = Arc<dyn Fn(&TaskValue) + Send + Sync>;
type BuilderErrorCallback = Arc<dyn Fn(&JobError) + Send + Sync>;

/// Builder for [`Job`]s; clonable, so it doubles as a resubmission template
/// for the cron and sentinel extensions.
#[derive(Clone)]
pub struct JobBuilder {
    kind: JobKind,
    callable: Callable,
    args: TaskArgs,
    condition: Condition,
    retry: RetryPolicy,
    wait_interval: Duration,
    name: Option<String>,
    done_callbacks: Vec<BuilderDoneCallback>,
    error_callbacks: Vec<BuilderErrorCallback>,
}

impl JobBuilder {
    fn new(kind: JobKind, callable: Callable) -> Self {
        Self {
            kind,
            callable,
            args: TaskArgs::new(),
            condition: Condition::Always,
            retry: RetryPolicy::default(),
            wait_interval: DEFAULT_WAIT_INTERVAL,
            name: None,
            done_callbacks: Vec::new(),
            error_callbacks: Vec::new(),
        }
    }

    /// Set the full argument list.
    #[must_use]
    pub fn args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    /// Append one positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<crate::core::value::TaskArg>) -> Self {
        self.args = self.args.arg(value);
        self
    }

    /// Set a named argument.
    #[must_use]
    pub fn named_arg(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::core::value::TaskArg>,
    ) -> Self {
        self.args = self.args.named(key, value);
        self
    }

    /// Gate the job on a condition (default: always satisfied).
    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Allow up to `max_attempts` retries, `delay` apart.
    #[must_use]
    pub fn retries(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy {
            max_attempts,
            delay,
        };
        self
    }

    /// Set the job's display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Minimum interval between condition re-evaluations.
    #[must_use]
    pub fn wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Observer fired with the result when the job finishes `done`.
    #[must_use]
    pub fn on_done(mut self, callback: impl Fn(&TaskValue) + Send + Sync + 'static) -> Self {
        self.done_callbacks.push(Arc::new(callback));
        self
    }

    /// Observer fired with the error when the job settles `failed` or
    /// `cancelled`.
    #[must_use]
    pub fn on_error(mut self, callback: impl Fn(&JobError) + Send + Sync + 'static) -> Self {
        self.error_callbacks.push(Arc::new(callback));
        self
    }

    /// Construct the job in `created` status.
    #[must_use]
    pub fn build(self) -> Job {
        let id = JobId::generate();
        let name = self.name.unwrap_or_else(|| match &self.callable {
            Callable::Named(task) => task.clone(),
            _ => self.kind.name().to_string(),
        });
        let future = JobFuture::new(id.clone());
        for cb in self.done_callbacks {
            future.on_done(move |value| cb(value));
        }
        for cb in self.error_callbacks {
            future.on_error(move |err| cb(err));
        }
        Job {
            inner: Arc::new(JobInner {
                id,
                name,
                kind: self.kind,
                callable: self.callable,
                args: self.args,
                base_condition: self.condition,
                retry: self.retry,
                wait_interval: self.wait_interval,
                state: Mutex::new(JobState {
                    status: JobStatus::Created,
                    attempts: 0,
                    created_at: Utc::now(),
                    started_at: None,
                    stopped_at: None,
                    last_poll: None,
                    streaming: false,
                    cancel_requested: false,
                    dep_condition: None,
                    retry_gate: None,
                    cancel_flag: None,
                }),
                cv: Condvar::new(),
                notify: Notify::new(),
                future,
                engine: Mutex::new(Weak::new()),
            }),
        }
    }
}

impl fmt::Debug for JobBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobBuilder")
            .field("kind", &self.kind)
            .field("callable", &self.callable)
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_defaults() {
        let job = Job::thread(|_ctx| Ok(json!(1))).build();
        assert_eq!(job.status(), JobStatus::Created);
        assert_eq!(job.kind(), &JobKind::Thread);
        assert_eq!(job.attempts(), 0);
        assert_eq!(job.name(), "thread");
        assert!(job.started_at().is_none());
        assert!(job.stopped_at().is_none());
    }

    #[test]
    fn test_named_job_takes_task_name() {
        let job = Job::process("add").build();
        assert_eq!(job.name(), "add");
        assert_eq!(job.kind(), &JobKind::Process);
    }

    #[test]
    fn test_status_display_and_terminal() {
        assert_eq!(JobStatus::Pending.to_string(), "pending");
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_kind_round_trips_as_string() {
        for kind in [
            JobKind::Local,
            JobKind::Thread,
            JobKind::Process,
            JobKind::Distributed,
            JobKind::Extension("gpu".into()),
        ] {
            let text = serde_json::to_string(&kind).unwrap();
            let back: JobKind = serde_json::from_str(&text).unwrap();
            assert_eq!(kind, back);
        }
    }

    #[test]
    fn test_apply_status_maintains_timestamps() {
        let job = Job::thread(|_ctx| Ok(json!(0))).build();
        job.apply_status(JobStatus::Pending);
        assert!(job.stopped_at().is_none());
        job.apply_status(JobStatus::Running);
        assert!(job.started_at().is_some());
        job.apply_status(JobStatus::Done);
        assert!(job.stopped_at().is_some());
        job.apply_status(JobStatus::Pending);
        assert!(job.stopped_at().is_none());
        assert!(job.started_at().is_some());
    }

    #[test]
    fn test_poll_due_respects_wait_interval() {
        let job = Job::thread(|_ctx| Ok(json!(0)))
            .wait_interval(Duration::from_secs(60))
            .build();
        let now = Instant::now();
        assert!(job.poll_due(now));
        assert!(!job.poll_due(now + Duration::from_secs(1)));
        assert!(job.poll_due(now + Duration::from_secs(61)));
    }

    #[test]
    fn test_effective_condition_composes_gates() {
        let job = Job::thread(|_ctx| Ok(json!(0)))
            .condition(Condition::after_another("a"))
            .build();
        job.set_dep_condition(Some(Condition::after_others(["b"])));
        job.arm_retry(Condition::after_timepoint(Utc::now()));
        match job.effective_condition() {
            Condition::AllSatisfied(parts) => assert_eq!(parts.len(), 3),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_begin_dispatch_counts_attempts() {
        let job = Job::thread(|_ctx| Ok(json!(0))).build();
        job.begin_dispatch(crate::backend::CancelFlag::new(), false);
        assert_eq!(job.attempts(), 1);
        job.begin_dispatch(crate::backend::CancelFlag::new(), false);
        assert_eq!(job.attempts(), 2);
    }

    #[test]
    fn test_rerun_requires_terminal() {
        let job = Job::thread(|_ctx| Ok(json!(0))).build();
        let err = job.rerun().unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }
}
