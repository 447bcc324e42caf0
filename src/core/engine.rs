//! Public engine facade.
//!
//! Exactly one cooperative scheduler task runs per engine. In sync mode
//! ([`Engine::start`]) a private background thread hosts a current-thread
//! tokio runtime running the scheduler; public methods post to its mailbox
//! and block on completion primitives. In async mode ([`Engine::start_async`])
//! the caller's runtime hosts the scheduler directly. An engine is not meant
//! to be shared across multiple host loops.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::backend::{
    Backend, ClusterClient, DistributedBackend, LocalBackend, ProcessBackend, ThreadBackend,
};
use crate::config::EngineSetting;
use crate::core::condition::{Condition, ConditionMode, EngineView, StatusSet};
use crate::core::error::{BackendError, EngineError, EngineResult};
use crate::core::future::JobFuture;
use crate::core::job::{Job, JobId, JobKind, JobStatus};
use crate::core::scheduler::{EngineMsg, IdleWaiter, Scheduler};
use crate::core::store::{JobRegistry, JobsView};

pub(crate) struct EngineShared {
    pub id: String,
    pub setting: EngineSetting,
    pub registry: JobRegistry,
    pub tx: RwLock<Option<tokio::sync::mpsc::UnboundedSender<EngineMsg>>>,
}

impl EngineShared {
    pub(crate) fn send(&self, msg: EngineMsg) -> EngineResult<()> {
        let guard = self.tx.read();
        let tx = guard.as_ref().ok_or(EngineError::NotRunning)?;
        tx.send(msg).map_err(|_| EngineError::NotRunning)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.tx.read().is_some()
    }

    /// Register, bind, and enqueue a batch of created jobs.
    pub(crate) fn submit_jobs(
        self: &Arc<Self>,
        jobs: Vec<Job>,
    ) -> EngineResult<Vec<JobFuture>> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        for job in &jobs {
            let status = job.status();
            if status != JobStatus::Created {
                return Err(EngineError::InvalidState {
                    expected: "created".into(),
                    actual: status,
                });
            }
        }
        {
            let mut registry = self.registry.write();
            for job in &jobs {
                job.bind_engine(self);
                let deps = job.args().future_deps();
                if deps.is_empty() {
                    job.set_dep_condition(None);
                } else {
                    // The dispatch gate accepts any terminal producer status;
                    // a failed or cancelled producer then surfaces as a
                    // dependency failure at argument resolution.
                    job.set_dep_condition(Some(Condition::after_others_in(
                        deps,
                        StatusSet::terminal(),
                        ConditionMode::All,
                    )));
                }
                registry.insert(job.id().clone(), job.clone());
            }
        }
        let mut futures = Vec::with_capacity(jobs.len());
        for job in jobs {
            futures.push(job.future());
            self.send(EngineMsg::Submit(job))?;
        }
        Ok(futures)
    }
}

/// Cheap, weak handle back to an engine.
///
/// Handed to running callables through [`crate::JobCtx`]; lets jobs submit
/// follow-up work and inspect statuses without keeping the engine alive.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Weak<EngineShared>,
}

impl EngineHandle {
    pub(crate) fn from_shared(shared: &Arc<EngineShared>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
        }
    }

    pub(crate) fn from_weak(shared: Weak<EngineShared>) -> Self {
        Self { shared }
    }

    fn upgrade(&self) -> EngineResult<Arc<EngineShared>> {
        self.shared.upgrade().ok_or(EngineError::NotRunning)
    }

    /// Submit one job, returning its future.
    ///
    /// # Errors
    ///
    /// Fails when the engine is gone, stopped, or the job is not `created`.
    pub fn submit(&self, job: Job) -> EngineResult<JobFuture> {
        let mut futures = self.upgrade()?.submit_jobs(vec![job])?;
        futures.pop().ok_or(EngineError::NotRunning)
    }

    /// Request cancellation of a job by id.
    ///
    /// # Errors
    ///
    /// Fails when the engine is gone or stopped.
    pub fn cancel(&self, id: &JobId) -> EngineResult<()> {
        self.upgrade()?.send(EngineMsg::Cancel(id.clone()))
    }

    /// Request a rerun of a terminal job by id.
    ///
    /// # Errors
    ///
    /// Fails when the engine is gone or stopped.
    pub fn rerun(&self, id: &JobId) -> EngineResult<()> {
        self.upgrade()?.send(EngineMsg::Rerun(id.clone()))
    }

    /// Current status of a job, if the engine knows it.
    #[must_use]
    pub fn status_of(&self, id: &JobId) -> Option<JobStatus> {
        let shared = self.shared.upgrade()?;
        let registry = shared.registry.read();
        registry.get(id).map(Job::status)
    }

    /// Evaluate a condition against current engine state.
    #[must_use]
    pub fn satisfy(&self, condition: &Condition) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                let registry = shared.registry.read();
                condition.satisfy(&EngineView::new(&*registry, Utc::now()))
            }
            None => false,
        }
    }

    /// View over every job the engine has seen.
    ///
    /// # Errors
    ///
    /// Fails when the engine is gone.
    pub fn jobs(&self) -> EngineResult<JobsView> {
        Ok(JobsView::new(Arc::clone(&self.upgrade()?.registry)))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineHandle")
    }
}

enum SchedulerHost {
    /// Sync mode: dedicated thread with its own current-thread runtime.
    Thread(std::thread::JoinHandle<()>),
    /// Async mode: task on the caller's runtime.
    Task(tokio::task::JoinHandle<()>),
}

/// The job execution engine.
///
/// # Example
///
/// ```no_run
/// use jobflow::{Engine, EngineSetting, Job};
/// use serde_json::json;
///
/// # fn main() -> Result<(), jobflow::EngineError> {
/// Engine::scope(EngineSetting::default(), |engine| {
///     let job = Job::thread(|_ctx| Ok(json!(2 + 2))).build();
///     let future = job.submit_to(engine)?;
///     assert_eq!(future.result(None)?, json!(4));
///     Ok(())
/// })?
/// # }
/// ```
pub struct Engine {
    shared: Arc<EngineShared>,
    host: Mutex<Option<SchedulerHost>>,
    cluster: Mutex<Option<Arc<dyn ClusterClient>>>,
    extra_backends: Mutex<HashMap<JobKind, Arc<dyn Backend>>>,
}

impl Engine {
    /// Build an engine from settings.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] when validation fails.
    pub fn new(setting: EngineSetting) -> EngineResult<Self> {
        setting.validate().map_err(EngineError::InvalidConfig)?;
        Ok(Self::build(setting))
    }

    fn build(setting: EngineSetting) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                id: Uuid::new_v4().to_string(),
                setting,
                registry: Arc::new(RwLock::new(HashMap::new())),
                tx: RwLock::new(None),
            }),
            host: Mutex::new(None),
            cluster: Mutex::new(None),
            extra_backends: Mutex::new(HashMap::new()),
        }
    }

    /// Start, run `f`, and stop on every exit path (including panics).
    ///
    /// # Errors
    ///
    /// Propagates configuration and startup errors.
    pub fn scope<R>(setting: EngineSetting, f: impl FnOnce(&Engine) -> R) -> EngineResult<R> {
        let engine = Engine::new(setting)?;
        engine.start()?;

        struct StopGuard<'a>(&'a Engine);
        impl Drop for StopGuard<'_> {
            fn drop(&mut self) {
                let _ = self.0.stop();
            }
        }

        let guard = StopGuard(&engine);
        let out = f(&engine);
        drop(guard);
        Ok(out)
    }

    /// The engine's unique id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// The settings this engine was built with.
    #[must_use]
    pub fn setting(&self) -> &EngineSetting {
        &self.shared.setting
    }

    /// Weak handle usable from jobs and other threads.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle::from_shared(&self.shared)
    }

    /// View over every job the engine has seen.
    #[must_use]
    pub fn jobs(&self) -> JobsView {
        JobsView::new(Arc::clone(&self.shared.registry))
    }

    /// True while the scheduler is up.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Set the cluster client backing the distributed kind. Takes effect at
    /// the next `start`.
    pub fn set_cluster(&self, client: Arc<dyn ClusterClient>) {
        *self.cluster.lock() = Some(client);
    }

    /// Register a backend for a custom job kind. Takes effect at the next
    /// `start`; replaces any built-in backend for that kind.
    pub fn register_backend(&self, kind: JobKind, backend: Arc<dyn Backend>) {
        self.extra_backends.lock().insert(kind, backend);
    }

    fn build_backends(&self) -> HashMap<JobKind, Arc<dyn Backend>> {
        let setting = &self.shared.setting;
        let mut backends: HashMap<JobKind, Arc<dyn Backend>> = HashMap::new();
        backends.insert(JobKind::Local, Arc::new(LocalBackend::new()));
        backends.insert(
            JobKind::Thread,
            Arc::new(ThreadBackend::new(setting.thread_workers())),
        );
        backends.insert(
            JobKind::Process,
            Arc::new(ProcessBackend::new(setting.process_workers())),
        );
        if let Some(client) = self.cluster.lock().clone() {
            backends.insert(
                JobKind::Distributed,
                Arc::new(DistributedBackend::new(client)),
            );
        }
        for (kind, backend) in self.extra_backends.lock().iter() {
            backends.insert(kind.clone(), Arc::clone(backend));
        }
        backends
    }

    /// Start the scheduler on a private background thread. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails when the runtime or thread cannot be created.
    pub fn start(&self) -> EngineResult<()> {
        let mut host = self.host.lock();
        if host.is_some() {
            return Ok(());
        }
        let scheduler = self.make_scheduler();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                *self.shared.tx.write() = None;
                EngineError::Backend(BackendError::Launch(format!(
                    "failed to build scheduler runtime: {err}"
                )))
            })?;
        let thread = std::thread::Builder::new()
            .name("jobflow-scheduler".into())
            .spawn(move || runtime.block_on(scheduler.run()))
            .map_err(|err| {
                *self.shared.tx.write() = None;
                EngineError::Backend(BackendError::Launch(format!(
                    "failed to spawn scheduler thread: {err}"
                )))
            })?;
        *host = Some(SchedulerHost::Thread(thread));
        debug!(engine = %self.shared.id, "engine started (sync mode)");
        Ok(())
    }

    /// Start the scheduler on the caller's tokio runtime. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails when called outside a tokio runtime.
    pub fn start_async(&self) -> EngineResult<()> {
        let mut host = self.host.lock();
        if host.is_some() {
            return Ok(());
        }
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            EngineError::InvalidConfig("start_async requires a running tokio runtime".into())
        })?;
        let scheduler = self.make_scheduler();
        let task = handle.spawn(scheduler.run());
        *host = Some(SchedulerHost::Task(task));
        debug!(engine = %self.shared.id, "engine started (async mode)");
        Ok(())
    }

    fn make_scheduler(&self) -> Scheduler {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *self.shared.tx.write() = Some(tx.clone());
        Scheduler::new(Arc::clone(&self.shared), rx, tx, self.build_backends())
    }

    /// Cancel outstanding jobs, drain, and terminate the scheduler.
    /// Idempotent. For thread-hosted engines this blocks until the
    /// scheduler has exited; task-hosted engines should prefer
    /// [`stop_async`](Self::stop_async).
    ///
    /// # Errors
    ///
    /// Currently infallible; returns a result for forward compatibility.
    pub fn stop(&self) -> EngineResult<()> {
        let Some(host) = self.host.lock().take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let sent = self.shared.send(EngineMsg::Stop(done_tx)).is_ok();
        *self.shared.tx.write() = None;
        match host {
            SchedulerHost::Thread(thread) => {
                if sent {
                    let _ = done_rx.blocking_recv();
                }
                let _ = thread.join();
            }
            SchedulerHost::Task(task) => {
                // The stop message terminates the loop; nothing to join
                // without blocking the caller's runtime.
                drop(task);
            }
        }
        debug!(engine = %self.shared.id, "engine stopped");
        Ok(())
    }

    /// Async analogue of [`stop`](Self::stop); awaits scheduler exit.
    ///
    /// # Errors
    ///
    /// Currently infallible; returns a result for forward compatibility.
    pub async fn stop_async(&self) -> EngineResult<()> {
        let Some(host) = self.host.lock().take() else {
            return Ok(());
        };
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let sent = self.shared.send(EngineMsg::Stop(done_tx)).is_ok();
        *self.shared.tx.write() = None;
        if sent {
            let _ = done_rx.await;
        }
        match host {
            SchedulerHost::Task(task) => {
                let _ = task.await;
            }
            SchedulerHost::Thread(thread) => {
                let _ = tokio::task::spawn_blocking(move || thread.join()).await;
            }
        }
        debug!(engine = %self.shared.id, "engine stopped");
        Ok(())
    }

    /// Enqueue jobs; returns their futures without blocking.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running or any job is not `created`.
    pub fn submit(&self, jobs: impl IntoIterator<Item = Job>) -> EngineResult<Vec<JobFuture>> {
        self.shared.submit_jobs(jobs.into_iter().collect())
    }

    /// Submit one job, returning its future.
    ///
    /// # Errors
    ///
    /// Same conditions as [`submit`](Self::submit).
    pub fn submit_one(&self, job: Job) -> EngineResult<JobFuture> {
        let mut futures = self.shared.submit_jobs(vec![job])?;
        futures.pop().ok_or(EngineError::NotRunning)
    }

    /// Awaitable analogue of [`submit`](Self::submit); the enqueue itself
    /// never blocks.
    ///
    /// # Errors
    ///
    /// Same conditions as [`submit`](Self::submit).
    pub async fn submit_async(
        &self,
        jobs: impl IntoIterator<Item = Job>,
    ) -> EngineResult<Vec<JobFuture>> {
        self.submit(jobs)
    }

    /// Block until no pending jobs remain and every running job is a
    /// streaming generator.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running.
    pub fn wait(&self) -> EngineResult<()> {
        self.wait_timeout(None)
    }

    /// [`wait`](Self::wait) with a deadline.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when the deadline passes first.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> EngineResult<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.shared.send(EngineMsg::WaitIdle(IdleWaiter::Sync(tx)))?;
        match timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|_| EngineError::Timeout),
            None => rx.recv().map_err(|_| EngineError::NotRunning),
        }
    }

    /// Await engine idleness; see [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running.
    pub async fn wait_async(&self) -> EngineResult<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.shared
            .send(EngineMsg::WaitIdle(IdleWaiter::Async(tx)))?;
        rx.await.map_err(|_| EngineError::NotRunning)
    }

    /// Alias for [`wait`](Self::wait).
    ///
    /// # Errors
    ///
    /// Same conditions as [`wait`](Self::wait).
    pub fn join(&self) -> EngineResult<()> {
        self.wait()
    }

    /// Block until `job` reaches a terminal status; returns that status.
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] when the deadline passes first; job state is
    /// unchanged.
    pub fn wait_job(&self, job: &Job, timeout: Option<Duration>) -> EngineResult<JobStatus> {
        job.wait(JobStatus::Done, timeout)
    }

    /// Request cancellation of a job. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running.
    pub fn cancel(&self, job: &Job) -> EngineResult<()> {
        self.shared.send(EngineMsg::Cancel(job.id().clone()))
    }

    /// Resubmit a terminal job with a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// Fails when the job is not terminal or the engine is not running.
    pub fn rerun(&self, job: &Job) -> EngineResult<()> {
        let status = job.status();
        if !status.is_terminal() {
            return Err(EngineError::InvalidState {
                expected: "done, failed, or cancelled".into(),
                actual: status,
            });
        }
        self.shared.send(EngineMsg::Rerun(job.id().clone()))
    }

    /// Drop bookkeeping for jobs in the given statuses.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running.
    pub fn clear(&self, statuses: &[JobStatus]) -> EngineResult<()> {
        self.shared.send(EngineMsg::Clear(statuses.to_vec()))
    }

    /// Drop bookkeeping for done, failed, and cancelled jobs.
    ///
    /// # Errors
    ///
    /// Fails when the engine is not running.
    pub fn clear_non_active(&self) -> EngineResult<()> {
        self.clear(&[JobStatus::Done, JobStatus::Failed, JobStatus::Cancelled])
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::build(EngineSetting::default())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Signal the scheduler but do not join: a wedged callable must not
        // hang the dropping thread. Explicit stop() is the graceful path.
        if let Some(host) = self.host.lock().take() {
            let (done_tx, _done_rx) = tokio::sync::oneshot::channel();
            let _ = self.shared.send(EngineMsg::Stop(done_tx));
            *self.shared.tx.write() = None;
            drop(host);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("running", &self.is_running())
            .finish()
    }
}
