//! The engine's cooperative scheduling loop.
//!
//! One scheduler task owns all mutable scheduling state: the status buckets,
//! the running-count capacity accounting, and the idle waiters. Everything
//! external reaches it through a single mailbox; backends report completions
//! on the same mailbox, so the loop sleeps on `select!` instead of polling.
//!
//! Per tick: drain the mailbox, then walk pending jobs in submission order,
//! polling each job's effective condition at most once (rate-limited by its
//! wait interval) and dispatching those that are runnable within per-kind and
//! global capacity.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

use crate::backend::{
    Backend, CancelFlag, Completion, CompletionSink, LaunchSpec, Outcome,
};
use crate::config::CacheType;
use crate::core::condition::{Condition, EngineView};
use crate::core::engine::{EngineHandle, EngineShared};
use crate::core::error::{BackendError, JobError};
use crate::core::future::stream_pair;
use crate::core::job::{Callable, Job, JobId, JobStatus};
use crate::core::store::JobStore;
use crate::core::value::{ResolvedArgs, TaskArg, TaskValue};
use crate::infra::snapshot::{JobRecord, SnapshotStore};

/// A waiter released when the engine has no pending work left.
pub(crate) enum IdleWaiter {
    Sync(crossbeam_channel::Sender<()>),
    Async(tokio::sync::oneshot::Sender<()>),
}

impl IdleWaiter {
    fn notify(self) {
        match self {
            Self::Sync(tx) => {
                let _ = tx.send(());
            }
            Self::Async(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

/// Messages accepted by the scheduler mailbox.
pub(crate) enum EngineMsg {
    /// A newly submitted job, already registered and bound.
    Submit(Job),
    /// User-requested cancellation.
    Cancel(JobId),
    /// User-requested resubmission of a terminal job.
    Rerun(JobId),
    /// A backend reported an execution outcome.
    Completed(Completion),
    /// A producer job's stream was fully consumed or closed.
    StreamExhausted(JobId),
    /// Drop finished bookkeeping for the given statuses.
    Clear(Vec<JobStatus>),
    /// Release the waiter once no pending or (non-streaming) running jobs
    /// remain.
    WaitIdle(IdleWaiter),
    /// Cancel everything, drain, and terminate the loop.
    Stop(tokio::sync::oneshot::Sender<()>),
}

pub(crate) struct Scheduler {
    shared: Arc<EngineShared>,
    rx: UnboundedReceiver<EngineMsg>,
    tx: UnboundedSender<EngineMsg>,
    store: JobStore,
    backends: HashMap<crate::core::job::JobKind, Arc<dyn Backend>>,
    running: HashMap<crate::core::job::JobKind, usize>,
    idle_waiters: Vec<IdleWaiter>,
    snapshots: Option<SnapshotStore>,
}

impl Scheduler {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        rx: UnboundedReceiver<EngineMsg>,
        tx: UnboundedSender<EngineMsg>,
        backends: HashMap<crate::core::job::JobKind, Arc<dyn Backend>>,
    ) -> Self {
        let snapshots = match shared.setting.cache_type {
            CacheType::Mem => None,
            CacheType::Disk => {
                let path = shared
                    .setting
                    .cache_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(".jobflow").join(&shared.id));
                match SnapshotStore::new(&path) {
                    Ok(store) => Some(store),
                    Err(err) => {
                        error!(%err, path = %path.display(), "cannot open snapshot dir");
                        None
                    }
                }
            }
        };
        Self {
            shared,
            rx,
            tx,
            store: JobStore::new(),
            backends,
            running: HashMap::new(),
            idle_waiters: Vec::new(),
            snapshots,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(engine = %self.shared.id, "scheduler started");
        loop {
            let tick = self.shared.setting.tick();
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(EngineMsg::Stop(done)) => {
                        self.shutdown(Some(done));
                        return;
                    }
                    Some(msg) => self.handle_msg(msg),
                    None => {
                        self.shutdown(None);
                        return;
                    }
                },
                () = tokio::time::sleep(tick) => {}
            }
            // Drain whatever queued up behind the first message before the
            // pending scan, so one tick sees a consistent batch.
            loop {
                match self.rx.try_recv() {
                    Ok(EngineMsg::Stop(done)) => {
                        self.shutdown(Some(done));
                        return;
                    }
                    Ok(msg) => self.handle_msg(msg),
                    Err(_) => break,
                }
            }
            self.poll_pending();
            self.notify_if_idle();
        }
    }

    fn handle_msg(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Submit(job) => {
                debug!(job = %job.id(), name = job.name(), "job submitted");
                self.transition(&job, JobStatus::Pending);
            }
            EngineMsg::Cancel(id) => self.handle_cancel(&id),
            EngineMsg::Rerun(id) => self.handle_rerun(&id),
            EngineMsg::Completed(completion) => self.handle_completion(completion),
            EngineMsg::StreamExhausted(id) => self.handle_stream_exhausted(&id),
            EngineMsg::Clear(statuses) => {
                let removed = self.store.clear(&statuses);
                let mut registry = self.shared.registry.write();
                for id in removed {
                    registry.remove(&id);
                }
            }
            EngineMsg::WaitIdle(waiter) => self.idle_waiters.push(waiter),
            EngineMsg::Stop(_) => {
                // Routed before dispatch; unreachable in practice.
            }
        }
    }

    fn handle_cancel(&mut self, id: &JobId) {
        let Some(job) = self.store.get(id).cloned() else {
            debug!(job = %id, "cancel for unknown job ignored");
            return;
        };
        match job.status() {
            JobStatus::Pending => {
                job.future().settle(Err(JobError::Cancelled));
                self.transition(&job, JobStatus::Cancelled);
            }
            JobStatus::Running => {
                job.request_cancel();
                if let Some(backend) = self.backends.get(job.kind()) {
                    backend.cancel(job.id());
                }
                if let Some(stream) = job.future().stream() {
                    stream.mark_cancelled();
                }
                job.future().settle(Err(JobError::Cancelled));
                self.transition(&job, JobStatus::Cancelled);
            }
            // Terminal and created statuses: cancel is idempotent.
            _ => {}
        }
    }

    fn handle_rerun(&mut self, id: &JobId) {
        let Some(job) = self.store.get(id).cloned() else {
            warn!(job = %id, "rerun for unknown job ignored");
            return;
        };
        if !job.status().is_terminal() {
            warn!(job = %id, status = %job.status(), "rerun ignored for non-terminal job");
            return;
        }
        debug!(job = %id, "rerun");
        job.reset_for_rerun();
        self.transition(&job, JobStatus::Pending);
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Completion { job_id, outcome } = completion;
        let Some(job) = self.store.get(&job_id).cloned() else {
            debug!(job = %job_id, "completion for unknown job ignored");
            return;
        };
        if job.status() != JobStatus::Running {
            // Late report after a cancellation or rerun; the job has moved on.
            debug!(job = %job_id, status = %job.status(), "stale completion ignored");
            return;
        }
        if job.cancel_requested() {
            job.future().settle(Err(JobError::Cancelled));
            self.transition(&job, JobStatus::Cancelled);
            return;
        }
        match outcome {
            Outcome::Cancelled => {
                job.future().settle(Err(JobError::Cancelled));
                self.transition(&job, JobStatus::Cancelled);
            }
            Outcome::Finished(Ok(value)) => {
                job.future().settle(Ok(value));
                self.transition(&job, JobStatus::Done);
            }
            Outcome::Finished(Err(err)) => self.handle_failure(&job, err),
        }
    }

    fn handle_failure(&mut self, job: &Job, err: JobError) {
        let policy = job.retry_policy();
        let attempts = job.attempts();
        let retryable = !matches!(err, JobError::DependencyFailed { .. });
        if retryable && attempts <= policy.max_attempts {
            warn!(
                job = %job.id(),
                attempts,
                max_attempts = policy.max_attempts,
                %err,
                "job failed; retry scheduled"
            );
            if let Some(stream) = job.future().stream() {
                stream.mark_cancelled();
            }
            let delay = chrono::Duration::from_std(policy.delay)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            job.arm_retry(Condition::after_timepoint(Utc::now() + delay));
            self.transition(job, JobStatus::Pending);
            return;
        }
        if self.shared.setting.print_traceback {
            error!(job = %job.id(), name = job.name(), %err, "job failed");
        }
        if let Some(stream) = job.future().stream() {
            stream.mark_cancelled();
        }
        job.future().settle(Err(err));
        self.transition(job, JobStatus::Failed);
    }

    fn handle_stream_exhausted(&mut self, id: &JobId) {
        let Some(job) = self.store.get(id).cloned() else {
            return;
        };
        if job.status() != JobStatus::Running || !job.is_streaming() {
            debug!(job = %id, "stale stream-exhausted ignored");
            return;
        }
        if job.cancel_requested() {
            job.future().settle(Err(JobError::Cancelled));
            self.transition(&job, JobStatus::Cancelled);
        } else {
            job.future().settle(Ok(TaskValue::Null));
            self.transition(&job, JobStatus::Done);
        }
    }

    /// Scan pending jobs in submission order and dispatch the runnable ones.
    fn poll_pending(&mut self) {
        let pending = self.store.pending_jobs();
        if pending.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut runnable = Vec::new();
        {
            let registry = self.shared.registry.read();
            let view = EngineView::new(&*registry, Utc::now());
            for job in pending {
                if !job.poll_due(now) {
                    continue;
                }
                if job.effective_condition().satisfy(&view) {
                    runnable.push(job);
                }
            }
        }
        for job in runnable {
            if let Some(cap) = self.shared.setting.cap_for(job.kind()) {
                if self.running_of_kind(job.kind()) >= cap {
                    continue;
                }
            }
            if let Some(cap) = self.shared.setting.max_jobs {
                if self.total_running() >= cap {
                    break;
                }
            }
            self.dispatch(job);
        }
    }

    fn dispatch(&mut self, job: Job) {
        let args = match self.resolve_args(&job) {
            Ok(args) => args,
            Err(err) => {
                warn!(job = %job.id(), %err, "dependency failed; job not executed");
                job.future().settle(Err(err));
                self.transition(&job, JobStatus::Failed);
                return;
            }
        };

        let cancel = CancelFlag::new();
        let mut sink = None;
        if matches!(job.callable(), Callable::Producer(_)) {
            let (producer_sink, handle) = stream_pair(job.id().clone());
            let tx = self.tx.clone();
            let id = job.id().clone();
            handle.set_on_exhausted(Box::new(move || {
                let _ = tx.send(EngineMsg::StreamExhausted(id));
            }));
            job.future().set_stream(handle);
            sink = Some(producer_sink);
        }
        job.begin_dispatch(cancel.clone(), sink.is_some());
        self.transition(&job, JobStatus::Running);

        let Some(backend) = self.backends.get(job.kind()).cloned() else {
            let err = BackendError::NotConfigured(job.kind().to_string());
            warn!(job = %job.id(), %err, "dispatch failed");
            job.future().settle(Err(JobError::Backend(err.to_string())));
            self.transition(&job, JobStatus::Failed);
            return;
        };

        debug!(job = %job.id(), kind = %job.kind(), attempt = job.attempts(), "dispatching");
        let spec = LaunchSpec {
            job: job.clone(),
            args,
            cancel,
            engine: EngineHandle::from_shared(&self.shared),
            sink,
            completions: CompletionSink::new(self.tx.clone()),
        };
        if let Err(err) = backend.launch(spec) {
            job.future().settle(Err(JobError::Backend(err.to_string())));
            self.transition(&job, JobStatus::Failed);
        }
    }

    /// Substitute future arguments with their producers' results.
    fn resolve_args(&self, job: &Job) -> Result<ResolvedArgs, JobError> {
        let (positional, named) = job.args().parts();
        let registry = self.shared.registry.read();
        let resolve = |arg: &TaskArg| -> Result<TaskValue, JobError> {
            match arg {
                TaskArg::Value(value) => Ok(value.clone()),
                TaskArg::Future(fut) => {
                    let upstream = fut.job_id().clone();
                    let Some(producer) = registry.get(&upstream) else {
                        return Err(JobError::DependencyFailed {
                            upstream,
                            status: JobStatus::Failed,
                        });
                    };
                    let status = producer.status();
                    if status == JobStatus::Done {
                        if let Some(Ok(value)) = producer.future().peek() {
                            return Ok(value);
                        }
                    }
                    Err(JobError::DependencyFailed { upstream, status })
                }
            }
        };
        let positional = positional
            .iter()
            .map(|arg| resolve(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let named = named
            .iter()
            .map(|(key, arg)| resolve(arg).map(|value| (key.clone(), value)))
            .collect::<Result<_, _>>()?;
        Ok(ResolvedArgs::from_parts(positional, named))
    }

    fn transition(&mut self, job: &Job, new_status: JobStatus) {
        let old = job.apply_status(new_status);
        if old == new_status {
            return;
        }
        if old == JobStatus::Created {
            self.store.insert(job.clone(), new_status);
        } else {
            self.store.move_job(job.id(), old, new_status);
        }
        if old == JobStatus::Running {
            if let Some(count) = self.running.get_mut(job.kind()) {
                *count = count.saturating_sub(1);
            }
        }
        if new_status == JobStatus::Running {
            *self.running.entry(job.kind().clone()).or_insert(0) += 1;
        }
        self.snapshot(job);
    }

    fn running_of_kind(&self, kind: &crate::core::job::JobKind) -> usize {
        self.running.get(kind).copied().unwrap_or(0)
    }

    fn total_running(&self) -> usize {
        self.running.values().sum()
    }

    /// Idle means nothing pending and every running job is a generator in
    /// its streaming phase; `wait()` excludes those by contract.
    fn is_idle(&self) -> bool {
        self.store.len(JobStatus::Pending) == 0
            && self.store.running_jobs().iter().all(Job::is_streaming)
    }

    fn notify_if_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            waiter.notify();
        }
    }

    fn shutdown(&mut self, done: Option<tokio::sync::oneshot::Sender<()>>) {
        debug!(engine = %self.shared.id, "scheduler stopping");
        for job in self.store.pending_jobs() {
            job.future().settle(Err(JobError::Cancelled));
            self.transition(&job, JobStatus::Cancelled);
        }
        for job in self.store.running_jobs() {
            job.request_cancel();
            if let Some(backend) = self.backends.get(job.kind()) {
                backend.cancel(job.id());
            }
            if let Some(stream) = job.future().stream() {
                stream.mark_cancelled();
            }
            job.future().settle(Err(JobError::Cancelled));
            self.transition(&job, JobStatus::Cancelled);
        }
        // Drain the mailbox so late senders are not left hanging.
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                EngineMsg::Stop(tx) => {
                    let _ = tx.send(());
                }
                EngineMsg::WaitIdle(waiter) => waiter.notify(),
                _ => {}
            }
        }
        for waiter in self.idle_waiters.drain(..) {
            waiter.notify();
        }
        for backend in self.backends.values() {
            backend.shutdown();
        }
        if let Some(done) = done {
            let _ = done.send(());
        }
        debug!(engine = %self.shared.id, "scheduler stopped");
    }

    fn snapshot(&self, job: &Job) {
        if let Some(store) = &self.snapshots {
            if let Err(err) = store.write(&JobRecord::from_job(job)) {
                warn!(job = %job.id(), %err, "snapshot write failed");
            }
        }
    }
}
