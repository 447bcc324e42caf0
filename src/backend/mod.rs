//! Pluggable execution backends.
//!
//! A [`Backend`] starts a prepared execution and reports its outcome on the
//! engine's completion mailbox; the scheduler never polls. Cancellation is
//! two-level: the scheduler flips the job's [`CancelFlag`] (observable by
//! cooperative user code) and calls [`Backend::cancel`] for backend-specific
//! teardown such as killing a child process.

pub mod distributed;
pub mod local;
pub mod process;
pub mod thread;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::engine::EngineHandle;
use crate::core::error::{BackendError, JobError};
use crate::core::future::{StreamClosed, StreamSink};
use crate::core::job::{Callable, Job, JobCtx, JobId};
use crate::core::scheduler::EngineMsg;
use crate::core::value::{ResolvedArgs, TaskValue};

pub use distributed::{ClusterClient, DistributedBackend, LoopbackCluster, RemoteTask};
pub use local::LocalBackend;
pub use process::{init_worker, ProcessBackend, TaskRegistry};
pub use thread::ThreadBackend;

/// Cooperative cancellation flag shared between the scheduler and a running
/// callable.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// A fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// What a backend reports when an execution terminates.
#[derive(Debug)]
pub enum Outcome {
    /// The callable returned a value or an error.
    Finished(Result<TaskValue, JobError>),
    /// The execution was torn down by a cancellation request.
    Cancelled,
}

/// A completion event, keyed by job id.
#[derive(Debug)]
pub struct Completion {
    /// The job whose execution terminated.
    pub job_id: JobId,
    /// How it terminated.
    pub outcome: Outcome,
}

/// Sender half of the engine's completion mailbox.
#[derive(Clone)]
pub struct CompletionSink {
    tx: tokio::sync::mpsc::UnboundedSender<EngineMsg>,
}

impl CompletionSink {
    pub(crate) fn new(tx: tokio::sync::mpsc::UnboundedSender<EngineMsg>) -> Self {
        Self { tx }
    }

    /// Deliver a completion event to the scheduler. Events for jobs no
    /// longer running are ignored on the receiving side, so late delivery
    /// after a cancellation race is harmless.
    pub fn deliver(&self, completion: Completion) {
        let _ = self.tx.send(EngineMsg::Completed(completion));
    }
}

impl std::fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CompletionSink")
    }
}

/// Everything a backend needs to run one dispatched job.
pub struct LaunchSpec {
    /// The job being executed.
    pub job: Job,
    /// Arguments with dependency futures already substituted.
    pub args: ResolvedArgs,
    /// Cooperative cancellation flag for this run.
    pub cancel: CancelFlag,
    /// Handle back to the owning engine.
    pub engine: EngineHandle,
    /// Producer-side stream sink, present only for generator jobs.
    pub sink: Option<StreamSink>,
    /// Where to report the outcome.
    pub completions: CompletionSink,
}

/// Contract every execution backend implements.
///
/// `launch` must not block the scheduler: thread and process backends hand
/// the spec to their worker pools, the distributed backend spawns an async
/// submission task. Only the local backend runs inline.
pub trait Backend: Send + Sync {
    /// Start executing the spec. The outcome is delivered later through
    /// `spec.completions`.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when execution could not be started at
    /// all; the scheduler fails the job without waiting for a completion.
    fn launch(&self, spec: LaunchSpec) -> Result<(), BackendError>;

    /// Backend-specific cancellation teardown for a running job.
    fn cancel(&self, _job_id: &JobId) {}

    /// Tear down worker pools at engine stop.
    fn shutdown(&self) {}
}

/// Run a native callable to completion, isolating panics.
///
/// `Ok(Some(value))` is a finished function job, `Ok(None)` a producer that
/// completed its emission loop (job completion is then driven by stream
/// exhaustion), `Err` a failure to store on the job.
pub(crate) fn execute_callable(
    job: &Job,
    args: ResolvedArgs,
    engine: EngineHandle,
    cancel: CancelFlag,
    sink: Option<&StreamSink>,
) -> Result<Option<TaskValue>, JobError> {
    let ctx = JobCtx {
        job_id: job.id().clone(),
        args,
        engine,
        cancel,
    };
    match job.callable() {
        Callable::Sync(f) => match catch_unwind(AssertUnwindSafe(|| f(&ctx))) {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(err)) => Err(JobError::UserCallable(format!("{err:#}"))),
            Err(panic) => Err(JobError::UserCallable(panic_message(&panic))),
        },
        Callable::Producer(f) => {
            let sink = sink.ok_or_else(|| {
                JobError::Backend("producer callable dispatched without a stream sink".into())
            })?;
            match catch_unwind(AssertUnwindSafe(|| f(&ctx, sink))) {
                Ok(Ok(())) => Ok(None),
                // A consumer closing the stream stops the producer; that is
                // normal termination, not a failure.
                Ok(Err(err)) if err.downcast_ref::<StreamClosed>().is_some() => Ok(None),
                Ok(Err(err)) => Err(JobError::UserCallable(format!("{err:#}"))),
                Err(panic) => Err(JobError::UserCallable(panic_message(&panic))),
            }
        }
        Callable::Named(task) => Err(JobError::Backend(format!(
            "task `{task}` requires the process or distributed backend"
        ))),
    }
}

/// Execute a spec on the current thread and deliver the outcome.
pub(crate) fn run_spec(spec: LaunchSpec) {
    let LaunchSpec {
        job,
        args,
        cancel,
        engine,
        sink,
        completions,
    } = spec;

    if cancel.is_cancelled() {
        completions.deliver(Completion {
            job_id: job.id().clone(),
            outcome: Outcome::Cancelled,
        });
        return;
    }

    let result = execute_callable(&job, args, engine, cancel.clone(), sink.as_ref());
    let outcome = match result {
        Ok(Some(value)) => Some(Outcome::Finished(Ok(value))),
        // Producer finished emitting; dropping the sink below closes the
        // stream, and exhaustion completes the job.
        Ok(None) => None,
        Err(err) => Some(Outcome::Finished(Err(err))),
    };
    if let Some(outcome) = outcome {
        let outcome = if cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            outcome
        };
        completions.deliver(Completion {
            job_id: job.id().clone(),
            outcome,
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panic: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panic: {msg}")
    } else {
        "panic in job callable".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_idempotent() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        flag.cancel();
        flag.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_panic_message_extraction() {
        let panic: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*panic), "panic: boom");
        let panic: Box<dyn std::any::Any + Send> = Box::new(String::from("later"));
        assert_eq!(panic_message(&*panic), "panic: later");
    }
}
