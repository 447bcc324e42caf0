//! # jobflow
//!
//! An in-process job execution engine: user-defined units of work ("jobs")
//! are gated on declarative preconditions ("conditions"), dispatched across
//! heterogeneous backends (inline, thread pool, process pool, distributed
//! worker pool), and tracked from submission through completion, failure,
//! cancellation, and retry.
//!
//! ## Modules
//!
//! - [`core`] - jobs, conditions, futures, the scheduler, and the engine
//! - [`backend`] - the pluggable execution backends
//! - [`config`] - engine settings
//! - [`extend`] - subprocess, webapp, cron, and sentinel job kinds
//! - [`launcher`] - function-to-submit-site wrapper
//! - [`infra`] - on-disk job snapshots
//! - [`util`] - clock and telemetry helpers
//!
//! ## Example
//!
//! ```no_run
//! use jobflow::{Condition, Engine, EngineSetting, Job};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), jobflow::EngineError> {
//! Engine::scope(EngineSetting::default(), |engine| {
//!     let first = Job::thread(|ctx| Ok(json!(ctx.args().int(0)? + 1)))
//!         .arg(1i64)
//!         .build();
//!     // The future argument makes `second` wait for `first` and receive
//!     // its result in place of the future.
//!     let second = Job::thread(|ctx| Ok(json!(ctx.args().int(0)? * 10)))
//!         .arg(first.future())
//!         .build();
//!     engine.submit([first, second.clone()])?;
//!     engine.wait()?;
//!     assert_eq!(second.result(None)?, json!(20));
//!     Ok(())
//! })?
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! One cooperative scheduler task per engine owns all scheduling state;
//! backends host the actual parallelism. External submissions, cancels, and
//! completions all flow through one mailbox, so the scheduler sleeps on
//! events instead of polling. Condition evaluation is side-effect-free and
//! happens at most once per pending job per tick.

#![warn(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
pub mod config;
pub mod core;
pub mod extend;
pub mod infra;
pub mod launcher;
pub mod util;

pub use backend::{
    init_worker, Backend, CancelFlag, ClusterClient, Completion, CompletionSink, LaunchSpec,
    LoopbackCluster, Outcome, RemoteTask, TaskRegistry,
};
pub use config::{CacheType, EngineSetting};
pub use core::{
    between_timepoints, BackendError, Callable, Condition, ConditionMode, Engine, EngineError,
    EngineHandle,
    EngineResult, EngineView, Job, JobBuilder, JobCtx, JobError, JobFuture, JobId, JobKind,
    JobStatus, JobsView, Predicate, ResolvedArgs, RetryPolicy, StatusSet, StreamClosed,
    StreamHandle, StreamSink, TaskArg, TaskArgs, TaskValue,
};
pub use extend::{CronJob, SentinelJob, SubprocessJob, WebappJob};
pub use infra::{JobRecord, SnapshotStore};
pub use launcher::Launcher;
pub use util::init_tracing;
