//! Core scheduling types: jobs, conditions, futures, the store, the
//! scheduler loop, and the engine facade.

pub mod condition;
pub mod engine;
pub mod error;
pub mod future;
pub mod job;
pub(crate) mod scheduler;
pub mod store;
pub mod value;

pub use condition::{
    between_timepoints, Condition, ConditionMode, EngineView, JobStatusLookup, Predicate,
    StatusSet,
};
pub use engine::{Engine, EngineHandle};
pub use error::{BackendError, EngineError, EngineResult, JobError};
pub use future::{JobFuture, StreamClosed, StreamHandle, StreamSink};
pub use job::{
    Callable, Job, JobBuilder, JobCtx, JobId, JobKind, JobStatus, ProducerFn, RetryPolicy, SyncFn,
};
pub use store::JobsView;
pub use value::{ResolvedArgs, TaskArg, TaskArgs, TaskValue};
