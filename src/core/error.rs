//! Error types for engine, job, and backend operations.

use thiserror::Error;

use crate::core::job::{JobId, JobStatus};

/// Errors stored on a job when it fails to produce a result.
///
/// These are surfaced through [`crate::JobFuture::exception`] and never halt
/// the scheduler.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The user callable returned an error or panicked.
    #[error("callable failed: {0}")]
    UserCallable(String),

    /// An upstream job referenced by a future argument did not finish `done`.
    #[error("dependency {upstream} finished as {status}; job was not executed")]
    DependencyFailed {
        /// Id of the upstream producer job.
        upstream: JobId,
        /// Terminal status the producer reached (or `failed` if it was never
        /// submitted).
        status: JobStatus,
    },

    /// The backend failed to start or lost the execution.
    #[error("backend error: {0}")]
    Backend(String),

    /// The job was cancelled by the user or the engine.
    #[error("job cancelled")]
    Cancelled,
}

/// Errors produced while starting or driving a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No backend is registered for the job's kind.
    #[error("no backend configured for kind `{0}`")]
    NotConfigured(String),

    /// The backend rejected the launch request.
    #[error("failed to launch: {0}")]
    Launch(String),

    /// A worker thread or child process died underneath an execution.
    #[error("worker lost: {0}")]
    WorkerLost(String),
}

/// Errors returned from the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation is not valid for the job's current status.
    #[error("invalid state: expected {expected}, job is {actual}")]
    InvalidState {
        /// Human-readable description of the acceptable statuses.
        expected: String,
        /// The status the job was actually in.
        actual: JobStatus,
    },

    /// A blocking or async wait ran out of time. Job state is unchanged.
    #[error("operation timed out")]
    Timeout,

    /// No job with the given id is known to the engine.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// The engine has not been started, or has already been stopped.
    #[error("engine is not running")]
    NotRunning,

    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A backend could not be brought up.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The job terminated with a stored error.
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Convenience alias for engine-facing results.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JobError::UserCallable("boom".into());
        assert_eq!(format!("{err}"), "callable failed: boom");

        let err = EngineError::Timeout;
        assert_eq!(format!("{err}"), "operation timed out");

        let err = BackendError::NotConfigured("process".into());
        assert_eq!(format!("{err}"), "no backend configured for kind `process`");
    }

    #[test]
    fn test_job_error_wraps_into_engine_error() {
        let err: EngineError = JobError::Cancelled.into();
        assert!(matches!(err, EngineError::Job(JobError::Cancelled)));
    }
}
