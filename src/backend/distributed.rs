//! Distributed backend: delegates named tasks to an external worker pool.
//!
//! The cluster mechanics live behind the [`ClusterClient`] trait; the engine
//! only needs submit-with-completion and cancel. [`LoopbackCluster`] is an
//! in-process client mirroring process-backend semantics, useful for tests
//! and single-host deployments.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::{BackendError, JobError};
use crate::core::job::{Callable, JobId};
use crate::core::value::{ResolvedArgs, TaskValue};

use super::{Backend, Completion, LaunchSpec, Outcome, TaskRegistry};

/// A task submission shipped to a remote worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    /// Id of the submitting job, usable as an idempotency key.
    pub job_id: JobId,
    /// Registered task name to invoke on the worker.
    pub task: String,
    /// Serialized arguments.
    pub args: ResolvedArgs,
}

/// Client for an external worker cluster.
///
/// Implementations own transport, serialization, and retries on their side
/// of the wire; the engine treats `submit` resolving as the completion
/// event.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Run the task remotely and resolve with its result.
    ///
    /// # Errors
    ///
    /// Transport and remote-execution failures are stringified; the engine
    /// stores them as the job's error.
    async fn submit(&self, task: RemoteTask) -> Result<TaskValue, String>;

    /// Best-effort remote cancellation.
    async fn cancel(&self, _job_id: &JobId) {}
}

/// In-process [`ClusterClient`] executing tasks from a local registry.
pub struct LoopbackCluster {
    registry: TaskRegistry,
}

impl LoopbackCluster {
    /// Wrap a registry as a loopback cluster.
    #[must_use]
    pub fn new(registry: TaskRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ClusterClient for LoopbackCluster {
    async fn submit(&self, task: RemoteTask) -> Result<TaskValue, String> {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || registry.run(&task.task, &task.args))
            .await
            .map_err(|err| format!("loopback worker panicked: {err}"))?
    }
}

/// Backend that forwards named tasks to a [`ClusterClient`].
pub struct DistributedBackend {
    client: Arc<dyn ClusterClient>,
}

impl DistributedBackend {
    /// Build the backend around a cluster client.
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }
}

impl Backend for DistributedBackend {
    fn launch(&self, spec: LaunchSpec) -> Result<(), BackendError> {
        let task = match spec.job.callable() {
            Callable::Named(task) => task.clone(),
            other => {
                return Err(BackendError::Launch(format!(
                    "distributed backend requires a named task, got {other:?}"
                )))
            }
        };
        let client = Arc::clone(&self.client);
        let job_id = spec.job.id().clone();
        let remote = RemoteTask {
            job_id: job_id.clone(),
            task,
            args: spec.args.clone(),
        };
        let cancel = spec.cancel.clone();
        let completions = spec.completions.clone();
        tokio::spawn(async move {
            let result = client.submit(remote).await;
            let outcome = if cancel.is_cancelled() {
                Outcome::Cancelled
            } else {
                Outcome::Finished(result.map_err(JobError::Backend))
            };
            completions.deliver(Completion { job_id, outcome });
        });
        Ok(())
    }

    fn cancel(&self, job_id: &JobId) {
        let client = Arc::clone(&self.client);
        let job_id = job_id.clone();
        debug!(%job_id, "forwarding cancel to cluster");
        tokio::spawn(async move {
            client.cancel(&job_id).await;
        });
    }
}
