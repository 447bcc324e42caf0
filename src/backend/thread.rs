//! Thread-pool backend: dedicated OS worker threads fed over a channel.
//!
//! Workers block on channel recv; dropping the sender at shutdown unblocks
//! them naturally. Cancellation is cooperative: user code observes the
//! job's cancel flag, and the scheduler settles the job as cancelled no
//! matter what the worker eventually reports.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::BackendError;

use super::{run_spec, Backend, LaunchSpec};

/// Backend that offloads callables to a bounded pool of OS threads.
pub struct ThreadBackend {
    task_tx: Mutex<Option<Sender<LaunchSpec>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadBackend {
    /// Spawn `worker_count` dedicated worker threads.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        let (task_tx, task_rx) = unbounded::<LaunchSpec>();
        let workers = (0..worker_count.max(1))
            .map(|worker_id| spawn_worker(worker_id, task_rx.clone()))
            .collect();
        Self {
            task_tx: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
        }
    }
}

impl Backend for ThreadBackend {
    fn launch(&self, spec: LaunchSpec) -> Result<(), BackendError> {
        let guard = self.task_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| BackendError::Launch("thread pool is shut down".into()))?;
        tx.send(spec)
            .map_err(|_| BackendError::WorkerLost("thread pool workers exited".into()))
    }

    fn shutdown(&self) {
        // Dropping the sender unblocks idle workers; busy workers finish
        // their current job and then exit. They are detached, not joined,
        // so a wedged callable cannot hang engine shutdown.
        *self.task_tx.lock() = None;
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(worker_count = workers.len(), "thread backend shut down");
    }
}

fn spawn_worker(worker_id: usize, task_rx: Receiver<LaunchSpec>) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("jf-worker-{worker_id}"))
        .spawn(move || {
            debug!(worker_id, "worker thread started");
            while let Ok(spec) = task_rx.recv() {
                run_spec(spec);
            }
            debug!(worker_id, "worker thread exiting");
        })
        .expect("failed to spawn worker thread")
}
