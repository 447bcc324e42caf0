//! Child-process backend: a pool of re-exec'd worker processes.
//!
//! Process jobs carry a registered task name instead of a closure; arguments
//! and results cross the process boundary as JSON line frames over the
//! child's stdio. Workers are the current executable re-run with
//! [`WORKER_ENV`] set, so embedding programs must call [`init_worker`] with
//! their registry at the very top of `main` before doing anything else.
//! While a worker is serving, its stdout belongs to the protocol; task code
//! should write diagnostics to stderr.
//!
//! Cancellation kills the child; the pool respawns a fresh worker for the
//! next job.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::error::{BackendError, JobError};
use crate::core::job::{Callable, JobId};
use crate::core::value::{ResolvedArgs, TaskValue};

use super::{Backend, Completion, LaunchSpec, Outcome};

/// Environment variable marking a process as a pool worker.
pub const WORKER_ENV: &str = "JOBFLOW_PROCESS_WORKER";

type RegisteredTask = Arc<dyn Fn(&ResolvedArgs) -> anyhow::Result<TaskValue> + Send + Sync>;

/// Named task functions runnable on process and distributed backends.
///
/// The parent and the worker must build the same registry; there is no
/// global registration, the registry is passed explicitly wherever it is
/// needed.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task function under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Fn(&ResolvedArgs) -> anyhow::Result<TaskValue> + Send + Sync + 'static,
    {
        self.tasks.insert(name.into(), Arc::new(task));
    }

    /// True when a task with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Run a registered task; errors are stringified for transport.
    ///
    /// # Errors
    ///
    /// Unknown task names and task failures are both reported as strings.
    pub fn run(&self, name: &str, args: &ResolvedArgs) -> Result<TaskValue, String> {
        let task = self
            .tasks
            .get(name)
            .ok_or_else(|| format!("unknown task `{name}`"))?;
        task(args).map_err(|err| format!("{err:#}"))
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerRequest {
    id: u64,
    task: String,
    args: ResolvedArgs,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerReply {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ok: Option<TaskValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
}

impl WorkerReply {
    // A `null` result serializes the same as an absent one, so the error
    // field decides: no error means success.
    fn into_result(self) -> Result<TaskValue, String> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(self.ok.unwrap_or(TaskValue::Null)),
        }
    }
}

/// Turn the current process into a pool worker when [`WORKER_ENV`] is set;
/// otherwise return immediately.
///
/// Call this at the very top of `main`, before any other work, in every
/// program that submits process jobs. When running as a worker this function
/// serves requests until stdin closes and then exits the process.
pub fn init_worker(registry: &TaskRegistry) {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    serve(registry);
    std::process::exit(0);
}

fn serve(registry: &TaskRegistry) {
    let stdin = io::stdin();
    let stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                eprintln!("jobflow worker: bad request frame: {err}");
                continue;
            }
        };
        let reply = match registry.run(&request.task, &request.args) {
            Ok(value) => WorkerReply {
                id: request.id,
                ok: Some(value),
                err: None,
            },
            Err(err) => WorkerReply {
                id: request.id,
                ok: None,
                err: Some(err),
            },
        };
        let mut out = stdout.lock();
        if serde_json::to_writer(&mut out, &reply).is_err() {
            break;
        }
        if out.write_all(b"\n").and_then(|()| out.flush()).is_err() {
            break;
        }
    }
}

struct WorkerChild {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl WorkerChild {
    fn spawn() -> io::Result<Self> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout unavailable"))?;
        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        })
    }

    fn handle(&self) -> Arc<Mutex<Child>> {
        Arc::clone(&self.child)
    }

    fn roundtrip(&mut self, task: &str, args: &ResolvedArgs) -> io::Result<Result<TaskValue, String>> {
        self.next_id += 1;
        let request = WorkerRequest {
            id: self.next_id,
            task: task.to_string(),
            args: args.clone(),
        };
        let frame = serde_json::to_string(&request).map_err(io::Error::other)?;
        writeln!(self.stdin, "{frame}")?;
        self.stdin.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if self.stdout.read_line(&mut line)? == 0 {
                return Err(io::Error::other("worker closed its stdout"));
            }
            match serde_json::from_str::<WorkerReply>(line.trim()) {
                Ok(reply) if reply.id == request.id => return Ok(reply.into_result()),
                // Stray output on the protocol channel; skip it.
                _ => continue,
            }
        }
    }

    fn kill(&self) {
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
    }
}

type ActiveChildren = Arc<Mutex<HashMap<JobId, Arc<Mutex<Child>>>>>;

/// Backend that runs registered tasks on a pool of child worker processes.
pub struct ProcessBackend {
    task_tx: Mutex<Option<Sender<LaunchSpec>>>,
    active: ActiveChildren,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessBackend {
    /// Spawn `worker_count` pool threads. Child processes are started
    /// lazily, on each thread's first job.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        let (task_tx, task_rx) = unbounded::<LaunchSpec>();
        let active: ActiveChildren = Arc::new(Mutex::new(HashMap::new()));
        let workers = (0..worker_count.max(1))
            .map(|worker_id| spawn_pool_thread(worker_id, task_rx.clone(), Arc::clone(&active)))
            .collect();
        Self {
            task_tx: Mutex::new(Some(task_tx)),
            active,
            workers: Mutex::new(workers),
        }
    }
}

impl Backend for ProcessBackend {
    fn launch(&self, spec: LaunchSpec) -> Result<(), BackendError> {
        let guard = self.task_tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| BackendError::Launch("process pool is shut down".into()))?;
        tx.send(spec)
            .map_err(|_| BackendError::WorkerLost("process pool workers exited".into()))
    }

    fn cancel(&self, job_id: &JobId) {
        if let Some(child) = self.active.lock().get(job_id).cloned() {
            debug!(%job_id, "killing process worker for cancelled job");
            let _ = child.lock().kill();
        }
    }

    fn shutdown(&self) {
        *self.task_tx.lock() = None;
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!(worker_count = workers.len(), "process backend shut down");
    }
}

fn spawn_pool_thread(
    worker_id: usize,
    task_rx: Receiver<LaunchSpec>,
    active: ActiveChildren,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("jf-process-{worker_id}"))
        .spawn(move || {
            let mut child: Option<WorkerChild> = None;
            while let Ok(spec) = task_rx.recv() {
                serve_one(worker_id, &spec, &mut child, &active);
            }
            if let Some(child) = child.take() {
                child.kill();
            }
            debug!(worker_id, "process pool thread exiting");
        })
        .expect("failed to spawn process pool thread")
}

fn serve_one(
    worker_id: usize,
    spec: &LaunchSpec,
    child: &mut Option<WorkerChild>,
    active: &ActiveChildren,
) {
    let job_id = spec.job.id().clone();
    let deliver = |outcome: Outcome| {
        spec.completions.deliver(Completion {
            job_id: job_id.clone(),
            outcome,
        });
    };

    if spec.cancel.is_cancelled() {
        deliver(Outcome::Cancelled);
        return;
    }

    let task = match spec.job.callable() {
        Callable::Named(task) => task.clone(),
        other => {
            deliver(Outcome::Finished(Err(JobError::Backend(format!(
                "process backend requires a named task, got {other:?}"
            )))));
            return;
        }
    };

    if child.is_none() {
        match WorkerChild::spawn() {
            Ok(spawned) => {
                debug!(worker_id, "spawned process pool worker");
                *child = Some(spawned);
            }
            Err(err) => {
                error!(worker_id, %err, "failed to spawn process pool worker");
                deliver(Outcome::Finished(Err(JobError::Backend(format!(
                    "failed to spawn worker process: {err}"
                )))));
                return;
            }
        }
    }
    let Some(worker) = child.as_mut() else {
        return;
    };

    active.lock().insert(job_id.clone(), worker.handle());
    let result = worker.roundtrip(&task, &spec.args);
    active.lock().remove(&job_id);

    match result {
        Ok(reply) => deliver(Outcome::Finished(
            reply.map_err(JobError::UserCallable),
        )),
        Err(err) => {
            // The child died or was killed; retire it either way.
            if let Some(dead) = child.take() {
                dead.kill();
            }
            if spec.cancel.is_cancelled() {
                deliver(Outcome::Cancelled);
            } else {
                warn!(worker_id, %err, "process pool worker lost");
                deliver(Outcome::Finished(Err(JobError::Backend(format!(
                    "worker lost: {err}"
                )))));
            }
        }
    }
}
