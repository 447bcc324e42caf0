//! On-disk job snapshots.
//!
//! With `cache_type = disk`, the scheduler writes one JSON record per job
//! under `cache_path/<job-id>/record.json` on every status transition. The
//! format is for inspection and post-mortem tooling, not a compatibility
//! surface.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::job::{Job, JobId, JobKind, JobStatus};
use crate::core::value::{TaskArg, TaskValue};

const RECORD_FILE: &str = "record.json";

/// Serialized snapshot of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Display name.
    pub name: String,
    /// Backend kind.
    pub kind: JobKind,
    /// Status at snapshot time.
    pub status: JobStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Construction timestamp.
    pub created_at: DateTime<Utc>,
    /// Start of the latest run, if any.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal timestamp, if terminal.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Positional arguments; future arguments appear as
    /// `{"$future": "<job-id>"}` placeholders.
    pub args: Vec<TaskValue>,
    /// Result value, when the job is done.
    pub result: Option<TaskValue>,
    /// Stored error, when the job failed or was cancelled.
    pub error: Option<String>,
}

impl JobRecord {
    pub(crate) fn from_job(job: &Job) -> Self {
        let (positional, _named) = job.args().parts();
        let args = positional
            .iter()
            .map(|arg| match arg {
                TaskArg::Value(value) => value.clone(),
                TaskArg::Future(fut) => json!({ "$future": fut.job_id().as_str() }),
            })
            .collect();
        let (result, error) = match job.future().peek() {
            Some(Ok(value)) => (Some(value), None),
            Some(Err(err)) => (None, Some(err.to_string())),
            None => (None, None),
        };
        Self {
            id: job.id().clone(),
            name: job.name().to_string(),
            kind: job.kind().clone(),
            status: job.status(),
            attempts: job.attempts(),
            created_at: job.created_at(),
            started_at: job.started_at(),
            stopped_at: job.stopped_at(),
            args,
            result,
            error,
        }
    }
}

/// Directory of per-job snapshot records.
#[derive(Debug)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open (creating if needed) a snapshot directory.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors from directory creation.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The snapshot root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one job's snapshot files.
    #[must_use]
    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Write (or overwrite) a job's record.
    ///
    /// # Errors
    ///
    /// Propagates filesystem and serialization errors.
    pub fn write(&self, record: &JobRecord) -> io::Result<()> {
        let dir = self.job_dir(&record.id);
        fs::create_dir_all(&dir)?;
        let body = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        fs::write(dir.join(RECORD_FILE), body)
    }

    /// Load one job's record.
    ///
    /// # Errors
    ///
    /// Propagates filesystem and deserialization errors.
    pub fn load(&self, id: &JobId) -> io::Result<JobRecord> {
        let body = fs::read(self.job_dir(id).join(RECORD_FILE))?;
        serde_json::from_slice(&body).map_err(io::Error::other)
    }

    /// Load every record under the snapshot root, skipping unreadable
    /// entries.
    ///
    /// # Errors
    ///
    /// Propagates the error from listing the root directory.
    pub fn load_all(&self) -> io::Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = JobId::from(entry.file_name().to_string_lossy().to_string());
            if let Ok(record) = self.load(&id) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
