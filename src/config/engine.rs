//! Engine settings and validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::job::JobKind;

/// Where job records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// In-memory only; records vanish with the engine.
    Mem,
    /// JSON snapshots on disk under the cache path.
    Disk,
}

fn default_kind_caps() -> HashMap<JobKind, usize> {
    let mut caps = HashMap::new();
    caps.insert(JobKind::Thread, default_thread_cap());
    caps.insert(JobKind::Process, default_process_cap());
    caps
}

/// Default cap on concurrently-running thread jobs.
fn default_thread_cap() -> usize {
    20
}

/// Default cap on concurrently-running process jobs: one per CPU, at most 8.
fn default_process_cap() -> usize {
    num_cpus::get().clamp(1, 8)
}

fn default_true() -> bool {
    true
}

fn default_cache_type() -> CacheType {
    CacheType::Mem
}

/// Default scheduler tick in milliseconds.
fn default_tick_ms() -> u64 {
    50
}

/// Engine configuration.
///
/// # Example
///
/// ```rust
/// use jobflow::{EngineSetting, JobKind};
///
/// let setting = EngineSetting::new()
///     .with_max_jobs(16)
///     .with_kind_cap(JobKind::Thread, 4)
///     .with_print_traceback(false);
/// assert!(setting.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSetting {
    /// Global cap on concurrently-running jobs. `None` means unlimited.
    #[serde(default)]
    pub max_jobs: Option<usize>,

    /// Per-kind caps on concurrently-running jobs; kinds absent from the
    /// map are unlimited. Thread and process kinds carry defaults sized to
    /// their worker pools.
    #[serde(default = "default_kind_caps")]
    pub max_jobs_per_kind: HashMap<JobKind, usize>,

    /// Log failed jobs' errors at error level.
    #[serde(default = "default_true")]
    pub print_traceback: bool,

    /// Whether job records are persisted to disk.
    #[serde(default = "default_cache_type")]
    pub cache_type: CacheType,

    /// Directory for on-disk job snapshots. Defaults to
    /// `.jobflow/<engine-id>` when `cache_type` is `disk`.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Scheduler tick in milliseconds: the fallback poll interval when no
    /// mailbox event arrives.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for EngineSetting {
    fn default() -> Self {
        Self {
            max_jobs: None,
            max_jobs_per_kind: default_kind_caps(),
            print_traceback: true,
            cache_type: default_cache_type(),
            cache_path: None,
            tick_ms: default_tick_ms(),
        }
    }
}

impl EngineSetting {
    /// Settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of concurrently-running jobs across all kinds.
    #[must_use]
    pub fn with_max_jobs(mut self, cap: usize) -> Self {
        self.max_jobs = Some(cap);
        self
    }

    /// Cap the number of concurrently-running jobs of one kind.
    #[must_use]
    pub fn with_kind_cap(mut self, kind: JobKind, cap: usize) -> Self {
        self.max_jobs_per_kind.insert(kind, cap);
        self
    }

    /// Remove the cap for a kind.
    #[must_use]
    pub fn with_unlimited_kind(mut self, kind: &JobKind) -> Self {
        self.max_jobs_per_kind.remove(kind);
        self
    }

    /// Control error-level logging of job failures.
    #[must_use]
    pub fn with_print_traceback(mut self, enabled: bool) -> Self {
        self.print_traceback = enabled;
        self
    }

    /// Persist job records as JSON snapshots under `path`.
    #[must_use]
    pub fn with_cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_type = CacheType::Disk;
        self.cache_path = Some(path.into());
        self
    }

    /// Set the scheduler tick.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_ms = tick.as_millis().max(1) as u64;
        self
    }

    /// The scheduler tick as a [`Duration`].
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Effective cap for a kind, if any.
    #[must_use]
    pub fn cap_for(&self, kind: &JobKind) -> Option<usize> {
        self.max_jobs_per_kind.get(kind).copied()
    }

    /// Worker count for the thread pool backend.
    #[must_use]
    pub fn thread_workers(&self) -> usize {
        self.cap_for(&JobKind::Thread)
            .unwrap_or_else(default_thread_cap)
    }

    /// Worker count for the process pool backend.
    #[must_use]
    pub fn process_workers(&self) -> usize {
        self.cap_for(&JobKind::Process)
            .unwrap_or_else(default_process_cap)
    }

    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_ms == 0 {
            return Err("tick_ms must be greater than 0".into());
        }
        if self.max_jobs == Some(0) {
            return Err("max_jobs must be greater than 0".into());
        }
        for (kind, cap) in &self.max_jobs_per_kind {
            if *cap == 0 {
                return Err(format!("max_jobs_per_kind[{kind}] must be greater than 0"));
            }
        }
        Ok(())
    }
}
