//! Job bookkeeping: scheduler-owned status buckets and the shared registry.
//!
//! The [`JobStore`] holds five insertion-ordered buckets, one per
//! non-`created` status, and is mutated only from the scheduler task. The
//! engine additionally keeps a thread-safe registry of every submitted job;
//! [`JobsView`] serves user-facing reads from it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::condition::JobStatusLookup;
use crate::core::job::{Job, JobId, JobStatus};

pub(crate) type JobRegistry = Arc<RwLock<HashMap<JobId, Job>>>;

impl JobStatusLookup for HashMap<JobId, Job> {
    fn status_of(&self, id: &JobId) -> Option<JobStatus> {
        self.get(id).map(Job::status)
    }
}

#[derive(Default)]
struct Bucket {
    order: VecDeque<JobId>,
    jobs: HashMap<JobId, Job>,
}

impl Bucket {
    fn insert(&mut self, job: Job) {
        let id = job.id().clone();
        if self.jobs.insert(id.clone(), job).is_none() {
            self.order.push_back(id);
        }
    }

    fn remove(&mut self, id: &JobId) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.order.retain(|other| other != id);
        Some(job)
    }

    fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    fn len(&self) -> usize {
        self.jobs.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.jobs.clear();
    }
}

/// Scheduler-owned collection of jobs, partitioned by status.
///
/// Invariant: a job lives in exactly one bucket at a time; moves happen only
/// through [`move_job`](Self::move_job) on the scheduler task.
pub(crate) struct JobStore {
    pending: Bucket,
    running: Bucket,
    done: Bucket,
    failed: Bucket,
    cancelled: Bucket,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            pending: Bucket::default(),
            running: Bucket::default(),
            done: Bucket::default(),
            failed: Bucket::default(),
            cancelled: Bucket::default(),
        }
    }

    fn bucket_mut(&mut self, status: JobStatus) -> Option<&mut Bucket> {
        match status {
            JobStatus::Created => None,
            JobStatus::Pending => Some(&mut self.pending),
            JobStatus::Running => Some(&mut self.running),
            JobStatus::Done => Some(&mut self.done),
            JobStatus::Failed => Some(&mut self.failed),
            JobStatus::Cancelled => Some(&mut self.cancelled),
        }
    }

    fn bucket(&self, status: JobStatus) -> Option<&Bucket> {
        match status {
            JobStatus::Created => None,
            JobStatus::Pending => Some(&self.pending),
            JobStatus::Running => Some(&self.running),
            JobStatus::Done => Some(&self.done),
            JobStatus::Failed => Some(&self.failed),
            JobStatus::Cancelled => Some(&self.cancelled),
        }
    }

    /// Insert a job into the bucket for `status`.
    pub fn insert(&mut self, job: Job, status: JobStatus) {
        if let Some(bucket) = self.bucket_mut(status) {
            bucket.insert(job);
        }
    }

    /// Move a job between buckets. No-op when the statuses are equal.
    pub fn move_job(&mut self, id: &JobId, from: JobStatus, to: JobStatus) {
        if from == to {
            return;
        }
        let job = match self.bucket_mut(from).and_then(|b| b.remove(id)) {
            Some(job) => job,
            None => return,
        };
        self.insert(job, to);
    }

    /// Search every bucket for a job by id.
    pub fn get(&self, id: &JobId) -> Option<&Job> {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            if let Some(job) = self.bucket(status).and_then(|b| b.jobs.get(id)) {
                return Some(job);
            }
        }
        None
    }

    /// Pending jobs, in submission order.
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.pending.iter().cloned().collect()
    }

    /// Running jobs, in dispatch order.
    pub fn running_jobs(&self) -> Vec<Job> {
        self.running.iter().cloned().collect()
    }

    /// Number of jobs in the bucket for `status`.
    pub fn len(&self, status: JobStatus) -> usize {
        self.bucket(status).map_or(0, Bucket::len)
    }

    /// Drop all jobs in the given buckets; returns the removed ids.
    pub fn clear(&mut self, statuses: &[JobStatus]) -> Vec<JobId> {
        let mut removed = Vec::new();
        for status in statuses {
            if let Some(bucket) = self.bucket_mut(*status) {
                removed.extend(bucket.order.iter().cloned());
                bucket.clear();
            }
        }
        removed
    }
}

/// Thread-safe, read-only view over every job the engine has seen.
#[derive(Clone)]
pub struct JobsView {
    registry: JobRegistry,
}

impl JobsView {
    pub(crate) fn new(registry: JobRegistry) -> Self {
        Self { registry }
    }

    /// Look a job up by id, across all statuses.
    #[must_use]
    pub fn get_job_by_id(&self, id: &JobId) -> Option<Job> {
        self.registry.read().get(id).cloned()
    }

    /// Every job known to the engine, in unspecified order.
    #[must_use]
    pub fn all_jobs(&self) -> Vec<Job> {
        self.registry.read().values().cloned().collect()
    }

    /// Jobs currently in `status`.
    #[must_use]
    pub fn with_status(&self, status: JobStatus) -> Vec<Job> {
        self.registry
            .read()
            .values()
            .filter(|job| job.status() == status)
            .cloned()
            .collect()
    }

    /// Number of jobs currently in `status`.
    #[must_use]
    pub fn count(&self, status: JobStatus) -> usize {
        self.registry
            .read()
            .values()
            .filter(|job| job.status() == status)
            .count()
    }

    /// Total number of jobs known to the engine.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    /// True when the engine has seen no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }
}

impl std::fmt::Debug for JobsView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobsView")
            .field("jobs", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job() -> Job {
        Job::thread(|_ctx| Ok(json!(0))).build()
    }

    #[test]
    fn test_insertion_order_is_fifo() {
        let mut store = JobStore::new();
        let jobs: Vec<Job> = (0..3).map(|_| make_job()).collect();
        for job in &jobs {
            store.insert(job.clone(), JobStatus::Pending);
        }
        let pending = store.pending_jobs();
        let ids: Vec<&JobId> = pending.iter().map(Job::id).collect();
        let expected: Vec<&JobId> = jobs.iter().map(Job::id).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_move_job_between_buckets() {
        let mut store = JobStore::new();
        let job = make_job();
        store.insert(job.clone(), JobStatus::Pending);
        store.move_job(job.id(), JobStatus::Pending, JobStatus::Running);
        assert_eq!(store.len(JobStatus::Pending), 0);
        assert_eq!(store.len(JobStatus::Running), 1);
        assert!(store.get(job.id()).is_some());

        // Same-status moves are no-ops.
        store.move_job(job.id(), JobStatus::Running, JobStatus::Running);
        assert_eq!(store.len(JobStatus::Running), 1);
    }

    #[test]
    fn test_clear_returns_removed_ids() {
        let mut store = JobStore::new();
        let a = make_job();
        let b = make_job();
        store.insert(a.clone(), JobStatus::Done);
        store.insert(b.clone(), JobStatus::Failed);
        let removed = store.clear(&[JobStatus::Done, JobStatus::Failed]);
        assert_eq!(removed.len(), 2);
        assert!(store.get(a.id()).is_none());
    }

    #[test]
    fn test_jobs_view_lookup() {
        let registry: JobRegistry = Arc::new(RwLock::new(HashMap::new()));
        let job = make_job();
        registry.write().insert(job.id().clone(), job.clone());
        let view = JobsView::new(registry);
        assert!(view.get_job_by_id(job.id()).is_some());
        assert_eq!(view.count(JobStatus::Created), 1);
        assert_eq!(view.len(), 1);
    }
}
