//! Condition algebra gating the `pending -> running` transition.
//!
//! A [`Condition`] is a side-effect-free predicate over engine state. The
//! scheduler polls each pending job's condition once per tick; combinators
//! short-circuit and nested combinators of the same kind are flattened by the
//! `&` and `|` operators.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::job::{JobId, JobStatus};

/// Set of job statuses, stored as a bitmask.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StatusSet(u8);

impl StatusSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Only `done`.
    #[must_use]
    pub const fn done() -> Self {
        Self::empty().with(JobStatus::Done)
    }

    /// All terminal statuses: `done`, `failed`, `cancelled`.
    #[must_use]
    pub const fn terminal() -> Self {
        Self::empty()
            .with(JobStatus::Done)
            .with(JobStatus::Failed)
            .with(JobStatus::Cancelled)
    }

    /// Build a set from a slice of statuses.
    #[must_use]
    pub fn of(statuses: &[JobStatus]) -> Self {
        statuses.iter().fold(Self::empty(), |set, s| set.with(*s))
    }

    /// Add a status to the set.
    #[must_use]
    pub const fn with(self, status: JobStatus) -> Self {
        Self(self.0 | Self::bit(status))
    }

    /// Membership test.
    #[must_use]
    pub const fn contains(self, status: JobStatus) -> bool {
        self.0 & Self::bit(status) != 0
    }

    const fn bit(status: JobStatus) -> u8 {
        match status {
            JobStatus::Created => 1,
            JobStatus::Pending => 1 << 1,
            JobStatus::Running => 1 << 2,
            JobStatus::Done => 1 << 3,
            JobStatus::Failed => 1 << 4,
            JobStatus::Cancelled => 1 << 5,
        }
    }
}

impl fmt::Debug for StatusSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for status in [
            JobStatus::Created,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            if self.contains(status) {
                set.entry(&status);
            }
        }
        set.finish()
    }
}

impl Default for StatusSet {
    fn default() -> Self {
        Self::done()
    }
}

/// Lookup of job statuses, implemented by the engine's job registry.
pub trait JobStatusLookup {
    /// Current status of the job with the given id, if the engine knows it.
    fn status_of(&self, id: &JobId) -> Option<JobStatus>;
}

/// Read-only view of engine state handed to condition evaluation.
///
/// Conditions see only job statuses and the current time; they cannot mutate
/// the engine, which keeps condition polling reentrancy-free.
pub struct EngineView<'a> {
    statuses: &'a dyn JobStatusLookup,
    now: DateTime<Utc>,
}

impl<'a> EngineView<'a> {
    pub(crate) fn new(statuses: &'a dyn JobStatusLookup, now: DateTime<Utc>) -> Self {
        Self { statuses, now }
    }

    /// Status of the referenced job, if known to the engine.
    #[must_use]
    pub fn status_of(&self, id: &JobId) -> Option<JobStatus> {
        self.statuses.status_of(id)
    }

    /// The instant this evaluation round started.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }
}

/// User-defined condition extension point.
///
/// Implementations must be cheap and side-effect-free: `satisfy` is called on
/// every scheduler tick for every pending job carrying the predicate. A panic
/// inside `satisfy` is caught and treated as "not satisfied".
pub trait Predicate: Send + Sync {
    /// Evaluate the predicate against the current engine state.
    fn satisfy(&self, view: &EngineView<'_>) -> bool;

    /// Short label used in job debug output.
    fn describe(&self) -> String {
        "<predicate>".to_string()
    }
}

/// Evaluation mode for [`Condition::AfterOthers`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionMode {
    /// Every referenced job must be in the allowed status set.
    All,
    /// At least one referenced job must be in the allowed status set.
    Any,
}

/// Composable predicate gating a job's transition to `running`.
#[derive(Clone)]
pub enum Condition {
    /// Satisfied unconditionally. The default for jobs without a condition.
    Always,
    /// Satisfied once the referenced job's status is in `statuses`.
    AfterAnother {
        /// Id of the referenced job.
        job_id: JobId,
        /// Statuses that satisfy the condition (default: `{done}`).
        statuses: StatusSet,
    },
    /// Satisfied once the referenced jobs' statuses are in `statuses`,
    /// combined per `mode`.
    AfterOthers {
        /// Ids of the referenced jobs.
        job_ids: Vec<JobId>,
        /// Statuses that satisfy the condition (default: `{done}`).
        statuses: StatusSet,
        /// Whether all or any referenced jobs must match.
        mode: ConditionMode,
    },
    /// Satisfied once the wall clock reaches the timepoint.
    AfterTimepoint(DateTime<Utc>),
    /// Satisfied while the wall clock is before the timepoint.
    BeforeTimepoint(DateTime<Utc>),
    /// Satisfied when every sub-condition is satisfied. Short-circuits.
    AllSatisfied(Vec<Condition>),
    /// Satisfied when any sub-condition is satisfied. Short-circuits.
    AnySatisfied(Vec<Condition>),
    /// A user-supplied predicate.
    Extension(Arc<dyn Predicate>),
}

impl Condition {
    /// Gate on another job reaching `done`.
    #[must_use]
    pub fn after_another(job_id: impl Into<JobId>) -> Self {
        Self::AfterAnother {
            job_id: job_id.into(),
            statuses: StatusSet::done(),
        }
    }

    /// Gate on another job reaching any status in `statuses`.
    #[must_use]
    pub fn after_another_in(job_id: impl Into<JobId>, statuses: StatusSet) -> Self {
        Self::AfterAnother {
            job_id: job_id.into(),
            statuses,
        }
    }

    /// Gate on all of the referenced jobs reaching `done`.
    #[must_use]
    pub fn after_others<I>(job_ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<JobId>,
    {
        Self::after_others_in(job_ids, StatusSet::done(), ConditionMode::All)
    }

    /// Gate on the referenced jobs reaching a status in `statuses`, combined
    /// per `mode`.
    #[must_use]
    pub fn after_others_in<I>(job_ids: I, statuses: StatusSet, mode: ConditionMode) -> Self
    where
        I: IntoIterator,
        I::Item: Into<JobId>,
    {
        Self::AfterOthers {
            job_ids: job_ids.into_iter().map(Into::into).collect(),
            statuses,
            mode,
        }
    }

    /// Gate on the wall clock reaching `timepoint`.
    #[must_use]
    pub fn after_timepoint(timepoint: DateTime<Utc>) -> Self {
        Self::AfterTimepoint(timepoint)
    }

    /// Satisfied only before `timepoint`.
    #[must_use]
    pub fn before_timepoint(timepoint: DateTime<Utc>) -> Self {
        Self::BeforeTimepoint(timepoint)
    }

    /// Conjunction over a list of conditions.
    #[must_use]
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::AllSatisfied(conditions)
    }

    /// Disjunction over a list of conditions.
    #[must_use]
    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::AnySatisfied(conditions)
    }

    /// Wrap a user predicate.
    #[must_use]
    pub fn extension(predicate: Arc<dyn Predicate>) -> Self {
        Self::Extension(predicate)
    }

    /// Evaluate the condition against a view of engine state.
    ///
    /// A missing referenced job counts as satisfied only when the allowed
    /// status set includes `failed`; otherwise it is unsatisfied. Panics from
    /// extension predicates are caught, logged, and treated as unsatisfied.
    #[must_use]
    pub fn satisfy(&self, view: &EngineView<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::AfterAnother { job_id, statuses } => {
                Self::job_matches(view, job_id, *statuses)
            }
            Self::AfterOthers {
                job_ids,
                statuses,
                mode,
            } => match mode {
                ConditionMode::All => job_ids
                    .iter()
                    .all(|id| Self::job_matches(view, id, *statuses)),
                ConditionMode::Any => job_ids
                    .iter()
                    .any(|id| Self::job_matches(view, id, *statuses)),
            },
            Self::AfterTimepoint(tp) => view.now() >= *tp,
            Self::BeforeTimepoint(tp) => view.now() < *tp,
            Self::AllSatisfied(conditions) => conditions.iter().all(|c| c.satisfy(view)),
            Self::AnySatisfied(conditions) => conditions.iter().any(|c| c.satisfy(view)),
            Self::Extension(predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate.satisfy(view))) {
                    Ok(satisfied) => satisfied,
                    Err(_) => {
                        tracing::warn!(
                            predicate = %predicate.describe(),
                            "condition predicate panicked; treating as unsatisfied"
                        );
                        false
                    }
                }
            }
        }
    }

    fn job_matches(view: &EngineView<'_>, id: &JobId, statuses: StatusSet) -> bool {
        match view.status_of(id) {
            Some(status) => statuses.contains(status),
            // Unknown jobs read as failed; that only satisfies sets that
            // accept failure.
            None => statuses.contains(JobStatus::Failed),
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::Always
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::AfterAnother { job_id, statuses } => {
                write!(f, "AfterAnother({job_id}, {statuses:?})")
            }
            Self::AfterOthers {
                job_ids,
                statuses,
                mode,
            } => write!(f, "AfterOthers({job_ids:?}, {statuses:?}, {mode:?})"),
            Self::AfterTimepoint(tp) => write!(f, "AfterTimepoint({tp})"),
            Self::BeforeTimepoint(tp) => write!(f, "BeforeTimepoint({tp})"),
            Self::AllSatisfied(cs) => f.debug_tuple("AllSatisfied").field(cs).finish(),
            Self::AnySatisfied(cs) => f.debug_tuple("AnySatisfied").field(cs).finish(),
            Self::Extension(p) => write!(f, "Extension({})", p.describe()),
        }
    }
}

impl BitAnd for Condition {
    type Output = Condition;

    /// `a & b` builds `AllSatisfied([a, b])`, flattening nested conjunctions.
    fn bitand(self, rhs: Condition) -> Condition {
        match (self, rhs) {
            (Condition::AllSatisfied(mut lhs), Condition::AllSatisfied(rhs)) => {
                lhs.extend(rhs);
                Condition::AllSatisfied(lhs)
            }
            (Condition::AllSatisfied(mut lhs), rhs) => {
                lhs.push(rhs);
                Condition::AllSatisfied(lhs)
            }
            (lhs, Condition::AllSatisfied(mut rhs)) => {
                rhs.insert(0, lhs);
                Condition::AllSatisfied(rhs)
            }
            (lhs, rhs) => Condition::AllSatisfied(vec![lhs, rhs]),
        }
    }
}

impl BitOr for Condition {
    type Output = Condition;

    /// `a | b` builds `AnySatisfied([a, b])`, flattening nested disjunctions.
    fn bitor(self, rhs: Condition) -> Condition {
        match (self, rhs) {
            (Condition::AnySatisfied(mut lhs), Condition::AnySatisfied(rhs)) => {
                lhs.extend(rhs);
                Condition::AnySatisfied(lhs)
            }
            (Condition::AnySatisfied(mut lhs), rhs) => {
                lhs.push(rhs);
                Condition::AnySatisfied(lhs)
            }
            (lhs, Condition::AnySatisfied(mut rhs)) => {
                rhs.insert(0, lhs);
                Condition::AnySatisfied(rhs)
            }
            (lhs, rhs) => Condition::AnySatisfied(vec![lhs, rhs]),
        }
    }
}

/// `AfterTimepoint(start) & BeforeTimepoint(end)`.
#[must_use]
pub fn between_timepoints(start: DateTime<Utc>, end: DateTime<Utc>) -> Condition {
    Condition::after_timepoint(start) & Condition::before_timepoint(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;

    struct FakeStatuses(HashMap<JobId, JobStatus>);

    impl JobStatusLookup for FakeStatuses {
        fn status_of(&self, id: &JobId) -> Option<JobStatus> {
            self.0.get(id).copied()
        }
    }

    fn view(statuses: &FakeStatuses) -> EngineView<'_> {
        EngineView::new(statuses, Utc::now())
    }

    fn fake(entries: &[(&str, JobStatus)]) -> FakeStatuses {
        FakeStatuses(
            entries
                .iter()
                .map(|(id, s)| (JobId::from(*id), *s))
                .collect(),
        )
    }

    #[test]
    fn test_after_another_default_requires_done() {
        let statuses = fake(&[("a", JobStatus::Running)]);
        let cond = Condition::after_another("a");
        assert!(!cond.satisfy(&view(&statuses)));

        let statuses = fake(&[("a", JobStatus::Done)]);
        assert!(cond.satisfy(&view(&statuses)));
    }

    #[test]
    fn test_missing_job_is_unsatisfied_unless_failure_allowed() {
        let statuses = fake(&[]);
        let strict = Condition::after_another("ghost");
        assert!(!strict.satisfy(&view(&statuses)));

        let lenient = Condition::after_another_in("ghost", StatusSet::terminal());
        assert!(lenient.satisfy(&view(&statuses)));
    }

    #[test]
    fn test_after_others_modes() {
        let statuses = fake(&[("a", JobStatus::Done), ("b", JobStatus::Running)]);
        let all = Condition::after_others(["a", "b"]);
        let any = Condition::after_others_in(
            ["a", "b"],
            StatusSet::done(),
            ConditionMode::Any,
        );
        assert!(!all.satisfy(&view(&statuses)));
        assert!(any.satisfy(&view(&statuses)));
    }

    #[test]
    fn test_timepoints() {
        let statuses = fake(&[]);
        let past = Utc::now() - ChronoDuration::seconds(5);
        let future = Utc::now() + ChronoDuration::seconds(5);
        assert!(Condition::after_timepoint(past).satisfy(&view(&statuses)));
        assert!(!Condition::after_timepoint(future).satisfy(&view(&statuses)));
        assert!(Condition::before_timepoint(future).satisfy(&view(&statuses)));
        assert!(between_timepoints(past, future).satisfy(&view(&statuses)));
    }

    #[test]
    fn test_operators_flatten() {
        let a = Condition::after_another("a");
        let b = Condition::after_another("b");
        let c = Condition::after_another("c");

        let and = (a.clone() & b.clone()) & c.clone();
        match and {
            Condition::AllSatisfied(cs) => assert_eq!(cs.len(), 3),
            other => panic!("expected AllSatisfied, got {other:?}"),
        }

        let or = a | (b | c);
        match or {
            Condition::AnySatisfied(cs) => assert_eq!(cs.len(), 3),
            other => panic!("expected AnySatisfied, got {other:?}"),
        }
    }

    #[test]
    fn test_panicking_predicate_is_unsatisfied() {
        struct Bad;
        impl Predicate for Bad {
            fn satisfy(&self, _view: &EngineView<'_>) -> bool {
                panic!("bad predicate")
            }
        }
        let statuses = fake(&[]);
        let cond = Condition::extension(Arc::new(Bad));
        assert!(!cond.satisfy(&view(&statuses)));
    }

    #[test]
    fn test_status_set_membership() {
        let set = StatusSet::of(&[JobStatus::Done, JobStatus::Failed]);
        assert!(set.contains(JobStatus::Done));
        assert!(set.contains(JobStatus::Failed));
        assert!(!set.contains(JobStatus::Cancelled));
    }
}
