//! Dynamic argument and result values.
//!
//! Job inputs and outputs are carried as [`TaskValue`]s so they survive
//! transport to process and distributed backends. Arguments may additionally
//! reference another job's eventual result through a [`JobFuture`]; the
//! scheduler substitutes the resolved value immediately before dispatch.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::future::JobFuture;
use crate::core::job::JobId;

/// Dynamic value exchanged between jobs and across process boundaries.
pub type TaskValue = serde_json::Value;

/// One job argument: either a plain value or a reference to another job's
/// eventual result.
#[derive(Clone)]
pub enum TaskArg {
    /// A concrete value, passed through untouched.
    Value(TaskValue),
    /// A dependency edge; replaced by the producer's result at dispatch time.
    Future(JobFuture),
}

impl TaskArg {
    /// Build an argument from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error when `value` cannot be
    /// represented as a [`TaskValue`].
    pub fn json<T: Serialize>(value: T) -> serde_json::Result<Self> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }
}

impl fmt::Debug for TaskArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "Value({v})"),
            Self::Future(fut) => write!(f, "Future({})", fut.job_id()),
        }
    }
}

impl From<TaskValue> for TaskArg {
    fn from(value: TaskValue) -> Self {
        Self::Value(value)
    }
}

impl From<JobFuture> for TaskArg {
    fn from(future: JobFuture) -> Self {
        Self::Future(future)
    }
}

impl From<i64> for TaskArg {
    fn from(value: i64) -> Self {
        Self::Value(value.into())
    }
}

impl From<f64> for TaskArg {
    fn from(value: f64) -> Self {
        Self::Value(value.into())
    }
}

impl From<bool> for TaskArg {
    fn from(value: bool) -> Self {
        Self::Value(value.into())
    }
}

impl From<&str> for TaskArg {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for TaskArg {
    fn from(value: String) -> Self {
        Self::Value(value.into())
    }
}

/// Positional and named arguments for a job callable.
#[derive(Clone, Debug, Default)]
pub struct TaskArgs {
    positional: Vec<TaskArg>,
    named: BTreeMap<String, TaskArg>,
}

impl TaskArgs {
    /// Empty argument list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from positional arguments only.
    pub fn positional<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<TaskArg>,
    {
        Self {
            positional: args.into_iter().map(Into::into).collect(),
            named: BTreeMap::new(),
        }
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<TaskArg>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument.
    #[must_use]
    pub fn named(mut self, key: impl Into<String>, value: impl Into<TaskArg>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Ids of every job referenced through a future argument, in argument
    /// order (positional first).
    #[must_use]
    pub fn future_deps(&self) -> Vec<JobId> {
        self.iter()
            .filter_map(|arg| match arg {
                TaskArg::Future(fut) => Some(fut.job_id().clone()),
                TaskArg::Value(_) => None,
            })
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &TaskArg> {
        self.positional.iter().chain(self.named.values())
    }

    pub(crate) fn parts(&self) -> (&[TaskArg], &BTreeMap<String, TaskArg>) {
        (&self.positional, &self.named)
    }
}

/// Arguments with every future substituted by its resolved value.
///
/// This is the form a callable actually receives, and the form serialized to
/// process and distributed workers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResolvedArgs {
    positional: Vec<TaskValue>,
    named: BTreeMap<String, TaskValue>,
}

impl ResolvedArgs {
    pub(crate) fn from_parts(
        positional: Vec<TaskValue>,
        named: BTreeMap<String, TaskValue>,
    ) -> Self {
        Self { positional, named }
    }

    /// Positional argument at `idx`, if present.
    #[must_use]
    pub fn pos(&self, idx: usize) -> Option<&TaskValue> {
        self.positional.get(idx)
    }

    /// Named argument `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&TaskValue> {
        self.named.get(key)
    }

    /// Number of positional arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// True when no arguments were supplied at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    /// Positional argument at `idx` as an integer.
    ///
    /// # Errors
    ///
    /// Fails when the argument is missing or not an integer.
    pub fn int(&self, idx: usize) -> anyhow::Result<i64> {
        self.pos(idx)
            .and_then(TaskValue::as_i64)
            .ok_or_else(|| anyhow::anyhow!("argument {idx} is missing or not an integer"))
    }

    /// Positional argument at `idx` as a string slice.
    ///
    /// # Errors
    ///
    /// Fails when the argument is missing or not a string.
    pub fn str(&self, idx: usize) -> anyhow::Result<&str> {
        self.pos(idx)
            .and_then(TaskValue::as_str)
            .ok_or_else(|| anyhow::anyhow!("argument {idx} is missing or not a string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_positional_and_named_args() {
        let args = TaskArgs::positional([1i64, 2i64]).named("scale", 3i64);
        assert_eq!(args.iter().count(), 3);
        assert!(args.future_deps().is_empty());
    }

    #[test]
    fn test_resolved_args_accessors() {
        let args = ResolvedArgs::from_parts(
            vec![json!(7), json!("hi")],
            [("k".to_string(), json!(true))].into_iter().collect(),
        );
        assert_eq!(args.int(0).unwrap(), 7);
        assert_eq!(args.str(1).unwrap(), "hi");
        assert_eq!(args.get("k"), Some(&json!(true)));
        assert!(args.int(1).is_err());
        assert!(args.int(5).is_err());
    }

    #[test]
    fn test_resolved_args_round_trip() {
        let args = ResolvedArgs::from_parts(vec![json!([1, 2, 3])], BTreeMap::new());
        let text = serde_json::to_string(&args).unwrap();
        let back: ResolvedArgs = serde_json::from_str(&text).unwrap();
        assert_eq!(back.pos(0), Some(&json!([1, 2, 3])));
    }
}
