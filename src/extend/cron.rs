//! Periodic and conditional resubmission.
//!
//! Both kinds are watcher jobs on the thread backend holding a clonable
//! [`JobBuilder`] template: a cron job stamps out and submits a fresh job
//! every period, a sentinel does so on each false-to-true edge of a
//! condition. Watchers run until cancelled, so cancel them before calling
//! `engine.wait()`.

use std::time::{Duration, Instant};

use serde_json::json;

use crate::core::condition::Condition;
use crate::core::job::{Job, JobBuilder, JobCtx};
use crate::core::value::TaskValue;

const WATCH_INTERVAL: Duration = Duration::from_millis(20);

/// Periodic resubmission of a job template.
pub struct CronJob;

impl CronJob {
    /// Submit a fresh instance of `template` every `period`, starting one
    /// period from now.
    #[must_use]
    pub fn every(period: Duration, template: JobBuilder) -> JobBuilder {
        Self::schedule(period, false, template)
    }

    /// Like [`every`](Self::every), but fire immediately as well.
    #[must_use]
    pub fn every_immediate(period: Duration, template: JobBuilder) -> JobBuilder {
        Self::schedule(period, true, template)
    }

    fn schedule(period: Duration, immediate: bool, template: JobBuilder) -> JobBuilder {
        Job::thread(move |ctx: &JobCtx| {
            let mut fired: u64 = 0;
            let mut next = if immediate {
                Instant::now()
            } else {
                Instant::now() + period
            };
            loop {
                if ctx.is_cancelled() {
                    return Ok(json!(fired));
                }
                if Instant::now() >= next {
                    ctx.engine().submit(template.clone().build())?;
                    fired += 1;
                    next += period;
                }
                std::thread::sleep(WATCH_INTERVAL.min(period));
            }
        })
        .name("cron")
    }
}

/// Conditional resubmission of a job template.
pub struct SentinelJob;

impl SentinelJob {
    /// Submit a fresh instance of `template` on every false-to-true edge of
    /// `condition`, re-checking every 100ms.
    #[must_use]
    pub fn new(condition: Condition, template: JobBuilder) -> JobBuilder {
        Self::with_interval(condition, template, Duration::from_millis(100))
    }

    /// [`new`](Self::new) with an explicit re-check interval.
    #[must_use]
    pub fn with_interval(
        condition: Condition,
        template: JobBuilder,
        interval: Duration,
    ) -> JobBuilder {
        Job::thread(move |ctx: &JobCtx| -> anyhow::Result<TaskValue> {
            let mut fired: u64 = 0;
            let mut was_satisfied = false;
            loop {
                if ctx.is_cancelled() {
                    return Ok(json!(fired));
                }
                let satisfied = ctx.engine().satisfy(&condition);
                if satisfied && !was_satisfied {
                    ctx.engine().submit(template.clone().build())?;
                    fired += 1;
                }
                was_satisfied = satisfied;
                std::thread::sleep(interval);
            }
        })
        .name("sentinel")
    }
}
