//! Retry protocol: attempt budgets, delays, and rerun resets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use jobflow::{Engine, EngineSetting, Job, JobStatus, TaskValue};
use serde_json::json;

fn fast_setting() -> EngineSetting {
    EngineSetting::new()
        .with_tick(Duration::from_millis(10))
        .with_print_traceback(false)
}

#[test]
fn test_always_failing_job_runs_max_attempts_plus_one_times() {
    Engine::scope(fast_setting(), |engine| {
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations2 = Arc::clone(&invocations);
        let job = Job::thread(move |_ctx| -> anyhow::Result<TaskValue> {
            invocations2.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("always fails")
        })
        .retries(2, Duration::from_millis(20))
        .wait_interval(Duration::from_millis(10))
        .build();

        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Failed, Some(Duration::from_secs(10)))
            .expect("terminal");

        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(job.attempts(), 3);
    })
    .expect("scope");
}

#[test]
fn test_retry_delay_gates_reattempt() {
    Engine::scope(fast_setting(), |engine| {
        let stamps: Arc<parking_lot::Mutex<Vec<Instant>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let stamps2 = Arc::clone(&stamps);
        let job = Job::thread(move |_ctx| -> anyhow::Result<TaskValue> {
            stamps2.lock().push(Instant::now());
            anyhow::bail!("fails once more")
        })
        .retries(1, Duration::from_millis(300))
        .wait_interval(Duration::from_millis(10))
        .build();

        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Failed, Some(Duration::from_secs(10)))
            .expect("terminal");

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1].duration_since(stamps[0]) >= Duration::from_millis(300));
    })
    .expect("scope");
}

#[test]
fn test_job_succeeds_within_retry_budget() {
    Engine::scope(fast_setting(), |engine| {
        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations2 = Arc::clone(&invocations);
        let job = Job::thread(move |_ctx| {
            let n = invocations2.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                anyhow::bail!("not yet")
            }
            Ok(json!(n))
        })
        .retries(5, Duration::from_millis(10))
        .wait_interval(Duration::from_millis(10))
        .build();

        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Done, Some(Duration::from_secs(10)))
            .expect("done");
        assert_eq!(job.result(Some(Duration::from_secs(2))).unwrap(), json!(3));
        assert_eq!(job.attempts(), 3);
    })
    .expect("scope");
}

#[test]
fn test_rerun_resets_attempt_counter() {
    Engine::scope(fast_setting(), |engine| {
        let job = Job::thread(|_ctx| -> anyhow::Result<TaskValue> {
            anyhow::bail!("terminal failure")
        })
        .retries(1, Duration::from_millis(10))
        .wait_interval(Duration::from_millis(10))
        .build();

        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Failed, Some(Duration::from_secs(10)))
            .expect("failed");
        assert_eq!(job.attempts(), 2);

        job.rerun().expect("rerun");
        job.wait(JobStatus::Failed, Some(Duration::from_secs(10)))
            .expect("failed again");
        // A rerun starts a fresh budget: initial attempt + one retry.
        assert_eq!(job.attempts(), 2);
    })
    .expect("scope");
}
