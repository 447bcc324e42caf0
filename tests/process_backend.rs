//! End-to-end process backend tests.
//!
//! This binary doubles as the pool worker: the engine re-execs the current
//! executable with the worker env var set, and `init_worker` takes over in
//! the child. That requires a manual `main`, so this test runs without the
//! libtest harness (`harness = false` in Cargo.toml).

use std::time::Duration;

use jobflow::{
    init_worker, Engine, EngineSetting, Job, JobError, JobStatus, ResolvedArgs, TaskRegistry,
    TaskValue,
};
use serde_json::json;

fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("add", |args: &ResolvedArgs| {
        Ok(json!(args.int(0)? + args.int(1)?))
    });
    registry.register("boom", |_args: &ResolvedArgs| -> anyhow::Result<TaskValue> {
        anyhow::bail!("kaboom")
    });
    registry.register("spin", |_args: &ResolvedArgs| -> anyhow::Result<TaskValue> {
        loop {
            std::thread::sleep(Duration::from_millis(50));
        }
    });
    registry
}

fn fast_setting() -> EngineSetting {
    EngineSetting::new()
        .with_tick(Duration::from_millis(10))
        .with_print_traceback(false)
}

fn main() {
    // In the re-exec'd child this serves requests and never returns.
    init_worker(&registry());

    test_process_job_returns_result();
    test_future_chain_across_processes();
    test_task_failure_is_stored();
    test_cancel_kills_worker_and_pool_recovers();
    println!("process backend tests: ok");
}

fn test_process_job_returns_result() {
    Engine::scope(fast_setting(), |engine| {
        let job = Job::process("add").arg(1i64).arg(2i64).build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Done, Some(Duration::from_secs(10)))
            .expect("done");
        assert_eq!(job.result(Some(Duration::from_secs(5))).unwrap(), json!(3));
    })
    .expect("scope");
}

fn test_future_chain_across_processes() {
    Engine::scope(fast_setting(), |engine| {
        let job1 = Job::process("add")
            .arg(1i64)
            .arg(2i64)
            .wait_interval(Duration::from_millis(10))
            .build();
        let job2 = Job::process("add")
            .arg(job1.future())
            .arg(4i64)
            .wait_interval(Duration::from_millis(10))
            .build();
        engine.submit([job1, job2.clone()]).expect("submit");
        engine.wait().expect("wait");
        assert_eq!(job2.result(Some(Duration::from_secs(5))).unwrap(), json!(7));
    })
    .expect("scope");
}

fn test_task_failure_is_stored() {
    Engine::scope(fast_setting(), |engine| {
        let job = Job::process("boom").build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Failed, Some(Duration::from_secs(10)))
            .expect("failed");
        match job.exception(Some(Duration::from_secs(5))).unwrap() {
            Some(JobError::UserCallable(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("expected UserCallable, got {other:?}"),
        }
    })
    .expect("scope");
}

fn test_cancel_kills_worker_and_pool_recovers() {
    Engine::scope(fast_setting(), |engine| {
        let spinner = Job::process("spin").build();
        engine.submit_one(spinner.clone()).expect("submit");
        spinner
            .wait(JobStatus::Running, Some(Duration::from_secs(10)))
            .expect("running");
        std::thread::sleep(Duration::from_millis(200));

        spinner.cancel().expect("cancel");
        spinner
            .wait(JobStatus::Cancelled, Some(Duration::from_secs(10)))
            .expect("cancelled");

        // The pool respawns a worker; subsequent jobs still run.
        let job = Job::process("add").arg(20i64).arg(22i64).build();
        engine.submit_one(job.clone()).expect("submit after cancel");
        job.wait(JobStatus::Done, Some(Duration::from_secs(10)))
            .expect("done");
        assert_eq!(job.result(Some(Duration::from_secs(5))).unwrap(), json!(42));
    })
    .expect("scope");
}
