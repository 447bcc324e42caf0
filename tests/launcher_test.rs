//! Launcher: function-to-submit-site wrapping.

use std::time::Duration;

use jobflow::{Engine, EngineSetting, JobStatus, Launcher, TaskArgs};
use serde_json::json;

fn fast_setting() -> EngineSetting {
    EngineSetting::new().with_tick(Duration::from_millis(10))
}

fn add_launcher() -> Launcher {
    Launcher::thread("add", |ctx| {
        Ok(json!(ctx.args().int(0)? + ctx.args().int(1)?))
    })
    .wait_interval(Duration::from_millis(10))
}

#[test]
fn test_submit_returns_job_handle() {
    Engine::scope(fast_setting(), |engine| {
        let add = add_launcher();
        let job = add
            .submit_to(engine, TaskArgs::positional([1i64, 2i64]))
            .expect("submit");
        engine.wait_job(&job, Some(Duration::from_secs(5))).expect("wait");
        assert_eq!(job.result(Some(Duration::from_secs(2))).unwrap(), json!(3));
        assert_eq!(job.name(), "add");
    })
    .expect("scope");
}

#[test]
fn test_bound_launcher_call_blocks_for_result() {
    Engine::scope(fast_setting(), |engine| {
        let add = add_launcher().bind(engine);
        let value = add
            .call(TaskArgs::positional([2i64, 40i64]), Some(Duration::from_secs(5)))
            .expect("call");
        assert_eq!(value, json!(42));
    })
    .expect("scope");
}

#[test]
fn test_launcher_jobs_chain_through_futures() {
    Engine::scope(fast_setting(), |engine| {
        let add = add_launcher().bind(engine);
        let first = add
            .submit(TaskArgs::positional([1i64, 2i64]))
            .expect("first");
        let second = add
            .submit(TaskArgs::new().arg(first.future()).arg(2i64))
            .expect("second");
        engine.wait().expect("wait");
        assert_eq!(
            second.result(Some(Duration::from_secs(5))).unwrap(),
            json!(5)
        );
    })
    .expect("scope");
}

#[test]
fn test_call_surfaces_job_failure() {
    let setting = fast_setting().with_print_traceback(false);
    Engine::scope(setting, |engine| {
        let boom = Launcher::thread("boom", |_ctx| -> anyhow::Result<jobflow::TaskValue> {
            anyhow::bail!("launcher test failure")
        })
        .bind(engine);
        let err = boom
            .call(TaskArgs::new(), Some(Duration::from_secs(5)))
            .unwrap_err();
        assert!(matches!(
            err,
            jobflow::EngineError::Job(jobflow::JobError::UserCallable(_))
        ));
    })
    .expect("scope");
}

#[test]
fn test_command_launcher_runs_subprocess() {
    Engine::scope(fast_setting(), |engine| {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("launched.txt");
        let touch = Launcher::command("touch", "touch {0}").bind(engine);
        let job = touch
            .submit(TaskArgs::positional([marker.to_string_lossy().to_string()]))
            .expect("submit");
        job.wait(JobStatus::Done, Some(Duration::from_secs(5)))
            .expect("done");
        assert!(marker.exists());
    })
    .expect("scope");
}

#[tokio::test]
async fn test_call_async() {
    let engine = Engine::new(fast_setting()).expect("engine");
    engine.start_async().expect("start");
    let add = add_launcher().bind(&engine);
    let value = add
        .call_async(TaskArgs::positional([3i64, 4i64]))
        .await
        .expect("call_async");
    assert_eq!(value, json!(7));
    engine.stop_async().await.expect("stop");
}
