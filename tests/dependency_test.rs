//! Dependency-result plumbing through job futures.

use std::sync::Arc;
use std::time::Duration;

use jobflow::{
    Engine, EngineSetting, Job, JobError, JobStatus, LoopbackCluster, ResolvedArgs, TaskRegistry,
};
use serde_json::json;

fn fast_setting() -> EngineSetting {
    EngineSetting::new().with_tick(Duration::from_millis(10))
}

fn add_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("add", |args: &ResolvedArgs| {
        Ok(json!(args.int(0)? + args.int(1)?))
    });
    registry
}

#[test]
fn test_future_argument_feeds_downstream_job() {
    Engine::scope(fast_setting(), |engine| {
        let job1 = Job::thread(|ctx| Ok(json!(ctx.args().int(0)? + ctx.args().int(1)?)))
            .arg(1i64)
            .arg(2i64)
            .wait_interval(Duration::from_millis(10))
            .build();
        let job2 = Job::thread(|ctx| Ok(json!(ctx.args().int(0)? + ctx.args().int(1)?)))
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

#[test]
fn test_future_chain_through_distributed_backend() {
    let engine = Engine::new(fast_setting()).expect("engine");
    engine.set_cluster(Arc::new(LoopbackCluster::new(add_registry())));
    engine.start().expect("start");

    let job1 = Job::distributed("add")
        .arg(1i64)
        .arg(2i64)
        .wait_interval(Duration::from_millis(10))
        .build();
    let job2 = Job::distributed("add")
        .arg(job1.future())
        .arg(4i64)
        .wait_interval(Duration::from_millis(10))
        .build();
    engine.submit([job1.clone(), job2.clone()]).expect("submit");
    engine.wait().expect("wait");

    assert_eq!(job1.result(Some(Duration::from_secs(5))).unwrap(), json!(3));
    assert_eq!(job2.result(Some(Duration::from_secs(5))).unwrap(), json!(7));
    engine.stop().expect("stop");
}

#[test]
fn test_named_args_resolve_futures_too() {
    Engine::scope(fast_setting(), |engine| {
        let producer = Job::thread(|_ctx| Ok(json!(10)))
            .wait_interval(Duration::from_millis(10))
            .build();
        let consumer = Job::thread(|ctx| {
            let base = ctx.args().get("base").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!(base * 3))
        })
        .named_arg("base", producer.future())
        .wait_interval(Duration::from_millis(10))
        .build();
        engine.submit([producer, consumer.clone()]).expect("submit");
        engine.wait().expect("wait");
        assert_eq!(
            consumer.result(Some(Duration::from_secs(5))).unwrap(),
            json!(30)
        );
    })
    .expect("scope");
}

#[test]
fn test_upstream_failure_fails_consumer_without_running_it() {
    let setting = fast_setting().with_print_traceback(false);
    Engine::scope(setting, |engine| {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let job1 = Job::thread(|_ctx| -> anyhow::Result<jobflow::TaskValue> {
            anyhow::bail!("upstream broke")
        })
        .wait_interval(Duration::from_millis(10))
        .build();
        let ran2 = Arc::clone(&ran);
        let job2 = Job::thread(move |_ctx| {
            ran2.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(json!(null))
        })
        .arg(job1.future())
        .wait_interval(Duration::from_millis(10))
        .build();

        engine.submit([job2.clone(), job1.clone()]).expect("submit");
        engine.wait().expect("wait");

        assert_eq!(job1.status(), JobStatus::Failed);
        assert_eq!(job2.status(), JobStatus::Failed);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        match job2.exception(Some(Duration::from_secs(2))).unwrap() {
            Some(JobError::DependencyFailed { upstream, status }) => {
                assert_eq!(&upstream, job1.id());
                assert_eq!(status, JobStatus::Failed);
            }
            other => panic!("expected DependencyFailed, got {other:?}"),
        }
    })
    .expect("scope");
}

#[test]
fn test_upstream_cancellation_fails_consumer() {
    Engine::scope(fast_setting(), |engine| {
        let job1 = Job::thread(|ctx| {
            while !ctx.is_cancelled() {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(json!(null))
        })
        .build();
        let job2 = Job::thread(|_ctx| Ok(json!(null)))
            .arg(job1.future())
            .wait_interval(Duration::from_millis(10))
            .build();

        engine.submit([job2.clone(), job1.clone()]).expect("submit");
        job1.wait(JobStatus::Running, Some(Duration::from_secs(2)))
            .expect("running");
        job1.cancel().expect("cancel");
        engine.wait().expect("wait");

        assert_eq!(job1.status(), JobStatus::Cancelled);
        assert_eq!(job2.status(), JobStatus::Failed);
        match job2.exception(Some(Duration::from_secs(2))).unwrap() {
            Some(JobError::DependencyFailed { status, .. }) => {
                assert_eq!(status, JobStatus::Cancelled);
            }
            other => panic!("expected DependencyFailed, got {other:?}"),
        }
    })
    .expect("scope");
}

#[test]
fn test_dependency_failure_is_not_retried() {
    let setting = fast_setting().with_print_traceback(false);
    Engine::scope(setting, |engine| {
        let job1 = Job::thread(|_ctx| -> anyhow::Result<jobflow::TaskValue> {
            anyhow::bail!("nope")
        })
        .wait_interval(Duration::from_millis(10))
        .build();
        let job2 = Job::thread(|_ctx| Ok(json!(null)))
            .arg(job1.future())
            .retries(3, Duration::from_millis(10))
            .wait_interval(Duration::from_millis(10))
            .build();
        engine.submit([job1, job2.clone()]).expect("submit");
        engine.wait().expect("wait");
        assert_eq!(job2.status(), JobStatus::Failed);
        // The consumer never executed, and never burned retry attempts.
        assert_eq!(job2.attempts(), 0);
    })
    .expect("scope");
}
