//! Generator-producing jobs and the stream consumption protocol.

use std::time::Duration;

use jobflow::{Engine, EngineSetting, Job, JobKind, JobStatus};
use serde_json::json;

fn fast_setting() -> EngineSetting {
    EngineSetting::new().with_tick(Duration::from_millis(10))
}

fn counting_producer(count: i64) -> jobflow::JobBuilder {
    Job::streaming(JobKind::Thread, move |_ctx, sink| {
        for i in 0..count {
            sink.emit(json!(i))?;
        }
        Ok(())
    })
    .wait_interval(Duration::from_millis(10))
}

#[test]
fn test_stream_is_consumed_then_job_completes() {
    Engine::scope(fast_setting(), |engine| {
        let job = counting_producer(5).build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Running, Some(Duration::from_secs(2)))
            .expect("running");

        let stream = job.stream().expect("stream handle");
        let mut values = Vec::new();
        while let Some(value) = stream.next() {
            values.push(value);
        }
        assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

        job.wait(JobStatus::Done, Some(Duration::from_secs(2)))
            .expect("done");
        assert_eq!(job.status(), JobStatus::Done);
    })
    .expect("scope");
}

#[test]
fn test_engine_wait_excludes_streaming_jobs() {
    Engine::scope(fast_setting(), |engine| {
        let job = counting_producer(3).build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Running, Some(Duration::from_secs(2)))
            .expect("running");

        // The producer job is still `running` with an unconsumed stream,
        // yet wait() returns.
        engine
            .wait_timeout(Some(Duration::from_secs(2)))
            .expect("wait returns despite open stream");
        assert_eq!(job.status(), JobStatus::Running);

        let stream = job.stream().expect("stream handle");
        while stream.next().is_some() {}
        job.wait(JobStatus::Done, Some(Duration::from_secs(2)))
            .expect("done");
    })
    .expect("scope");
}

#[test]
fn test_closing_stream_early_completes_job() {
    Engine::scope(fast_setting(), |engine| {
        let job = counting_producer(100).build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Running, Some(Duration::from_secs(2)))
            .expect("running");

        let stream = job.stream().expect("stream handle");
        assert_eq!(stream.next(), Some(json!(0)));
        stream.close();
        assert_eq!(stream.next(), None);

        job.wait(JobStatus::Done, Some(Duration::from_secs(2)))
            .expect("done after close");
    })
    .expect("scope");
}

#[test]
fn test_cancel_mid_stream_marks_cancelled() {
    Engine::scope(fast_setting(), |engine| {
        let job = counting_producer(100).build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Running, Some(Duration::from_secs(2)))
            .expect("running");

        let stream = job.stream().expect("stream handle");
        assert_eq!(stream.next(), Some(json!(0)));

        job.cancel().expect("cancel");
        job.wait(JobStatus::Cancelled, Some(Duration::from_secs(2)))
            .expect("cancelled");
        // The closed stream yields no further values.
        assert_eq!(stream.next(), None);
    })
    .expect("scope");
}

#[test]
fn test_failing_producer_fails_job() {
    let setting = fast_setting().with_print_traceback(false);
    Engine::scope(setting, |engine| {
        let job = Job::streaming(JobKind::Thread, |_ctx, sink| {
            sink.emit(json!(1))?;
            anyhow::bail!("producer exploded")
        })
        .wait_interval(Duration::from_millis(10))
        .build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Failed, Some(Duration::from_secs(2)))
            .expect("failed");
        assert!(matches!(
            job.exception(Some(Duration::from_secs(1))).unwrap(),
            Some(jobflow::JobError::UserCallable(_))
        ));
    })
    .expect("scope");
}

#[test]
fn test_local_producer_streams_too() {
    Engine::scope(fast_setting(), |engine| {
        let job = Job::streaming(JobKind::Local, |_ctx, sink| {
            for i in 0..3 {
                sink.emit(json!(i * 10))?;
            }
            Ok(())
        })
        .wait_interval(Duration::from_millis(10))
        .build();
        engine.submit_one(job.clone()).expect("submit");
        job.wait(JobStatus::Running, Some(Duration::from_secs(2)))
            .expect("running");

        let stream = job.stream().expect("stream handle");
        let mut values = Vec::new();
        while let Some(value) = stream.next() {
            values.push(value);
        }
        assert_eq!(values, vec![json!(0), json!(10), json!(20)]);
        job.wait(JobStatus::Done, Some(Duration::from_secs(2)))
            .expect("done");
    })
    .expect("scope");
}
