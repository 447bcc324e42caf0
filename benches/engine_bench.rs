//! Benchmarks for submission and scheduling throughput.
//!
//! Covers:
//! - Condition evaluation cost
//! - Submit + wait round-trips for local and thread jobs
//! - Dependency-chain scheduling latency

use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;

use jobflow::{Condition, Engine, EngineSetting, Job};

fn fast_setting() -> EngineSetting {
    EngineSetting::new().with_tick(Duration::from_millis(1))
}

fn bench_condition_operators(c: &mut Criterion) {
    let mut group = c.benchmark_group("condition");
    group.bench_function("and_flatten_8", |b| {
        b.iter(|| {
            let mut cond = Condition::after_another("job-0");
            for i in 1..8 {
                cond = cond & Condition::after_another(format!("job-{i}").as_str());
            }
            black_box(cond)
        });
    });
    group.finish();
}

fn bench_local_jobs(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_jobs");
    for count in [10usize, 100] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                Engine::scope(fast_setting(), |engine| {
                    let jobs: Vec<Job> = (0..count)
                        .map(|i| {
                            Job::local(move |_ctx| Ok(json!(i)))
                                .wait_interval(Duration::from_millis(1))
                                .build()
                        })
                        .collect();
                    engine.submit(jobs).expect("submit");
                    engine.wait().expect("wait");
                })
                .expect("scope")
            });
        });
    }
    group.finish();
}

fn bench_dependency_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_chain");
    group.bench_function("chain_4_thread_jobs", |b| {
        b.iter(|| {
            Engine::scope(fast_setting(), |engine| {
                let mut prev: Option<Job> = None;
                let mut last = None;
                for _ in 0..4 {
                    let mut builder = Job::thread(|ctx| {
                        Ok(json!(ctx.args().pos(0).and_then(|v| v.as_i64()).unwrap_or(0) + 1))
                    })
                    .wait_interval(Duration::from_millis(1));
                    builder = match prev.take() {
                        Some(p) => builder.arg(p.future()),
                        None => builder.arg(0i64),
                    };
                    let job = builder.build();
                    engine.submit_one(job.clone()).expect("submit");
                    last = Some(job.clone());
                    prev = Some(job);
                }
                let last = last.expect("at least one job");
                engine.wait().expect("wait");
                black_box(last.result(Some(Duration::from_secs(5))).expect("result"))
            })
            .expect("scope")
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_condition_operators,
    bench_local_jobs,
    bench_dependency_chain
);
criterion_main!(benches);
