//! Benchmarks for job queue operations using criterion.
//!
//! Measures the in-memory queue on its hot paths: insert, dispatch
//! under a constraint, tag lookup, and the insert-dispatch-remove
//! lifecycle.

#![allow(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quarry::{
    Constraint, Job, JobHandler, JobHolder, JobQueue, MemoryJobQueue, NetworkStatus, TagQuery,
};
use tokio::runtime::Runtime;
use uuid::Uuid;

struct BenchHandler;

#[async_trait]
impl JobHandler for BenchHandler {
    async fn on_run(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn holder(priority: i32, order: u64) -> JobHolder {
    JobHolder::new(
        Job::new().with_priority(priority).tagged("bench"),
        Arc::new(BenchHandler),
        order,
        0,
    )
}

fn ready_now() -> Constraint {
    Constraint::new(NetworkStatus::Unmetered).ready_by(0)
}

fn bench_insert_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("insert_single");
    group.sample_size(100);

    group.bench_function("memory", |b| {
        b.to_async(&rt).iter(|| async {
            let mut queue = MemoryJobQueue::new();
            queue
                .insert(holder(1, 0))
                .await
                .expect("insert should succeed");
        });
    });

    group.finish();
}

fn bench_insert_batch(c: &mut Criterion) {
    let rt = create_runtime();
    let batch_sizes = vec![10, 100, 1000];

    let mut group = c.benchmark_group("insert_batch");
    group.sample_size(50);

    for batch_size in &batch_sizes {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("memory", batch_size),
            batch_size,
            |b, &size| {
                b.to_async(&rt).iter(|| async {
                    let mut queue = MemoryJobQueue::new();
                    for i in 0..size {
                        queue
                            .insert(holder((i % 10) as i32, i as u64))
                            .await
                            .expect("insert should succeed");
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_next_job(c: &mut Criterion) {
    let rt = create_runtime();
    let depths = vec![10, 100, 1000];

    let mut group = c.benchmark_group("next_job");
    group.sample_size(50);

    for depth in &depths {
        group.bench_with_input(BenchmarkId::new("memory", depth), depth, |b, &depth| {
            b.to_async(&rt).iter(|| async {
                let mut queue = MemoryJobQueue::new();
                for i in 0..depth {
                    queue
                        .insert(holder((i % 10) as i32, i as u64))
                        .await
                        .expect("insert should succeed");
                }
                queue
                    .next_job(&ready_now(), Uuid::now_v7())
                    .await
                    .expect("next_job should succeed")
                    .expect("queue is not empty");
            });
        });
    }

    group.finish();
}

fn bench_find_by_tags(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("find_by_tags");
    group.sample_size(50);

    group.bench_function("memory_1000", |b| {
        let mut seeded = MemoryJobQueue::new();
        rt.block_on(async {
            for i in 0..1000 {
                seeded
                    .insert(holder((i % 10) as i32, i as u64))
                    .await
                    .expect("insert should succeed");
            }
        });
        let queue = Arc::new(tokio::sync::Mutex::new(seeded));

        b.to_async(&rt).iter(|| {
            let queue = Arc::clone(&queue);
            async move {
                let ids = queue
                    .lock()
                    .await
                    .find_by_tags(&TagQuery::any(["bench"]))
                    .await
                    .expect("find_by_tags should succeed");
                assert_eq!(ids.len(), 1000);
            }
        });
    });

    group.finish();
}

fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.sample_size(100);

    group.bench_function("memory", |b| {
        b.to_async(&rt).iter(|| async {
            let mut queue = MemoryJobQueue::new();
            queue
                .insert(holder(1, 0))
                .await
                .expect("insert should succeed");
            let taken = queue
                .next_job(&ready_now(), Uuid::now_v7())
                .await
                .expect("next_job should succeed")
                .expect("queue is not empty");
            queue
                .remove(taken.job.id)
                .await
                .expect("remove should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_single,
    bench_insert_batch,
    bench_next_job,
    bench_find_by_tags,
    bench_full_lifecycle
);
criterion_main!(benches);
