//! Benchmarks for queue operations using criterion.
//!
//! Measures enqueue latency, fair pop with many active owners, and the full
//! push → pop cycle against the in-memory store.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use switchyard::models::OrgId;
use switchyard::queue::{QueueName, TaskQueue};
use switchyard::task::{Task, TaskPriority, TaskType};
use switchyard_testkit::MemoryStore;
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn bench_task(org: OrgId) -> Task {
    Task::new(TaskType::StartFlow, org, &serde_json::json!({"bench": true})).unwrap()
}

fn bench_push_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("push_single");
    group.sample_size(100);

    group.bench_function("in_memory", |b| {
        let store = Arc::new(MemoryStore::new());
        let org = OrgId(1);
        let task = bench_task(org);

        b.to_async(&rt).iter(|| {
            let store = store.clone();
            let task = task.clone();
            async move {
                store
                    .push(QueueName::Batch, org, &task, TaskPriority::Default)
                    .await
                    .expect("push should succeed");
            }
        });
    });

    group.finish();
}

fn bench_pop_many_owners(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("pop_many_owners");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory_100_owners", |b| {
        let store = Arc::new(MemoryStore::new());
        rt.block_on(async {
            for owner in 1..=100 {
                let org = OrgId(owner);
                for _ in 0..100 {
                    store
                        .push(QueueName::Batch, org, &bench_task(org), TaskPriority::Default)
                        .await
                        .unwrap();
                }
            }
        });

        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                // keep the index populated by pushing back what we pop
                if let Some(task) = store.pop(QueueName::Batch).await.unwrap() {
                    store
                        .push(QueueName::Batch, task.org_id, &task, TaskPriority::Default)
                        .await
                        .unwrap();
                }
            }
        });
    });

    group.finish();
}

fn bench_push_pop_cycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("push_pop_cycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory", |b| {
        let store = Arc::new(MemoryStore::new());
        let org = OrgId(1);

        b.to_async(&rt).iter(|| {
            let store = store.clone();
            async move {
                store
                    .push(QueueName::Handler, org, &bench_task(org), TaskPriority::Default)
                    .await
                    .unwrap();
                store
                    .pop(QueueName::Handler)
                    .await
                    .unwrap()
                    .expect("task should be queued");
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_push_single,
    bench_pop_many_owners,
    bench_push_pop_cycle
);
criterion_main!(benches);
