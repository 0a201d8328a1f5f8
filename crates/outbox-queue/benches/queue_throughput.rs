//! Benchmarks for enqueue throughput and dependency ordering

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use outbox_queue::{dependency_order, FileStore, MemoryStore, OperationQueue};
use outbox_types::NewOperation;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn bench_enqueue_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("enqueue_100_memory", |b| {
        b.to_async(&rt).iter(|| async {
            let queue = OperationQueue::open(Arc::new(MemoryStore::new())).unwrap();
            for i in 0..100 {
                black_box(
                    queue
                        .enqueue(NewOperation::create("tasks.create", "task", json!({ "n": i })))
                        .await
                        .unwrap(),
                );
            }
        });
    });
}

fn bench_enqueue_file(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("enqueue_10_fsync", |b| {
        b.to_async(&rt).iter(|| async {
            let temp_dir = TempDir::new().unwrap();
            let store = Arc::new(FileStore::open(temp_dir.path()).unwrap());
            let queue = OperationQueue::open(store).unwrap();
            for i in 0..10 {
                black_box(
                    queue
                        .enqueue(NewOperation::create("tasks.create", "task", json!({ "n": i })))
                        .await
                        .unwrap(),
                );
            }
        });
    });
}

fn bench_dependency_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let operations = rt.block_on(async {
        let queue = OperationQueue::open(Arc::new(MemoryStore::new())).unwrap();
        // Every operation depends on the one enqueued after it
        for id in 1..=500u64 {
            let mut request = NewOperation::create("tasks.create", "task", json!({})).with_id(id);
            if id < 500 {
                request = request.depends_on(id + 1);
            }
            queue.enqueue(request).await.unwrap();
        }
        queue.list().await
    });

    c.bench_function("dependency_order_500_chain", |b| {
        b.iter(|| black_box(dependency_order(black_box(&operations))));
    });
}

criterion_group!(
    benches,
    bench_enqueue_memory,
    bench_enqueue_file,
    bench_dependency_order
);
criterion_main!(benches);
