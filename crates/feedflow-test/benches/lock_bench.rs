//! Benchmarks for the FIFO async lock

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use feedflow_sync::FastAsyncLock;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("bench runtime")
}

fn bench_try_lock(c: &mut Criterion) {
    let lock = FastAsyncLock::new();

    c.bench_function("lock_try_lock_release", |b| {
        b.iter(|| {
            let guard = lock.try_lock();
            drop(guard);
        })
    });
}

fn bench_uncontended(c: &mut Criterion) {
    let rt = runtime();
    let lock = FastAsyncLock::new();
    let token = CancellationToken::new();

    c.bench_function("lock_uncontended", |b| {
        b.iter(|| {
            rt.block_on(async {
                let guard = lock.lock(&token).await;
                drop(guard);
            })
        })
    });
}

fn bench_hand_off(c: &mut Criterion) {
    let rt = runtime();
    let lock = FastAsyncLock::new();

    c.bench_function("lock_hand_off_4_tasks", |b| {
        b.iter(|| {
            let lock = lock.clone();
            rt.block_on(async move {
                let token = Arc::new(CancellationToken::new());
                let tasks: Vec<_> = (0..4)
                    .map(|_| {
                        let lock = lock.clone();
                        let token = Arc::clone(&token);
                        tokio::spawn(async move {
                            let guard = lock.lock(&token).await;
                            tokio::task::yield_now().await;
                            drop(guard);
                        })
                    })
                    .collect();
                for task in tasks {
                    let _ = task.await;
                }
            })
        })
    });
}

criterion_group!(benches, bench_try_lock, bench_uncontended, bench_hand_off);
criterion_main!(benches);
