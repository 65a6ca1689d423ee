use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use msgqueue_core::{Cache, Message, Options, Producer, Queuer, handler_fn};
use msgqueue_infra::{InMemoryCache, InMemoryQueue, MemQueue};

const LEASE: Duration = Duration::from_secs(60);

/// Add, reserve and delete on the bare store, no threads involved.
fn bench_store_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_round_trip");
    for batch in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let q = InMemoryQueue::new(&Options::new("bench-store").with_wait_timeout(Duration::from_millis(1)));
            b.iter(|| {
                for i in 0..batch {
                    q.call((i,)).unwrap();
                }
                let msgs = q.reserve_n(batch, LEASE).unwrap();
                q.delete_batch(black_box(&msgs)).unwrap();
            });
        });
    }
    group.finish();
}

/// Producer-to-handler throughput through the background processor.
fn bench_processed_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("processed_throughput");
    group.sample_size(10);
    for n in [1_000usize, 10_000] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let calls = Arc::new(AtomicUsize::new(0));
                let q = {
                    let calls = calls.clone();
                    MemQueue::new(Options::new("bench-processed").with_handler(handler_fn(
                        move |_i: usize| {
                            calls.fetch_add(1, Ordering::Relaxed);
                        },
                    )))
                };
                for i in 0..n {
                    q.call_async((i,)).unwrap();
                }
                q.close().unwrap();
                assert_eq!(calls.load(Ordering::Relaxed), n);
            });
        });
    }
    group.finish();
}

fn bench_dedup(c: &mut Criterion) {
    let cache = InMemoryCache::default();
    let mut i = 0u64;
    c.bench_function("in_memory_cache_exists", |b| {
        b.iter(|| {
            i += 1;
            black_box(cache.exists(&format!("msgqueue:bench:{}", i % 4096)))
        })
    });

    c.bench_function("call_once_key", |b| {
        b.iter(|| {
            let mut msg = Message::from_args(("user", 42)).unwrap();
            msg.set_delay_name(Duration::from_secs(60)).unwrap();
            black_box(msg.name)
        })
    });
}

criterion_group!(
    benches,
    bench_store_round_trip,
    bench_processed_throughput,
    bench_dedup
);
criterion_main!(benches);
