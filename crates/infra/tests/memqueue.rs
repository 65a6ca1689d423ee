//! End-to-end behavior of the self-processing in-memory queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use msgqueue_core::{
    Message, Options, Producer, QueueConfig, QueueError, Queuer, handler_fn, message_handler,
};
use msgqueue_infra::{InMemoryCache, MemQueue};

const BACKOFF: Duration = Duration::from_millis(200);
const TOLERANCE: Duration = Duration::from_millis(20);

fn setup() {
    msgqueue_observability::init_for_tests();
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn assert_near(actual: Instant, expected: Instant) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= TOLERANCE,
        "off by {diff:?} (tolerance {TOLERANCE:?})"
    );
}

/// Sleep until just after a whole second so every caller in a burst lands in
/// the same dedup slot.
fn align_to_second() {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    let into_second = Duration::from_nanos(u64::from(now.subsec_nanos()));
    thread::sleep(Duration::from_secs(1) - into_second + Duration::from_millis(5));
}

/// Queue whose handler always fails and records when it ran.
fn failing_queue(opt: Options, times: Arc<Mutex<Vec<Instant>>>) -> MemQueue {
    MemQueue::new(opt.with_handler(handler_fn(move || -> anyhow::Result<()> {
        times.lock().unwrap().push(Instant::now());
        anyhow::bail!("fake handler error")
    })))
}

#[test]
fn handler_is_called_with_args() {
    setup();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let q = MemQueue::new(Options::new("args").with_handler(handler_fn(
        move |s: String, n: i64| {
            tx.send((s, n)).unwrap();
        },
    )));

    q.call(("string", 42)).unwrap();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ("string".to_string(), 42)
    );
    q.close().unwrap();
}

#[test]
fn wrong_argument_count_skips_the_handler() {
    setup();
    let calls = counter();
    let q = {
        let calls = calls.clone();
        MemQueue::new(Options::new("arity").with_handler(handler_fn(move |_s: String| {
            calls.fetch_add(1, Ordering::SeqCst);
        })))
    };

    q.call(()).unwrap();
    q.call(("a", "b")).unwrap();
    q.close().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(q.is_empty());
}

#[test]
fn message_handler_sees_the_whole_message() {
    setup();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let q = MemQueue::new(Options::new("whole").with_handler(message_handler(
        move |msg: &Message| {
            tx.send(msg.clone()).unwrap();
        },
    )));

    q.add(Message::from_args(("hello",)).unwrap().with_name("greeting"))
        .unwrap();
    let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(msg.args, vec![serde_json::json!("hello")]);
    assert_eq!(msg.name.as_deref(), Some("greeting"));
    assert_eq!(msg.reserved_count, 1);
    q.close().unwrap();
}

#[test]
fn failed_messages_are_retried_with_exponential_backoff() {
    setup();
    let times = Arc::new(Mutex::new(Vec::new()));
    let q = failing_queue(
        Options::new("backoff")
            .with_retry_limit(3)
            .with_min_backoff(BACKOFF),
        times.clone(),
    );

    let start = Instant::now();
    q.call(()).unwrap();
    q.close().unwrap();

    let times = times.lock().unwrap();
    assert_eq!(times.len(), 3);
    assert_near(times[0], start);
    assert_near(times[1], start + BACKOFF);
    assert_near(times[2], start + 3 * BACKOFF);
}

#[test]
fn delayed_messages_wait_before_the_first_attempt() {
    setup();
    let times = Arc::new(Mutex::new(Vec::new()));
    let q = failing_queue(
        Options::new("delayed")
            .with_retry_limit(3)
            .with_min_backoff(BACKOFF),
        times.clone(),
    );

    let start = Instant::now();
    q.add(Message::new(vec![]).with_delay(5 * BACKOFF)).unwrap();
    q.close().unwrap();

    let times = times.lock().unwrap();
    assert_eq!(times.len(), 3);
    assert_near(times[0], start + 5 * BACKOFF);
    assert_near(times[1], start + 6 * BACKOFF);
    assert_near(times[2], start + 8 * BACKOFF);
}

#[test]
fn ignore_delay_processes_delayed_messages_at_once() {
    setup();
    let times = Arc::new(Mutex::new(Vec::new()));
    let q = failing_queue(
        Options::new("ignore-delay")
            .with_retry_limit(3)
            .with_min_backoff(BACKOFF)
            .with_ignore_delay(true),
        times.clone(),
    );

    let start = Instant::now();
    q.add(Message::new(vec![]).with_delay(Duration::from_secs(3600)))
        .unwrap();
    q.close().unwrap();

    let times = times.lock().unwrap();
    assert_eq!(times.len(), 3);
    assert_near(times[0], start);
    assert_near(times[1], start + BACKOFF);
    assert_near(times[2], start + 3 * BACKOFF);
}

#[test]
fn fallback_runs_once_after_the_last_attempt() {
    setup();
    let fallbacks = counter();
    let q = {
        let fallbacks = fallbacks.clone();
        MemQueue::new(
            Options::new("fallback")
                .with_retry_limit(1)
                .with_handler(handler_fn(|_n: u32| -> anyhow::Result<()> {
                    anyhow::bail!("fake handler error")
                }))
                .with_fallback_handler(handler_fn(move |n: u32| {
                    assert_eq!(n, 7);
                    fallbacks.fetch_add(1, Ordering::SeqCst);
                })),
        )
    };

    q.call((7,)).unwrap();
    q.close().unwrap();
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn named_message_is_processed_once() {
    setup();
    const PRODUCERS: usize = 100;
    let calls = counter();
    let q = {
        let calls = calls.clone();
        Arc::new(MemQueue::new(Options::new("named").with_handler(handler_fn(
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
            },
        ))))
    };

    let barrier = Arc::new(Barrier::new(PRODUCERS));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let q = q.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                q.add(Message::new(vec![]).with_name("myname")).unwrap();
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    q.close().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn call_once_runs_once_per_period() {
    setup();
    const PRODUCERS: usize = 100;
    let period = BACKOFF;
    let times = Arc::new(Mutex::new(Vec::new()));
    let q = {
        let times = times.clone();
        Arc::new(MemQueue::new(Options::new("call-once").with_handler(handler_fn(
            move |slot: u32| {
                assert_eq!(slot, 1);
                times.lock().unwrap().push(Instant::now());
            },
        ))))
    };

    align_to_second();
    let start = Instant::now();
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let q = q.clone();
            thread::spawn(move || q.call_once(period, (1,)).unwrap())
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    q.close().unwrap();
    let times = times.lock().unwrap();
    assert_eq!(times.len(), 1);
    assert_near(times[0], start + period);
}

#[test]
fn every_message_is_handled_exactly_once() {
    setup();
    const N: usize = 10_000;
    let calls = counter();
    let q = {
        let calls = calls.clone();
        MemQueue::new(Options::new("stress").with_handler(handler_fn(move |_i: usize| {
            calls.fetch_add(1, Ordering::SeqCst);
        })))
    };

    for i in 0..N {
        q.call((i,)).unwrap();
    }
    q.close().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), N);
    let stats = q.processor().stats();
    assert_eq!(stats.processed, N as u64);
    assert_eq!(stats.in_flight, 0);
}

#[test]
fn every_failing_message_reaches_the_fallback() {
    setup();
    const N: usize = 10_000;
    let fallbacks = counter();
    let q = {
        let fallbacks = fallbacks.clone();
        MemQueue::new(
            Options::new("stress-failing")
                .with_retry_limit(3)
                .with_min_backoff(Duration::from_millis(1))
                .with_handler(handler_fn(|| -> anyhow::Result<()> {
                    anyhow::bail!("fake handler error")
                }))
                .with_fallback_handler(handler_fn(move || {
                    fallbacks.fetch_add(1, Ordering::SeqCst);
                })),
        )
    };

    for _ in 0..N {
        q.call(()).unwrap();
    }
    q.close().unwrap();

    assert_eq!(fallbacks.load(Ordering::SeqCst), N);
    assert_eq!(q.processor().stats().fails, N as u64);
}

#[test]
fn deleting_twice_succeeds() {
    setup();
    let q = MemQueue::new(Options::new("double-delete"));
    q.call(()).unwrap();

    let msg = q.reserve_n(1, Duration::from_secs(60)).unwrap().remove(0);
    q.delete(&msg).unwrap();
    q.delete(&msg).unwrap();
    assert!(q.is_empty());
    q.close().unwrap();
}

#[test]
fn shared_cache_deduplicates_across_queues() {
    setup();
    let cache = Arc::new(InMemoryCache::default());
    let a = MemQueue::new(Options::new("shared").with_cache(cache.clone()));
    let b = MemQueue::new(Options::new("shared").with_cache(cache));

    a.add(Message::new(vec![]).with_name("job")).unwrap();
    b.add(Message::new(vec![]).with_name("job")).unwrap();
    assert_eq!(a.len() + b.len(), 1);
}

#[test]
fn close_times_out_on_slow_handlers() {
    setup();
    let q = MemQueue::new(
        Options::new("slow")
            .with_worker_limit(1)
            .with_handler(handler_fn(|| thread::sleep(Duration::from_millis(500)))),
    );
    q.call(()).unwrap();

    let err = q.close_timeout(Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, QueueError::Timeout(_)));
    assert!(matches!(q.call(()), Err(QueueError::Closed)));
}

#[test]
fn options_load_from_toml() {
    setup();
    let calls = counter();
    let config = QueueConfig::from_toml_str(
        r#"
        name = "from-config"
        retry_limit = 2
        min_backoff_ms = 10
        worker_limit = 2
        "#,
    )
    .unwrap();
    let opt = {
        let calls = calls.clone();
        config.apply(Options::default().with_handler(handler_fn(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        })))
    };

    let q = MemQueue::new(opt);
    assert_eq!(q.name(), "from-config");
    assert_eq!(q.processor().options().worker_limit, 2);
    q.call(()).unwrap();
    q.close().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
