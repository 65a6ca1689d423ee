//! Reservation/retry engine.
//!
//! One fetcher thread reserves batches from the queue into a bounded local
//! buffer, a fixed pool of workers runs the handler, and a deleter thread
//! acknowledges finished messages in batches. Failed messages are released
//! back to the queue with exponential backoff until `retry_limit`
//! reservations have been used, then handed to the fallback handler and
//! deleted.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use msgqueue_core::{Handler, HandlerError, HandlerResult, Message, Options, QueueError, QueueResult, Queuer};

use crate::backoff::exponential_backoff;
use crate::permits::Permits;
use crate::stats::{Counters, ProcessorStats};

/// Upper bound on a single `reserve_n` call, whatever the concurrency.
pub const MAX_RESERVE_BATCH: usize = 100;

/// Upper bound on a single `delete_batch` call.
pub const DELETE_BATCH_SIZE: usize = 100;

/// Default deadline used by [`Processor::stop`].
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum spacing between reservations that come back empty.
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// How often the fetcher re-checks the stop flag while the buffer is full.
const PERMIT_TICK: Duration = Duration::from_millis(50);

/// What happens to a message after one handler attempt.
#[derive(Debug)]
enum Outcome {
    /// Handled; delete it.
    Done,
    /// Arguments did not bind; delete it without retrying.
    Dropped(HandlerError),
    /// Release it for another attempt after the delay.
    Retry(Duration, HandlerError),
    /// Out of retries; run the fallback, then delete it.
    Exhausted(HandlerError),
}

struct Shared {
    queue: Arc<dyn Queuer>,
    opt: Options,
    counters: Counters,
    permits: Permits,
}

struct Running {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    threads: Vec<JoinHandle<()>>,
}

/// Drives a [`Queuer`] with a pool of worker threads.
pub struct Processor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("queue", &self.shared.queue.name())
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Processor {
    /// Create a stopped processor for `queue`.
    pub fn new(queue: Arc<dyn Queuer>, opt: &Options) -> Self {
        let opt = opt.clone().init();
        let permits = Permits::new(opt.buffer_size + opt.worker_limit);
        Self {
            shared: Arc::new(Shared {
                queue,
                opt,
                counters: Counters::default(),
                permits,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &Options {
        &self.shared.opt
    }

    pub fn stats(&self) -> ProcessorStats {
        self.shared.counters.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.shared.permits.available()
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the fetcher, workers and deleter. Starting a running processor
    /// is a no-op.
    pub fn start(&self) -> QueueResult<()> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(());
        }
        let shared = &self.shared;
        if shared.opt.handler.is_none() {
            return Err(QueueError::MissingHandler(shared.opt.name.clone()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (work_tx, work_rx) = crossbeam_channel::bounded::<Message>(shared.opt.buffer_size);
        let (del_tx, del_rx) = crossbeam_channel::bounded::<Message>(shared.opt.buffer_size);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let mut threads = Vec::with_capacity(shared.opt.worker_limit + 2);

        let spawned = (|| -> QueueResult<()> {
            let deleter = {
                let shared = shared.clone();
                let done_tx = done_tx.clone();
                spawn(format!("{}-deleter", shared.opt.name), move || {
                    shared.delete_loop(del_rx);
                    drop(done_tx);
                })?
            };
            threads.push(deleter);

            for i in 0..shared.opt.worker_limit {
                let shared = shared.clone();
                let work_rx = work_rx.clone();
                let del_tx = del_tx.clone();
                let done_tx = done_tx.clone();
                threads.push(spawn(format!("{}-worker-{i}", shared.opt.name), move || {
                    shared.worker_loop(work_rx, del_tx);
                    drop(done_tx);
                })?);
            }

            let fetcher = {
                let shared = shared.clone();
                let stop = stop.clone();
                let done_tx = done_tx.clone();
                spawn(format!("{}-fetcher", shared.opt.name), move || {
                    shared.fetch_loop(work_tx, &stop);
                    drop(done_tx);
                })?
            };
            threads.push(fetcher);
            Ok(())
        })();

        if let Err(e) = spawned {
            stop.store(true, Ordering::SeqCst);
            error!(queue = %shared.opt.name, error = %e, "failed to start processor");
            return Err(e);
        }

        info!(
            queue = %shared.opt.name,
            workers = shared.opt.worker_limit,
            buffer = shared.opt.buffer_size,
            "processor started"
        );
        *running = Some(Running {
            stop,
            done: done_rx,
            threads,
        });
        Ok(())
    }

    /// [`Processor::stop_timeout`] with [`DEFAULT_STOP_TIMEOUT`].
    pub fn stop(&self) -> QueueResult<()> {
        self.stop_timeout(DEFAULT_STOP_TIMEOUT)
    }

    /// Stop reserving new messages and wait up to `timeout` for buffered and
    /// in-flight messages to finish.
    ///
    /// Handlers still running at the deadline are not interrupted; they keep
    /// their reservations until they finish or the lease expires.
    pub fn stop_timeout(&self, timeout: Duration) -> QueueResult<()> {
        let Some(running) = self.lock_running().take() else {
            return Ok(());
        };
        running.stop.store(true, Ordering::SeqCst);

        match running.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                for handle in running.threads {
                    let _ = handle.join();
                }
                info!(queue = %self.shared.opt.name, "processor stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    queue = %self.shared.opt.name,
                    stats = ?self.stats(),
                    "processor did not drain before the deadline"
                );
                Err(QueueError::Timeout(timeout))
            }
        }
    }

    /// Reserve and process a single message on the calling thread.
    ///
    /// Returns `false` when nothing was visible.
    pub fn process_one(&self) -> QueueResult<bool> {
        let shared = &self.shared;
        shared.require_handler()?;
        let msgs = match shared.queue.reserve_n(1, shared.opt.reservation_timeout) {
            Ok(msgs) => msgs,
            Err(e) if e.is_queue_not_found() => {
                shared.recreate_queue(&e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let Some(msg) = msgs.into_iter().next() else {
            return Ok(false);
        };
        shared.process(msg, |msg| shared.delete_now(&msg));
        Ok(true)
    }

    /// Process messages on the calling thread until the queue has nothing
    /// visible. Returns how many messages were processed.
    pub fn process_all(&self) -> QueueResult<usize> {
        let shared = &self.shared;
        shared.require_handler()?;
        let mut count = 0;
        loop {
            let msgs = match shared.queue.reserve_n(MAX_RESERVE_BATCH, shared.opt.reservation_timeout) {
                Ok(msgs) => msgs,
                Err(e) if e.is_queue_not_found() => {
                    shared.recreate_queue(&e);
                    return Ok(count);
                }
                Err(e) => return Err(e),
            };
            if msgs.is_empty() {
                return Ok(count);
            }
            for msg in msgs {
                shared.process(msg, |msg| shared.delete_now(&msg));
                count += 1;
            }
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().as_ref() {
            running.stop.store(true, Ordering::SeqCst);
        }
    }
}

fn spawn(name: String, f: impl FnOnce() + Send + 'static) -> QueueResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(|e| QueueError::Spawn(e.to_string()))
}

impl Shared {
    fn require_handler(&self) -> QueueResult<&Arc<dyn Handler>> {
        self.opt
            .handler
            .as_ref()
            .ok_or_else(|| QueueError::MissingHandler(self.opt.name.clone()))
    }

    fn recreate_queue(&self, cause: &QueueError) {
        warn!(queue = %self.opt.name, error = %cause, "queue is missing, recreating it");
        if let Err(e) = self.queue.create_queue() {
            error!(queue = %self.opt.name, error = %e, "failed to recreate queue");
        }
    }

    fn fetch_loop(&self, work_tx: Sender<Message>, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            let n = self.permits.acquire_up_to(MAX_RESERVE_BATCH, PERMIT_TICK);
            if n == 0 {
                continue;
            }

            let started = Instant::now();
            match self.queue.reserve_n(n, self.opt.reservation_timeout) {
                Ok(msgs) if msgs.is_empty() => {
                    self.permits.release(n);
                    idle(started);
                }
                Ok(mut msgs) => {
                    if msgs.len() > n {
                        self.return_surplus(msgs.split_off(n));
                    }
                    self.permits.release(n - msgs.len());
                    debug!(queue = %self.opt.name, count = msgs.len(), "reserved messages");
                    for msg in msgs {
                        Counters::incr(&self.counters.buffered);
                        if work_tx.send(msg).is_err() {
                            // Workers are gone; the lease will expire and the
                            // message becomes visible again.
                            Counters::decr(&self.counters.buffered);
                            self.permits.release(1);
                        }
                    }
                }
                Err(e) if e.is_queue_not_found() => {
                    self.permits.release(n);
                    self.recreate_queue(&e);
                }
                Err(e) => {
                    self.permits.release(n);
                    error!(queue = %self.opt.name, error = %e, "failed to reserve messages");
                    idle(started);
                }
            }
        }
        debug!(queue = %self.opt.name, "fetcher stopped");
    }

    /// Hand back messages a backend returned beyond the requested batch;
    /// they have no permits to run under.
    fn return_surplus(&self, surplus: Vec<Message>) {
        warn!(
            queue = %self.opt.name,
            count = surplus.len(),
            "backend returned more messages than requested, releasing the surplus"
        );
        for msg in &surplus {
            if let Err(e) = self.queue.release(msg, Duration::ZERO) {
                error!(queue = %self.opt.name, message_id = %msg.id, error = %e, "failed to release message");
            }
        }
    }

    fn worker_loop(&self, work_rx: Receiver<Message>, del_tx: Sender<Message>) {
        for msg in work_rx.iter() {
            Counters::decr(&self.counters.buffered);
            Counters::incr(&self.counters.in_flight);

            self.process(msg, |msg| {
                Counters::incr(&self.counters.deleting);
                if let Err(crossbeam_channel::SendError(msg)) = del_tx.send(msg) {
                    Counters::decr(&self.counters.deleting);
                    self.delete_now(&msg);
                }
            });

            Counters::decr(&self.counters.in_flight);
            self.permits.release(1);
        }
    }

    fn delete_loop(&self, del_rx: Receiver<Message>) {
        while let Ok(first) = del_rx.recv() {
            let mut batch = Vec::with_capacity(DELETE_BATCH_SIZE);
            batch.push(first);
            while batch.len() < DELETE_BATCH_SIZE {
                match del_rx.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }

            if let Err(e) = self.queue.delete_batch(&batch) {
                warn!(
                    queue = %self.opt.name,
                    count = batch.len(),
                    error = %e,
                    "batch delete failed, deleting one by one"
                );
                for msg in &batch {
                    self.delete_now(msg);
                }
            }
            for _ in &batch {
                Counters::decr(&self.counters.deleting);
            }
        }
    }

    fn delete_now(&self, msg: &Message) {
        if let Err(e) = self.queue.delete(msg) {
            error!(queue = %self.opt.name, message_id = %msg.id, error = %e, "failed to delete message");
        }
    }

    /// Run one attempt and settle the message with the queue; `delete`
    /// receives messages that are finished.
    fn process(&self, mut msg: Message, delete: impl FnOnce(Message)) {
        let outcome = self.attempt(&mut msg);
        match outcome {
            Outcome::Done => {
                Counters::incr(&self.counters.processed);
                delete(msg);
            }
            Outcome::Dropped(reason @ HandlerError::Body(_)) => {
                warn!(
                    queue = %self.opt.name,
                    message_id = %msg.id,
                    reason = %reason,
                    "undecodable message body, dropping message"
                );
                Counters::incr(&self.counters.processed);
                delete(msg);
            }
            Outcome::Dropped(reason) => {
                debug!(
                    queue = %self.opt.name,
                    message_id = %msg.id,
                    reason = %reason,
                    "arguments do not match handler, dropping message"
                );
                Counters::incr(&self.counters.processed);
                delete(msg);
            }
            Outcome::Retry(delay, err) => {
                debug!(
                    queue = %self.opt.name,
                    message_id = %msg.id,
                    reserved_count = msg.reserved_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "handler failed, releasing message"
                );
                Counters::incr(&self.counters.retries);
                if let Err(e) = self.queue.release(&msg, delay) {
                    error!(queue = %self.opt.name, message_id = %msg.id, error = %e, "failed to release message");
                }
            }
            Outcome::Exhausted(err) => {
                warn!(
                    queue = %self.opt.name,
                    message_id = %msg.id,
                    reserved_count = msg.reserved_count,
                    error = %err,
                    "message exhausted its retries"
                );
                Counters::incr(&self.counters.fails);
                if let Some(fallback) = &self.opt.fallback_handler {
                    if let Err(e) = invoke(fallback.as_ref(), &msg) {
                        warn!(queue = %self.opt.name, message_id = %msg.id, error = %e, "fallback handler failed");
                    }
                }
                delete(msg);
            }
        }
    }

    fn attempt(&self, msg: &mut Message) -> Outcome {
        let result = match msg.unmarshal_args() {
            Ok(()) => match self.require_handler() {
                Ok(handler) => invoke(handler.as_ref(), msg),
                Err(e) => Err(HandlerError::Failed(e.into())),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Outcome::Done,
            Err(e) if e.is_args_mismatch() => Outcome::Dropped(e),
            Err(e) => {
                let reserved = msg.reserved_count.max(1);
                if reserved < self.opt.retry_limit {
                    Outcome::Retry(exponential_backoff(self.opt.min_backoff, reserved), e)
                } else {
                    Outcome::Exhausted(e)
                }
            }
        }
    }
}

/// Call `handler`, turning a panic into a handler failure.
fn invoke(handler: &dyn Handler, msg: &Message) -> HandlerResult {
    panic::catch_unwind(AssertUnwindSafe(|| handler.handle_message(msg))).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(HandlerError::Panicked(reason))
    })
}

/// Sleep out the rest of [`IDLE_BACKOFF`] after a reservation that started
/// at `started` came back empty.
fn idle(started: Instant) {
    if let Some(rest) = IDLE_BACKOFF.checked_sub(started.elapsed()) {
        thread::sleep(rest);
    }
}
