//! Remote queue fronted by a local staging buffer.
//!
//! `add_async` lands in an in-memory staging queue whose handler forwards
//! each message to the remote backend. Forwarding retries a few times; a
//! message that still cannot be delivered is handled locally by the user's
//! handler instead of being lost. Messages on the remote are consumed by a
//! regular [`Processor`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use msgqueue_core::{
    Cache, Message, Options, QueueError, QueueResult, Queuer, dedup_key, message_handler,
};
use msgqueue_processor::{DEFAULT_STOP_TIMEOUT, Processor};

use crate::cache::InMemoryCache;
use crate::memqueue::MemQueue;
use crate::resilient::Resilient;

/// Forward attempts before a staged message is handled locally.
pub const STAGING_RETRY_LIMIT: u32 = 3;

/// Backoff unit between forward attempts.
pub const STAGING_MIN_BACKOFF: Duration = Duration::from_secs(1);

pub struct StagedQueue<Q: Queuer + 'static> {
    remote: Arc<Resilient<Q>>,
    staging: MemQueue,
    processor: Processor,
    cache: Arc<dyn Cache>,
}

impl<Q: Queuer + 'static> std::fmt::Debug for StagedQueue<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedQueue")
            .field("name", &self.remote.name())
            .field("staging", &self.staging)
            .field("processor", &self.processor)
            .finish()
    }
}

/// Copy of `msg` suitable for the remote: no local identity, and no name
/// since dedup already happened on this side.
fn forwardable(msg: &Message) -> Message {
    let mut msg = msg.detached();
    msg.name = None;
    msg
}

impl<Q: Queuer + 'static> StagedQueue<Q> {
    /// Front `remote` with a staging buffer. An empty `opt.name` takes the
    /// remote's name. The remote processor starts when a handler is set.
    pub fn new(remote: Q, mut opt: Options) -> Self {
        if opt.name.is_empty() {
            opt.name = remote.name().to_string();
        }
        let opt = opt.init();
        let remote = Arc::new(Resilient::new(remote));
        let cache = opt
            .cache
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryCache::default()));

        let forward = remote.clone();
        let mut staging_opt = Options::new(opt.name.clone())
            .with_retry_limit(STAGING_RETRY_LIMIT)
            .with_min_backoff(STAGING_MIN_BACKOFF)
            .with_ignore_delay(true)
            .with_buffer_size(opt.buffer_size)
            .with_worker_limit(opt.worker_limit)
            .with_cache(cache.clone())
            .with_handler(message_handler(move |msg: &Message| forward.add(forwardable(msg))));
        staging_opt.fallback_handler = opt.handler.clone();
        let staging = MemQueue::new(staging_opt);

        let processor = Processor::new(remote.clone(), &opt);
        if opt.handler.is_some() {
            if let Err(e) = processor.start() {
                error!(queue = %opt.name, error = %e, "failed to start remote processor");
            }
        }

        Self {
            remote,
            staging,
            processor,
            cache,
        }
    }

    /// The wrapped backend.
    pub fn remote(&self) -> &Q {
        self.remote.inner()
    }

    pub fn staging(&self) -> &MemQueue {
        &self.staging
    }

    /// Consumes the remote queue.
    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// [`Queuer::close_timeout`] with [`DEFAULT_STOP_TIMEOUT`].
    pub fn close(&self) -> QueueResult<()> {
        self.close_timeout(DEFAULT_STOP_TIMEOUT)
    }
}

impl<Q: Queuer + 'static> Queuer for StagedQueue<Q> {
    fn name(&self) -> &str {
        self.remote.name()
    }

    /// Send straight to the remote after the dedup check. A message the
    /// remote refuses is staged instead, so its name is never claimed by a
    /// message that went nowhere.
    fn add(&self, msg: Message) -> QueueResult<()> {
        if self.staging.store().is_closed() {
            return Err(QueueError::Closed);
        }
        if let Some(name) = &msg.name {
            if self.cache.exists(&dedup_key(self.name(), name)) {
                debug!(queue = %self.name(), name = %name, "duplicate message, skipping");
                return Ok(());
            }
        }
        let msg = forwardable(&msg);
        match self.remote.add(msg.clone()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(queue = %self.name(), error = %e, "remote add failed, staging message");
                self.staging.add(msg)
            }
        }
    }

    /// Stage the message locally; it reaches the remote in the background.
    fn add_async(&self, msg: Message) -> QueueResult<()> {
        self.staging.add(msg)
    }

    fn reserve_n(&self, n: usize, timeout: Duration) -> QueueResult<Vec<Message>> {
        self.remote.reserve_n(n, timeout)
    }

    fn release(&self, msg: &Message, delay: Duration) -> QueueResult<()> {
        self.remote.release(msg, delay)
    }

    fn delete(&self, msg: &Message) -> QueueResult<()> {
        self.remote.delete(msg)
    }

    fn delete_batch(&self, msgs: &[Message]) -> QueueResult<()> {
        self.remote.delete_batch(msgs)
    }

    /// Discard staged messages and everything on the remote.
    fn purge(&self) -> QueueResult<()> {
        let staged = self.staging.purge();
        let remote = self.remote.purge();
        staged.and(remote)
    }

    /// Flush the staging buffer to the remote, then stop the remote
    /// processor. Both steps share `timeout`; the first error wins.
    fn close_timeout(&self, timeout: Duration) -> QueueResult<()> {
        let started = Instant::now();
        let flushed = self.staging.close_timeout(timeout);
        let stopped = self
            .processor
            .stop_timeout(timeout.saturating_sub(started.elapsed()));
        flushed.and(stopped)
    }

    fn create_queue(&self) -> QueueResult<()> {
        self.remote.create_queue()
    }
}
