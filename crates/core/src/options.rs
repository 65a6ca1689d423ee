//! Queue and processor options.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cache::Cache;
use crate::handler::Handler;

pub const DEFAULT_RETRY_LIMIT: u32 = 10;
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Runtime configuration shared by a queue and its processor.
#[derive(Clone)]
pub struct Options {
    /// Queue name; also scopes deduplication keys.
    pub name: String,
    /// Reservations allowed before the fallback handler takes over.
    pub retry_limit: u32,
    /// Backoff unit; the k-th retry waits `min_backoff * 2^(k-1)`.
    pub min_backoff: Duration,
    /// Lease granted by each reservation.
    pub reservation_timeout: Duration,
    /// How long a reservation call may wait for messages to become visible.
    pub wait_timeout: Duration,
    /// Capacity of local buffers.
    pub buffer_size: usize,
    /// Maximum concurrent handler executions.
    pub worker_limit: usize,
    /// Make every added message visible immediately (in-memory queues only).
    pub ignore_delay: bool,
    pub handler: Option<Arc<dyn Handler>>,
    pub fallback_handler: Option<Arc<dyn Handler>>,
    pub cache: Option<Arc<dyn Cache>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            min_backoff: DEFAULT_MIN_BACKOFF,
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            worker_limit: default_worker_limit(),
            ignore_delay: false,
            handler: None,
            fallback_handler: None,
            cache: None,
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("retry_limit", &self.retry_limit)
            .field("min_backoff", &self.min_backoff)
            .field("reservation_timeout", &self.reservation_timeout)
            .field("wait_timeout", &self.wait_timeout)
            .field("buffer_size", &self.buffer_size)
            .field("worker_limit", &self.worker_limit)
            .field("ignore_delay", &self.ignore_delay)
            .field("handler", &self.handler.is_some())
            .field("fallback_handler", &self.fallback_handler.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

fn default_worker_limit() -> usize {
    10 * thread::available_parallelism().map_or(1, |n| n.get())
}

impl Options {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_fallback_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.fallback_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_min_backoff(mut self, backoff: Duration) -> Self {
        self.min_backoff = backoff;
        self
    }

    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_worker_limit(mut self, limit: usize) -> Self {
        self.worker_limit = limit;
        self
    }

    pub fn with_ignore_delay(mut self, ignore: bool) -> Self {
        self.ignore_delay = ignore;
        self
    }

    /// Replace zero values with defaults.
    pub fn init(mut self) -> Self {
        if self.name.is_empty() {
            self.name = "default".to_string();
        }
        if self.retry_limit == 0 {
            self.retry_limit = DEFAULT_RETRY_LIMIT;
        }
        if self.min_backoff.is_zero() {
            self.min_backoff = DEFAULT_MIN_BACKOFF;
        }
        if self.reservation_timeout.is_zero() {
            self.reservation_timeout = DEFAULT_RESERVATION_TIMEOUT;
        }
        if self.wait_timeout.is_zero() {
            self.wait_timeout = DEFAULT_WAIT_TIMEOUT;
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }
        if self.worker_limit == 0 {
            self.worker_limit = default_worker_limit();
        }
        self
    }
}
