//! [`InMemoryQueue`] paired with its own [`Processor`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::error;

use msgqueue_core::{Message, Options, QueueResult, Queuer};
use msgqueue_processor::{DEFAULT_STOP_TIMEOUT, Processor};

use crate::in_memory::InMemoryQueue;

/// Process-local queue that handles its own messages.
///
/// The processor starts on construction when a handler is configured. Without
/// one, the queue only stores messages; drive it with
/// [`Processor::process_one`] or [`Processor::process_all`].
pub struct MemQueue {
    store: Arc<InMemoryQueue>,
    processor: Processor,
}

impl std::fmt::Debug for MemQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemQueue")
            .field("store", &self.store)
            .field("processor", &self.processor)
            .finish()
    }
}

impl MemQueue {
    pub fn new(opt: Options) -> Self {
        let opt = opt.init();
        let store = Arc::new(InMemoryQueue::new(&opt));
        let processor = Processor::new(store.clone(), &opt);
        if opt.handler.is_some() {
            if let Err(e) = processor.start() {
                error!(queue = %opt.name, error = %e, "failed to start in-memory processor");
            }
        }
        Self { store, processor }
    }

    pub fn store(&self) -> &Arc<InMemoryQueue> {
        &self.store
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Messages stored, visible or reserved.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// [`Queuer::close_timeout`] with [`DEFAULT_STOP_TIMEOUT`].
    pub fn close(&self) -> QueueResult<()> {
        self.close_timeout(DEFAULT_STOP_TIMEOUT)
    }
}

impl Queuer for MemQueue {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn add(&self, msg: Message) -> QueueResult<()> {
        self.store.add(msg)
    }

    fn reserve_n(&self, n: usize, timeout: Duration) -> QueueResult<Vec<Message>> {
        self.store.reserve_n(n, timeout)
    }

    fn release(&self, msg: &Message, delay: Duration) -> QueueResult<()> {
        self.store.release(msg, delay)
    }

    fn delete(&self, msg: &Message) -> QueueResult<()> {
        self.store.delete(msg)
    }

    fn delete_batch(&self, msgs: &[Message]) -> QueueResult<()> {
        self.store.delete_batch(msgs)
    }

    fn purge(&self) -> QueueResult<()> {
        self.store.purge()
    }

    /// Reject new messages, let the processor drain what is stored (delayed
    /// and backing-off messages included), then stop it. Both steps share
    /// `timeout`; the first error wins.
    fn close_timeout(&self, timeout: Duration) -> QueueResult<()> {
        let started = Instant::now();
        let drained = if self.processor.is_running() {
            self.store.close_timeout(timeout)
        } else {
            self.store.close();
            Ok(())
        };
        let stopped = self
            .processor
            .stop_timeout(timeout.saturating_sub(started.elapsed()));
        drained.and(stopped)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use msgqueue_core::{Producer, QueueError, handler_fn};

    use super::*;

    #[test]
    fn starts_only_with_a_handler() {
        let idle = MemQueue::new(Options::new("idle"));
        assert!(!idle.processor().is_running());

        let busy = MemQueue::new(Options::new("busy").with_handler(handler_fn(|| {})));
        assert!(busy.processor().is_running());
        busy.close().unwrap();
        assert!(!busy.processor().is_running());
    }

    #[test]
    fn manual_processing_without_background_workers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let q = MemQueue::new(Options::new("manual").with_wait_timeout(Duration::from_millis(10)));
        q.call((1,)).unwrap();
        q.call((2,)).unwrap();

        let manual = {
            let calls = calls.clone();
            Processor::new(
                q.store().clone(),
                &Options::new("manual")
                    .with_wait_timeout(Duration::from_millis(10))
                    .with_handler(handler_fn(move |_n: i32| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    })),
            )
        };
        assert_eq!(manual.process_all().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(q.is_empty());

        q.close().unwrap();
        assert!(matches!(q.call(()), Err(QueueError::Closed)));
    }
}
