//! Acknowledgement hardening for remote queues.

use std::time::Duration;

use msgqueue_core::{Message, QueueResult, Queuer, retry_transient};

/// Wraps a remote [`Queuer`] so acknowledgements survive flaky backends.
///
/// `release`, `delete` and `delete_batch` are retried on transient errors,
/// and deleting a message the backend no longer knows counts as success.
#[derive(Debug)]
pub struct Resilient<Q> {
    inner: Q,
}

impl<Q: Queuer> Resilient<Q> {
    pub fn new(inner: Q) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    pub fn into_inner(self) -> Q {
        self.inner
    }
}

fn gone_is_ok(result: QueueResult<()>) -> QueueResult<()> {
    match result {
        Err(e) if e.is_message_not_found() => Ok(()),
        other => other,
    }
}

impl<Q: Queuer> Queuer for Resilient<Q> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn add(&self, msg: Message) -> QueueResult<()> {
        self.inner.add(msg)
    }

    fn add_async(&self, msg: Message) -> QueueResult<()> {
        self.inner.add_async(msg)
    }

    fn reserve_n(&self, n: usize, timeout: Duration) -> QueueResult<Vec<Message>> {
        self.inner.reserve_n(n, timeout)
    }

    fn release(&self, msg: &Message, delay: Duration) -> QueueResult<()> {
        retry_transient(|| self.inner.release(msg, delay))
    }

    fn delete(&self, msg: &Message) -> QueueResult<()> {
        gone_is_ok(retry_transient(|| self.inner.delete(msg)))
    }

    fn delete_batch(&self, msgs: &[Message]) -> QueueResult<()> {
        gone_is_ok(retry_transient(|| self.inner.delete_batch(msgs)))
    }

    fn purge(&self) -> QueueResult<()> {
        self.inner.purge()
    }

    fn close_timeout(&self, timeout: Duration) -> QueueResult<()> {
        self.inner.close_timeout(timeout)
    }

    fn create_queue(&self) -> QueueResult<()> {
        self.inner.create_queue()
    }
}
