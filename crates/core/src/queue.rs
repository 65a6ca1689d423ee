//! Queue capability contract.
//!
//! A backend plugs into the processor by implementing [`Queuer`]. The contract
//! is reservation based: reserved messages are leased for a timeout and become
//! visible again unless they are deleted or released first.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::args::IntoArgs;
use crate::error::QueueResult;
use crate::message::Message;

/// Attempts made by [`retry_transient`] before giving up.
pub const TRANSIENT_RETRY_ATTEMPTS: usize = 3;

/// Reservation-based message storage.
pub trait Queuer: Send + Sync {
    fn name(&self) -> &str;

    /// Accept a message for later reservation.
    ///
    /// A named message that was already accepted within the current dedup
    /// window is dropped and `Ok(())` is returned.
    fn add(&self, msg: Message) -> QueueResult<()>;

    /// Like `add`, but may return before the backend acknowledges the message.
    fn add_async(&self, msg: Message) -> QueueResult<()> {
        self.add(msg)
    }

    /// Lease up to `n` visible messages for `timeout` each.
    ///
    /// Returns an empty list when nothing is visible. A missing backend
    /// object is reported as `QueueError::QueueNotFound`.
    fn reserve_n(&self, n: usize, timeout: Duration) -> QueueResult<Vec<Message>>;

    /// End the reservation early; the message becomes visible after `delay`.
    fn release(&self, msg: &Message, delay: Duration) -> QueueResult<()>;

    /// Remove a message. Deleting a message that is already gone succeeds.
    fn delete(&self, msg: &Message) -> QueueResult<()>;

    fn delete_batch(&self, msgs: &[Message]) -> QueueResult<()>;

    /// Discard every message, visible or reserved.
    fn purge(&self) -> QueueResult<()>;

    /// Stop accepting work and wait up to `timeout` for pending work to drain.
    fn close_timeout(&self, timeout: Duration) -> QueueResult<()>;

    /// Recreate the backend object after `QueueError::QueueNotFound`.
    fn create_queue(&self) -> QueueResult<()> {
        Ok(())
    }
}

impl<Q> Queuer for Arc<Q>
where
    Q: Queuer + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn add(&self, msg: Message) -> QueueResult<()> {
        (**self).add(msg)
    }

    fn add_async(&self, msg: Message) -> QueueResult<()> {
        (**self).add_async(msg)
    }

    fn reserve_n(&self, n: usize, timeout: Duration) -> QueueResult<Vec<Message>> {
        (**self).reserve_n(n, timeout)
    }

    fn release(&self, msg: &Message, delay: Duration) -> QueueResult<()> {
        (**self).release(msg, delay)
    }

    fn delete(&self, msg: &Message) -> QueueResult<()> {
        (**self).delete(msg)
    }

    fn delete_batch(&self, msgs: &[Message]) -> QueueResult<()> {
        (**self).delete_batch(msgs)
    }

    fn purge(&self) -> QueueResult<()> {
        (**self).purge()
    }

    fn close_timeout(&self, timeout: Duration) -> QueueResult<()> {
        (**self).close_timeout(timeout)
    }

    fn create_queue(&self) -> QueueResult<()> {
        (**self).create_queue()
    }
}

/// Producer-facing helpers available on every queue.
pub trait Producer: Queuer {
    /// Enqueue a call with `args`.
    fn call(&self, args: impl IntoArgs) -> QueueResult<()> {
        self.add(Message::from_args(args)?)
    }

    fn call_async(&self, args: impl IntoArgs) -> QueueResult<()> {
        self.add_async(Message::from_args(args)?)
    }

    /// Enqueue a call with `args` at most once per `period`.
    fn call_once(&self, period: Duration, args: impl IntoArgs) -> QueueResult<()> {
        let mut msg = Message::from_args(args)?;
        msg.set_delay_name(period)?;
        self.add(msg)
    }

    fn call_once_async(&self, period: Duration, args: impl IntoArgs) -> QueueResult<()> {
        let mut msg = Message::from_args(args)?;
        msg.set_delay_name(period)?;
        self.add_async(msg)
    }
}

impl<Q: Queuer + ?Sized> Producer for Q {}

/// Run `op` until it succeeds, fails with a non-transient error, or has been
/// attempted [`TRANSIENT_RETRY_ATTEMPTS`] times.
pub fn retry_transient<T>(mut op: impl FnMut() -> QueueResult<T>) -> QueueResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < TRANSIENT_RETRY_ATTEMPTS => {
                debug!(attempt, error = %e, "retrying transient queue error");
                attempt += 1;
            }
            result => return result,
        }
    }
}
