//! Processor counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of a processor's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Handlers currently running.
    pub in_flight: u64,
    /// Reserved messages waiting in the local buffer.
    pub buffered: u64,
    /// Messages waiting for the deleter.
    pub deleting: u64,
    /// Messages completed (handled or dropped as malformed).
    pub processed: u64,
    /// Messages released for another attempt.
    pub retries: u64,
    /// Messages that exhausted their retries.
    pub fails: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub in_flight: AtomicU64,
    pub buffered: AtomicU64,
    pub deleting: AtomicU64,
    pub processed: AtomicU64,
    pub retries: AtomicU64,
    pub fails: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            deleting: self.deleting.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
        }
    }
}
