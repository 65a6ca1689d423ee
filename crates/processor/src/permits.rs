//! Counting gate bounding reserved-but-unfinished messages.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct Permits {
    available: Mutex<usize>,
    cond: Condvar,
}

impl Permits {
    pub fn new(n: usize) -> Self {
        Self {
            available: Mutex::new(n),
            cond: Condvar::new(),
        }
    }

    /// Take between 1 and `max` permits, waiting up to `timeout` for one to
    /// free up. Returns 0 on timeout.
    pub fn acquire_up_to(&self, max: usize, timeout: Duration) -> usize {
        let guard = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut available, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |n| *n == 0)
            .unwrap_or_else(PoisonError::into_inner);
        let taken = (*available).min(max);
        *available -= taken;
        taken
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        *self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut available = self.available.lock().unwrap_or_else(PoisonError::into_inner);
        *available += n;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_at_most_what_is_available() {
        let permits = Permits::new(3);
        assert_eq!(permits.acquire_up_to(100, Duration::ZERO), 3);
        assert_eq!(permits.acquire_up_to(100, Duration::from_millis(5)), 0);

        permits.release(2);
        assert_eq!(permits.acquire_up_to(1, Duration::ZERO), 1);
        assert_eq!(permits.acquire_up_to(5, Duration::ZERO), 1);
    }
}
