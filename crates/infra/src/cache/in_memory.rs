use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use msgqueue_core::Cache;

/// How long a key is remembered unless configured otherwise.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Expired keys are swept after this many insertions.
const PRUNE_EVERY: usize = 1024;

#[derive(Debug, Default)]
struct Keys {
    expires: HashMap<String, Instant>,
    inserts: usize,
}

/// Process-local dedup cache with a fixed time-to-live per key.
#[derive(Debug)]
pub struct InMemoryCache {
    ttl: Duration,
    keys: Mutex<Keys>,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl InMemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            keys: Mutex::new(Keys::default()),
        }
    }

    /// Keys currently remembered, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expires
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for InMemoryCache {
    fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if keys.expires.get(key).is_some_and(|at| *at > now) {
            return true;
        }

        let expires_at = now.checked_add(self.ttl).unwrap_or(now);
        keys.expires.insert(key.to_owned(), expires_at);
        keys.inserts += 1;
        if keys.inserts % PRUNE_EVERY == 0 {
            keys.expires.retain(|_, at| *at > now);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    #[test]
    fn first_caller_sees_absent() {
        let cache = InMemoryCache::default();
        assert!(!cache.exists("a"));
        assert!(cache.exists("a"));
        assert!(cache.exists("a"));
        assert!(!cache.exists("b"));
    }

    #[test]
    fn keys_expire_after_ttl() {
        let cache = InMemoryCache::new(Duration::from_millis(30));
        assert!(!cache.exists("k"));
        assert!(cache.exists("k"));
        thread::sleep(Duration::from_millis(50));
        assert!(!cache.exists("k"));
    }

    #[test]
    fn exactly_one_concurrent_caller_wins() {
        let cache = Arc::new(InMemoryCache::default());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                let winners = winners.clone();
                thread::spawn(move || {
                    if !cache.exists("race") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_keys_are_pruned() {
        let cache = InMemoryCache::new(Duration::ZERO);
        for i in 0..PRUNE_EVERY {
            cache.exists(&i.to_string());
        }
        assert!(cache.len() < PRUNE_EVERY);
    }
}
