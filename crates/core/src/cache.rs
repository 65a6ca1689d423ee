//! Deduplication cache contract.

use std::sync::Arc;

/// Atomic "set if absent and report" keyed by string.
///
/// `exists` returns `false` exactly once per key and window: the first caller
/// records the key, every later caller sees `true` until the entry expires.
/// Implementations must uphold this for any number of concurrent callers
/// without caller-side locking.
pub trait Cache: Send + Sync {
    fn exists(&self, key: &str) -> bool;
}

impl<C> Cache for Arc<C>
where
    C: Cache + ?Sized,
{
    fn exists(&self, key: &str) -> bool {
        (**self).exists(key)
    }
}

/// Cache key for a named message in `queue`.
pub fn dedup_key(queue: &str, name: &str) -> String {
    format!("msgqueue:{queue}:{name}")
}
