//! Redis-backed dedup cache, shared by every process pointing at the same
//! server.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use msgqueue_core::Cache;

use super::DEFAULT_CACHE_TTL;

#[derive(Debug, thiserror::Error)]
pub enum RedisCacheError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),
}

/// [`Cache`] built on `SET key "" NX PX ttl`.
///
/// Fails open: when Redis cannot be reached the key is reported absent, so a
/// named message may be accepted twice rather than lost.
#[derive(Debug, Clone)]
pub struct RedisCache {
    client: Arc<redis::Client>,
    ttl: Duration,
}

impl RedisCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisCacheError> {
        Self::with_ttl(redis_url, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(redis_url: impl AsRef<str>, ttl: Duration) -> Result<Self, RedisCacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisCacheError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            ttl,
        })
    }

    /// Record `key`; `Ok(true)` when this call created it.
    fn set_if_absent(&self, key: &str) -> Result<bool, RedisCacheError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisCacheError::Connection(e.to_string()))?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("")
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis().max(1) as u64)
            .query(&mut conn)
            .map_err(|e| RedisCacheError::Command(format!("SET NX failed: {}", e)))?;
        Ok(reply.is_some())
    }
}

impl Cache for RedisCache {
    fn exists(&self, key: &str) -> bool {
        match self.set_if_absent(key) {
            Ok(created) => !created,
            Err(e) => {
                warn!(key = %key, error = %e, "dedup cache unavailable, accepting message");
                false
            }
        }
    }
}
