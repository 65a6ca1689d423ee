//! [`Cache`](msgqueue_core::Cache) backends used for message deduplication.

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

pub use in_memory::{DEFAULT_CACHE_TTL, InMemoryCache};
#[cfg(feature = "redis")]
pub use self::redis::{RedisCache, RedisCacheError};
