//! Queue backends: the in-memory lease store, the self-processing
//! [`MemQueue`], dedup caches, and wrappers for remote queues.

pub mod cache;
pub mod in_memory;
pub mod memqueue;
pub mod resilient;
pub mod staged;

pub use cache::{DEFAULT_CACHE_TTL, InMemoryCache};
#[cfg(feature = "redis")]
pub use cache::{RedisCache, RedisCacheError};
pub use in_memory::InMemoryQueue;
pub use memqueue::MemQueue;
pub use resilient::Resilient;
pub use staged::{STAGING_MIN_BACKOFF, STAGING_RETRY_LIMIT, StagedQueue};
