//! File-backed tunables for [`Options`].

use std::time::Duration;

use serde::Deserialize;

use crate::error::{QueueError, QueueResult};
use crate::options::Options;

/// Serializable mirror of the numeric [`Options`], deserializable from TOML.
/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub retry_limit: u32,
    pub min_backoff_ms: u64,
    pub reservation_timeout_ms: u64,
    pub wait_timeout_ms: u64,
    pub buffer_size: usize,
    /// Zero means "derive from available parallelism".
    pub worker_limit: usize,
    pub ignore_delay: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let opt = Options::default();
        Self {
            name: opt.name,
            retry_limit: opt.retry_limit,
            min_backoff_ms: opt.min_backoff.as_millis() as u64,
            reservation_timeout_ms: opt.reservation_timeout.as_millis() as u64,
            wait_timeout_ms: opt.wait_timeout.as_millis() as u64,
            buffer_size: opt.buffer_size,
            worker_limit: 0,
            ignore_delay: opt.ignore_delay,
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(s: &str) -> QueueResult<Self> {
        toml::from_str(s).map_err(|e| QueueError::Config(e.to_string()))
    }

    /// Copy these tunables onto `opt`, keeping its handlers and cache.
    pub fn apply(&self, opt: Options) -> Options {
        Options {
            name: self.name.clone(),
            retry_limit: self.retry_limit,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            reservation_timeout: Duration::from_millis(self.reservation_timeout_ms),
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            buffer_size: self.buffer_size,
            worker_limit: self.worker_limit,
            ignore_delay: self.ignore_delay,
            ..opt
        }
        .init()
    }
}
