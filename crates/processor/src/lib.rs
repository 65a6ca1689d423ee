//! `msgqueue-processor` — the engine that reserves, dispatches, retries and
//! acknowledges messages against any [`msgqueue_core::Queuer`].

pub mod backoff;
mod permits;
pub mod processor;
pub mod stats;

pub use backoff::exponential_backoff;
pub use processor::{DEFAULT_STOP_TIMEOUT, DELETE_BATCH_SIZE, MAX_RESERVE_BATCH, Processor};
pub use stats::ProcessorStats;
