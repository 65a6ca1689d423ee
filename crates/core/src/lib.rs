//! `msgqueue-core` — messages, options and the capability contracts every
//! queue backend and processor is built on.
//!
//! This crate has no threads and no IO; backends live in `msgqueue-infra` and
//! the processing engine in `msgqueue-processor`.

pub mod args;
pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod options;
pub mod queue;

pub use args::{FromArgs, IntoArgs};
pub use cache::{Cache, dedup_key};
pub use config::QueueConfig;
pub use error::{HandlerError, HandlerResult, QueueError, QueueResult};
pub use handler::{ArgsFn, FnHandler, Handler, IntoHandlerResult, MessageFn, handler_fn, message_handler};
pub use message::{Message, time_slot};
pub use options::Options;
pub use queue::{Producer, Queuer, TRANSIENT_RETRY_ATTEMPTS, retry_transient};
