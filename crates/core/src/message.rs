//! The unit of work carried through a queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::args::IntoArgs;
use crate::error::HandlerError;

/// A function call serialized as a message.
///
/// `id` is assigned by the backend when it accepts the message. The
/// reservation fields are owned by the backend and refreshed on every
/// successful reserve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Backend-assigned identity; empty until accepted.
    pub id: String,
    /// Optional deduplication key.
    pub name: Option<String>,
    /// Time before the message first becomes eligible for reservation.
    pub delay: Duration,
    /// Positional handler arguments.
    pub args: Vec<Value>,
    /// Serialized `args` (a JSON array).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    /// Current reservation lease; empty while unreserved.
    pub reservation_id: String,
    /// How many times the message has been reserved.
    pub reserved_count: u32,
}

impl Message {
    /// Create a message from an already-encoded argument list.
    pub fn new(args: Vec<Value>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Create a message from producer values.
    pub fn from_args(args: impl IntoArgs) -> Result<Self, serde_json::Error> {
        Ok(Self::new(args.into_args()?))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn is_reserved(&self) -> bool {
        !self.reservation_id.is_empty()
    }

    /// Name the message after its arguments and the current time slot of
    /// `period`, and delay it by `period`.
    ///
    /// Every call with equal arguments inside one slot yields the same name,
    /// so the queue accepts only the first of them.
    pub fn set_delay_name(&mut self, period: Duration) -> Result<(), serde_json::Error> {
        self.set_delay_name_at(Utc::now(), period)
    }

    pub(crate) fn set_delay_name_at(
        &mut self,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Result<(), serde_json::Error> {
        let slot = time_slot(now, period);
        let encoded = serde_json::to_vec(&(slot, &self.args))?;
        self.name = Some(hex::encode(Sha256::digest(&encoded)));
        self.delay = period;
        Ok(())
    }

    /// Encode `args` into `body`.
    pub fn marshal_args(&mut self) -> Result<(), serde_json::Error> {
        self.body = serde_json::to_vec(&self.args)?;
        Ok(())
    }

    /// Decode `body` into `args` unless the arguments are already present.
    pub fn unmarshal_args(&mut self) -> Result<(), HandlerError> {
        if !self.args.is_empty() || self.body.is_empty() {
            return Ok(());
        }
        self.args = serde_json::from_slice(&self.body).map_err(HandlerError::Body)?;
        Ok(())
    }

    /// Copy of the message stripped of backend state, ready to be added to
    /// another queue.
    pub fn detached(&self) -> Self {
        Self {
            id: String::new(),
            name: self.name.clone(),
            delay: self.delay,
            args: self.args.clone(),
            body: self.body.clone(),
            reservation_id: String::new(),
            reserved_count: 0,
        }
    }
}

/// Split time into equal periods and return the index of the one containing
/// `now`. Sub-second periods fall back to whole seconds.
pub fn time_slot(now: DateTime<Utc>, period: Duration) -> i64 {
    let secs = now.timestamp();
    let period_secs = period.as_secs() as i64;
    if period_secs == 0 {
        return secs;
    }
    secs / period_secs
}
