//! In-memory lease store.
//!
//! Messages live in a map keyed by id. A min-heap of `(visible_at, id)` slots
//! drives both delayed delivery and lease expiry: reserving a message pushes
//! a new slot at `now + timeout`, so an unacknowledged reservation simply
//! becomes due again. Every schedule bumps the entry's generation, which
//! invalidates any older slot still sitting in the heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use uuid::Uuid;

use msgqueue_core::{Cache, Message, Options, QueueError, QueueResult, Queuer, dedup_key};

use crate::cache::InMemoryCache;

/// Stand-in for "never" when a delay would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    at: Instant,
    generation: u64,
    id: String,
}

#[derive(Debug)]
struct Entry {
    msg: Message,
    generation: u64,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    schedule: BinaryHeap<Reverse<Slot>>,
    generation: u64,
    closed: bool,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn insert(&mut self, msg: Message, at: Instant) {
        let generation = self.next_generation();
        self.schedule.push(Reverse(Slot {
            at,
            generation,
            id: msg.id.clone(),
        }));
        self.entries.insert(msg.id.clone(), Entry { msg, generation });
    }

    /// Lease up to `n` due messages until `now + timeout`.
    fn take_due(&mut self, n: usize, now: Instant, timeout: Duration) -> Vec<Message> {
        let mut out = Vec::new();
        while out.len() < n {
            match self.schedule.peek() {
                Some(Reverse(slot)) if slot.at <= now => {}
                _ => break,
            }
            let Some(Reverse(slot)) = self.schedule.pop() else {
                break;
            };
            let Some(entry) = self.entries.get_mut(&slot.id) else {
                continue;
            };
            if entry.generation != slot.generation {
                continue;
            }
            if entry.msg.is_reserved() {
                debug!(message_id = %slot.id, "reservation expired, redelivering");
            }

            self.generation += 1;
            entry.generation = self.generation;
            entry.msg.reserved_count += 1;
            entry.msg.reservation_id = Uuid::now_v7().to_string();
            self.schedule.push(Reverse(Slot {
                at: after(now, timeout),
                generation: entry.generation,
                id: slot.id,
            }));
            out.push(entry.msg.clone());
        }
        out
    }

    fn next_due(&self) -> Option<Instant> {
        self.schedule.peek().map(|Reverse(slot)| slot.at)
    }

    fn release(&mut self, msg: &Message, at: Instant) -> QueueResult<()> {
        let generation = self.next_generation();
        let Some(entry) = self.entries.get_mut(&msg.id) else {
            return Err(QueueError::MessageNotFound(msg.id.clone()));
        };
        if !entry.msg.is_reserved() || entry.msg.reservation_id != msg.reservation_id {
            return Err(QueueError::ReservationExpired(msg.id.clone()));
        }
        entry.generation = generation;
        entry.msg.reservation_id.clear();
        self.schedule.push(Reverse(Slot {
            at,
            generation,
            id: msg.id.clone(),
        }));
        Ok(())
    }

    /// Remove `msg` unless it has been re-leased under another reservation.
    /// An empty reservation id deletes by id alone.
    fn remove(&mut self, msg: &Message) -> bool {
        let current = match self.entries.get(&msg.id) {
            Some(entry) => &entry.msg.reservation_id,
            None => return false,
        };
        if !msg.reservation_id.is_empty() && *current != msg.reservation_id {
            debug!(message_id = %msg.id, "stale reservation, keeping message");
            return false;
        }
        self.entries.remove(&msg.id);
        true
    }

    /// Drop slots no entry refers to any more once they clearly outnumber
    /// the live ones. Acknowledged leases would otherwise sit in the heap
    /// until their expiry comes due.
    fn compact(&mut self, capacity: usize) {
        if self.schedule.len() <= 2 * self.entries.len() + capacity {
            return;
        }
        let entries = &self.entries;
        self.schedule
            .retain(|Reverse(slot)| entries.get(&slot.id).is_some_and(|e| e.generation == slot.generation));
    }

    fn is_drained(&self) -> bool {
        self.closed && self.entries.is_empty()
    }
}

fn after(now: Instant, d: Duration) -> Instant {
    now.checked_add(d).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Bounded, process-local [`Queuer`] with visibility timeouts.
///
/// `add` blocks while `buffer_size` messages are stored. Named messages are
/// deduplicated through the configured [`Cache`]; without one, each queue
/// gets its own [`InMemoryCache`].
pub struct InMemoryQueue {
    name: String,
    capacity: usize,
    wait_timeout: Duration,
    ignore_delay: bool,
    cache: Arc<dyn Cache>,
    state: Mutex<State>,
    /// Signalled when a message may have become reservable, or on close.
    available: Condvar,
    /// Signalled when messages are removed, or on close.
    space: Condvar,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl InMemoryQueue {
    pub fn new(opt: &Options) -> Self {
        let opt = opt.clone().init();
        let cache = opt
            .cache
            .clone()
            .unwrap_or_else(|| Arc::new(InMemoryCache::default()));
        Self {
            name: opt.name,
            capacity: opt.buffer_size,
            wait_timeout: opt.wait_timeout,
            ignore_delay: opt.ignore_delay,
            cache,
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            space: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored messages, visible or reserved.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Reject further adds and wake every waiter. Stored messages can still
    /// be reserved and deleted.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
        self.space.notify_all();
        debug!(queue = %self.name, "queue closed");
    }

    /// Block until every stored message has been deleted.
    pub fn wait_drained(&self, timeout: Duration) -> QueueResult<()> {
        let (state, result) = self
            .space
            .wait_timeout_while(self.lock(), timeout, |s| !s.entries.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() && !state.entries.is_empty() {
            return Err(QueueError::Timeout(timeout));
        }
        Ok(())
    }
}

impl Queuer for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn add(&self, mut msg: Message) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if msg.body.is_empty() && !msg.args.is_empty() {
            msg.marshal_args()?;
        }
        if msg.id.is_empty() {
            msg.id = Uuid::now_v7().to_string();
        }
        msg.reservation_id.clear();

        let state = self.lock();
        let mut state = self
            .space
            .wait_while(state, |s| !s.closed && s.entries.len() >= self.capacity)
            .unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(QueueError::Closed);
        }
        // Recorded only once the message is certain to be stored, so a
        // rejected add can be retried under the same name.
        if let Some(name) = &msg.name {
            if self.cache.exists(&dedup_key(&self.name, name)) {
                debug!(queue = %self.name, name = %name, "duplicate message, skipping");
                return Ok(());
            }
        }

        let now = Instant::now();
        let at = if self.ignore_delay { now } else { after(now, msg.delay) };
        trace!(queue = %self.name, message_id = %msg.id, delay_ms = msg.delay.as_millis() as u64, "message added");
        state.insert(msg, at);
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    fn reserve_n(&self, n: usize, timeout: Duration) -> QueueResult<Vec<Message>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let deadline = after(Instant::now(), self.wait_timeout);
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            let msgs = state.take_due(n, now, timeout);
            if !msgs.is_empty() {
                return Ok(msgs);
            }
            if state.is_drained() || now >= deadline {
                return Ok(msgs);
            }
            let wake = state.next_due().map_or(deadline, |at| at.min(deadline));
            state = self
                .available
                .wait_timeout(state, wake.saturating_duration_since(now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, msg: &Message, delay: Duration) -> QueueResult<()> {
        let mut state = self.lock();
        state.release(msg, after(Instant::now(), delay))?;
        state.compact(self.capacity);
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    fn delete(&self, msg: &Message) -> QueueResult<()> {
        self.delete_batch(std::slice::from_ref(msg))
    }

    fn delete_batch(&self, msgs: &[Message]) -> QueueResult<()> {
        let mut state = self.lock();
        let mut removed = false;
        for msg in msgs {
            removed |= state.remove(msg);
        }
        if !removed {
            return Ok(());
        }
        state.compact(self.capacity);
        let drained = state.is_drained();
        drop(state);
        self.space.notify_all();
        if drained {
            // Pollers waiting on a closed queue can stop now.
            self.available.notify_all();
        }
        Ok(())
    }

    fn purge(&self) -> QueueResult<()> {
        let mut state = self.lock();
        state.entries.clear();
        state.schedule.clear();
        drop(state);
        self.space.notify_all();
        self.available.notify_all();
        Ok(())
    }

    /// Close the queue and wait for stored messages to be deleted. Only
    /// meaningful while something is consuming the queue.
    fn close_timeout(&self, timeout: Duration) -> QueueResult<()> {
        self.close();
        self.wait_drained(timeout)
    }
}
