//! Logical clock and timer queue.
//!
//! The protocol core never reads a wall clock. Time only moves when the
//! owner calls [`Scheduler::pop_due`] with a target instant, which lets tests
//! fast-forward deterministically and lets the tokio runtime map real time
//! onto the same queue.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Timers used by the client. At most one instance of each is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Watchdog for the CONNECT/CONNACK handshake.
    ConnectTimeout,
    /// Periodic PINGREQ.
    KeepAlive,
    /// Single-shot reconnect attempt.
    Reconnect,
    /// Periodic scan for unacknowledged publishes to retransmit.
    Resend,
}

type Slot = (Duration, u64);

/// Timer queue keyed by logical deadline.
#[derive(Debug, Default)]
pub struct Scheduler {
    now: Duration,
    seq: u64,
    queue: BTreeMap<Slot, Timer>,
    armed: HashMap<Timer, Slot>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical time (elapsed since the scheduler was created).
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Arm `timer` to fire `after` from now, replacing any pending instance.
    pub fn arm(&mut self, timer: Timer, after: Duration) {
        self.cancel(timer);

        let slot = (self.now + after, self.seq);
        self.seq += 1;
        self.queue.insert(slot, timer);
        self.armed.insert(timer, slot);
    }

    /// Returns true if the timer was armed.
    pub fn cancel(&mut self, timer: Timer) -> bool {
        match self.armed.remove(&timer) {
            Some(slot) => {
                self.queue.remove(&slot);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        self.queue.clear();
        self.armed.clear();
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.armed.contains_key(&timer)
    }

    #[cfg(test)]
    pub fn deadline(&self, timer: Timer) -> Option<Duration> {
        self.armed.get(&timer).map(|(at, _)| *at)
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest timer due at or before `target`.
    ///
    /// The clock moves to that timer's deadline so anything armed while
    /// handling it is scheduled relative to when it fired. Returns `None`
    /// (and moves the clock to `target`) once nothing else is due.
    pub fn pop_due(&mut self, target: Duration) -> Option<Timer> {
        let slot = match self.queue.keys().next() {
            Some(slot) if slot.0 <= target => *slot,
            _ => {
                self.now = self.now.max(target);
                return None;
            }
        };

        let timer = self.queue.remove(&slot)?;
        self.armed.remove(&timer);
        self.now = self.now.max(slot.0);
        Some(timer)
    }
}
