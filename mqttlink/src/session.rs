//! Session bookkeeping: subscriptions, unacknowledged publishes and packet
//! identifiers.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{Message, QoS};

/// Monotonic 16-bit packet identifier counter.
///
/// Never yields 0; wraps from 65535 back to 1.
#[derive(Debug, Clone, Default)]
pub struct PacketIdAllocator {
    last: u16,
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> u16 {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        self.last
    }
}

/// A QoS 1 publish waiting for its PUBACK.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub message: Message,
    /// Logical time of the last transmission.
    pub sent_at: Duration,
    /// Retransmissions so far.
    pub resends: u32,
}

/// Client-side session state.
#[derive(Debug, Default)]
pub struct Session {
    subscriptions: BTreeMap<String, QoS>,
    pending: BTreeMap<u16, PendingPublish>,
    ids: PacketIdAllocator,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. The latest QoS for a filter wins.
    pub fn add_subscription(&mut self, filter: &str, qos: QoS) {
        self.subscriptions.insert(filter.to_string(), qos);
    }

    pub fn remove_subscription(&mut self, filter: &str) -> Option<QoS> {
        self.subscriptions.remove(filter)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = (&str, QoS)> {
        self.subscriptions.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Allocate a packet identifier not held by an unacknowledged publish.
    pub fn next_packet_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let id = self.ids.next_id();
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(Error::PacketIdsExhausted)
    }

    pub fn insert_pending(&mut self, pkid: u16, message: Message, sent_at: Duration) {
        self.pending.insert(
            pkid,
            PendingPublish {
                message,
                sent_at,
                resends: 0,
            },
        );
    }

    pub fn ack_pending(&mut self, pkid: u16) -> Option<PendingPublish> {
        self.pending.remove(&pkid)
    }

    pub fn pending(&self) -> &BTreeMap<u16, PendingPublish> {
        &self.pending
    }

    /// Entries whose last transmission is at least `timeout` old.
    pub fn pending_older_than(&self, now: Duration, timeout: Duration) -> Vec<u16> {
        self.pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn mark_resent(&mut self, pkid: u16, now: Duration) -> Option<&PendingPublish> {
        let entry = self.pending.get_mut(&pkid)?;
        entry.sent_at = now;
        entry.resends += 1;
        Some(entry)
    }

    /// Drop all unacknowledged publishes without completing them.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
