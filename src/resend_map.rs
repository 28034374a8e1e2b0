//! Tracking of reliable messages pending acknowledgement.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::binary::Uint24;
use crate::packet::Packet;

/// Time window for RTT calculation.
const RTT_CALCULATION_WINDOW: Duration = Duration::from_secs(5);

/// RTT assumed before any acknowledgement has been observed.
const DEFAULT_RTT: Duration = Duration::from_millis(50);

/// A reliable message owned by the reliability layer until acknowledged or
/// given up.
#[derive(Debug)]
pub struct ResendRecord {
    pub packet: Packet,
    /// When this sequence number was last put on the wire.
    pub sent_at: Instant,
    /// Number of retransmissions so far. The backoff deadline doubles with
    /// each retry.
    pub retries: u32,
}

impl ResendRecord {
    /// The retransmission deadline for this record: base RTO doubled per
    /// retry already performed.
    pub fn deadline(&self, base_rto: Duration) -> Duration {
        base_rto.saturating_mul(1u32 << self.retries.min(16))
    }

    /// Whether the record is due for retransmission at `now`.
    pub fn is_due(&self, now: Instant, base_rto: Duration) -> bool {
        now.duration_since(self.sent_at) > self.deadline(base_rto)
    }
}

/// A map of unacknowledged reliable messages keyed by datagram sequence
/// number.
#[derive(Debug, Default)]
pub struct ResendMap {
    unacknowledged: HashMap<u32, ResendRecord>,
    delays: HashMap<Instant, Duration>,
}

impl ResendMap {
    /// Creates a new resend map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly sent packet for acknowledgement tracking.
    pub fn add(&mut self, index: Uint24, packet: Packet) {
        self.add_with_retries(index, packet, 0);
    }

    /// Re-registers a retransmitted packet under its new sequence number,
    /// carrying the retry count forward.
    pub fn add_with_retries(&mut self, index: Uint24, packet: Packet, retries: u32) {
        self.unacknowledged.insert(
            index.value(),
            ResendRecord {
                packet,
                sent_at: Instant::now(),
                retries,
            },
        );
    }

    /// Marks a sequence number as acknowledged and returns the message if it
    /// was still pending. A duplicate or stale acknowledgement returns None
    /// and is not an error.
    pub fn acknowledge(&mut self, index: Uint24) -> Option<Packet> {
        self.remove(index, 1).map(|r| r.packet)
    }

    /// Takes a pending message out for retransmission. Returns the record so
    /// the caller can carry the retry count to the new sequence number.
    pub fn retransmit(&mut self, index: Uint24) -> Option<ResendRecord> {
        self.remove(index, 2)
    }

    /// Sequence numbers that are past their backoff deadline at `now`.
    pub fn due(&self, now: Instant, base_rto: Duration) -> Vec<Uint24> {
        self.unacknowledged
            .iter()
            .filter(|(_, record)| record.is_due(now, base_rto))
            .map(|(&seq, _)| Uint24::new(seq))
            .collect()
    }

    /// Number of messages still awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.unacknowledged.len()
    }

    /// Drops every pending message. Used when a connection closes.
    pub fn clear(&mut self) {
        self.unacknowledged.clear();
    }

    /// Removes a record and folds its observed delay into the RTT estimate.
    fn remove(&mut self, index: Uint24, mul: u32) -> Option<ResendRecord> {
        let record = self.unacknowledged.remove(&index.value())?;

        let now = Instant::now();
        let delay = now.duration_since(record.sent_at) * mul;
        self.delays.insert(now, delay);

        Some(record)
    }

    /// Average round-trip time over recently acknowledged messages.
    pub fn rtt(&mut self, now: Instant) -> Duration {
        self.delays
            .retain(|t, _| now.duration_since(*t) <= RTT_CALCULATION_WINDOW);

        if self.delays.is_empty() {
            return DEFAULT_RTT;
        }

        let total: Duration = self.delays.values().sum();
        total / self.delays.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_acknowledge() {
        let mut map = ResendMap::new();

        map.add(Uint24::new(0), Packet::new());
        assert_eq!(map.pending(), 1);

        let ack = map.acknowledge(Uint24::new(0));
        assert!(ack.is_some());
        assert_eq!(map.pending(), 0);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let mut map = ResendMap::new();
        map.add(Uint24::new(3), Packet::new());
        map.acknowledge(Uint24::new(3));

        // Second acknowledgement of the same sequence is a no-op.
        assert!(map.acknowledge(Uint24::new(3)).is_none());
        // An acknowledgement for something never sent is also a no-op.
        assert!(map.acknowledge(Uint24::new(99)).is_none());
    }

    #[test]
    fn test_acked_message_not_due() {
        let mut map = ResendMap::new();
        map.add(Uint24::new(1), Packet::new());
        map.acknowledge(Uint24::new(1));

        // Even with a zero RTO nothing is eligible for retransmission.
        assert!(map.due(Instant::now(), Duration::ZERO).is_empty());
    }

    #[test]
    fn test_backoff_doubles_per_retry() {
        let base = Duration::from_millis(100);
        let record = ResendRecord {
            packet: Packet::new(),
            sent_at: Instant::now(),
            retries: 3,
        };
        assert_eq!(record.deadline(base), Duration::from_millis(800));
    }

    #[test]
    fn test_retransmit_carries_retry_count() {
        let mut map = ResendMap::new();
        map.add(Uint24::new(0), Packet::new());

        let record = map.retransmit(Uint24::new(0)).unwrap();
        map.add_with_retries(Uint24::new(1), record.packet, record.retries + 1);

        let record = map.retransmit(Uint24::new(1)).unwrap();
        assert_eq!(record.retries, 1);
    }

    #[test]
    fn test_rtt_default() {
        let mut map = ResendMap::new();
        let rtt = map.rtt(Instant::now());
        assert_eq!(rtt, Duration::from_millis(50));
    }
}
