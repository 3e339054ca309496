use crate::packet::write_nack_packet;
use crate::sequence_buffer::{sequence_less_than, SequenceBuffer};
use log::*;
use std::collections::{HashSet, VecDeque};
use std::num::Wrapping;

/// A previously transmitted raw packet, retained until acknowledged by a
/// later NACK cycle's silence or evicted by the ring.
#[derive(Debug, Clone)]
pub struct RetainedPacket {
    pub bytes: Vec<u8>,
    pub sent_at_usecs: u64,
}

/// Sender side of loss recovery: retains recently sent packets and replays
/// them when the peer reports their sequence numbers missing.
///
/// Fire-and-forget at the wire level: a retransmit is not itself tracked, and
/// a retransmit that is lost is healed by the peer's next NACK cycle.
pub struct RetransmitQueue {
    sent_history: SequenceBuffer<RetainedPacket>,
    /// Sequence numbers the peer has NACKed, not yet replayed.
    nacked: VecDeque<u16>,
    queued: HashSet<u16>,
}

impl RetransmitQueue {
    pub fn with_capacity(size: usize) -> Self {
        Self {
            sent_history: SequenceBuffer::with_capacity(size),
            nacked: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    /// Record a packet at the moment it is sent. Eviction of older history is
    /// the ring's concern; an evicted packet simply can't be retransmitted.
    pub fn record_sent(&mut self, sequence: u16, bytes: Vec<u8>, sent_at_usecs: u64) {
        if let Err(e) = self.sent_history.insert(
            RetainedPacket {
                bytes,
                sent_at_usecs,
            },
            sequence,
        ) {
            debug!("not retaining sent packet {sequence}: {e}");
        }
    }

    /// Queue the sequence numbers named by an inbound NACK.
    pub fn queue_nacks(&mut self, missing: impl IntoIterator<Item = u16>) {
        for seq in missing {
            if self.queued.insert(seq) {
                self.nacked.push_back(seq);
            }
        }
    }

    pub fn has_next(&self) -> bool {
        !self.nacked.is_empty()
    }

    /// Pop the next NACKed sequence and fetch its retained packet, if we
    /// still have it. Each sequence is replayed at most once per NACK cycle,
    /// but the history entry survives until the ring evicts it: a retransmit
    /// that is itself lost can be replayed by the next cycle.
    pub fn next(&mut self) -> Option<RetainedPacket> {
        while let Some(seq) = self.nacked.pop_front() {
            self.queued.remove(&seq);
            match self.sent_history.get(seq) {
                Some(packet) => return Some(packet.clone()),
                None => {
                    debug!("nacked packet {seq} no longer retained, skipping");
                }
            }
        }
        None
    }
}

/// Receiver side of loss recovery: derives the missing-sequence set from the
/// gaps in what arrived, prunes stale entries, and frames NACK payloads.
///
/// Whether a NACK should be sent at all is the caller's decision: if inbound
/// packets from the sender are still queued for processing, the apparent gaps
/// may be processing lag rather than loss, and NACKing would only invite
/// redundant retransmission.
#[derive(Debug, Default)]
pub struct MissingTracker {
    missing: HashSet<u16>,
    /// Highest sequence received so far, once anything has arrived.
    newest: Option<u16>,
}

impl MissingTracker {
    pub fn record_received(&mut self, sequence: u16) {
        match self.newest {
            None => {
                self.newest = Some(sequence);
            }
            Some(newest) => {
                if crate::sequence_buffer::sequence_greater_than(sequence, newest) {
                    // everything between the old newest and this arrival is missing
                    let mut cursor = (Wrapping(newest) + Wrapping(1)).0;
                    while cursor != sequence {
                        self.missing.insert(cursor);
                        cursor = (Wrapping(cursor) + Wrapping(1)).0;
                    }
                    self.newest = Some(sequence);
                } else {
                    // a late arrival fills its gap
                    self.missing.remove(&sequence);
                }
            }
        }
    }

    /// Discard missing entries that have fallen too far behind to be worth
    /// recovering. Run before constructing a NACK.
    pub fn prune(&mut self, window: u16) {
        let Some(newest) = self.newest else {
            return;
        };
        let oldest_wanted = (Wrapping(newest) - Wrapping(window)).0;
        let before = self.missing.len();
        self.missing
            .retain(|seq| !sequence_less_than(*seq, oldest_wanted));
        let pruned = before - self.missing.len();
        if pruned > 0 {
            debug!("pruned {pruned} stale missing sequence numbers");
        }
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    /// Deriving the missing set has no side effects: until a retransmission
    /// actually arrives, repeated calls name the same sequences.
    pub fn missing_set(&self) -> Vec<u16> {
        let mut missing: Vec<u16> = self.missing.iter().copied().collect();
        missing.sort_unstable();
        missing
    }

    /// Frame the missing set into one or more NACK payloads, each holding at
    /// most `max_seqs_per_packet` sequence numbers.
    pub fn build_nack_packets(&self, max_seqs_per_packet: usize) -> Vec<Vec<u8>> {
        self.missing_set()
            .chunks(max_seqs_per_packet.max(1))
            .map(write_nack_packet)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_nack_packet;

    #[test]
    fn retransmit_replays_from_history() {
        let mut rq = RetransmitQueue::with_capacity(64);
        rq.record_sent(5, vec![5; 10], 1000);
        rq.record_sent(6, vec![6; 10], 1001);
        rq.queue_nacks([5]);
        assert!(rq.has_next());
        let packet = rq.next().unwrap();
        assert_eq!(packet.bytes, vec![5; 10]);
        assert!(!rq.has_next());
        // a lost retransmit is recoverable: the next NACK cycle replays it
        rq.queue_nacks([5]);
        assert_eq!(rq.next().unwrap().bytes, vec![5; 10]);
    }

    #[test]
    fn evicted_history_cannot_be_replayed() {
        let mut rq = RetransmitQueue::with_capacity(8);
        for seq in 0..20u16 {
            rq.record_sent(seq, vec![seq as u8], u64::from(seq));
        }
        rq.queue_nacks([1]); // long gone from an 8-deep ring
        assert!(rq.next().is_none());
    }

    #[test]
    fn duplicate_nacks_queue_once() {
        let mut rq = RetransmitQueue::with_capacity(64);
        rq.record_sent(9, vec![9], 0);
        rq.queue_nacks([9, 9, 9]);
        assert!(rq.next().is_some());
        assert!(!rq.has_next());
    }

    #[test]
    fn gaps_become_missing() {
        let mut mt = MissingTracker::default();
        mt.record_received(1);
        mt.record_received(4);
        assert_eq!(mt.missing_set(), vec![2, 3]);
        // late arrival fills its gap
        mt.record_received(3);
        assert_eq!(mt.missing_set(), vec![2]);
    }

    #[test]
    fn missing_set_is_idempotent() {
        let mut mt = MissingTracker::default();
        mt.record_received(1);
        mt.record_received(8);
        let first = mt.missing_set();
        let second = mt.missing_set();
        assert_eq!(first, second);
        assert_eq!(first, vec![2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn prune_discards_stale() {
        let mut mt = MissingTracker::default();
        mt.record_received(0);
        mt.record_received(1000);
        assert_eq!(mt.missing_count(), 999);
        mt.prune(100);
        assert_eq!(mt.missing_count(), 100);
    }

    #[test]
    fn nack_packets_chunked() {
        let mut mt = MissingTracker::default();
        mt.record_received(0);
        mt.record_received(11); // 1..=10 missing
        let packets = mt.build_nack_packets(4);
        assert_eq!(packets.len(), 3);
        let all: Vec<u16> = packets
            .iter()
            .flat_map(|p| parse_nack_packet(p).unwrap())
            .collect();
        assert_eq!(all, (1..=10).collect::<Vec<u16>>());
    }
}
