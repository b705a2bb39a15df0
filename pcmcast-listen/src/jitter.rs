//! Jitter buffer for sequenced audio packets
//!
//! Packets are queued by sequence number and released strictly in order.
//! A gap is only given up on once more than `depth` packets are waiting
//! behind it; each missing packet then becomes one packet of silence.
//! Packets older than the next expected sequence arrive too late to play
//! and are dropped.
//!
//! A packet further ahead than `depth * MAX_GAP_PER_DEPTH` sequence numbers
//! is dropped as out of range instead of opening a gap of that size. The one
//! exception is the very first packet: a client that joins a run part way
//! through starts its recording at that packet.
//!
//! Sequence numbers are expected not to wrap within one recording.

use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default number of packets held back before a gap is filled
pub const DEFAULT_DEPTH: usize = 100;

/// Largest accepted jump ahead of the expected sequence, in multiples of
/// the depth
pub const MAX_GAP_PER_DEPTH: u64 = 64;

/// One unit of output, in play order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// Payload of a received packet
    Packet(Vec<u8>),
    /// Stand-in for a packet that never arrived
    Silence,
}

/// Packet accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitterStats {
    /// Packets accepted into the buffer
    pub received: u64,
    /// Packets replaced by silence
    pub lost: u64,
    /// Packets that arrived after their slot was played
    pub late: u64,
    /// Packets whose sequence was already queued
    pub duplicate: u64,
    /// Packets too far ahead of the stream to belong to it
    pub out_of_range: u64,
}

#[derive(Debug)]
pub struct JitterBuffer {
    depth: usize,
    max_gap: u64,
    started: bool,
    expected: u64,
    pending: BTreeMap<u64, Vec<u8>>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            max_gap: depth.max(1) as u64 * MAX_GAP_PER_DEPTH,
            started: false,
            expected: 0,
            pending: BTreeMap::new(),
            stats: JitterStats::default(),
        }
    }

    /// Queue one packet and return whatever became playable
    pub fn push(&mut self, sequence: u32, payload: Vec<u8>) -> Vec<Released> {
        let sequence = u64::from(sequence);

        if sequence - self.expected.min(sequence) > self.max_gap {
            if self.started {
                self.stats.out_of_range += 1;
                warn!(sequence, expected = self.expected, "Dropping out-of-range packet");
                return Vec::new();
            }
            debug!(sequence, "Joined mid-stream, recording from here");
            self.expected = sequence;
        }
        self.started = true;

        if sequence < self.expected {
            self.stats.late += 1;
            debug!(sequence, expected = self.expected, "Dropping late packet");
            return Vec::new();
        }

        match self.pending.entry(sequence) {
            Entry::Occupied(_) => {
                self.stats.duplicate += 1;
                debug!(sequence, "Dropping duplicate packet");
                return Vec::new();
            }
            Entry::Vacant(slot) => {
                slot.insert(payload);
                self.stats.received += 1;
            }
        }

        self.drain(false)
    }

    /// Release everything still queued, filling any gaps with silence
    pub fn finish(&mut self) -> Vec<Released> {
        self.drain(true)
    }

    /// Next sequence number to be released
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Packets waiting behind a gap
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    fn drain(&mut self, flush: bool) -> Vec<Released> {
        let mut out = Vec::new();

        while let Some(entry) = self.pending.first_entry() {
            let sequence = *entry.key();

            if sequence == self.expected {
                out.push(Released::Packet(entry.remove()));
                self.expected += 1;
                continue;
            }

            if !flush && self.pending.len() <= self.depth {
                break;
            }

            let missing = sequence - self.expected;
            warn!(
                "Packet loss! {} packets missing, starting from {}",
                missing, self.expected
            );
            self.stats.lost += missing;
            out.extend(std::iter::repeat(Released::Silence).take(missing as usize));
            self.expected = sequence;
        }

        out
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8) -> Vec<u8> {
        vec![tag; 4]
    }

    fn packet(tag: u8) -> Released {
        Released::Packet(payload(tag))
    }

    #[test]
    fn test_in_order_packets_release_immediately() {
        let mut jitter = JitterBuffer::new(10);

        assert_eq!(jitter.push(0, payload(0)), vec![packet(0)]);
        assert_eq!(jitter.push(1, payload(1)), vec![packet(1)]);
        assert_eq!(jitter.expected(), 2);
        assert_eq!(jitter.pending(), 0);
    }

    #[test]
    fn test_reordered_packets_release_in_order() {
        let mut jitter = JitterBuffer::new(10);

        assert!(jitter.push(1, payload(1)).is_empty());
        assert!(jitter.push(2, payload(2)).is_empty());
        assert_eq!(
            jitter.push(0, payload(0)),
            vec![packet(0), packet(1), packet(2)]
        );
        assert_eq!(jitter.stats().lost, 0);
    }

    #[test]
    fn test_gap_filled_once_depth_exceeded() {
        let mut jitter = JitterBuffer::new(2);

        assert_eq!(jitter.push(0, payload(0)), vec![packet(0)]);
        // Sequence 1 never arrives
        assert!(jitter.push(2, payload(2)).is_empty());
        assert!(jitter.push(3, payload(3)).is_empty());

        let released = jitter.push(4, payload(4));
        assert_eq!(
            released,
            vec![Released::Silence, packet(2), packet(3), packet(4)]
        );
        assert_eq!(jitter.stats().lost, 1);
        assert_eq!(jitter.expected(), 5);
    }

    #[test]
    fn test_late_and_duplicate_packets_dropped() {
        let mut jitter = JitterBuffer::new(1);

        jitter.push(0, payload(0));
        jitter.push(2, payload(2));
        jitter.push(2, payload(9));
        // Depth exceeded: slot 1 is filled with silence
        jitter.push(3, payload(3));
        assert!(jitter.push(1, payload(1)).is_empty());

        let stats = jitter.stats();
        assert_eq!(stats.duplicate, 1);
        assert_eq!(stats.late, 1);
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.received, 3);
    }

    #[test]
    fn test_far_ahead_packet_opens_no_gap() {
        let mut jitter = JitterBuffer::new(100);

        jitter.push(0, payload(0));
        assert!(jitter.push(5_000_000, payload(9)).is_empty());
        assert!(jitter.push(u32::MAX, payload(9)).is_empty());
        assert_eq!(jitter.push(1, payload(1)), vec![packet(1)]);

        assert!(jitter.finish().is_empty());
        let stats = jitter.stats();
        assert_eq!(stats.out_of_range, 2);
        assert_eq!(stats.lost, 0);
        assert_eq!(jitter.expected(), 2);
    }

    #[test]
    fn test_gap_within_bound_is_filled() {
        let mut jitter = JitterBuffer::new(1);

        jitter.push(0, payload(0));
        // Exactly at the bound: 64 missing packets
        jitter.push(65, payload(65));
        assert_eq!(jitter.finish().len(), 64 + 1);
        assert_eq!(jitter.stats().out_of_range, 0);
        assert_eq!(jitter.stats().lost, 64);
    }

    #[test]
    fn test_first_packet_mid_stream_starts_recording() {
        let mut jitter = JitterBuffer::new(100);

        assert_eq!(jitter.push(50_000, payload(1)), vec![packet(1)]);
        assert_eq!(jitter.push(50_001, payload(2)), vec![packet(2)]);
        assert!(jitter.push(3, payload(3)).is_empty());

        let stats = jitter.stats();
        assert_eq!(stats.lost, 0);
        assert_eq!(stats.late, 1);
        assert_eq!(jitter.expected(), 50_002);
    }

    #[test]
    fn test_finish_flushes_with_silence() {
        let mut jitter = JitterBuffer::new(100);

        jitter.push(0, payload(0));
        jitter.push(3, payload(3));
        jitter.push(5, payload(5));

        assert_eq!(
            jitter.finish(),
            vec![
                Released::Silence,
                Released::Silence,
                packet(3),
                Released::Silence,
                packet(5)
            ]
        );
        assert_eq!(jitter.stats().lost, 3);
        assert_eq!(jitter.pending(), 0);
        assert!(jitter.finish().is_empty());
    }
}
