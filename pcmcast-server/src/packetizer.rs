//! Packetizer: slices the PCM buffer into sequenced wire packets
//!
//! Pure and stateless. Slice `k` covers bytes `[k * 1020, min((k + 1) * 1020, len))`
//! and is sent with sequence number `k`. A short final slice is the normal end
//! of a run, not an error.

use pcmcast_common::protocol::{encode_packet, PAYLOAD_SIZE};

/// Payload slice starting at `offset`, or `None` at or past the end.
pub fn slice_at(buffer: &[u8], offset: usize) -> Option<&[u8]> {
    if offset >= buffer.len() {
        return None;
    }
    let end = offset.saturating_add(PAYLOAD_SIZE).min(buffer.len());
    Some(&buffer[offset..end])
}

/// Wire packet for the slice at `offset` carrying `sequence`.
pub fn packet_at(buffer: &[u8], offset: usize, sequence: u32) -> Option<Vec<u8>> {
    slice_at(buffer, offset).map(|payload| encode_packet(sequence, payload))
}

/// One packet of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u32,
    /// Byte offset of the payload within the buffer
    pub offset: usize,
    /// Payload length (header excluded)
    pub payload_len: usize,
    /// Encoded datagram
    pub bytes: Vec<u8>,
}

/// Iterator over every packet of a buffer, sequence numbers from zero
#[derive(Debug, Clone)]
pub struct Packets<'a> {
    buffer: &'a [u8],
    offset: usize,
    sequence: u32,
}

impl<'a> Packets<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            sequence: 0,
        }
    }
}

impl Iterator for Packets<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        let payload = slice_at(self.buffer, self.offset)?;
        let packet = Packet {
            sequence: self.sequence,
            offset: self.offset,
            payload_len: payload.len(),
            bytes: encode_packet(self.sequence, payload),
        };

        self.offset += payload.len();
        // Only wraps past 4 TiB of audio
        self.sequence = self.sequence.wrapping_add(1);

        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = packet_count(self.buffer.len().saturating_sub(self.offset));
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Packets<'_> {}

/// Number of packets needed for `total_bytes`
pub fn packet_count(total_bytes: usize) -> usize {
    total_bytes.div_ceil(PAYLOAD_SIZE)
}
