//! Wire protocol between the relay server and its clients
//!
//! Two kinds of datagrams travel over the relay socket:
//!
//! - Control messages, client to server: the UTF-8 text `START` or `STOP`
//!   in a single datagram. Surrounding whitespace is ignored.
//! - Audio packets, server to client: a 4-byte big-endian sequence number
//!   followed by up to [`PAYLOAD_SIZE`] bytes of raw PCM.
//!
//! There is no end-of-stream marker. A client infers the end of a run from a
//! short final payload, an idle timeout, or knowledge of the total length.

use crate::{Error, Result};

/// Default UDP port of the relay server
pub const DEFAULT_PORT: u16 = 50007;

/// Maximum PCM payload carried by one audio packet
pub const PAYLOAD_SIZE: usize = 1020;

/// Size of the sequence number prefix
pub const HEADER_SIZE: usize = 4;

/// Largest datagram the server ever sends
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Receive buffer size for control datagrams
pub const CONTROL_BUFFER_SIZE: usize = 1024;

/// Control message sent by a client to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    /// Join the client set
    Start,
    /// Leave the client set
    Stop,
}

impl ControlMessage {
    /// Text form used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMessage::Start => "START",
            ControlMessage::Stop => "STOP",
        }
    }

    /// Bytes to put in a datagram
    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Parse a control datagram.
    ///
    /// # Returns
    /// - `Ok(Some(msg))` for a recognized command
    /// - `Ok(None)` for well-formed text that is not a command
    ///
    /// # Errors
    /// - [`Error::Protocol`] if the payload is not valid UTF-8
    pub fn parse(datagram: &[u8]) -> Result<Option<Self>> {
        let text = std::str::from_utf8(datagram)
            .map_err(|e| Error::Protocol(format!("Control message is not UTF-8: {}", e)))?;

        Ok(match text.trim() {
            "START" => Some(ControlMessage::Start),
            "STOP" => Some(ControlMessage::Stop),
            _ => None,
        })
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode an audio packet: big-endian `sequence` followed by `payload`.
pub fn encode_packet(sequence: u32, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
    packet.extend_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Decoded view of an audio packet, borrowing the datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPacket<'a> {
    /// Position of this packet within its broadcast run
    pub sequence: u32,
    /// Raw PCM bytes
    pub payload: &'a [u8],
}

impl<'a> AudioPacket<'a> {
    /// Split a received datagram into sequence number and payload.
    ///
    /// # Errors
    /// - [`Error::Protocol`] if the datagram is shorter than the header or
    ///   longer than [`MAX_PACKET_SIZE`]
    pub fn decode(datagram: &'a [u8]) -> Result<Self> {
        if datagram.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "Audio packet too short: {} bytes",
                datagram.len()
            )));
        }
        if datagram.len() > MAX_PACKET_SIZE {
            return Err(Error::Protocol(format!(
                "Audio packet too long: {} bytes",
                datagram.len()
            )));
        }

        let (header, payload) = datagram.split_at(HEADER_SIZE);
        let sequence = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

        Ok(Self { sequence, payload })
    }

    /// True if this packet carries less than a full payload, which marks the
    /// end of a run whose length is not a multiple of [`PAYLOAD_SIZE`].
    pub fn is_short(&self) -> bool {
        self.payload.len() < PAYLOAD_SIZE
    }
}
