//! # pcmcast Listening Client Library (pcmcast-listen)
//!
//! Subscribes to a pcmcast relay server and records the stream.
//!
//! **Purpose:** Send `START`, collect sequenced audio packets, put them back
//! in order through a jitter buffer (filling gaps with silence) and write the
//! result to a 16-bit stereo 44.1kHz WAV file.

pub mod error;
pub mod jitter;
pub mod receiver;
pub mod sink;

pub use error::{Error, Result};
pub use jitter::{JitterBuffer, JitterStats, Released};
pub use receiver::{ListenConfig, ReceiveStats, Receiver};
pub use sink::{AudioSink, WavSink};
