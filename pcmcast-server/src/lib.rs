//! # pcmcast Relay Server Library (pcmcast-server)
//!
//! Streams one decoded audio file to any number of UDP clients.
//!
//! **Purpose:** Decode an audio file once, keep a registry of clients that
//! subscribe with `START`/`STOP` datagrams, and send the raw PCM to them as
//! sequenced packets, either to everyone on demand or to each new client as
//! it joins.
//!
//! **Architecture:** symphonia + rubato for loading, a tokio UDP socket shared
//! by one control listener task and any number of broadcast run tasks.

pub mod audio;
pub mod broadcast;
pub mod error;
pub mod events;
pub mod listener;
pub mod packetizer;
pub mod registry;
pub mod session;
pub mod tasks;

pub use audio::{PcmBuffer, PcmFormat};
pub use broadcast::{BroadcastEngine, BroadcastReport, BroadcastScope, DatagramSink};
pub use error::{Error, Result};
pub use events::RelayEvent;
pub use registry::ClientRegistry;
pub use session::{BroadcastTrigger, Session, SessionState};
