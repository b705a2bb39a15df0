//! # pcmcast Common Library
//!
//! Shared code for the pcmcast relay server and listening client:
//! - Wire protocol (control messages, sequenced audio packets)
//! - Configuration loading (TOML file with environment/CLI overrides)
//! - Common error type

pub mod config;
pub mod error;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::{AudioPacket, ControlMessage};
