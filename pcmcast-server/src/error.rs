//! Error types for pcmcast-server
//!
//! Defines module-specific error types using thiserror for clear error propagation.

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for pcmcast-server
#[derive(Error, Debug)]
pub enum Error {
    /// Audio loading, decoding or resampling errors (fatal at startup)
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Relay socket could not be bound (fatal at startup)
    #[error("Failed to bind {addr}: {source}. Port might be in use")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Socket or file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation not valid in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// An all-clients broadcast run is already active
    #[error("An all-clients broadcast is already in flight")]
    BroadcastInFlight,
}

/// Convenience Result type using pcmcast-server Error
pub type Result<T> = std::result::Result<T, Error>;
