//! Common error types for pcmcast

use thiserror::Error;

/// Common result type for pcmcast operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the server and the listening client
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Datagram that does not follow the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),
}
