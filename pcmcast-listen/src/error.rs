//! Error types for pcmcast-listen

use thiserror::Error;

/// Main error type for pcmcast-listen
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or file I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WAV output errors
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// Server address could not be resolved
    #[error("Cannot resolve server address: {0}")]
    Resolve(String),
}

/// Convenience Result type using pcmcast-listen Error
pub type Result<T> = std::result::Result<T, Error>;
