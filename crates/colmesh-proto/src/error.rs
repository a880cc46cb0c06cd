//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum Error {
    /// A message could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A message could not be deserialized.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The peer speaks a different protocol version.
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Frame or message structure is invalid.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
