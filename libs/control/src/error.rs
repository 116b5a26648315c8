//! Error types for control-channel framing.

use thiserror::Error;

/// Errors raised while encoding or decoding control frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peer speaks a protocol version this build does not.
    #[error("unsupported control protocol version: {0}")]
    UnsupportedVersion(u16),

    /// The line is not a valid frame for the expected direction.
    #[error("malformed control frame: {0}")]
    Malformed(String),

    /// The line was empty.
    #[error("empty control frame")]
    Empty,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
