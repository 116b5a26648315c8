//! Control messages and frame encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Version written into every frame.
pub const PROTOCOL_VERSION: u16 = 1;

/// Messages a worker sends to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// The worker is listening; `port` is the port it actually bound.
    Port { port: u16 },
}

/// Messages the node sends to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// Close the listener, drain connections and exit cleanly.
    Shutdown,
}

/// A versioned frame wrapping one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame<M> {
    /// Protocol version.
    #[serde(rename = "v")]
    pub version: u16,

    /// The message itself, flattened next to the version.
    #[serde(flatten)]
    pub message: M,
}

impl<M> Frame<M> {
    /// Wraps a message in a frame of the current version.
    pub fn new(message: M) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}

/// Encodes a message as one newline-terminated frame.
pub fn encode_line<M: Serialize>(message: M) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(&Frame::new(message))?;
    line.push('\n');
    Ok(line)
}

/// Decodes one frame, checking the version before the message body.
pub fn decode_line<M: DeserializeOwned>(line: &str) -> Result<M, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }

    #[derive(Deserialize)]
    struct VersionOnly {
        v: u16,
    }

    let VersionOnly { v } = serde_json::from_str(line)?;
    if v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(v));
    }

    let frame: Frame<M> = serde_json::from_str(line)?;
    Ok(frame.message)
}
