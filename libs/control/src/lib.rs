//! # chatfleet-control
//!
//! Messages exchanged between the scheduling node and each room worker
//! process over the worker's private control channel.
//!
//! ## Framing
//!
//! The channel is newline-delimited JSON (the worker's stdin carries node
//! messages, its stdout carries worker messages). Every frame carries the
//! protocol version next to an internally tagged message:
//!
//! ```text
//! worker -> node   {"v":1,"type":"port","port":34001}
//! node   -> worker {"v":1,"type":"shutdown"}
//! ```
//!
//! Frames with a different version are rejected rather than guessed at.

mod error;
mod message;

pub use error::ProtocolError;
pub use message::*;
