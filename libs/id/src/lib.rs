//! # chatfleet-id
//!
//! Typed identifiers for the chatfleet node.
//!
//! Identifiers are minted by the node itself and never derived from
//! platform-assigned values such as process ids, so reuse of a pid by the OS
//! can never alias two workers.
//!
//! ## ID Format
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! - `wrk_01HV4Z2WQXKJNM8GPQY6VBKC3D` (room worker)
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (scheduling node)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
