//! # Protocol Error Types
//!
//! Errors raised while decoding or building wire-level data.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  chief-protocol errors (this file)                                     │
//! │  └── ProtocolError    - Malformed or unexpected wire data              │
//! │                                                                         │
//! │  chief-uplink errors (separate crate)                                  │
//! │  └── UplinkError      - Transport, control-plane, lifecycle failures   │
//! │                                                                         │
//! │  Flow: ProtocolError → UplinkError::InvalidMessage → logged & skipped  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Malformed or unexpected protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame could not be parsed as JSON.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame carried an event other than the one being decoded.
    #[error("Unexpected event: expected {expected}, got {actual}")]
    UnexpectedEvent { expected: String, actual: String },

    /// The `data` field did not have the expected shape.
    #[error("Invalid data for {event}: {reason}")]
    InvalidData { event: String, reason: String },

    /// The channel secret could not be used as an HMAC key.
    #[error("Invalid signing key")]
    InvalidSigningKey,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedFrame(err.to_string())
    }
}
