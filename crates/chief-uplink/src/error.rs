//! # Uplink Error Types
//!
//! Error types for uplink operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Uplink Error Categories                            │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │  Control Plane  │  │     Broadcast Socket    │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  AuthFailed 401 │  │  ConnectionFailed       │ │
//! │  │  InvalidUrl     │  │  Revoked    403 │  │  Disconnected           │ │
//! │  │  InsecureUrl    │  │  Http       5xx │  │  ServerError            │ │
//! │  │  ConfigLoad/Save│  │  Network        │  │  HandshakeTimeout       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │    Protocol     │  │                 Lifecycle                   │  │
//! │  │                 │  │                                             │  │
//! │  │  InvalidMessage │  │  Closed  Cancelled                          │  │
//! │  │  Serialization  │  │                                             │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The orchestrator branches on the three control-plane buckets:
//! auth (refresh token, retry), revoked (terminal), transient (backoff).

use thiserror::Error;

/// Result type alias for uplink operations.
pub type UplinkResult<T> = Result<T, UplinkError>;

/// Uplink error type covering all possible uplink failures.
#[derive(Debug, Error)]
pub enum UplinkError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid uplink configuration.
    #[error("Invalid uplink configuration: {0}")]
    InvalidConfig(String),

    /// Invalid server URL.
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    /// Plain HTTP to a non-loopback host.
    #[error("Refusing insecure URL {0}: plain http is only allowed for loopback hosts")]
    InsecureUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Control Plane Errors
    // =========================================================================
    /// Access token missing, invalid or expired (HTTP 401).
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Device access was revoked (HTTP 403).
    #[error("Device access revoked: {0}")]
    AccessRevoked(String),

    /// Any other non-2xx response.
    #[error("Server returned {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Request could not be delivered or the response could not be read.
    #[error("Network error: {0}")]
    Network(String),

    /// Request or connection timed out.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    // =========================================================================
    // Broadcast Socket Errors
    // =========================================================================
    /// Failed to establish the WebSocket connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Socket closed unexpectedly.
    #[error("Disconnected from broadcast server")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// `pusher:error` received during the handshake.
    #[error("Broadcast server error: {0}")]
    ServerError(String),

    /// A handshake stage did not complete in time.
    #[error("Handshake timed out waiting for {0}")]
    HandshakeTimeout(&'static str),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Uplink or component was closed.
    #[error("Uplink is closed")]
    Closed,

    /// Cancelled through a cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<chief_protocol::ProtocolError> for UplinkError {
    fn from(err: chief_protocol::ProtocolError) -> Self {
        UplinkError::InvalidMessage(err.to_string())
    }
}

impl From<serde_json::Error> for UplinkError {
    fn from(err: serde_json::Error) -> Self {
        UplinkError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for UplinkError {
    fn from(err: url::ParseError) -> Self {
        UplinkError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for UplinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UplinkError::Timeout(0)
        } else if err.is_builder() {
            UplinkError::InvalidConfig(err.to_string())
        } else {
            UplinkError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for UplinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => UplinkError::Disconnected,
            WsError::AlreadyClosed => UplinkError::Disconnected,
            WsError::Protocol(p) => UplinkError::WebSocketError(p.to_string()),
            WsError::Io(io) => UplinkError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => UplinkError::ConnectionFailed(tls.to_string()),
            other => UplinkError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for UplinkError {
    fn from(err: std::io::Error) -> Self {
        UplinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for UplinkError {
    fn from(err: toml::de::Error) -> Self {
        UplinkError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for UplinkError {
    fn from(err: toml::ser::Error) -> Self {
        UplinkError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl UplinkError {
    /// Returns true for a 401: the caller should refresh the token.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, UplinkError::AuthFailed(_))
    }

    /// Returns true for a 403: terminal, never retried.
    pub fn is_revoked(&self) -> bool {
        matches!(self, UplinkError::AccessRevoked(_))
    }

    /// Returns true if this error is transient and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - Non-2xx responses other than 401/403
    /// - Socket failures and handshake timeouts
    ///
    /// ## Non-Retryable Errors
    /// - Auth failures and revocation
    /// - Configuration errors
    /// - Cancellation and shutdown
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UplinkError::Http { .. }
                | UplinkError::Network(_)
                | UplinkError::Timeout(_)
                | UplinkError::ConnectionFailed(_)
                | UplinkError::Disconnected
                | UplinkError::WebSocketError(_)
                | UplinkError::ServerError(_)
                | UplinkError::HandshakeTimeout(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            UplinkError::InvalidConfig(_)
                | UplinkError::InvalidUrl(_)
                | UplinkError::InsecureUrl(_)
                | UplinkError::ConfigLoadFailed(_)
                | UplinkError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates malformed wire data.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            UplinkError::InvalidMessage(_) | UplinkError::SerializationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_buckets() {
        assert!(UplinkError::AuthFailed("expired".into()).is_auth_failure());
        assert!(!UplinkError::AuthFailed("expired".into()).is_retryable());

        assert!(UplinkError::AccessRevoked("gone".into()).is_revoked());
        assert!(!UplinkError::AccessRevoked("gone".into()).is_retryable());

        let http = UplinkError::Http {
            status: 503,
            code: None,
            message: "unavailable".into(),
        };
        assert!(http.is_retryable());
        assert!(UplinkError::Network("reset".into()).is_retryable());
        assert!(UplinkError::Timeout(30_000).is_retryable());
    }

    #[test]
    fn test_lifecycle_errors_not_retryable() {
        assert!(!UplinkError::Cancelled.is_retryable());
        assert!(!UplinkError::Closed.is_retryable());
        assert!(!UplinkError::InvalidConfig("x".into()).is_retryable());
    }

    #[test]
    fn test_every_variant_has_exactly_one_bucket() {
        let all = [
            UplinkError::InvalidConfig("x".into()),
            UplinkError::InvalidUrl("x".into()),
            UplinkError::InsecureUrl("http://example.com".into()),
            UplinkError::ConfigLoadFailed("x".into()),
            UplinkError::ConfigSaveFailed("x".into()),
            UplinkError::AuthFailed("x".into()),
            UplinkError::AccessRevoked("x".into()),
            UplinkError::Http {
                status: 500,
                code: None,
                message: "x".into(),
            },
            UplinkError::Network("x".into()),
            UplinkError::Timeout(1),
            UplinkError::ConnectionFailed("x".into()),
            UplinkError::Disconnected,
            UplinkError::WebSocketError("x".into()),
            UplinkError::ServerError("x".into()),
            UplinkError::HandshakeTimeout("connection_established"),
            UplinkError::InvalidMessage("x".into()),
            UplinkError::SerializationFailed("x".into()),
            UplinkError::Closed,
            UplinkError::Cancelled,
        ];

        for err in &all {
            // No wildcard: a new variant has to pick a bucket here
            let lifecycle = match err {
                UplinkError::Closed | UplinkError::Cancelled => true,
                UplinkError::InvalidConfig(_)
                | UplinkError::InvalidUrl(_)
                | UplinkError::InsecureUrl(_)
                | UplinkError::ConfigLoadFailed(_)
                | UplinkError::ConfigSaveFailed(_)
                | UplinkError::AuthFailed(_)
                | UplinkError::AccessRevoked(_)
                | UplinkError::Http { .. }
                | UplinkError::Network(_)
                | UplinkError::Timeout(_)
                | UplinkError::ConnectionFailed(_)
                | UplinkError::Disconnected
                | UplinkError::WebSocketError(_)
                | UplinkError::ServerError(_)
                | UplinkError::HandshakeTimeout(_)
                | UplinkError::InvalidMessage(_)
                | UplinkError::SerializationFailed(_) => false,
            };
            let buckets = [
                err.is_auth_failure(),
                err.is_revoked(),
                err.is_retryable(),
                err.is_config_error(),
                err.is_protocol_error(),
                lifecycle,
            ];
            assert_eq!(buckets.iter().filter(|b| **b).count(), 1, "{err:?}");
        }
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: UplinkError = chief_protocol::ProtocolError::InvalidSigningKey.into();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_error_display() {
        let err = UplinkError::Http {
            status: 422,
            code: Some("invalid_batch".into()),
            message: "messages must not be empty".into(),
        };
        assert!(err.to_string().contains("422"));
        assert!(err.to_string().contains("messages must not be empty"));
    }
}
