//! # Broadcast Socket Frames
//!
//! Frame types for the Pusher-compatible broadcast server (protocol 7).
//!
//! ## Handshake
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Broadcast Socket Handshake                          │
//! │                                                                         │
//! │  CLIENT                                   SERVER                        │
//! │    │  dial ws(s)://host:port/app/{key}?protocol=7                       │
//! │    │ ─────────────────────────────────────────►                         │
//! │    │  pusher:connection_established                                     │
//! │    │  data: "{\"socket_id\":\"1.2\",\"activity_timeout\":30}"           │
//! │    │ ◄─────────────────────────────────────────                         │
//! │    │  pusher:subscribe {auth, channel}                                  │
//! │    │ ─────────────────────────────────────────►                         │
//! │    │  pusher_internal:subscription_succeeded (channel)                  │
//! │    │ ◄─────────────────────────────────────────                         │
//! │    │  chief.command (channel, data)   ... pusher:ping / pusher:pong     │
//! │    │ ◄────────────────────────────────────────►                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Double Encoding
//! The server encodes structured `data` as a JSON *string* holding JSON.
//! `connection_established` always does this; `chief.command` may. Both are
//! unwrapped here before anything else looks at them.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{ProtocolError, ProtocolResult};

type HmacSha256 = Hmac<Sha256>;

/// Pusher protocol revision spoken by the client.
pub const PROTOCOL: u32 = 7;

/// Event names.
pub mod events {
    pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
    pub const ERROR: &str = "pusher:error";
    pub const PING: &str = "pusher:ping";
    pub const PONG: &str = "pusher:pong";
    pub const SUBSCRIBE: &str = "pusher:subscribe";
    pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
    pub const COMMAND: &str = "chief.command";
}

// =============================================================================
// Frame
// =============================================================================

/// One JSON frame on the broadcast socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PusherFrame {
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default)]
    pub data: Value,
}

impl PusherFrame {
    /// Parses a text frame.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes to a JSON string.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `pusher:subscribe` for a private channel.
    pub fn subscribe(channel: &str, auth: &str) -> Self {
        PusherFrame {
            event: events::SUBSCRIBE.to_string(),
            channel: None,
            data: serde_json::json!({ "auth": auth, "channel": channel }),
        }
    }

    /// `pusher:ping`.
    pub fn ping() -> Self {
        PusherFrame {
            event: events::PING.to_string(),
            channel: None,
            data: Value::Object(Default::default()),
        }
    }

    /// `pusher:pong`.
    pub fn pong() -> Self {
        PusherFrame {
            event: events::PONG.to_string(),
            channel: None,
            data: Value::Object(Default::default()),
        }
    }

    /// True if this frame is `event` addressed to `channel`.
    pub fn is_for(&self, event: &str, channel: &str) -> bool {
        self.event == event && self.channel.as_deref() == Some(channel)
    }

    /// The `data` field with any string-encoded JSON unwrapped.
    pub fn payload(&self) -> Value {
        unwrap_encoded(&self.data)
    }
}

/// Unwraps JSON that was encoded into a JSON string, up to two levels deep.
///
/// Strings that do not hold JSON are returned unchanged.
pub fn unwrap_encoded(data: &Value) -> Value {
    let mut current = data.clone();
    for _ in 0..2 {
        match current {
            Value::String(ref s) => match serde_json::from_str::<Value>(s) {
                Ok(inner) => current = inner,
                Err(_) => break,
            },
            _ => break,
        }
    }
    current
}

// =============================================================================
// Typed Payloads
// =============================================================================

/// Decoded `pusher:connection_established` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    pub socket_id: String,
    /// Server keepalive interval in seconds.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout: u64,
}

fn default_activity_timeout() -> u64 {
    120
}

impl ConnectionEstablished {
    /// Decodes the double-encoded `data` of a connection-established frame.
    pub fn from_frame(frame: &PusherFrame) -> ProtocolResult<Self> {
        if frame.event != events::CONNECTION_ESTABLISHED {
            return Err(ProtocolError::UnexpectedEvent {
                expected: events::CONNECTION_ESTABLISHED.to_string(),
                actual: frame.event.clone(),
            });
        }
        let raw = match &frame.data {
            Value::String(s) => s.as_str(),
            other => {
                return Err(ProtocolError::InvalidData {
                    event: frame.event.clone(),
                    reason: format!("expected string-encoded JSON, got {other}"),
                })
            }
        };
        serde_json::from_str(raw).map_err(|e| ProtocolError::InvalidData {
            event: frame.event.clone(),
            reason: e.to_string(),
        })
    }
}

/// Decoded `pusher:error` data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerError {
    /// Lenient decode: missing or malformed data yields an empty error.
    pub fn from_frame(frame: &PusherFrame) -> Self {
        serde_json::from_value(frame.payload()).unwrap_or_default()
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.message.as_deref()) {
            (Some(code), Some(msg)) => write!(f, "{code}: {msg}"),
            (Some(code), None) => write!(f, "code {code}"),
            (None, Some(msg)) => write!(f, "{msg}"),
            (None, None) => write!(f, "unspecified server error"),
        }
    }
}

// =============================================================================
// URLs & Signatures
// =============================================================================

/// Builds the socket URL from the broadcast parameters.
///
/// `https` maps to `wss` and `http` to `ws`; socket schemes pass through.
pub fn connect_url(scheme: &str, host: &str, port: u16, app_key: &str) -> ProtocolResult<String> {
    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ProtocolError::InvalidData {
                event: "reverb".to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    };
    Ok(format!(
        "{ws_scheme}://{host}:{port}/app/{app_key}?protocol={PROTOCOL}"
    ))
}

/// Signs a private channel subscription.
///
/// HMAC-SHA256 over `socket_id:channel` keyed by `secret`, rendered as
/// `app_key:hex_digest`.
pub fn sign_channel(
    app_key: &str,
    secret: &str,
    socket_id: &str,
    channel: &str,
) -> ProtocolResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ProtocolError::InvalidSigningKey)?;
    mac.update(socket_id.as_bytes());
    mac.update(b":");
    mac.update(channel.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(format!("{app_key}:{}", hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_established_double_decode() {
        let text = r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"123.456\",\"activity_timeout\":30}"}"#;
        let frame = PusherFrame::parse(text).unwrap();
        let est = ConnectionEstablished::from_frame(&frame).unwrap();
        assert_eq!(est.socket_id, "123.456");
        assert_eq!(est.activity_timeout, 30);
    }

    #[test]
    fn test_connection_established_rejects_object_data() {
        let frame = PusherFrame {
            event: events::CONNECTION_ESTABLISHED.to_string(),
            channel: None,
            data: serde_json::json!({"socket_id": "1.1"}),
        };
        assert!(ConnectionEstablished::from_frame(&frame).is_err());
    }

    #[test]
    fn test_payload_unwraps_string_encoded_json() {
        let frame = PusherFrame {
            event: events::COMMAND.to_string(),
            channel: Some("private-chief-server.1".into()),
            data: Value::String(r#"{"type":"start_run","project":"demo"}"#.into()),
        };
        assert_eq!(
            frame.payload(),
            serde_json::json!({"type": "start_run", "project": "demo"})
        );
    }

    #[test]
    fn test_payload_unwraps_two_levels() {
        let inner = r#"{"type":"stop_run"}"#;
        let once = serde_json::to_string(inner).unwrap();
        let frame = PusherFrame {
            event: events::COMMAND.to_string(),
            channel: None,
            data: Value::String(once),
        };
        assert_eq!(frame.payload(), serde_json::json!({"type": "stop_run"}));
    }

    #[test]
    fn test_payload_keeps_plain_objects_and_strings() {
        let obj = serde_json::json!({"type": "ping_device"});
        assert_eq!(unwrap_encoded(&obj), obj);
        let text = Value::String("not json".into());
        assert_eq!(unwrap_encoded(&text), text);
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let json = PusherFrame::subscribe("private-chief-server.3", "key:abc")
            .to_json()
            .unwrap();
        assert!(json.contains(r#""event":"pusher:subscribe""#));
        assert!(json.contains(r#""channel":"private-chief-server.3""#));
        assert!(json.contains(r#""auth":"key:abc""#));
        // Top-level channel is omitted for subscribe
        assert!(!json.starts_with(r#"{"event":"pusher:subscribe","channel""#));
    }

    #[test]
    fn test_connect_url() {
        assert_eq!(
            connect_url("https", "ws.example.com", 443, "k1").unwrap(),
            "wss://ws.example.com:443/app/k1?protocol=7"
        );
        assert_eq!(
            connect_url("http", "127.0.0.1", 8080, "k1").unwrap(),
            "ws://127.0.0.1:8080/app/k1?protocol=7"
        );
        assert!(connect_url("ftp", "h", 1, "k").is_err());
    }

    #[test]
    fn test_sign_channel_known_vector() {
        // Reference vector from the Pusher private-channel documentation.
        let auth = sign_channel(
            "278d425bdf160c739803",
            "7ad3773142a6692b25b8",
            "1234.1234",
            "private-foobar",
        )
        .unwrap();
        assert_eq!(
            auth,
            "278d425bdf160c739803:58df8b0c36d6982b82c3ecf6b4662e34fe8c25bba48f5369f135bf843651c3a4"
        );
    }

    #[test]
    fn test_server_error_display() {
        let frame = PusherFrame {
            event: events::ERROR.to_string(),
            channel: None,
            data: serde_json::json!({"code": 4009, "message": "Connection is unauthorized"}),
        };
        let err = ServerError::from_frame(&frame);
        assert_eq!(err.to_string(), "4009: Connection is unauthorized");
    }
}
