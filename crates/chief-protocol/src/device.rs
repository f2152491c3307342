//! # Device Control-Plane Bodies
//!
//! Request and response bodies for the `/api/device/*` HTTP endpoints.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Device Control Plane (HTTP)                        │
//! │                                                                         │
//! │  POST /api/device/connect            ConnectRequest → WelcomeResponse  │
//! │  POST /api/device/disconnect         (empty)        → (empty)          │
//! │  POST /api/device/heartbeat          (empty)        → (empty)          │
//! │  POST /api/device/messages           IngestRequest  → IngestResponse   │
//! │  POST /api/device/broadcasting/auth  ChannelAuthRequest                │
//! │                                                   → ChannelAuthResponse│
//! │                                                                         │
//! │  Errors: { "error": "...", "code": "...", "message": "..." }           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Device protocol version sent on connect.
pub const PROTOCOL_VERSION: u32 = 1;

/// Endpoint paths, relative to the server base URL.
pub mod paths {
    pub const CONNECT: &str = "/api/device/connect";
    pub const DISCONNECT: &str = "/api/device/disconnect";
    pub const HEARTBEAT: &str = "/api/device/heartbeat";
    pub const MESSAGES: &str = "/api/device/messages";
    pub const CHANNEL_AUTH: &str = "/api/device/broadcasting/auth";
}

/// Prefix of the per-device private channel.
pub const CHANNEL_PREFIX: &str = "private-chief-server.";

/// Returns the private channel name for a device.
pub fn channel_name(device_id: i64) -> String {
    format!("{CHANNEL_PREFIX}{device_id}")
}

// =============================================================================
// Connect
// =============================================================================

/// Body of `POST /api/device/connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub chief_version: String,
    pub device_name: String,
    pub os: String,
    pub arch: String,
    pub protocol_version: u32,
}

impl ConnectRequest {
    /// Builds a connect request for the running platform.
    pub fn for_this_device(chief_version: &str, device_name: &str) -> Self {
        ConnectRequest {
            chief_version: chief_version.to_string(),
            device_name: device_name.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Broadcast server parameters handed out on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastParams {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub scheme: String,
}

/// Response of `POST /api/device/connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol_version: u32,
    pub device_id: i64,
    pub session_id: String,
    pub reverb: BroadcastParams,
}

// =============================================================================
// Message Ingestion
// =============================================================================

/// Body of `POST /api/device/messages`.
///
/// Messages are already-serialized JSON and are embedded verbatim.
#[derive(Debug, Serialize)]
pub struct IngestRequest<'a> {
    pub batch_id: &'a str,
    pub messages: &'a [Box<RawValue>],
}

/// Response of `POST /api/device/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: u64,
    pub batch_id: String,
    #[serde(default)]
    pub session_id: String,
}

// =============================================================================
// Channel Authorization
// =============================================================================

/// Body of `POST /api/device/broadcasting/auth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAuthRequest {
    pub socket_id: String,
    pub channel_name: String,
}

/// Response of `POST /api/device/broadcasting/auth`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub auth: String,
}

// =============================================================================
// Errors
// =============================================================================

/// Error envelope returned by the server on failure. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorEnvelope {
    /// Best-effort parse of an error body. Non-JSON bodies yield `None`.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<ErrorEnvelope>(body).ok()
    }

    /// The most descriptive text available: `message`, then `error`.
    pub fn description(&self) -> Option<&str> {
        self.message
            .as_deref()
            .filter(|m| !m.is_empty())
            .or(self.error.as_deref().filter(|e| !e.is_empty()))
    }
}
