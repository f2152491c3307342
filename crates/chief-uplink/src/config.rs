//! # Uplink Configuration
//!
//! Configuration management for the uplink.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CHIEF_SERVER_URL=https://chief.example.com                         │
//! │     CHIEF_DEVICE_NAME=build-box                                        │
//! │     CHIEF_HEARTBEAT_INTERVAL_SECS=30                                   │
//! │     CHIEF_BATCH_SIZE_THRESHOLD=20                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/chief/uplink.toml (Linux)                                │
//! │     ~/Library/Application Support/dev.chief.chief/uplink.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # uplink.toml
//! [server]
//! url = "https://chief.example.com"
//! request_timeout_secs = 30
//!
//! [device]
//! name = "build-box"
//!
//! [batcher]
//! size_threshold = 20
//! standard_delay_ms = 200
//! low_priority_delay_ms = 1000
//!
//! [heartbeat]
//! interval_secs = 30
//! max_failures = 3
//! ```
//!
//! The file structs are flat and serde-friendly; each component takes a
//! runtime config built from them with real `Duration`s.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{UplinkError, UplinkResult};

// =============================================================================
// Server Settings
// =============================================================================

/// Control server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Base URL of the control server. Must be https unless the host is loopback.
    #[serde(default = "default_server_url")]
    pub url: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on a response body read into memory (bytes).
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_server_url() -> String {
    "https://chief.sh".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_response_bytes() -> usize {
    1024 * 1024
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            url: default_server_url(),
            request_timeout_secs: default_request_timeout(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

// =============================================================================
// Device Settings
// =============================================================================

/// Identity reported on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Human-readable device name shown in the dashboard.
    #[serde(default = "default_device_name")]
    pub name: String,
}

/// Hostname from the environment, or a fixed fallback.
pub fn default_device_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "chief-device".to_string())
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Batcher Settings
// =============================================================================

/// Outgoing buffer and flush timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherSettings {
    /// Buffered message count that forces a flush.
    #[serde(default = "default_size_threshold")]
    pub size_threshold: usize,

    /// Debounce window for standard-tier messages (milliseconds).
    #[serde(default = "default_standard_delay")]
    pub standard_delay_ms: u64,

    /// Debounce window for low-priority messages (milliseconds).
    #[serde(default = "default_low_priority_delay")]
    pub low_priority_delay_ms: u64,

    /// Hard cap on buffered payload bytes.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Hard cap on buffered message count.
    #[serde(default = "default_max_buffer_messages")]
    pub max_buffer_messages: usize,
}

fn default_size_threshold() -> usize {
    20
}
fn default_standard_delay() -> u64 {
    200
}
fn default_low_priority_delay() -> u64 {
    1000
}
fn default_max_buffer_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_buffer_messages() -> usize {
    1000
}

impl Default for BatcherSettings {
    fn default() -> Self {
        BatcherSettings {
            size_threshold: default_size_threshold(),
            standard_delay_ms: default_standard_delay(),
            low_priority_delay_ms: default_low_priority_delay(),
            max_buffer_bytes: default_max_buffer_bytes(),
            max_buffer_messages: default_max_buffer_messages(),
        }
    }
}

// =============================================================================
// Pusher Settings
// =============================================================================

/// Broadcast socket timeouts and delivery queue size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PusherSettings {
    /// TCP/TLS/WebSocket dial timeout (seconds).
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,

    /// Wait for `connection_established` (seconds).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Wait for `subscription_succeeded` (seconds).
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_secs: u64,

    /// Extra time past the activity timeout before the socket is declared dead.
    #[serde(default = "default_pong_grace")]
    pub pong_grace_secs: u64,

    /// Best-effort close frame timeout (milliseconds).
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Capacity of the inbound command queue.
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_dial_timeout() -> u64 {
    10
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_subscribe_timeout() -> u64 {
    10
}
fn default_pong_grace() -> u64 {
    30
}
fn default_close_timeout() -> u64 {
    2000
}
fn default_command_buffer() -> usize {
    256
}

impl Default for PusherSettings {
    fn default() -> Self {
        PusherSettings {
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            subscribe_timeout_secs: default_subscribe_timeout(),
            pong_grace_secs: default_pong_grace(),
            close_timeout_ms: default_close_timeout(),
            command_buffer: default_command_buffer(),
        }
    }
}

// =============================================================================
// Heartbeat Settings
// =============================================================================

/// Liveness heartbeat timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSettings {
    /// Interval between heartbeat ticks (seconds).
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// A tick is skipped if a send succeeded within this window (seconds).
    #[serde(default = "default_skip_window")]
    pub skip_window_secs: u64,

    /// Delay before the single retry of a failed heartbeat (seconds).
    #[serde(default = "default_heartbeat_retry_delay")]
    pub retry_delay_secs: u64,

    /// Consecutive failures that trigger reconnection.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_skip_window() -> u64 {
    30
}
fn default_heartbeat_retry_delay() -> u64 {
    2
}
fn default_max_failures() -> u32 {
    3
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        HeartbeatSettings {
            interval_secs: default_heartbeat_interval(),
            skip_window_secs: default_skip_window(),
            retry_delay_secs: default_heartbeat_retry_delay(),
            max_failures: default_max_failures(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Backoff for `*_with_retry` calls and reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// First backoff interval (milliseconds).
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff cap (seconds).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Attempts per `*_with_retry` call. 0 means unlimited.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Consecutive auth-failure callbacks before reconnection gives up.
    #[serde(default = "default_max_auth_refreshes")]
    pub max_auth_refreshes: u32,
}

fn default_initial_backoff() -> u64 {
    1000
}
fn default_max_backoff() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    5
}
fn default_max_auth_refreshes() -> u32 {
    3
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            max_attempts: default_max_attempts(),
            max_auth_refreshes: default_max_auth_refreshes(),
        }
    }
}

// =============================================================================
// Main Uplink Configuration
// =============================================================================

/// Complete uplink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UplinkConfig {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub batcher: BatcherSettings,

    #[serde(default)]
    pub pusher: PusherSettings,

    #[serde(default)]
    pub heartbeat: HeartbeatSettings,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl UplinkConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (uplink.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> UplinkResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading uplink config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load uplink config, using defaults");
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> UplinkResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| UplinkError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UplinkError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| UplinkError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Uplink config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> UplinkResult<()> {
        validate_server_url(&self.server.url)?;

        let b = &self.batcher;
        if b.size_threshold == 0 {
            return Err(UplinkError::InvalidConfig(
                "batcher.size_threshold must be greater than 0".into(),
            ));
        }
        if b.max_buffer_bytes == 0 || b.max_buffer_messages == 0 {
            return Err(UplinkError::InvalidConfig(
                "batcher buffer caps must be greater than 0".into(),
            ));
        }
        if b.size_threshold > b.max_buffer_messages {
            return Err(UplinkError::InvalidConfig(format!(
                "batcher.size_threshold ({}) exceeds max_buffer_messages ({})",
                b.size_threshold, b.max_buffer_messages
            )));
        }

        if self.heartbeat.interval_secs == 0 {
            return Err(UplinkError::InvalidConfig(
                "heartbeat.interval_secs must be greater than 0".into(),
            ));
        }
        if self.heartbeat.max_failures == 0 {
            return Err(UplinkError::InvalidConfig(
                "heartbeat.max_failures must be greater than 0".into(),
            ));
        }

        if self.pusher.command_buffer == 0 {
            return Err(UplinkError::InvalidConfig(
                "pusher.command_buffer must be greater than 0".into(),
            ));
        }

        if self.server.max_response_bytes == 0 {
            return Err(UplinkError::InvalidConfig(
                "server.max_response_bytes must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CHIEF_SERVER_URL") {
            debug!(url = %url, "Overriding server URL from environment");
            self.server.url = url;
        }

        if let Ok(name) = std::env::var("CHIEF_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(secs) = std::env::var("CHIEF_HEARTBEAT_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.heartbeat.interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid CHIEF_HEARTBEAT_INTERVAL_SECS"),
            }
        }

        if let Ok(threshold) = std::env::var("CHIEF_BATCH_SIZE_THRESHOLD") {
            match threshold.parse::<usize>() {
                Ok(t) => self.batcher.size_threshold = t,
                Err(_) => warn!(value = %threshold, "Ignoring invalid CHIEF_BATCH_SIZE_THRESHOLD"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "chief", "chief")
            .map(|dirs| dirs.config_dir().join("uplink.toml"))
    }

    // =========================================================================
    // Runtime Configs
    // =========================================================================

    /// Control-plane client settings.
    pub fn control(&self, chief_version: &str) -> ControlConfig {
        ControlConfig {
            server_url: self.server.url.clone(),
            chief_version: chief_version.to_string(),
            device_name: self.device.name.clone(),
            request_timeout: Duration::from_secs(self.server.request_timeout_secs),
            max_response_bytes: self.server.max_response_bytes,
        }
    }

    /// Batcher settings.
    pub fn batcher(&self) -> BatcherConfig {
        BatcherConfig {
            size_threshold: self.batcher.size_threshold,
            standard_delay: Duration::from_millis(self.batcher.standard_delay_ms),
            low_priority_delay: Duration::from_millis(self.batcher.low_priority_delay_ms),
            max_buffer_bytes: self.batcher.max_buffer_bytes,
            max_buffer_messages: self.batcher.max_buffer_messages,
        }
    }

    /// Broadcast socket settings.
    pub fn pusher(&self) -> PusherConfig {
        PusherConfig {
            dial_timeout: Duration::from_secs(self.pusher.dial_timeout_secs),
            handshake_timeout: Duration::from_secs(self.pusher.handshake_timeout_secs),
            subscribe_timeout: Duration::from_secs(self.pusher.subscribe_timeout_secs),
            pong_grace: Duration::from_secs(self.pusher.pong_grace_secs),
            close_timeout: Duration::from_millis(self.pusher.close_timeout_ms),
            command_buffer: self.pusher.command_buffer,
        }
    }

    /// Heartbeat settings.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat.interval_secs),
            skip_window: Duration::from_secs(self.heartbeat.skip_window_secs),
            retry_delay: Duration::from_secs(self.heartbeat.retry_delay_secs),
            max_failures: self.heartbeat.max_failures,
        }
    }

    /// Retry policy.
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry.initial_backoff_ms),
            max_interval: Duration::from_secs(self.retry.max_backoff_secs),
            max_attempts: self.retry.max_attempts,
            max_auth_refreshes: self.retry.max_auth_refreshes,
        }
    }
}

// =============================================================================
// URL Validation
// =============================================================================

/// Parses a server URL, requiring https unless the host is loopback.
pub fn validate_server_url(raw: &str) -> UplinkResult<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback_host(&url) => Ok(url),
        "http" => Err(UplinkError::InsecureUrl(raw.to_string())),
        other => Err(UplinkError::InvalidUrl(format!(
            "unsupported scheme '{other}' in {raw}"
        ))),
    }
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

// =============================================================================
// Runtime Configs
// =============================================================================

/// Settings for [`crate::control::ControlClient`].
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub server_url: String,
    pub chief_version: String,
    pub device_name: String,
    pub request_timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        UplinkConfig::default().control(env!("CARGO_PKG_VERSION"))
    }
}

/// Settings for [`crate::batcher::Batcher`].
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub size_threshold: usize,
    pub standard_delay: Duration,
    pub low_priority_delay: Duration,
    pub max_buffer_bytes: usize,
    pub max_buffer_messages: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        UplinkConfig::default().batcher()
    }
}

/// Settings for [`crate::pusher::PusherClient`].
#[derive(Debug, Clone)]
pub struct PusherConfig {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub pong_grace: Duration,
    pub close_timeout: Duration,
    pub command_buffer: usize,
}

impl Default for PusherConfig {
    fn default() -> Self {
        UplinkConfig::default().pusher()
    }
}

/// Settings for the heartbeat task.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub skip_window: Duration,
    pub retry_delay: Duration,
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        UplinkConfig::default().heartbeat()
    }
}

/// Exponential backoff policy (x2, ±50% jitter).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Attempts per retrying call; 0 means unlimited.
    pub max_attempts: u32,
    pub max_auth_refreshes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        UplinkConfig::default().retry()
    }
}
