//! # chief-uplink: Device Transport for Chief
//!
//! This crate keeps a device connected to the hosted control server. The
//! device never listens on a port: everything it reports goes out as
//! batched HTTPS calls, and everything the server wants from it arrives
//! over a subscribed broadcast socket.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Uplink Architecture                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                     Uplink (Orchestrator)                        │  │
//! │  │                                                                  │  │
//! │  │  connect / send / receive / close                               │  │
//! │  │  Heartbeat timer, reconnect with backoff, auth refresh          │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │    Batcher     │  │ ControlClient  │  │     PusherClient       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Tiered buffer  │  │ HTTPS + bearer │  │ WebSocket, private     │    │
//! │  │ Debounce timers│─►│ Typed errors   │◄─│ channel subscribe,     │    │
//! │  │ Byte/count caps│  │ Retry/backoff  │  │ ping/pong, commands    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  OUTBOUND:  send() → Batcher → POST /api/device/messages               │
//! │  INBOUND:   chief.command → PusherClient → CommandStream               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`uplink`] - Main `Uplink` orchestrator and its status
//! - [`control`] - Control-plane HTTP client
//! - [`batcher`] - Tiered outgoing message buffer
//! - [`pusher`] - Broadcast socket client
//! - [`heartbeat`] - Liveness probing
//! - [`retry`] - Backoff helpers shared by the clients
//! - [`config`] - Uplink configuration (file, env, runtime settings)
//! - [`error`] - Uplink error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chief_uplink::{Uplink, UplinkConfig, UplinkSettings};
//! use chief_protocol::tier::message_type;
//!
//! let config = UplinkConfig::load_or_default(None);
//! let settings = UplinkSettings::from_config(&config, env!("CARGO_PKG_VERSION"));
//!
//! let uplink = Uplink::builder(settings, access_token)
//!     .on_reconnect(|uplink| {
//!         let _ = uplink.send(&snapshot(), message_type::STATE_SNAPSHOT);
//!     })
//!     .build()?;
//! uplink.connect().await?;
//!
//! let commands = uplink.receive();
//! while let Some(command) = commands.recv().await {
//!     handle(command);
//! }
//! uplink.close().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod batcher;
pub mod config;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod pusher;
pub mod retry;
pub mod uplink;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use batcher::{Admission, Batch, Batcher};
pub use config::{
    BatcherConfig, ControlConfig, HeartbeatConfig, PusherConfig, RetryPolicy, UplinkConfig,
};
pub use control::ControlClient;
pub use error::{UplinkError, UplinkResult};
pub use pusher::{PusherClient, Subscription};
pub use uplink::{
    auth_refresher, AuthRefresher, CommandStream, ConnectionState, Uplink, UplinkBuilder,
    UplinkSettings, UplinkStatus,
};
