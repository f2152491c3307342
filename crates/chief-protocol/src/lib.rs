//! # chief-protocol: Pure Wire Model for the Chief Uplink
//!
//! This crate describes everything that crosses the wire between a device
//! and the hosted control server, as pure data and pure functions.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Chief Uplink Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 apps/chief-uplink (binary)                      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 chief-uplink (transport, async I/O)             │   │
//! │  │   ControlClient ── Batcher ── PusherClient ── Uplink            │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ chief-protocol (THIS CRATE) ★                    │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐                  │   │
//! │  │   │   tier    │  │  device   │  │  pusher   │                  │   │
//! │  │   │ Tier table│  │ HTTP body │  │  frames   │                  │   │
//! │  │   │ msg types │  │  Welcome  │  │ signature │                  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘                  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • PURE FUNCTIONS                          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`tier`] - Message types and their flush/drop priority tier
//! - [`device`] - Control-plane HTTP request and response bodies
//! - [`pusher`] - Broadcast socket frames, event names, channel signatures
//! - [`error`] - Protocol error types
//!
//! ## Example Usage
//!
//! ```rust
//! use chief_protocol::tier::{message_type, Tier};
//! use chief_protocol::device::channel_name;
//!
//! assert_eq!(Tier::of(message_type::RUN_COMPLETE), Tier::Immediate);
//! assert_eq!(Tier::of("something_new"), Tier::Standard);
//! assert_eq!(channel_name(42), "private-chief-server.42");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod device;
pub mod error;
pub mod pusher;
pub mod tier;

// =============================================================================
// Re-exports
// =============================================================================

pub use device::{
    channel_name, BroadcastParams, ChannelAuthRequest, ChannelAuthResponse, ConnectRequest,
    ErrorEnvelope, IngestRequest, IngestResponse, WelcomeResponse, PROTOCOL_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use pusher::{ConnectionEstablished, PusherFrame};
pub use tier::Tier;
