//! Wire message types.
//!
//! Every frame is a JSON object with a mandatory `type` string and a
//! `timestamp` (seconds since the Unix epoch, floating point).
//!
//! # Message Catalog
//!
//! | Type | Direction | Purpose |
//! |------|-----------|---------|
//! | `client_capabilities` | Client → Server | Announce capabilities under a session id |
//! | `ping` | Client → Server | Heartbeat probe |
//! | `pong` | Server → Client | Heartbeat reply |
//! | `session_init` | Server → Client | Confirm the session id to use |
//! | `capabilities_ack` | Server → Client | Optional secondary confirmation |
//!
//! Any other `type` is application traffic and is routed to registered
//! handlers untouched.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `inbound` | Frame decoding and validation |
//! | `outbound` | Message builders and session tagging |

// ============================================================================
// Submodules
// ============================================================================

/// Inbound frame decoding.
pub mod inbound;

/// Outbound message construction.
pub mod outbound;

// ============================================================================
// Message Types
// ============================================================================

/// Type tags used by the session core.
pub mod kinds {
    /// Capabilities announcement.
    pub const CLIENT_CAPABILITIES: &str = "client_capabilities";
    /// Heartbeat probe.
    pub const PING: &str = "ping";
    /// Heartbeat reply.
    pub const PONG: &str = "pong";
    /// Server-assigned identity.
    pub const SESSION_INIT: &str = "session_init";
    /// Announcement acknowledgement.
    pub const CAPABILITIES_ACK: &str = "capabilities_ack";
}

// ============================================================================
// Re-exports
// ============================================================================

pub use inbound::{InboundMessage, ParsedMessage, decode};
pub use outbound::{
    Capabilities, ClientInfo, capabilities_announcement, ping, stamp, unix_timestamp,
};
