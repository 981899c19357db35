//! Duplex transport layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  LinkCommand   ┌──────────────┐   WebSocket   ┌──────────┐
//! │    Transport     │ ─────────────► │  Socket pump │ ◄───────────► │  Server  │
//! │ state+generation │ ◄───────────── │  (tokio task)│               │          │
//! └────────┬─────────┘   LinkEvent    └──────────────┘               └──────────┘
//!          │ TransportEvent { generation, kind }
//!          ▼
//!       Client
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `Transport::open` - `Disconnected → Connecting`, connector dials
//! 2. Generation assigned, `Opened` emitted, state `Open`
//! 3. Frames flow as `MessageReceived`; writes go through `Transport::send`
//! 4. `Transport::close` or a peer drop emits one `Closed` for the generation
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `connection` | WebSocket connector and socket pump |
//! | `core` | [`Transport`] state owner |
//! | `link` | Channel seam and [`Connector`] trait |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connector and socket pump.
pub mod connection;

/// Connection state owner.
pub mod core;

/// Channel seam between transport and carrier.
pub mod link;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::{DEFAULT_CONNECT_TIMEOUT, MAX_FRAME_BYTES, WebSocketConnector, spawn_pump};
pub use core::{
    CloseReason, ConnectionState, OpenOutcome, Transport, TransportEvent, TransportEventKind,
    TransportEvents,
};
pub use link::{Connector, Link, LinkCommand, LinkEvent, RemoteEnd};
