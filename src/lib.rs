//! Session Link - persistent duplex client with session negotiation.
//!
//! This library keeps one long-lived JSON-over-WebSocket connection to a
//! conversational server alive, and reconciles the client's identity with
//! the identity the server assigns.
//!
//! # Architecture
//!
//! The client is a single composition root owning one of each component:
//!
//! - **Transport**: one connection, state machine plus generation counter
//! - **Reconnect policy**: capped exponential backoff with an attempt limit
//! - **Outbound queue**: bounded, age-limited buffer drained on open
//! - **Heartbeat**: ping/pong liveness probe closing dead connections
//! - **Session negotiator**: provisional id, server confirmation, re-announce
//! - **Router**: dispatches inbound messages by `type` to handlers
//!
//! Key design principles:
//!
//! - Events from a superseded connection are tagged with an old generation
//!   and ignored
//! - Timers belong to one generation and stop once it is gone
//! - Handlers run isolated; a panicking handler does not stop dispatch
//! - Lifecycle changes are pushed as [`ClientEvent`]s (no polling)
//!
//! # Quick Start
//!
//! ```no_run
//! use serde_json::json;
//! use session_link::{Client, ClientEvent, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder()
//!         .address("wss://voice.example.com/ws")
//!         .build()?;
//!
//!     let mut events = client.subscribe();
//!     client.on("assistant_text", |msg| {
//!         println!("assistant: {}", msg.str_field("text").unwrap_or_default());
//!     });
//!
//!     client.connect()?;
//!     client.send(json!({ "type": "user_text", "text": "hi there" }))?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let ClientEvent::Synchronized { session_id } = &event {
//!             println!("session {session_id} ready");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] facade, builder, options, events |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`heartbeat`] | Liveness probe state machine |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire message types |
//! | [`queue`] | Offline outbound buffer |
//! | [`reconnect`] | Backoff policy |
//! | [`router`] | Inbound dispatch by message type |
//! | [`session`] | Identity negotiation and persistence |
//! | [`transport`] | Connection state owner and WebSocket carrier |

// ============================================================================
// Modules
// ============================================================================

/// Client facade.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Heartbeat liveness monitor.
pub mod heartbeat;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing session ids, generations and handler ids.
pub mod identifiers;

/// Wire protocol messages.
pub mod protocol;

/// Offline outbound queue.
pub mod queue;

/// Reconnect backoff policy.
pub mod reconnect;

/// Inbound message routing.
pub mod router;

/// Session identity negotiation.
pub mod session;

/// Duplex transport layer.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ClientBuilder, ClientEvent, ClientOptions, Delivery};

// Error types
pub use error::{Error, Result};

// Component types
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor, HeartbeatState};
pub use queue::{DrainReport, MessageSink, OutboundMessage, OutboundQueue, QueueConfig};
pub use reconnect::{ReconnectAttemptState, ReconnectDecision, ReconnectPolicy};
pub use router::{DispatchOutcome, MessageRouter};
pub use session::{
    FileStore, MemoryStore, NegotiationConfig, SessionIdentity, SessionNegotiator, SessionStore,
};

// Identifier types
pub use identifiers::{Generation, HandlerId, SessionId};

// Protocol types
pub use protocol::{Capabilities, ClientInfo, InboundMessage};

// Transport types
pub use transport::{CloseReason, ConnectionState, Connector, Link, WebSocketConnector};
