//! Client facade.
//!
//! This module composes transport, reconnect, queue, heartbeat, session and
//! routing into the single object applications use.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Connection supervisor and public API |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientOptions`] | Timing and buffering options |
//! | [`ClientEvent`] | Lifecycle notifications |
//! | [`Delivery`] | Outcome of a send |
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use session_link::{Client, Result};
//!
//! # async fn example() -> Result<()> {
//! let client = Client::builder()
//!     .address("ws://127.0.0.1:8765/ws")
//!     .build()?;
//!
//! client.on("session_init", |msg| println!("confirmed: {:?}", msg.session_id()));
//! client.connect()?;
//! client.send(json!({ "type": "user_text", "text": "hello" }))?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for client configuration.
pub mod builder;

/// Core client implementation.
pub mod core;

/// Lifecycle notifications.
pub mod events;

/// Timing and buffering options.
pub mod options;

#[cfg(test)]
mod tests;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use core::{Client, Delivery};
pub use events::ClientEvent;
pub use options::ClientOptions;
