//! Channel seam between [`Transport`](super::Transport) and a concrete carrier.
//!
//! A [`Connector`] produces a [`Link`]: an outgoing command channel and an
//! incoming event channel. The WebSocket connector backs the link with a
//! socket pump task; [`Link::in_memory`] backs it with a [`RemoteEnd`] the
//! caller drives directly.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// LinkCommand / LinkEvent
// ============================================================================

/// Instruction from the transport to the carrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Write a text frame.
    Text(String),
    /// Close the connection with an optional reason.
    Close(Option<String>),
}

/// Notification from the carrier to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame arrived.
    Text(String),
    /// Non-fatal carrier error.
    Error(String),
    /// The carrier is gone. No events follow.
    Closed {
        /// Close reason reported by the carrier, if any.
        reason: Option<String>,
        /// Frames accepted from the transport that never reached the wire,
        /// in send order.
        unsent: Vec<String>,
    },
}

// ============================================================================
// Link
// ============================================================================

/// Both directions of one established connection.
#[derive(Debug)]
pub struct Link {
    pub(crate) commands: mpsc::UnboundedSender<LinkCommand>,
    pub(crate) events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    /// Wraps an existing channel pair.
    #[inline]
    #[must_use]
    pub fn new(
        commands: mpsc::UnboundedSender<LinkCommand>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self { commands, events }
    }

    /// Creates a link whose far side is a [`RemoteEnd`].
    #[must_use]
    pub fn in_memory() -> (Self, RemoteEnd) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self::new(command_tx, event_rx),
            RemoteEnd {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

// ============================================================================
// RemoteEnd
// ============================================================================

/// Far side of an in-memory [`Link`], acting as the peer.
#[derive(Debug)]
pub struct RemoteEnd {
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl RemoteEnd {
    /// Delivers a text frame to the client. Returns `false` if the link is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.events.send(LinkEvent::Text(text.into())).is_ok()
    }

    /// Delivers a JSON frame to the client.
    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Reports a carrier error to the client.
    pub fn error(&self, detail: impl Into<String>) -> bool {
        self.events.send(LinkEvent::Error(detail.into())).is_ok()
    }

    /// Drops the connection from the peer side.
    ///
    /// Text frames the peer has not read yet are handed back to the client
    /// as unsent.
    pub fn close(&mut self, reason: Option<String>) -> bool {
        self.commands.close();
        let mut unsent = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            if let LinkCommand::Text(text) = command {
                unsent.push(text);
            }
        }
        self.events.send(LinkEvent::Closed { reason, unsent }).is_ok()
    }

    /// Waits for the next command from the client.
    pub async fn recv(&mut self) -> Option<LinkCommand> {
        self.commands.recv().await
    }

    /// Waits for the next text frame from the client, decoded as JSON.
    ///
    /// Returns `None` once the client closes the link.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.commands.recv().await? {
                LinkCommand::Text(text) => match serde_json::from_str(&text) {
                    Ok(value) => return Some(value),
                    Err(_) => continue,
                },
                LinkCommand::Close(_) => return None,
            }
        }
    }

    /// Returns the next command without waiting.
    pub fn try_recv(&mut self) -> Option<LinkCommand> {
        self.commands.try_recv().ok()
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Establishes the underlying duplex connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`](crate::Error::Connect) or
    /// [`Error::ConnectTimeout`](crate::Error::ConnectTimeout).
    async fn connect(&self, address: &str) -> Result<Link>;
}

// ============================================================================
// Tests
// ============================================================================
