//! Client lifecycle notifications.
//!
//! The client pushes these over a tokio `broadcast` channel; subscribers
//! react instead of polling connection flags.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::Error;
use crate::identifiers::{Generation, SessionId};
use crate::transport::CloseReason;

// ============================================================================
// ClientEvent
// ============================================================================

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A connection opened and the capabilities announcement went out.
    Connected {
        /// Connection generation.
        generation: Generation,
    },

    /// The current connection ended.
    Disconnected {
        /// Connection generation.
        generation: Generation,
        /// Why it ended.
        reason: CloseReason,
    },

    /// An open attempt failed.
    ConnectFailed {
        /// Failure description.
        detail: String,
    },

    /// A retry is scheduled.
    ReconnectScheduled {
        /// One-based attempt number.
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },

    /// Retries exhausted; call [`Client::reconnect`](super::Client::reconnect).
    ReconnectExhausted {
        /// Failed attempts counted.
        attempts: u32,
    },

    /// The server confirmed the session on the current connection.
    Synchronized {
        /// Confirmed id.
        session_id: SessionId,
    },

    /// The effective session id changed.
    IdentityChanged {
        /// New effective id.
        session_id: SessionId,
    },

    /// Confirmation never arrived on the current connection.
    NegotiationTimeout {
        /// Announcement resends performed.
        resends: u32,
    },

    /// An inbound frame was rejected.
    MalformedMessage {
        /// Validation failure.
        detail: String,
    },

    /// The carrier reported a non-fatal error.
    TransportError {
        /// Carrier error.
        detail: String,
    },
}

impl ClientEvent {
    /// Returns the terminal error this event represents, if any.
    #[must_use]
    pub fn terminal_error(&self) -> Option<Error> {
        match self {
            Self::NegotiationTimeout { resends } => Some(Error::negotiation_timeout(*resends)),
            Self::ReconnectExhausted { attempts } => Some(Error::reconnect_exhausted(*attempts)),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
