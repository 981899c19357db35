//! Inbound frame decoding and validation.
//!
//! Frames are decoded into an [`InboundMessage`] envelope. Decoding rejects
//! anything that is not a JSON object with a non-empty `type`, and checks the
//! required fields of the message types the session core consumes.

// ============================================================================
// Imports
// ============================================================================

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::kinds;

// ============================================================================
// InboundMessage
// ============================================================================

/// A decoded, validated inbound frame.
///
/// # Format
///
/// ```json
/// {
///   "type": "session_init",
///   "session_id": "srv-42",
///   "timestamp": 1718000000.25
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Message type tag.
    kind: String,

    /// Sender timestamp, if present.
    timestamp: Option<f64>,

    /// Session id carried by the frame, or the router's default tag.
    session_id: Option<SessionId>,

    /// Full decoded object.
    body: Map<String, Value>,
}

impl InboundMessage {
    /// Returns the message type tag.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the sender timestamp.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    /// Returns the session id this message belongs to.
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Returns the raw object.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Gets a string field.
    #[inline]
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Gets a boolean field.
    #[inline]
    #[must_use]
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }

    /// Fills in the session id when the frame did not carry one.
    pub(crate) fn with_default_session(mut self, default: Option<&SessionId>) -> Self {
        if self.session_id.is_none() {
            self.session_id = default.cloned();
        }
        self
    }

    /// Parses the message into a typed variant.
    #[must_use]
    pub fn parse(&self) -> ParsedMessage {
        match self.kind.as_str() {
            kinds::PONG => ParsedMessage::Pong,
            kinds::SESSION_INIT => match self.str_field("session_id").and_then(SessionId::new) {
                Some(session_id) => ParsedMessage::SessionInit { session_id },
                None => ParsedMessage::Other,
            },
            kinds::CAPABILITIES_ACK => ParsedMessage::CapabilitiesAck {
                server_session_id: self
                    .str_field("server_session_id")
                    .and_then(SessionId::new),
            },
            _ => ParsedMessage::Other,
        }
    }
}

// ============================================================================
// ParsedMessage
// ============================================================================

/// Typed view of the messages the session core consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage {
    /// Heartbeat reply.
    Pong,

    /// Server-assigned session id.
    SessionInit {
        /// Id the client must use from now on.
        session_id: SessionId,
    },

    /// Announcement acknowledgement.
    CapabilitiesAck {
        /// Server-side id, when the server chose to include it.
        server_session_id: Option<SessionId>,
    },

    /// Application traffic.
    Other,
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes and validates a raw text frame.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] if the frame is not a JSON object,
/// lacks a non-empty `type`, carries a non-numeric `timestamp`, or is a
/// `session_init` without a non-empty `session_id`.
pub fn decode(raw: &str) -> Result<InboundMessage> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::malformed(format!("invalid JSON: {e}")))?;

    let Value::Object(body) = value else {
        return Err(Error::malformed("frame is not a JSON object"));
    };

    let kind = match body.get("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => kind.clone(),
        Some(Value::String(_)) => return Err(Error::malformed("empty `type` field")),
        Some(_) => return Err(Error::malformed("`type` field is not a string")),
        None => return Err(Error::malformed("missing `type` field")),
    };

    let timestamp = match body.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_f64()
                .ok_or_else(|| Error::malformed("`timestamp` is not a number"))?,
        ),
    };

    let session_id = body
        .get("session_id")
        .and_then(Value::as_str)
        .and_then(SessionId::new);

    if kind == kinds::SESSION_INIT && session_id.is_none() {
        return Err(Error::malformed("`session_init` without `session_id`"));
    }

    Ok(InboundMessage {
        kind,
        timestamp,
        session_id,
        body,
    })
}

// ============================================================================
// Tests
// ============================================================================
