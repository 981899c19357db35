//! Outbound message construction.
//!
//! Builders for the messages the session core produces, plus [`stamp`], which
//! fills in `timestamp` and `session_id` on application payloads right before
//! they hit the wire.

// ============================================================================
// Imports
// ============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;

use super::kinds;

// ============================================================================
// Capabilities
// ============================================================================

/// Client name and version reported in announcements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client application name.
    pub name: String,
    /// Client application version.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Capabilities advertised in `client_capabilities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether the client accepts streamed responses.
    pub supports_streaming: bool,
    /// Audio formats the client can produce and consume.
    pub audio_formats: Vec<String>,
    /// Client identification.
    pub client: ClientInfo,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_streaming: true,
            audio_formats: vec!["pcm16".to_string()],
            client: ClientInfo::default(),
        }
    }
}

impl Capabilities {
    /// Sets the client name and version.
    #[inline]
    #[must_use]
    pub fn with_client(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client = ClientInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    /// Sets the supported audio formats.
    #[inline]
    #[must_use]
    pub fn with_audio_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.audio_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    /// Sets streaming support.
    #[inline]
    #[must_use]
    pub fn with_streaming(mut self, supports_streaming: bool) -> Self {
        self.supports_streaming = supports_streaming;
        self
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Seconds since the Unix epoch as a float.
#[must_use]
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Builds a `client_capabilities` announcement.
///
/// # Format
///
/// ```json
/// {
///   "type": "client_capabilities",
///   "session_id": "...",
///   "timestamp": 1718000000.0,
///   "capabilities": {
///     "supports_streaming": true,
///     "audio_formats": ["pcm16"],
///     "client": { "name": "...", "version": "..." }
///   }
/// }
/// ```
#[must_use]
pub fn capabilities_announcement(session_id: &SessionId, capabilities: &Capabilities) -> Value {
    json!({
        "type": kinds::CLIENT_CAPABILITIES,
        "session_id": session_id,
        "timestamp": unix_timestamp(),
        "capabilities": capabilities,
    })
}

/// Builds a heartbeat probe.
#[must_use]
pub fn ping() -> Value {
    json!({
        "type": kinds::PING,
        "timestamp": unix_timestamp(),
    })
}

/// Prepares a payload for sending.
///
/// Adds `timestamp` when absent and fills a missing, null or blank
/// `session_id` with `session`. Probes (`ping`) are never session-tagged.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the payload is not an object or has
/// no non-empty `type`.
pub fn stamp(payload: &mut Value, session: &SessionId) -> Result<()> {
    let Value::Object(map) = payload else {
        return Err(Error::invalid_argument("outbound payload must be a JSON object"));
    };

    let kind = match map.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.trim().is_empty() => kind.to_string(),
        _ => return Err(Error::invalid_argument("outbound payload needs a non-empty `type`")),
    };

    if !map.get("timestamp").is_some_and(Value::is_number) {
        map.insert("timestamp".to_string(), json!(unix_timestamp()));
    }

    if kind != kinds::PING {
        let blank = match map.get("session_id") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if blank {
            map.insert("session_id".to_string(), json!(session));
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
