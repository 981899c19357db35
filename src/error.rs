//! Error types for the session link client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use session_link::{Client, Result};
//! use serde_json::json;
//!
//! fn example(client: &Client) -> Result<()> {
//!     client.send(json!({ "type": "avatar_state", "pose": [0.0, 1.7, 0.0] }))?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidArgument`], [`Error::Storage`] |
//! | Connect | [`Error::Connect`], [`Error::ConnectTimeout`] |
//! | Send | [`Error::NotConnected`], [`Error::SendFailed`], [`Error::ConnectionClosed`] |
//! | Inbound | [`Error::MalformedMessage`] |
//! | Terminal | [`Error::NegotiationTimeout`], [`Error::ReconnectExhausted`] |
//! | External | [`Error::Io`], [`Error::Json`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// None of these are fatal to the process: every variant degrades to a
/// reported state, and connect/send failures additionally feed the retry
/// machinery.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Invalid argument passed to a public API.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Persisted session storage failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    // ========================================================================
    // Connect Errors
    // ========================================================================
    /// Address unreachable or handshake failure.
    ///
    /// Triggers a reconnect policy evaluation.
    #[error("Connect to {address} failed: {message}")]
    Connect {
        /// Address the connect was attempted against.
        address: String,
        /// Description of the failure.
        message: String,
    },

    /// Connect did not complete in time.
    #[error("Connect to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Address the connect was attempted against.
        address: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    // ========================================================================
    // Send Errors
    // ========================================================================
    /// Send attempted while the transport is not open.
    #[error("Not connected")]
    NotConnected,

    /// Write to the underlying connection failed.
    #[error("Send failed: {message}")]
    SendFailed {
        /// Description of the write failure.
        message: String,
    },

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Inbound Errors
    // ========================================================================
    /// Inbound frame is missing or has invalid required fields.
    ///
    /// Logged and dropped; the connection stays open.
    #[error("Malformed message: {message}")]
    MalformedMessage {
        /// Description of what was wrong with the frame.
        message: String,
    },

    // ========================================================================
    // Terminal Conditions
    // ========================================================================
    /// Identity confirmation never arrived.
    #[error("Session negotiation timed out after {resends} announcement resends")]
    NegotiationTimeout {
        /// Number of resends performed before giving up.
        resends: u32,
    },

    /// Reconnect attempts exhausted; manual reconnect required.
    #[error("Reconnect exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of failed attempts.
        attempts: u32,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[inline]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a connect error.
    #[inline]
    pub fn connect(address: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Creates a connect timeout error.
    #[inline]
    pub fn connect_timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::ConnectTimeout {
            address: address.into(),
            timeout_ms,
        }
    }

    /// Creates a send failure error.
    #[inline]
    pub fn send_failed(message: impl Into<String>) -> Self {
        Self::SendFailed {
            message: message.into(),
        }
    }

    /// Creates a malformed message error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Creates a negotiation timeout error.
    #[inline]
    pub fn negotiation_timeout(resends: u32) -> Self {
        Self::NegotiationTimeout { resends }
    }

    /// Creates a reconnect exhausted error.
    #[inline]
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::ReconnectExhausted { attempts }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connect-phase error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::ConnectTimeout { .. } | Self::ConnectionClosed
        )
    }

    /// Returns `true` if this is a send-phase error.
    ///
    /// Send errors cause the message to be queued for retry.
    #[inline]
    #[must_use]
    pub fn is_send_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::SendFailed { .. } | Self::ConnectionClosed
        )
    }

    /// Returns `true` if this condition needs explicit user action.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NegotiationTimeout { .. } | Self::ReconnectExhausted { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on retry.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::ConnectTimeout { .. }
                | Self::NotConnected
                | Self::SendFailed { .. }
                | Self::ConnectionClosed
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
