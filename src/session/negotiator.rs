//! Session identity negotiation.
//!
//! # States
//!
//! ```text
//!             connection opened
//!   ┌──────────────────────────────────────┐
//!   ▼                                      │
//! Unsynchronized ── session_init(id) ──► Synchronized
//!   │   ▲                                  │
//!   │   └── resend tick (≤ max_resends)    └── duplicate session_init(id): no-op
//!   └── resend tick (> max_resends) ──► NegotiationTimeout (once)
//! ```
//!
//! The negotiator never touches the transport. Each operation returns the
//! message (if any) the caller must send, which keeps the state machine
//! testable without a connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::identifiers::SessionId;
use crate::protocol::{Capabilities, capabilities_announcement};

use super::store::{PROVISIONAL_ID_KEY, SessionStore};

// ============================================================================
// Constants
// ============================================================================

/// Default delay between unconfirmed announcements.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(3);

/// Default number of resends before reporting a timeout.
pub const DEFAULT_MAX_RESENDS: u32 = 5;

// ============================================================================
// Types
// ============================================================================

/// Callback fired when the effective session id changes.
pub type IdentityListener = Box<dyn Fn(&SessionId) + Send + Sync>;

// ============================================================================
// NegotiationConfig
// ============================================================================

/// Announcement resend cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Delay between announcements while unconfirmed.
    #[serde(rename = "resend_interval_ms", with = "crate::client::options::millis")]
    pub resend_interval: Duration,

    /// Resends before [`ResendAction::TimedOut`].
    pub max_resends: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            resend_interval: DEFAULT_RESEND_INTERVAL,
            max_resends: DEFAULT_MAX_RESENDS,
        }
    }
}

// ============================================================================
// SessionIdentity
// ============================================================================

/// Snapshot of the client's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Client-generated id, fixed for the process lifetime.
    pub provisional_id: SessionId,
    /// Server-assigned id, once received.
    pub confirmed_id: Option<SessionId>,
    /// Whether the current connection has been confirmed.
    pub synchronized: bool,
}

impl SessionIdentity {
    /// The id outbound traffic should carry.
    #[inline]
    #[must_use]
    pub fn effective_id(&self) -> &SessionId {
        self.confirmed_id.as_ref().unwrap_or(&self.provisional_id)
    }
}

// ============================================================================
// NegotiationState / ResendAction
// ============================================================================

/// Negotiation state for the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No confirmation received on this connection yet.
    Unsynchronized,
    /// Confirmation received.
    Synchronized,
}

/// Outcome of a resend timer tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ResendAction {
    /// Nothing to do.
    Idle,
    /// Send this announcement again.
    Resend(Value),
    /// Resends exhausted; surface a negotiation timeout.
    TimedOut,
}

// ============================================================================
// SessionNegotiator
// ============================================================================

/// Owner of [`SessionIdentity`].
pub struct SessionNegotiator {
    identity: SessionIdentity,
    capabilities: Capabilities,
    config: NegotiationConfig,
    resends: u32,
    timed_out: bool,
    listeners: Vec<IdentityListener>,
}

impl fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("identity", &self.identity)
            .field("resends", &self.resends)
            .field("timed_out", &self.timed_out)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl SessionNegotiator {
    /// Creates a negotiator, restoring the provisional id from `store` or
    /// generating and persisting a new one.
    pub fn new(
        store: &dyn SessionStore,
        capabilities: Capabilities,
        config: NegotiationConfig,
    ) -> Self {
        let provisional_id = match store.get(PROVISIONAL_ID_KEY).and_then(SessionId::new) {
            Some(id) => {
                debug!(session_id = %id, "Restored provisional session id");
                id
            }
            None => {
                let id = SessionId::generate();
                if let Err(e) = store.set(PROVISIONAL_ID_KEY, id.as_str()) {
                    warn!(error = %e, "Failed to persist provisional session id");
                }
                info!(session_id = %id, "Generated provisional session id");
                id
            }
        };

        Self {
            identity: SessionIdentity {
                provisional_id,
                confirmed_id: None,
                synchronized: false,
            },
            capabilities,
            config,
            resends: 0,
            timed_out: false,
            listeners: Vec::new(),
        }
    }

    /// Subscribes to identity changes.
    pub fn on_identity_change(&mut self, listener: IdentityListener) {
        self.listeners.push(listener);
    }

    /// Returns a copy of the identity.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> SessionIdentity {
        self.identity.clone()
    }

    /// The id outbound traffic should carry.
    #[inline]
    #[must_use]
    pub fn current_id(&self) -> &SessionId {
        self.identity.effective_id()
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> NegotiationState {
        if self.identity.synchronized {
            NegotiationState::Synchronized
        } else {
            NegotiationState::Unsynchronized
        }
    }

    /// Resend configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> NegotiationConfig {
        self.config
    }

    /// Starts negotiation for a fresh connection.
    ///
    /// Returns the announcement to send, tagged with the confirmed id if one
    /// survives from an earlier connection, else the provisional id.
    pub fn on_connection_opened(&mut self) -> Value {
        self.identity.synchronized = false;
        self.resends = 0;
        self.timed_out = false;

        debug!(session_id = %self.current_id(), "Announcing capabilities");
        self.announcement()
    }

    /// Handles `session_init`.
    ///
    /// Returns the re-announcement under the confirmed id, or `None` for a
    /// duplicate confirmation of the id already in force.
    pub fn on_session_init(&mut self, session_id: SessionId) -> Option<Value> {
        self.confirm(session_id, "session_init")
    }

    /// Handles `capabilities_ack`; only an ack carrying an id confirms.
    pub fn on_capabilities_ack(&mut self, server_session_id: Option<SessionId>) -> Option<Value> {
        match server_session_id {
            Some(id) => self.confirm(id, "capabilities_ack"),
            None => {
                debug!("capabilities_ack without server_session_id");
                None
            }
        }
    }

    /// Advances the resend timer.
    pub fn on_resend_tick(&mut self) -> ResendAction {
        if self.identity.synchronized || self.timed_out {
            return ResendAction::Idle;
        }

        if self.resends < self.config.max_resends {
            self.resends += 1;
            debug!(
                attempt = self.resends,
                max = self.config.max_resends,
                "Resending unconfirmed announcement"
            );
            return ResendAction::Resend(self.announcement());
        }

        self.timed_out = true;
        warn!(resends = self.resends, "Session confirmation never arrived");
        ResendAction::TimedOut
    }

    /// Number of resends on the current connection.
    #[inline]
    #[must_use]
    pub fn resends(&self) -> u32 {
        self.resends
    }

    /// Forgets the confirmed id; the next connection announces provisionally.
    pub fn invalidate(&mut self) {
        if self.identity.confirmed_id.take().is_some() {
            self.identity.synchronized = false;
            info!(session_id = %self.identity.provisional_id, "Confirmed session id invalidated");
            self.notify();
        }
    }

    fn confirm(&mut self, session_id: SessionId, source: &str) -> Option<Value> {
        if self.identity.synchronized && self.identity.confirmed_id.as_ref() == Some(&session_id) {
            debug!(session_id = %session_id, source, "Duplicate confirmation ignored");
            return None;
        }

        let changed = *self.current_id() != session_id;
        self.identity.confirmed_id = Some(session_id);
        self.identity.synchronized = true;

        info!(session_id = %self.current_id(), source, changed, "Session synchronized");

        if changed {
            self.notify();
        }

        Some(self.announcement())
    }

    fn announcement(&self) -> Value {
        capabilities_announcement(self.current_id(), &self.capabilities)
    }

    fn notify(&self) {
        let id = self.current_id();
        for listener in &self.listeners {
            listener(id);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
