//! Inbound message routing.
//!
//! Decodes frames and invokes every handler registered for the frame's
//! `type`, in registration order. Each handler call is isolated: a panicking
//! handler is logged and the remaining handlers still run.
//!
//! Handlers run on the transport's receive path and must not block. Slow
//! work belongs in a spawned task:
//!
//! ```ignore
//! router.register("transcript", move |msg| {
//!     let text = msg.str_field("text").unwrap_or_default().to_string();
//!     tokio::spawn(async move { store_transcript(text).await });
//! });
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::identifiers::{HandlerId, SessionId};
use crate::protocol::{InboundMessage, decode};

// ============================================================================
// Types
// ============================================================================

/// Message handler callback.
pub type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Handlers per type tag, in registration order.
type Registry = FxHashMap<String, Vec<(HandlerId, Handler)>>;

// ============================================================================
// DispatchOutcome
// ============================================================================

/// Result of dispatching one well-formed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Number of handlers invoked (including ones that panicked).
    Handled(usize),
    /// No handler registered for the tag.
    Unhandled,
}

// ============================================================================
// MessageRouter
// ============================================================================

/// Type-keyed handler registry and dispatcher.
#[derive(Default)]
pub struct MessageRouter {
    handlers: RwLock<Registry>,
    default_session: RwLock<Option<SessionId>>,
}

impl MessageRouter {
    /// Creates an empty router.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `tag`.
    pub fn register<F>(&self, tag: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = HandlerId::next();
        let tag = tag.into();
        debug!(%tag, handler = %id, "Handler registered");
        self.handlers
            .write()
            .entry(tag)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns `false` if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;

        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(hid, _)| *hid != id);
            removed |= list.len() != before;
            !list.is_empty()
        });

        if removed {
            debug!(handler = %id, "Handler unregistered");
        }
        removed
    }

    /// Number of handlers for `tag`.
    #[must_use]
    pub fn handler_count(&self, tag: &str) -> usize {
        self.handlers.read().get(tag).map_or(0, Vec::len)
    }

    /// Sets the session id attached to frames that carry none.
    pub fn set_default_session(&self, session_id: SessionId) {
        *self.default_session.write() = Some(session_id);
    }

    /// Returns the default session tag.
    #[must_use]
    pub fn default_session(&self) -> Option<SessionId> {
        self.default_session.read().clone()
    }

    /// Decodes and dispatches a raw frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedMessage`](crate::Error::MalformedMessage) if
    /// the frame fails validation; nothing is dispatched in that case.
    pub fn dispatch(&self, raw: &str) -> Result<DispatchOutcome> {
        let message = match decode(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                return Err(e);
            }
        };

        let message = message.with_default_session(self.default_session.read().as_ref());
        Ok(self.dispatch_message(&message))
    }

    /// Dispatches an already decoded message.
    pub fn dispatch_message(&self, message: &InboundMessage) -> DispatchOutcome {
        // Snapshot so handlers may (un)register without deadlocking.
        let handlers: Vec<(HandlerId, Handler)> = match self.handlers.read().get(message.kind()) {
            Some(list) => list.clone(),
            None => {
                debug!(kind = message.kind(), "No handler for message type");
                return DispatchOutcome::Unhandled;
            }
        };

        for (id, handler) in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                error!(kind = message.kind(), handler = %id, "Message handler panicked");
            }
        }

        DispatchOutcome::Handled(handlers.len())
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("MessageRouter")
            .field("tags", &handlers.len())
            .field("default_session", &*self.default_session.read())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
