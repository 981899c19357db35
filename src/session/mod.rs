//! Session identity.
//!
//! Reconciles the client-chosen provisional id with the id the server
//! assigns, and persists the provisional id across restarts.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `negotiator` | Identity state machine |
//! | `store` | Persisted key/value storage |

// ============================================================================
// Submodules
// ============================================================================

/// Identity negotiation state machine.
pub mod negotiator;

/// Persisted key/value storage.
pub mod store;

// ============================================================================
// Re-exports
// ============================================================================

pub use negotiator::{
    IdentityListener, NegotiationConfig, NegotiationState, ResendAction, SessionIdentity,
    SessionNegotiator,
};
pub use store::{FileStore, MemoryStore, PROVISIONAL_ID_KEY, SessionStore};
