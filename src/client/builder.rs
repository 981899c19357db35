//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use session_link::{Client, ClientOptions, FileStore};
//!
//! # fn example() -> session_link::Result<()> {
//! let client = Client::builder()
//!     .address("wss://voice.example.com/ws")
//!     .store(FileStore::new("/var/lib/avatar/session.json"))
//!     .options(ClientOptions::new().with_heartbeat(Duration::from_secs(5), Duration::from_secs(10)))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};
use crate::protocol::Capabilities;
use crate::session::{MemoryStore, SessionNegotiator, SessionStore};
use crate::transport::{Connector, WebSocketConnector};

use super::core::Client;
use super::options::ClientOptions;

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct ClientBuilder {
    /// Server endpoint.
    address: Option<String>,
    /// Carrier override.
    connector: Option<Arc<dyn Connector>>,
    /// Provisional id storage.
    store: Option<Arc<dyn SessionStore>>,
    /// Announced capabilities.
    capabilities: Capabilities,
    /// Behavioral options.
    options: ClientOptions,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("address", &self.address)
            .field("custom_connector", &self.connector.is_some())
            .field("custom_store", &self.store.is_some())
            .field("capabilities", &self.capabilities)
            .field("options", &self.options)
            .finish()
    }
}

// ============================================================================
// ClientBuilder Implementation
// ============================================================================

impl ClientBuilder {
    /// Creates a new builder with default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server endpoint (`ws://` or `wss://`).
    #[inline]
    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Replaces the WebSocket carrier.
    ///
    /// Used to run the client over an in-memory [`Link`](crate::transport::Link)
    /// or a custom transport.
    #[inline]
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets where the provisional session id is persisted.
    ///
    /// Defaults to an in-process [`MemoryStore`].
    #[inline]
    #[must_use]
    pub fn store(mut self, store: impl SessionStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Sets the capabilities announced on every connection.
    #[inline]
    #[must_use]
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets behavioral options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the client with validation.
    ///
    /// Does not connect; call [`Client::connect`] afterwards.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the address is missing or not a WebSocket URL
    /// - [`Error::Config`] if the options fail validation
    pub fn build(self) -> Result<Client> {
        let address = self.validate_address()?;
        self.options.validate()?;

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new(self.options.connect_timeout)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let negotiator =
            SessionNegotiator::new(store.as_ref(), self.capabilities, self.options.negotiation);

        Ok(Client::new(address, connector, negotiator, self.options))
    }

    fn validate_address(&self) -> Result<String> {
        let address = self
            .address
            .as_deref()
            .ok_or_else(|| Error::config("server address is required"))?;

        let url = Url::parse(address)
            .map_err(|e| Error::config(format!("invalid server address '{address}': {e}")))?;

        match url.scheme() {
            "ws" | "wss" => Ok(address.to_string()),
            other => Err(Error::config(format!(
                "unsupported scheme '{other}', expected ws or wss"
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
