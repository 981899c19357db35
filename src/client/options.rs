//! Client tuning options.
//!
//! Every knob has a `const` default and a `with_*` builder method. Options
//! can also be loaded from JSON, with durations given in milliseconds:
//!
//! ```
//! use session_link::ClientOptions;
//!
//! let options = ClientOptions::from_json(r#"{
//!     "reconnect": { "base_delay_ms": 500, "max_delay_ms": 8000, "max_attempts": 6 },
//!     "heartbeat": { "interval_ms": 2000, "timeout_ms": 6000 },
//!     "queue": { "max_queued": 64 }
//! }"#).unwrap();
//!
//! assert_eq!(options.queue.max_queued, 64);
//! assert!(options.auto_reconnect);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatConfig;
use crate::queue::QueueConfig;
use crate::reconnect::ReconnectPolicy;
use crate::session::NegotiationConfig;
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

// ============================================================================
// ClientOptions
// ============================================================================

/// Behavioral configuration of a [`Client`](super::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,

    /// Liveness probing.
    pub heartbeat: HeartbeatConfig,

    /// Offline buffering limits.
    pub queue: QueueConfig,

    /// Announcement resend cadence.
    pub negotiation: NegotiationConfig,

    /// Buffer sends while offline instead of failing them.
    pub queue_when_offline: bool,

    /// Reconnect automatically after drops and failed opens.
    pub auto_reconnect: bool,

    /// Handshake timeout for the default WebSocket connector.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,

    /// Capacity of the client event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            negotiation: NegotiationConfig::default(),
            queue_when_offline: true,
            auto_reconnect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_capacity: 64,
        }
    }
}

impl ClientOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses options from JSON; missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is invalid or fails validation.
    pub fn from_json(text: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("invalid client options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Sets the reconnect policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets heartbeat timing.
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat = HeartbeatConfig { interval, timeout };
        self
    }

    /// Sets queue limits.
    #[inline]
    #[must_use]
    pub fn with_queue(mut self, max_queued: usize, max_age: Duration) -> Self {
        self.queue = QueueConfig {
            max_queued,
            max_age,
        };
        self
    }

    /// Sets announcement resend cadence.
    #[inline]
    #[must_use]
    pub fn with_negotiation(mut self, resend_interval: Duration, max_resends: u32) -> Self {
        self.negotiation = NegotiationConfig {
            resend_interval,
            max_resends,
        };
        self
    }

    /// Enables or disables offline queueing.
    #[inline]
    #[must_use]
    pub fn with_queue_when_offline(mut self, enabled: bool) -> Self {
        self.queue_when_offline = enabled;
        self
    }

    /// Enables or disables automatic reconnects.
    #[inline]
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Sets the WebSocket handshake timeout.
    #[inline]
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect.base_delay.is_zero() {
            return Err(Error::config("reconnect base delay must be positive"));
        }
        if self.reconnect.max_delay < self.reconnect.base_delay {
            return Err(Error::config("reconnect max delay must not be below base delay"));
        }
        if self.heartbeat.is_enabled() && self.heartbeat.timeout.is_zero() {
            return Err(Error::config("heartbeat timeout must be positive"));
        }
        if self.negotiation.resend_interval.is_zero() {
            return Err(Error::config("announcement resend interval must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::config("connect timeout must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(Error::config("event capacity must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Duration (de)serialization
// ============================================================================

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Tests
// ============================================================================
