//! Heartbeat liveness monitor.
//!
//! A tick-driven state machine. Every tick either sends a probe (nothing
//! outstanding), keeps waiting, or declares the connection dead once the
//! outstanding probe is older than `timeout`. The dead check runs on every
//! tick, so a stalled connection is caught even though no new probe goes out
//! while one is pending.
//!
//! Ticks alone would only notice a timeout on the next interval boundary.
//! Drivers therefore also wake at [`HeartbeatMonitor::deadline`] and tick
//! there.
//!
//! One monitor exists per open connection; reconnecting creates a new one.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

// ============================================================================
// Constants
// ============================================================================

/// Default probe interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default time to wait for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Margin past `timeout` at which a tick is guaranteed to report death.
const DEADLINE_SLACK: Duration = Duration::from_millis(1);

// ============================================================================
// HeartbeatConfig
// ============================================================================

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Tick period. Zero disables the heartbeat.
    #[serde(rename = "interval_ms", with = "crate::client::options::millis")]
    pub interval: Duration,

    /// Maximum wait for a `pong`.
    #[serde(rename = "timeout_ms", with = "crate::client::options::millis")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl HeartbeatConfig {
    /// Returns `true` if the heartbeat should run.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

// ============================================================================
// HeartbeatState
// ============================================================================

/// Probe bookkeeping for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    /// When the outstanding (or last) probe was sent.
    pub last_probe_sent_at: Option<Instant>,
    /// Whether a probe is waiting for its reply.
    pub awaiting_reply: bool,
}

// ============================================================================
// HeartbeatAction
// ============================================================================

/// What the caller must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a `ping` now.
    SendProbe,
    /// Probe outstanding, still within timeout (or already declared dead).
    Waiting,
    /// Close the transport and evaluate a reconnect.
    Dead,
}

// ============================================================================
// HeartbeatMonitor
// ============================================================================

/// Liveness state machine for a single connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: HeartbeatState,
    last_rtt: Option<Duration>,
    dead: bool,
}

impl HeartbeatMonitor {
    /// Creates a fresh monitor.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: HeartbeatState::default(),
            last_rtt: None,
            dead: false,
        }
    }

    /// Current probe state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Round-trip time of the last answered probe.
    #[inline]
    #[must_use]
    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Earliest instant at which [`tick`](Self::tick) reports
    /// [`HeartbeatAction::Dead`], or `None` while no probe is outstanding.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        if self.dead || !self.state.awaiting_reply {
            return None;
        }
        self.state
            .last_probe_sent_at
            .map(|sent| sent + self.config.timeout + DEADLINE_SLACK)
    }

    /// Advances the state machine.
    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        if self.dead {
            return HeartbeatAction::Waiting;
        }

        if !self.state.awaiting_reply {
            self.state.awaiting_reply = true;
            self.state.last_probe_sent_at = Some(now);
            trace!("Heartbeat probe due");
            return HeartbeatAction::SendProbe;
        }

        let elapsed = self
            .state
            .last_probe_sent_at
            .map(|sent| now.saturating_duration_since(sent))
            .unwrap_or_default();

        if elapsed > self.config.timeout {
            self.dead = true;
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "Heartbeat timed out, connection considered dead"
            );
            return HeartbeatAction::Dead;
        }

        HeartbeatAction::Waiting
    }

    /// Records a `pong`.
    ///
    /// Returns `false` and changes nothing if no probe was outstanding.
    pub fn on_pong(&mut self, now: Instant) -> bool {
        if !self.state.awaiting_reply || self.dead {
            debug!("Unsolicited pong ignored");
            return false;
        }

        self.state.awaiting_reply = false;
        self.last_rtt = self
            .state
            .last_probe_sent_at
            .map(|sent| now.saturating_duration_since(sent));
        trace!(rtt = ?self.last_rtt, "Heartbeat reply received");
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
