//! Bounded outbound queue.
//!
//! Holds messages that could not be sent because the transport was not open
//! or a write failed. Capacity overflow evicts the oldest entry; entries older
//! than `max_age` at drain time are dropped instead of sent.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Default capacity.
pub const DEFAULT_MAX_QUEUED: usize = 256;

/// Default maximum age of a queued message.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30);

// ============================================================================
// QueueConfig
// ============================================================================

/// Outbound queue limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of buffered messages.
    pub max_queued: usize,

    /// Messages older than this at drain time are dropped.
    #[serde(rename = "max_age_ms", with = "crate::client::options::millis")]
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued: DEFAULT_MAX_QUEUED,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

// ============================================================================
// MessageSink
// ============================================================================

/// Destination a queue drains into.
pub trait MessageSink {
    /// Returns `true` when the sink can accept messages.
    fn is_ready(&self) -> bool;

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Any error stops the drain; the message stays queued.
    fn send_message(&self, payload: &Value) -> Result<()>;
}

// ============================================================================
// OutboundMessage
// ============================================================================

/// A buffered outbound payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Opaque structured record.
    pub payload: Value,
    /// When the message entered the queue.
    pub enqueued_at: Instant,
}

// ============================================================================
// DrainReport
// ============================================================================

/// Result of a drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages handed to the sink.
    pub sent: usize,
    /// Messages dropped for age.
    pub expired: usize,
    /// Messages still queued afterwards.
    pub remaining: usize,
}

// ============================================================================
// OutboundQueue
// ============================================================================

/// FIFO buffer with oldest-first eviction.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<OutboundMessage>,
    config: QueueConfig,
}

impl OutboundQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.max_queued.min(DEFAULT_MAX_QUEUED)),
            config,
        }
    }

    /// Number of queued messages.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the configured limits.
    #[inline]
    #[must_use]
    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Appends a payload, evicting the oldest entry if full.
    ///
    /// Returns the evicted message, if any. With `max_queued == 0` the
    /// payload itself is returned as evicted.
    pub fn enqueue(&mut self, payload: Value) -> Option<OutboundMessage> {
        self.enqueue_at(payload, Instant::now())
    }

    /// [`enqueue`](Self::enqueue) with an explicit clock reading.
    pub fn enqueue_at(&mut self, payload: Value, now: Instant) -> Option<OutboundMessage> {
        let message = OutboundMessage {
            payload,
            enqueued_at: now,
        };

        if self.config.max_queued == 0 {
            warn!("Outbound queue disabled (capacity 0), dropping message");
            return Some(message);
        }

        let evicted = if self.entries.len() >= self.config.max_queued {
            self.entries.pop_front()
        } else {
            None
        };

        if evicted.is_some() {
            warn!(
                capacity = self.config.max_queued,
                "Outbound queue full, evicted oldest message"
            );
        }

        self.entries.push_back(message);
        trace!(queued = self.entries.len(), "Message queued");
        evicted
    }

    /// Puts payloads that never reached the wire back at the head of the
    /// queue, keeping their order ahead of anything queued since.
    ///
    /// Capacity is enforced afterwards by evicting oldest first. Returns the
    /// number of evicted messages.
    pub fn requeue_front(&mut self, payloads: Vec<Value>, now: Instant) -> usize {
        let restored = payloads.len();
        for payload in payloads.into_iter().rev() {
            self.entries.push_front(OutboundMessage {
                payload,
                enqueued_at: now,
            });
        }

        let mut evicted = 0;
        while self.entries.len() > self.config.max_queued {
            self.entries.pop_front();
            evicted += 1;
        }

        if evicted > 0 {
            warn!(
                evicted,
                capacity = self.config.max_queued,
                "Outbound queue full while restoring unsent messages"
            );
        }
        debug!(restored, queued = self.entries.len(), "Restored unsent messages");
        evicted
    }

    /// Sends queued messages in order until empty or the sink fails.
    pub fn drain_into(&mut self, sink: &dyn MessageSink) -> DrainReport {
        self.drain_into_at(sink, Instant::now())
    }

    /// [`drain_into`](Self::drain_into) with an explicit clock reading.
    pub fn drain_into_at(&mut self, sink: &dyn MessageSink, now: Instant) -> DrainReport {
        let mut report = DrainReport::default();

        if !sink.is_ready() {
            report.remaining = self.entries.len();
            return report;
        }

        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.enqueued_at) > self.config.max_age {
                self.entries.pop_front();
                report.expired += 1;
                continue;
            }

            if let Err(e) = sink.send_message(&front.payload) {
                debug!(error = %e, "Drain interrupted, keeping remaining messages");
                break;
            }

            self.entries.pop_front();
            report.sent += 1;
        }

        report.remaining = self.entries.len();

        if report.expired > 0 {
            warn!(expired = report.expired, "Dropped stale queued messages");
        }
        if report.sent > 0 {
            debug!(
                sent = report.sent,
                remaining = report.remaining,
                "Drained outbound queue"
            );
        }

        report
    }

    /// Drops every queued message.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}

// ============================================================================
// Tests
// ============================================================================
