//! Connection owner.
//!
//! [`Transport`] is the only writer of [`ConnectionState`] and the connection
//! generation. Every event it emits carries the generation of the connection
//! it came from, so consumers can drop events from superseded connections.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::Generation;
use crate::queue::MessageSink;

use super::link::{Connector, Link, LinkCommand, LinkEvent};

// ============================================================================
// Types
// ============================================================================

/// Receiving half of the transport event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle of the single current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// Open in progress.
    Connecting,
    /// Ready for traffic.
    Open,
    /// Close in progress.
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        })
    }
}

// ============================================================================
// CloseReason
// ============================================================================

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed through [`Transport::close`] by the application.
    Requested,
    /// Closed by the heartbeat monitor.
    HeartbeatTimeout,
    /// Dropped by the peer or the network.
    Remote(Option<String>),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed by client"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::Remote(Some(reason)) => write!(f, "closed by remote: {reason}"),
            Self::Remote(None) => f.write_str("closed by remote"),
        }
    }
}

// ============================================================================
// TransportEvent
// ============================================================================

/// What happened on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Connection established.
    Opened,
    /// Connection ended. Emitted once per generation.
    Closed(CloseReason),
    /// Raw text frame received.
    MessageReceived(String),
    /// Non-fatal carrier error.
    TransportError(String),
    /// Frames accepted by [`Transport::send`] that never reached the wire,
    /// in send order. Precedes the generation's `Closed` when the link drops.
    Undelivered(Vec<String>),
}

/// A transport event tagged with its connection generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Connection the event belongs to.
    pub generation: Generation,
    /// Event payload.
    pub kind: TransportEventKind,
}

// ============================================================================
// OpenOutcome
// ============================================================================

/// Result of [`Transport::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new connection was established.
    Opened(Generation),
    /// A connection was already open; nothing was done.
    AlreadyOpen(Generation),
    /// An open was already in progress; nothing was done.
    AlreadyConnecting,
}

// ============================================================================
// Transport
// ============================================================================

/// Mutable connection slot, guarded as one unit.
struct Slot {
    state: ConnectionState,
    generation: Generation,
    writer: Option<mpsc::UnboundedSender<LinkCommand>>,
}

/// Shared transport state.
struct TransportInner {
    connector: Arc<dyn Connector>,
    slot: Mutex<Slot>,
    next_generation: AtomicU64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Single duplex connection with generation tagging.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Transport")
            .field("state", &slot.state)
            .field("generation", &slot.generation)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Creates a disconnected transport and its event stream.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>) -> (Self, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(TransportInner {
                connector,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    generation: Generation::NONE,
                    writer: None,
                }),
                next_generation: AtomicU64::new(1),
                events: events_tx,
            }),
        };
        (transport, events_rx)
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.slot.lock().state
    }

    /// Generation of the most recent connection.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.slot.lock().generation
    }

    /// Returns `true` if `generation` is the open connection.
    #[inline]
    #[must_use]
    pub fn is_current(&self, generation: Generation) -> bool {
        let slot = self.inner.slot.lock();
        slot.state == ConnectionState::Open && slot.generation == generation
    }

    /// Opens a connection to `address`.
    ///
    /// A no-op returning the current state if already open or connecting.
    ///
    /// # Errors
    ///
    /// - [`Error::Connect`] / [`Error::ConnectTimeout`] from the connector
    /// - [`Error::ConnectionClosed`] if [`close`](Self::close) was called
    ///   while the connect was in flight
    pub async fn open(&self, address: &str) -> Result<OpenOutcome> {
        {
            let mut slot = self.inner.slot.lock();
            match slot.state {
                ConnectionState::Open => return Ok(OpenOutcome::AlreadyOpen(slot.generation)),
                ConnectionState::Connecting => return Ok(OpenOutcome::AlreadyConnecting),
                ConnectionState::Disconnected | ConnectionState::Closing => {
                    slot.state = ConnectionState::Connecting;
                }
            }
        }

        debug!(%address, "Opening connection");

        let link = match self.inner.connector.connect(address).await {
            Ok(link) => link,
            Err(e) => {
                let mut slot = self.inner.slot.lock();
                if slot.state == ConnectionState::Connecting {
                    slot.state = ConnectionState::Disconnected;
                }
                warn!(%address, error = %e, "Connect failed");
                return Err(e);
            }
        };

        let Link { commands, events } = link;

        let generation = {
            let mut slot = self.inner.slot.lock();
            if slot.state != ConnectionState::Connecting {
                debug!("Close requested during connect, discarding new connection");
                let _ = commands.send(LinkCommand::Close(None));
                return Err(Error::ConnectionClosed);
            }

            let generation =
                Generation::from_u64(self.inner.next_generation.fetch_add(1, Ordering::SeqCst));
            slot.state = ConnectionState::Open;
            slot.generation = generation;
            slot.writer = Some(commands);

            // Emitted under the lock so `Opened` precedes any frame of this generation.
            self.inner.emit(generation, TransportEventKind::Opened);
            generation
        };

        info!(%address, %generation, "Connection open");

        tokio::spawn(Arc::clone(&self.inner).read_loop(generation, events));

        Ok(OpenOutcome::Opened(generation))
    }

    /// Sends a JSON payload.
    ///
    /// `Ok` means the connection task accepted the frame. Frames it never
    /// writes come back as [`TransportEventKind::Undelivered`].
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the state is `Open`
    /// - [`Error::SendFailed`] if the connection task is gone
    /// - [`Error::Json`] if the payload cannot be serialized
    pub fn send(&self, payload: &Value) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.send_text(text)
    }

    /// Sends a raw text frame.
    ///
    /// # Errors
    ///
    /// Same as [`send`](Self::send).
    pub fn send_text(&self, text: String) -> Result<()> {
        let slot = self.inner.slot.lock();
        if slot.state != ConnectionState::Open {
            return Err(Error::NotConnected);
        }
        let writer = slot.writer.as_ref().ok_or(Error::NotConnected)?;
        writer
            .send(LinkCommand::Text(text))
            .map_err(|_| Error::send_failed("connection task terminated"))
    }

    /// Closes the current connection.
    ///
    /// Returns `false` if there was nothing to close. Emits exactly one
    /// `Closed` event for an open connection.
    pub fn close(&self, reason: CloseReason) -> bool {
        let mut slot = self.inner.slot.lock();
        match slot.state {
            ConnectionState::Disconnected => false,
            ConnectionState::Connecting => {
                debug!("Abandoning in-flight connect");
                slot.state = ConnectionState::Disconnected;
                true
            }
            ConnectionState::Open | ConnectionState::Closing => {
                slot.state = ConnectionState::Closing;
                if let Some(writer) = slot.writer.take() {
                    let _ = writer.send(LinkCommand::Close(Some(reason.to_string())));
                }
                slot.state = ConnectionState::Disconnected;

                info!(generation = %slot.generation, %reason, "Connection closed");
                self.inner
                    .emit(slot.generation, TransportEventKind::Closed(reason));
                true
            }
        }
    }
}

impl MessageSink for Transport {
    fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn send_message(&self, payload: &Value) -> Result<()> {
        self.send(payload)
    }
}

// ============================================================================
// TransportInner - Event Plumbing
// ============================================================================

impl TransportInner {
    fn emit(&self, generation: Generation, kind: TransportEventKind) {
        let _ = self.events.send(TransportEvent { generation, kind });
    }

    /// Forwards link events until the link closes.
    async fn read_loop(
        self: Arc<Self>,
        generation: Generation,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        let mut reason = None;
        let mut unsent = Vec::new();

        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Text(text) => {
                    self.emit(generation, TransportEventKind::MessageReceived(text));
                }
                LinkEvent::Error(detail) => {
                    self.emit(generation, TransportEventKind::TransportError(detail));
                }
                LinkEvent::Closed {
                    reason: remote_reason,
                    unsent: frames,
                } => {
                    reason = remote_reason;
                    unsent = frames;
                    break;
                }
            }
        }

        // Reported even after a local close so the frames can be resent.
        if !unsent.is_empty() {
            warn!(%generation, count = unsent.len(), "Frames never reached the wire");
            self.emit(generation, TransportEventKind::Undelivered(unsent));
        }

        self.on_link_closed(generation, CloseReason::Remote(reason));
    }

    /// Marks the connection closed if `generation` is still the open one.
    fn on_link_closed(&self, generation: Generation, reason: CloseReason) {
        let mut slot = self.slot.lock();
        if slot.generation != generation || slot.state != ConnectionState::Open {
            debug!(%generation, "Link ended after close, nothing to do");
            return;
        }

        slot.state = ConnectionState::Disconnected;
        slot.writer = None;
        warn!(%generation, %reason, "Connection lost");
        self.emit(generation, TransportEventKind::Closed(reason));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::transport::link::RemoteEnd;

    /// Connector handing out pre-built links, failing when empty.
    struct ScriptedConnector {
        links: Mutex<Vec<Link>>,
    }

    impl ScriptedConnector {
        fn new(count: usize) -> (Arc<Self>, Vec<RemoteEnd>) {
            let mut links = Vec::new();
            let mut remotes = Vec::new();
            for _ in 0..count {
                let (link, remote) = Link::in_memory();
                links.push(link);
                remotes.push(remote);
            }
            links.reverse();
            (
                Arc::new(Self {
                    links: Mutex::new(links),
                }),
                remotes,
            )
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, address: &str) -> Result<Link> {
            self.links
                .lock()
                .pop()
                .ok_or_else(|| Error::connect(address, "refused"))
        }
    }

    #[tokio::test]
    async fn test_open_send_receive() {
        let (connector, mut remotes) = ScriptedConnector::new(1);
        let (transport, mut events) = Transport::new(connector);
        let mut remote = remotes.remove(0);

        let outcome = transport.open("ws://test").await.unwrap();
        let OpenOutcome::Opened(generation) = outcome else {
            panic!("expected open");
        };
        assert_eq!(transport.state(), ConnectionState::Open);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent {
                generation,
                kind: TransportEventKind::Opened
            }
        );

        transport.send(&json!({"type": "ping"})).unwrap();
        assert_eq!(remote.recv_json().await.unwrap()["type"], "ping");

        remote.send_text(r#"{"type":"pong"}"#);
        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::MessageReceived(r#"{"type":"pong"}"#.into())
        );
    }

    #[tokio::test]
    async fn test_second_open_is_noop() {
        let (connector, _remotes) = ScriptedConnector::new(2);
        let (transport, _events) = Transport::new(connector);

        let OpenOutcome::Opened(generation) = transport.open("ws://test").await.unwrap() else {
            panic!("expected open");
        };
        assert_eq!(
            transport.open("ws://test").await.unwrap(),
            OpenOutcome::AlreadyOpen(generation)
        );
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_closed() {
        let (connector, _remotes) = ScriptedConnector::new(0);
        let (transport, _events) = Transport::new(connector);
        assert!(matches!(
            transport.send(&json!({"type": "x"})),
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let (connector, _remotes) = ScriptedConnector::new(0);
        let (transport, _events) = Transport::new(connector);
        assert!(transport.open("ws://test").await.is_err());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_generation_increases_and_stale_is_not_current() {
        let (connector, _remotes) = ScriptedConnector::new(2);
        let (transport, _events) = Transport::new(connector);

        let OpenOutcome::Opened(first) = transport.open("ws://a").await.unwrap() else {
            panic!();
        };
        transport.close(CloseReason::Requested);
        let OpenOutcome::Opened(second) = transport.open("ws://a").await.unwrap() else {
            panic!();
        };

        assert!(second > first);
        assert!(!transport.is_current(first));
        assert!(transport.is_current(second));
    }

    #[tokio::test]
    async fn test_close_emits_once() {
        let (connector, mut remotes) = ScriptedConnector::new(1);
        let (transport, mut events) = Transport::new(connector);
        let mut remote = remotes.remove(0);

        transport.open("ws://a").await.unwrap();
        events.recv().await.unwrap();

        assert!(transport.close(CloseReason::HeartbeatTimeout));
        assert!(!transport.close(CloseReason::Requested));
        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Closed(CloseReason::HeartbeatTimeout)
        );
        assert_eq!(
            remote.recv().await,
            Some(LinkCommand::Close(Some("heartbeat timeout".into())))
        );

        // Late peer close of the same generation is swallowed.
        remote.close(None);
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_close_transitions_to_disconnected() {
        let (connector, mut remotes) = ScriptedConnector::new(1);
        let (transport, mut events) = Transport::new(connector);
        let mut remote = remotes.remove(0);

        transport.open("ws://a").await.unwrap();
        events.recv().await.unwrap();

        remote.close(Some("server restart".into()));
        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Closed(CloseReason::Remote(Some("server restart".into())))
        );
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_unread_frames_reported_before_close() {
        let (connector, mut remotes) = ScriptedConnector::new(1);
        let (transport, mut events) = Transport::new(connector);
        let mut remote = remotes.remove(0);

        transport.open("ws://a").await.unwrap();
        events.recv().await.unwrap();

        transport.send(&json!({"type": "chat", "n": 1})).unwrap();
        transport.send(&json!({"type": "chat", "n": 2})).unwrap();
        remote.close(None);

        let TransportEventKind::Undelivered(frames) = events.recv().await.unwrap().kind else {
            panic!("expected undelivered frames");
        };
        let order: Vec<Value> = frames
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(1), json!(2)]);
        assert_eq!(
            events.recv().await.unwrap().kind,
            TransportEventKind::Closed(CloseReason::Remote(None))
        );
    }
}
