//! Client composition root.
//!
//! The [`Client`] owns one instance of every component and wires them once at
//! construction:
//!
//! ```text
//! Transport ──TransportEvent──► supervisor ──► MessageRouter ──► handlers
//!     ▲                             │               │
//!     │                             │               ├─ pong ──────────► HeartbeatMonitor
//!     │                             │               └─ session_init ──► SessionNegotiator
//!     │                             ├─ Opened: announce, start timers, drain OutboundQueue
//!     └──── close / open ◄──────────┴─ Closed: stop timers, ReconnectPolicy
//! ```
//!
//! Per-connection timers (heartbeat, announcement resend) carry the
//! generation they were started for and stop on their first fire after that
//! generation is no longer current.
//!
//! User messages the connection accepted but never wrote come back as
//! `Undelivered` and go to the head of the [`OutboundQueue`] for the next
//! connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep, sleep_until};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::identifiers::{Generation, HandlerId};
use crate::protocol::{InboundMessage, ParsedMessage, kinds, ping, stamp};
use crate::queue::{MessageSink, OutboundQueue};
use crate::reconnect::{ReconnectAttemptState, ReconnectDecision};
use crate::router::MessageRouter;
use crate::session::{ResendAction, SessionIdentity, SessionNegotiator};
use crate::transport::{
    CloseReason, ConnectionState, Connector, OpenOutcome, Transport, TransportEvent,
    TransportEventKind, TransportEvents,
};

use super::builder::ClientBuilder;
use super::events::ClientEvent;
use super::options::ClientOptions;

// ============================================================================
// Delivery
// ============================================================================

/// What [`Client::send`] did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the open connection. Restored to the queue if the
    /// connection drops before writing it.
    Sent,
    /// Buffered for the next drain.
    Queued,
}

// ============================================================================
// ClientShared
// ============================================================================

/// State shared between the client handle, the supervisor and timers.
pub(crate) struct ClientShared {
    address: String,
    options: ClientOptions,
    transport: Transport,
    router: Arc<MessageRouter>,
    queue: Mutex<OutboundQueue>,
    negotiator: Mutex<SessionNegotiator>,
    heartbeat: Mutex<Option<(Generation, HeartbeatMonitor)>>,
    reconnect: Mutex<ReconnectAttemptState>,
    auto_reconnect: AtomicBool,
    /// Generation whose announcement has gone out; user traffic waits for it.
    announced: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
    transport_events: Mutex<Option<TransportEvents>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    timers: Mutex<Vec<(Generation, JoinHandle<()>)>>,
    retry: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Client
// ============================================================================

/// Persistent connection client with session negotiation.
///
/// Cloning yields another handle to the same client. Dropping the last
/// handle stops all background tasks and closes the connection.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use session_link::{Client, ClientEvent, Result};
///
/// # async fn example() -> Result<()> {
/// let client = Client::builder().address("wss://voice.example.com/ws").build()?;
/// let mut events = client.subscribe();
///
/// client.on("transcript", |msg| {
///     println!("heard: {:?}", msg.str_field("text"));
/// });
/// client.connect()?;
///
/// // Safe before the connection is up: buffered and drained on open.
/// client.send(json!({ "type": "avatar_state", "emote": "wave" }))?;
///
/// while let Ok(event) = events.recv().await {
///     if let Some(err) = event.terminal_error() {
///         eprintln!("needs attention: {err}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("queued", &self.queued_len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client - Constructor
// ============================================================================

impl Client {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Assembles the components and wires them together.
    pub(crate) fn new(
        address: String,
        connector: Arc<dyn Connector>,
        negotiator: SessionNegotiator,
        options: ClientOptions,
    ) -> Self {
        let (transport, transport_events) = Transport::new(connector);
        let (events, _) = broadcast::channel(options.event_capacity);
        let router = Arc::new(MessageRouter::new());

        let mut negotiator = negotiator;
        router.set_default_session(negotiator.current_id().clone());
        {
            let router = Arc::clone(&router);
            let events = events.clone();
            negotiator.on_identity_change(Box::new(move |id| {
                router.set_default_session(id.clone());
                let _ = events.send(ClientEvent::IdentityChanged {
                    session_id: id.clone(),
                });
            }));
        }
        let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
            register_core_handlers(&router, weak);

            ClientShared {
                address,
                queue: Mutex::new(OutboundQueue::new(options.queue)),
                negotiator: Mutex::new(negotiator),
                heartbeat: Mutex::new(None),
                reconnect: Mutex::new(ReconnectAttemptState::default()),
                auto_reconnect: AtomicBool::new(options.auto_reconnect),
                announced: AtomicU64::new(Generation::NONE.as_u64()),
                events,
                transport_events: Mutex::new(Some(transport_events)),
                supervisor: Mutex::new(None),
                timers: Mutex::new(Vec::new()),
                retry: Mutex::new(None),
                options,
                transport,
                router,
            }
        });

        Self { shared }
    }
}

/// Routes the session-core message types into the shared state.
fn register_core_handlers(router: &MessageRouter, weak: &Weak<ClientShared>) {
    let w = weak.clone();
    router.register(kinds::PONG, move |_| {
        if let Some(shared) = w.upgrade() {
            shared.handle_pong();
        }
    });

    let w = weak.clone();
    router.register(kinds::SESSION_INIT, move |msg| {
        if let Some(shared) = w.upgrade() {
            shared.handle_confirmation(msg);
        }
    });

    let w = weak.clone();
    router.register(kinds::CAPABILITIES_ACK, move |msg| {
        if let Some(shared) = w.upgrade() {
            shared.handle_confirmation(msg);
        }
    });
}

// ============================================================================
// Client - Public API
// ============================================================================

impl Client {
    /// Starts connecting in the background.
    ///
    /// Returns immediately; progress is reported through [`subscribe`](Self::subscribe).
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client was already shut down.
    pub fn connect(&self) -> Result<()> {
        self.shared.ensure_supervisor()?;
        self.shared
            .auto_reconnect
            .store(self.shared.options.auto_reconnect, Ordering::SeqCst);
        self.shared.spawn_open();
        Ok(())
    }

    /// Manual reconnect: clears the attempt counter and tries again now.
    ///
    /// This is the way out of [`ClientEvent::ReconnectExhausted`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the client was already shut down.
    pub fn reconnect(&self) -> Result<()> {
        self.shared.ensure_supervisor()?;
        self.shared.reconnect.lock().reset();
        self.shared.cancel_retry();
        self.shared
            .auto_reconnect
            .store(self.shared.options.auto_reconnect, Ordering::SeqCst);
        info!("Manual reconnect requested");
        self.shared.spawn_open();
        Ok(())
    }

    /// Closes the connection and stops automatic reconnects.
    pub fn disconnect(&self) {
        self.shared.auto_reconnect.store(false, Ordering::SeqCst);
        self.shared.cancel_retry();
        self.shared.transport.close(CloseReason::Requested);
    }

    /// Disconnects and stops every background task.
    pub fn shutdown(&self) {
        self.disconnect();
        self.shared.stop_tasks();
        info!("Client shut down");
    }

    /// Sends a payload, buffering it while offline.
    ///
    /// `timestamp` and `session_id` are filled in at write time, so buffered
    /// messages carry the session id in force when they are finally sent.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the payload has no non-empty `type`
    /// - [`Error::NotConnected`] / [`Error::SendFailed`] if offline queueing
    ///   is disabled and the message could not be written
    pub fn send(&self, payload: Value) -> Result<Delivery> {
        validate_outbound(&payload)?;
        self.shared.send_or_queue(payload)
    }

    /// Registers a handler for inbound messages of type `tag`.
    pub fn on<F>(&self, tag: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.shared.router.register(tag, handler)
    }

    /// Removes a handler registered with [`on`](Self::on).
    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.router.unregister(id)
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.transport.state()
    }

    /// Generation of the most recent connection.
    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.shared.transport.generation()
    }

    /// Snapshot of the session identity.
    #[must_use]
    pub fn session(&self) -> SessionIdentity {
        self.shared.negotiator.lock().snapshot()
    }

    /// Forgets the confirmed session id.
    pub fn invalidate_session(&self) {
        self.shared.negotiator.lock().invalidate();
    }

    /// Number of buffered outbound messages.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Configured endpoint.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Active options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.shared.options
    }
}

/// Rejects payloads that could never be sent.
fn validate_outbound(payload: &Value) -> Result<()> {
    match payload.get("type").and_then(Value::as_str) {
        Some(kind) if !kind.trim().is_empty() => Ok(()),
        _ if !payload.is_object() => {
            Err(Error::invalid_argument("outbound payload must be a JSON object"))
        }
        _ => Err(Error::invalid_argument("outbound payload needs a non-empty `type`")),
    }
}

// ============================================================================
// ClientShared - Sending
// ============================================================================

/// Drain target that session-tags each message.
struct SessionSink<'a>(&'a ClientShared);

impl MessageSink for SessionSink<'_> {
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    fn send_message(&self, payload: &Value) -> Result<()> {
        self.0.send_tagged(payload)
    }
}

impl ClientShared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Open and announced, so user traffic may flow.
    fn is_ready(&self) -> bool {
        let announced = Generation::from_u64(self.announced.load(Ordering::SeqCst));
        self.transport.is_current(announced)
    }

    /// Stamps a copy of `payload` with the current session and writes it.
    fn send_tagged(&self, payload: &Value) -> Result<()> {
        let mut payload = payload.clone();
        let session_id = self.negotiator.lock().current_id().clone();
        stamp(&mut payload, &session_id)?;
        self.transport.send(&payload)
    }

    fn send_or_queue(&self, payload: Value) -> Result<Delivery> {
        // The queue lock orders direct sends against drains.
        let mut queue = self.queue.lock();
        let ready = self.is_ready();

        if ready && queue.is_empty() {
            match self.send_tagged(&payload) {
                Ok(()) => return Ok(Delivery::Sent),
                Err(e) if e.is_send_error() && self.options.queue_when_offline => {
                    trace!(error = %e, "Send deferred to queue");
                }
                Err(e) => return Err(e),
            }
        } else if !self.options.queue_when_offline {
            return Err(Error::NotConnected);
        }

        // Nothing can be buffered, so the payload itself would be evicted.
        if queue.config().max_queued == 0 {
            debug!("Queue capacity is zero, message not accepted");
            return Err(Error::NotConnected);
        }

        if let Some(evicted) = queue.enqueue(payload) {
            let kind = evicted.payload.get("type").and_then(Value::as_str);
            debug!(kind, "Evicted oldest queued message");
        }

        if self.is_ready() {
            queue.drain_into(&SessionSink(self));
            if queue.is_empty() {
                return Ok(Delivery::Sent);
            }
        }

        Ok(Delivery::Queued)
    }

    fn drain_queue(&self) {
        let report = self.queue.lock().drain_into(&SessionSink(self));
        if report.remaining > 0 {
            debug!(remaining = report.remaining, "Messages left queued after drain");
        }
    }

    /// Writes a message built by the session core.
    fn send_control(&self, payload: &Value) {
        if let Err(e) = self.transport.send(payload) {
            let kind = payload.get("type").and_then(Value::as_str);
            debug!(error = %e, kind, "Control message not sent");
        }
    }

    /// Puts user messages that never reached the wire back at the head of
    /// the queue. Control messages are rebuilt per connection and skipped.
    fn restore_unsent(&self, generation: Generation, frames: Vec<String>) {
        let payloads: Vec<Value> = frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .filter(|payload| {
                !matches!(
                    payload.get("type").and_then(Value::as_str),
                    Some(kinds::PING | kinds::CLIENT_CAPABILITIES)
                )
            })
            .collect();

        if payloads.is_empty() {
            return;
        }
        if !self.options.queue_when_offline {
            warn!(
                %generation,
                count = payloads.len(),
                "Unsent messages dropped, queueing disabled"
            );
            return;
        }

        let mut queue = self.queue.lock();
        queue.requeue_front(payloads, Instant::now());
        if self.is_ready() {
            queue.drain_into(&SessionSink(self));
        }
    }
}

// ============================================================================
// ClientShared - Message Handlers
// ============================================================================

impl ClientShared {
    fn handle_pong(&self) {
        let current = self.transport.generation();
        let mut heartbeat = self.heartbeat.lock();
        match heartbeat.as_mut() {
            Some((generation, monitor)) if *generation == current => {
                monitor.on_pong(Instant::now());
            }
            _ => debug!("Pong without an active heartbeat"),
        }
    }

    fn handle_confirmation(&self, message: &InboundMessage) {
        let (announcement, session_id) = {
            let mut negotiator = self.negotiator.lock();
            let announcement = match message.parse() {
                ParsedMessage::SessionInit { session_id } => negotiator.on_session_init(session_id),
                ParsedMessage::CapabilitiesAck { server_session_id } => {
                    negotiator.on_capabilities_ack(server_session_id)
                }
                ParsedMessage::Pong | ParsedMessage::Other => None,
            };
            (announcement, negotiator.current_id().clone())
        };

        if let Some(announcement) = announcement {
            self.send_control(&announcement);
            self.emit(ClientEvent::Synchronized { session_id });
        }
    }
}

// ============================================================================
// ClientShared - Supervisor
// ============================================================================

impl ClientShared {
    fn ensure_supervisor(self: &Arc<Self>) -> Result<()> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            return Ok(());
        }

        let events = self
            .transport_events
            .lock()
            .take()
            .ok_or_else(|| Error::config("client has been shut down"))?;

        *supervisor = Some(tokio::spawn(run_supervisor(Arc::downgrade(self), events)));
        Ok(())
    }

    fn spawn_open(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match shared.transport.open(&shared.address).await {
                Ok(OpenOutcome::Opened(generation)) => {
                    trace!(%generation, "Open completed");
                }
                Ok(outcome) => debug!(?outcome, "Open skipped"),
                Err(Error::ConnectionClosed) => debug!("Open abandoned by close"),
                Err(e) => {
                    shared.emit(ClientEvent::ConnectFailed {
                        detail: e.to_string(),
                    });
                    shared.schedule_reconnect();
                }
            }
        });
    }

    fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let TransportEvent { generation, kind } = event;

        match kind {
            TransportEventKind::Opened => self.on_opened(generation),

            TransportEventKind::MessageReceived(raw) => {
                if !self.transport.is_current(generation) {
                    debug!(%generation, "Dropping frame from superseded connection");
                    return;
                }
                if let Err(e) = self.router.dispatch(&raw) {
                    self.emit(ClientEvent::MalformedMessage {
                        detail: e.to_string(),
                    });
                }
            }

            TransportEventKind::TransportError(detail) => {
                warn!(%generation, %detail, "Transport error");
                if self.transport.is_current(generation) {
                    self.emit(ClientEvent::TransportError { detail });
                }
            }

            TransportEventKind::Undelivered(frames) => self.restore_unsent(generation, frames),

            TransportEventKind::Closed(reason) => self.on_closed(generation, reason),
        }
    }

    fn on_opened(self: &Arc<Self>, generation: Generation) {
        if !self.transport.is_current(generation) {
            debug!(%generation, "Ignoring Opened for superseded connection");
            return;
        }

        self.reconnect.lock().reset();
        self.cancel_retry();

        let announcement = self.negotiator.lock().on_connection_opened();
        self.send_control(&announcement);
        self.announced.store(generation.as_u64(), Ordering::SeqCst);

        if self.options.heartbeat.is_enabled() {
            *self.heartbeat.lock() =
                Some((generation, HeartbeatMonitor::new(self.options.heartbeat)));
            let handle = tokio::spawn(run_heartbeat(
                Arc::downgrade(self),
                generation,
                self.options.heartbeat.interval,
            ));
            self.timers.lock().push((generation, handle));
        }

        let handle = tokio::spawn(run_resend(
            Arc::downgrade(self),
            generation,
            self.options.negotiation.resend_interval,
        ));
        self.timers.lock().push((generation, handle));

        self.drain_queue();
        self.emit(ClientEvent::Connected { generation });
    }

    fn on_closed(self: &Arc<Self>, generation: Generation, reason: CloseReason) {
        self.cancel_timers(generation);

        {
            let mut heartbeat = self.heartbeat.lock();
            if heartbeat.as_ref().is_some_and(|(g, _)| *g == generation) {
                *heartbeat = None;
            }
        }

        if generation != self.transport.generation() {
            debug!(%generation, "Ignoring Closed for superseded connection");
            return;
        }

        self.emit(ClientEvent::Disconnected {
            generation,
            reason: reason.clone(),
        });

        if reason != CloseReason::Requested {
            self.schedule_reconnect();
        }
    }

    /// Consults the reconnect policy after a failed open or a drop.
    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.auto_reconnect.load(Ordering::SeqCst) {
            debug!("Auto-reconnect disabled, staying disconnected");
            return;
        }

        let (decision, attempts) = {
            let mut state = self.reconnect.lock();
            let decision = state.record_failure(&self.options.reconnect);
            (decision, state.attempt_count)
        };

        match decision {
            ReconnectDecision::Retry(delay) => {
                info!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
                self.emit(ClientEvent::ReconnectScheduled {
                    attempt: attempts,
                    delay,
                });

                let weak = Arc::downgrade(self);
                let handle = tokio::spawn(async move {
                    sleep(delay).await;
                    if let Some(shared) = weak.upgrade()
                        && shared.auto_reconnect.load(Ordering::SeqCst)
                    {
                        shared.spawn_open();
                    }
                });
                if let Some(previous) = self.retry.lock().replace(handle) {
                    previous.abort();
                }
            }
            ReconnectDecision::GiveUp => {
                error!(attempts, "Reconnect attempts exhausted, manual reconnect required");
                self.emit(ClientEvent::ReconnectExhausted { attempts });
            }
        }
    }

    fn cancel_retry(&self) {
        if let Some(handle) = self.retry.lock().take() {
            handle.abort();
        }
    }

    fn cancel_timers(&self, generation: Generation) {
        self.timers.lock().retain(|(g, handle)| {
            if *g == generation {
                handle.abort();
                false
            } else {
                !handle.is_finished()
            }
        });
    }

    fn stop_tasks(&self) {
        self.cancel_retry();
        for (_, handle) in self.timers.lock().drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.stop_tasks();
        self.transport.close(CloseReason::Requested);
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Consumes transport events for the lifetime of the client.
async fn run_supervisor(weak: Weak<ClientShared>, mut events: TransportEvents) {
    debug!("Supervisor started");
    while let Some(event) = events.recv().await {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        shared.handle_transport_event(event);
    }
    debug!("Supervisor terminated");
}

/// Heartbeat timer for one connection generation.
///
/// Pings right away, then every `period`. Also wakes at the outstanding
/// ping's deadline so a timeout is acted on without waiting for a tick.
async fn run_heartbeat(weak: Weak<ClientShared>, generation: Generation, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = {
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let heartbeat = shared.heartbeat.lock();
            let deadline = match heartbeat.as_ref() {
                Some((g, monitor)) if *g == generation => monitor.deadline(),
                _ => break,
            };
            deadline
        };

        let expiry = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ticker.tick() => {}
            () = expiry => {}
        }

        let Some(shared) = weak.upgrade() else {
            break;
        };
        if !shared.transport.is_current(generation) {
            break;
        }

        let action = {
            let mut heartbeat = shared.heartbeat.lock();
            match heartbeat.as_mut() {
                Some((g, monitor)) if *g == generation => monitor.tick(Instant::now()),
                _ => break,
            }
        };

        match action {
            HeartbeatAction::SendProbe => shared.send_control(&ping()),
            HeartbeatAction::Waiting => {}
            HeartbeatAction::Dead => {
                shared.transport.close(CloseReason::HeartbeatTimeout);
                break;
            }
        }
    }
}

/// Announcement resend timer for one connection generation.
async fn run_resend(weak: Weak<ClientShared>, generation: Generation, period: Duration) {
    loop {
        sleep(period).await;

        let Some(shared) = weak.upgrade() else {
            break;
        };
        if !shared.transport.is_current(generation) {
            break;
        }

        let action = shared.negotiator.lock().on_resend_tick();
        match action {
            ResendAction::Resend(announcement) => shared.send_control(&announcement),
            ResendAction::TimedOut => {
                let resends = shared.negotiator.lock().resends();
                shared.emit(ClientEvent::NegotiationTimeout { resends });
                break;
            }
            ResendAction::Idle => break,
        }
    }
}
