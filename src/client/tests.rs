//! End-to-end client scenarios over in-memory links.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::time::{Instant, timeout};

use crate::error::{Error, Result};
use crate::identifiers::SessionId;
use crate::reconnect::ReconnectPolicy;
use crate::session::{MemoryStore, PROVISIONAL_ID_KEY, SessionStore};
use crate::transport::{CloseReason, ConnectionState, Connector, Link, RemoteEnd};

use super::{Client, ClientEvent, ClientOptions, Delivery};

// ============================================================================
// Harness
// ============================================================================

const PROVISIONAL: &str = "provisional-test-id";

/// Connector handing each new link's far end to the test.
struct TestConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    refuse: AtomicBool,
    gate: Option<Semaphore>,
    attempts: AtomicU32,
}

impl TestConnector {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::with_gate(None)
    }

    /// Connects block until [`release`](Self::release) is called.
    fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::with_gate(Some(Semaphore::new(0)))
    }

    fn with_gate(gate: Option<Semaphore>) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            remotes: tx,
            refuse: AtomicBool::new(false),
            gate,
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, address: &str) -> Result<Link> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|e| Error::connect(address, e.to_string()))?.forget();
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::connect(address, "connection refused"));
        }
        let (link, remote) = Link::in_memory();
        let _ = self.remotes.send(remote);
        Ok(link)
    }
}

/// Options with heartbeat off and slow resends, so only the scenario's
/// own timers fire.
fn quiet_options() -> ClientOptions {
    ClientOptions::new()
        .with_heartbeat(Duration::ZERO, Duration::from_secs(10))
        .with_negotiation(Duration::from_secs(3600), 5)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn build(connector: Arc<TestConnector>, options: ClientOptions) -> Client {
    init_tracing();

    let store = MemoryStore::new();
    store.set(PROVISIONAL_ID_KEY, PROVISIONAL).unwrap();

    Client::builder()
        .address("ws://test.invalid/ws")
        .connector(connector)
        .store(store)
        .options(options)
        .build()
        .unwrap()
}

/// Waits for the first event matching `pred`, skipping others.
async fn wait_for<F>(events: &mut broadcast::Receiver<ClientEvent>, pred: F) -> ClientEvent
where
    F: Fn(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(600), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed")
}

/// Collects every event already buffered.
fn drain_events(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn next_frame(remote: &mut RemoteEnd) -> Value {
    timeout(Duration::from_secs(600), remote.recv_json())
        .await
        .expect("frame not observed")
        .expect("link open")
}

/// Connects and returns the peer after the first announcement.
async fn connect_and_announce(
    client: &Client,
    remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>,
) -> RemoteEnd {
    client.connect().unwrap();
    let mut remote = remotes.recv().await.expect("link");
    let announcement = next_frame(&mut remote).await;
    assert_eq!(announcement["type"], "client_capabilities");
    remote
}

/// Registers a `flush` handler that reports when the supervisor got there.
fn flush_signal(client: &Client) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.on("flush", move |_| {
        let _ = tx.send(());
    });
    rx
}

async fn flush(remote: &RemoteEnd, flushed: &mut mpsc::UnboundedReceiver<()>) {
    remote.send_json(&json!({ "type": "flush" }));
    timeout(Duration::from_secs(600), flushed.recv())
        .await
        .expect("flush not dispatched");
}

// ============================================================================
// Queueing
// ============================================================================

#[tokio::test]
async fn test_messages_queued_before_open_drain_after_announcement() {
    let (connector, mut remotes) = TestConnector::gated();
    let client = build(Arc::clone(&connector), quiet_options());
    let mut events = client.subscribe();

    client.connect().unwrap();
    for n in 0..3 {
        let delivery = client.send(json!({ "type": "chat", "n": n })).unwrap();
        assert_eq!(delivery, Delivery::Queued);
    }
    assert_eq!(client.queued_len(), 3);

    connector.release();
    let mut remote = remotes.recv().await.unwrap();

    let announcement = next_frame(&mut remote).await;
    assert_eq!(announcement["type"], "client_capabilities");
    assert_eq!(announcement["session_id"], PROVISIONAL);

    for n in 0..3 {
        let frame = next_frame(&mut remote).await;
        assert_eq!(frame["type"], "chat");
        assert_eq!(frame["n"], n);
        assert_eq!(frame["session_id"], PROVISIONAL);
        assert!(frame["timestamp"].is_number());
    }

    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(client.queued_len(), 0);
}

#[tokio::test]
async fn test_send_while_open_is_tagged_and_sent() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut events = client.subscribe();

    let mut remote = connect_and_announce(&client, &mut remotes).await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    let delivery = client
        .send(json!({ "type": "chat", "session_id": "caller-chosen" }))
        .unwrap();
    assert_eq!(delivery, Delivery::Sent);

    let frame = next_frame(&mut remote).await;
    assert_eq!(frame["session_id"], "caller-chosen");
}

#[tokio::test]
async fn test_offline_send_without_queueing_is_not_connected() {
    let (connector, _remotes) = TestConnector::new();
    let client = build(connector, quiet_options().with_queue_when_offline(false));

    let err = client.send(json!({ "type": "chat" })).unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert_eq!(client.queued_len(), 0);
}

#[tokio::test]
async fn test_offline_send_with_zero_capacity_is_not_connected() {
    let (connector, _remotes) = TestConnector::new();
    let client = build(connector, quiet_options().with_queue(0, Duration::from_secs(30)));

    let err = client.send(json!({ "type": "chat" })).unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert_eq!(client.queued_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_frames_unread_at_drop_are_resent_after_reconnect() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut events = client.subscribe();

    let mut first = connect_and_announce(&client, &mut remotes).await;
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    for n in 0..2 {
        let delivery = client.send(json!({ "type": "chat", "n": n })).unwrap();
        assert_eq!(delivery, Delivery::Sent);
    }
    first.close(Some("server restart".into()));

    wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert_eq!(client.queued_len(), 2);

    let mut second = remotes.recv().await.unwrap();
    let announcement = next_frame(&mut second).await;
    assert_eq!(announcement["type"], "client_capabilities");
    for n in 0..2 {
        let frame = next_frame(&mut second).await;
        assert_eq!(frame["type"], "chat");
        assert_eq!(frame["n"], n);
    }

    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    assert_eq!(client.queued_len(), 0);
    assert!(second.try_recv().is_none());
}

#[tokio::test]
async fn test_send_without_type_is_invalid_argument() {
    let (connector, _remotes) = TestConnector::new();
    let client = build(connector, quiet_options());

    for payload in [json!({ "text": "hi" }), json!({ "type": "  " }), json!("chat")] {
        assert!(matches!(
            client.send(payload),
            Err(Error::InvalidArgument { .. })
        ));
    }
    assert_eq!(client.queued_len(), 0);
}

// ============================================================================
// Session Negotiation
// ============================================================================

#[tokio::test]
async fn test_session_init_reannounces_exactly_once() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut events = client.subscribe();
    let mut flushed = flush_signal(&client);

    let mut remote = connect_and_announce(&client, &mut remotes).await;

    remote.send_json(&json!({ "type": "session_init", "session_id": "srv-1" }));
    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Synchronized { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Synchronized {
            session_id: SessionId::new("srv-1").unwrap()
        }
    );

    let reannouncement = next_frame(&mut remote).await;
    assert_eq!(reannouncement["type"], "client_capabilities");
    assert_eq!(reannouncement["session_id"], "srv-1");

    remote.send_json(&json!({ "type": "session_init", "session_id": "srv-1" }));
    flush(&remote, &mut flushed).await;

    client.send(json!({ "type": "marker" })).unwrap();
    let frame = next_frame(&mut remote).await;
    assert_eq!(frame["type"], "marker");
    assert_eq!(frame["session_id"], "srv-1");

    let session = client.session();
    assert!(session.synchronized);
    assert_eq!(session.provisional_id.as_str(), PROVISIONAL);
    assert_eq!(session.effective_id().as_str(), "srv-1");
}

#[tokio::test]
async fn test_inbound_messages_default_to_current_session() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut flushed = flush_signal(&client);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client.on("assistant_text", move |msg| {
        sink.lock().push(msg.session_id().map(ToString::to_string));
    });

    let remote = connect_and_announce(&client, &mut remotes).await;
    remote.send_json(&json!({ "type": "assistant_text", "text": "hello" }));
    remote.send_json(&json!({ "type": "assistant_text", "session_id": "other" }));
    flush(&remote, &mut flushed).await;

    assert_eq!(
        *seen.lock(),
        vec![Some(PROVISIONAL.to_string()), Some("other".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_reported_once() {
    let (connector, mut remotes) = TestConnector::new();
    let options = quiet_options().with_negotiation(Duration::from_secs(1), 2);
    let client = build(connector, options);
    let mut events = client.subscribe();

    let mut remote = connect_and_announce(&client, &mut remotes).await;

    for _ in 0..2 {
        let resend = next_frame(&mut remote).await;
        assert_eq!(resend["type"], "client_capabilities");
    }

    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::NegotiationTimeout { .. })
    })
    .await;
    assert_eq!(event, ClientEvent::NegotiationTimeout { resends: 2 });
    assert!(event.terminal_error().unwrap().is_terminal());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, ClientEvent::NegotiationTimeout { .. }))
    );
    assert!(remote.try_recv().is_none());
    assert_eq!(client.state(), ConnectionState::Open);
}

// ============================================================================
// Heartbeat
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_closes_and_schedules_one_reconnect() {
    let (connector, mut remotes) = TestConnector::new();
    let options = quiet_options()
        .with_heartbeat(Duration::from_secs(10), Duration::from_secs(5))
        .with_reconnect(ReconnectPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
    let client = build(connector, options);
    let mut events = client.subscribe();

    let opened_at = Instant::now();
    let mut remote = connect_and_announce(&client, &mut remotes).await;

    // The first ping goes out with the connection, not one interval later.
    let ping = next_frame(&mut remote).await;
    let ping_at = Instant::now();
    assert_eq!(ping["type"], "ping");
    assert!(ping.get("session_id").is_none());
    assert!(ping_at - opened_at < Duration::from_secs(1));

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    let ClientEvent::Disconnected { reason, .. } = event else {
        unreachable!();
    };
    assert_eq!(reason, CloseReason::HeartbeatTimeout);

    // Closed at the reply deadline rather than at the next interval tick.
    let latency = Instant::now() - ping_at;
    assert!(latency >= Duration::from_secs(5), "closed early: {latency:?}");
    assert!(latency < Duration::from_millis(5100), "closed late: {latency:?}");

    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(60)
        }
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, ClientEvent::ReconnectScheduled { .. }))
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeat_keeps_connection_open() {
    let (connector, mut remotes) = TestConnector::new();
    let options = quiet_options().with_heartbeat(Duration::from_secs(1), Duration::from_secs(2));
    let client = build(connector, options);
    let mut events = client.subscribe();

    let mut remote = connect_and_announce(&client, &mut remotes).await;
    let responder = tokio::spawn(async move {
        while let Some(frame) = remote.recv_json().await {
            if frame["type"] == "ping" {
                remote.send_json(&json!({ "type": "pong" }));
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(client.state(), ConnectionState::Open);
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, ClientEvent::Disconnected { .. }))
    );
    responder.abort();
}

// ============================================================================
// Generations and Reconnects
// ============================================================================

#[tokio::test]
async fn test_frames_from_superseded_connection_are_dropped() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut events = client.subscribe();
    let mut flushed = flush_signal(&client);

    let count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&count);
    client.on("chat", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let first = connect_and_announce(&client, &mut remotes).await;
    let first_generation = client.generation();

    client.disconnect();
    first.send_json(&json!({ "type": "chat" }));

    let second = connect_and_announce(&client, &mut remotes).await;
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::Connected { generation } if *generation > first_generation)
    })
    .await;
    assert!(matches!(event, ClientEvent::Connected { .. }));

    second.send_json(&json!({ "type": "chat" }));
    flush(&second, &mut flushed).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_drop_reconnects_with_confirmed_id() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut events = client.subscribe();

    let mut first = connect_and_announce(&client, &mut remotes).await;
    let first_generation = client.generation();

    first.send_json(&json!({ "type": "session_init", "session_id": "srv-9" }));
    wait_for(&mut events, |e| matches!(e, ClientEvent::Synchronized { .. })).await;
    assert_eq!(next_frame(&mut first).await["session_id"], "srv-9");

    first.close(Some("server restart".into()));

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Disconnected {
            generation: first_generation,
            reason: CloseReason::Remote(Some("server restart".into()))
        }
    );
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1)
        }
    );

    let mut second = remotes.recv().await.unwrap();
    let announcement = next_frame(&mut second).await;
    assert_eq!(announcement["type"], "client_capabilities");
    assert_eq!(announcement["session_id"], "srv-9");

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;
    let ClientEvent::Connected { generation } = event else {
        unreachable!();
    };
    assert!(generation > first_generation);
    assert!(!client.session().synchronized);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_then_manual_reconnect() {
    let (connector, mut remotes) = TestConnector::new();
    connector.refuse(true);
    let options = quiet_options().with_reconnect(
        ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30))
            .with_max_attempts(Some(2)),
    );
    let client = build(Arc::clone(&connector), options);
    let mut events = client.subscribe();

    client.connect().unwrap();

    let mut scheduled = Vec::new();
    loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                ClientEvent::ReconnectScheduled { .. } | ClientEvent::ReconnectExhausted { .. }
            )
        })
        .await
        {
            ClientEvent::ReconnectScheduled { attempt, delay } => scheduled.push((attempt, delay)),
            exhausted => {
                assert_eq!(exhausted, ClientEvent::ReconnectExhausted { attempts: 2 });
                break;
            }
        }
    }
    assert_eq!(
        scheduled,
        vec![(1, Duration::from_secs(1)), (2, Duration::from_secs(2))]
    );
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);

    // No further attempts without user action.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);

    connector.refuse(false);
    client.reconnect().unwrap();
    let mut remote = remotes.recv().await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Connected { .. })).await;

    // The counter was cleared, so the next drop starts from attempt one.
    remote.close(None);
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        event,
        ClientEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1)
        }
    );
}

#[tokio::test]
async fn test_disconnect_stops_reconnecting() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(Arc::clone(&connector), quiet_options());
    let mut events = client.subscribe();

    let _remote = connect_and_announce(&client, &mut remotes).await;
    client.disconnect();

    let event = wait_for(&mut events, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert!(matches!(
        event,
        ClientEvent::Disconnected {
            reason: CloseReason::Requested,
            ..
        }
    ));

    tokio::task::yield_now().await;
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, ClientEvent::ReconnectScheduled { .. }))
    );
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Malformed Input
// ============================================================================

#[tokio::test]
async fn test_malformed_frame_reported_and_connection_kept() {
    let (connector, mut remotes) = TestConnector::new();
    let client = build(connector, quiet_options());
    let mut events = client.subscribe();
    let mut flushed = flush_signal(&client);

    let remote = connect_and_announce(&client, &mut remotes).await;

    remote.send_text("{ not json");
    let event = wait_for(&mut events, |e| {
        matches!(e, ClientEvent::MalformedMessage { .. })
    })
    .await;
    assert!(matches!(event, ClientEvent::MalformedMessage { .. }));

    remote.send_json(&json!({ "type": "session_init" }));
    wait_for(&mut events, |e| {
        matches!(e, ClientEvent::MalformedMessage { .. })
    })
    .await;

    flush(&remote, &mut flushed).await;
    assert_eq!(client.state(), ConnectionState::Open);
    assert!(!client.session().synchronized);
}
