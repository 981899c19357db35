//! WebSocket connector and socket pump.
//!
//! Each established socket is driven by a spawned tokio task that handles:
//!
//! - Incoming frames from the server (forwarded as [`LinkEvent`]s)
//! - Outgoing frames and close requests from the transport
//! - Final [`LinkEvent::Closed`] notification when the socket ends, carrying
//!   every frame that was accepted but never written

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

use super::link::{Connector, Link, LinkCommand, LinkEvent};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for establishing the socket and handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest inbound frame forwarded to the transport.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

// ============================================================================
// WebSocketConnector
// ============================================================================

/// Production [`Connector`] over `ws://` / `wss://`.
#[derive(Debug, Clone, Copy)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WebSocketConnector {
    /// Creates a connector with a custom handshake timeout.
    #[inline]
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Returns the handshake timeout.
    #[inline]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, address: &str) -> Result<Link> {
        let (ws_stream, _response) =
            timeout(self.connect_timeout, tokio_tungstenite::connect_async(address))
                .await
                .map_err(|_| {
                    Error::connect_timeout(address, self.connect_timeout.as_millis() as u64)
                })?
                .map_err(|e| Error::connect(address, e.to_string()))?;

        debug!(%address, "WebSocket connection established");
        Ok(spawn_pump(ws_stream))
    }
}

// ============================================================================
// Socket Pump
// ============================================================================

/// Spawns the pump task for an established socket and returns its link.
pub fn spawn_pump<S>(ws_stream: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_pump(ws_stream, command_rx, event_tx));

    Link::new(command_tx, event_rx)
}

/// Event loop that handles WebSocket I/O.
async fn run_pump<S>(
    ws_stream: WebSocketStream<S>,
    mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let mut reason: Option<String> = None;
    let mut unsent = Vec::new();

    loop {
        tokio::select! {
            // Incoming frames from the server
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_FRAME_BYTES {
                            warn!(bytes = text.len(), "Oversized frame dropped");
                            let _ = event_tx.send(LinkEvent::Error(format!(
                                "frame of {} bytes exceeds limit of {MAX_FRAME_BYTES}",
                                text.len()
                            )));
                            continue;
                        }
                        if event_tx.send(LinkEvent::Text(text.as_str().to_owned())).is_err() {
                            debug!("Transport gone, stopping pump");
                            break;
                        }
                    }

                    Some(Ok(Message::Binary(data))) => {
                        let event = match std::str::from_utf8(&data) {
                            Ok(text) if text.len() <= MAX_FRAME_BYTES => LinkEvent::Text(text.to_string()),
                            Ok(_) => LinkEvent::Error("oversized binary frame".to_string()),
                            Err(_) => LinkEvent::Error("binary frame is not UTF-8".to_string()),
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }

                    Some(Ok(Message::Close(frame))) => {
                        reason = frame.map(|f| f.reason.as_str().to_owned()).filter(|r| !r.is_empty());
                        debug!(?reason, "WebSocket closed by remote");
                        break;
                    }

                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        let _ = event_tx.send(LinkEvent::Error(e.to_string()));
                        reason = Some(e.to_string());
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }

                    // Ping/Pong control frames are answered by tungstenite
                    _ => {}
                }
            }

            // Commands from the transport
            command = command_rx.recv() => {
                match command {
                    Some(LinkCommand::Text(text)) => {
                        if let Err(e) = ws_write.send(Message::Text(text.as_str().into())).await {
                            warn!(error = %e, "Failed to write frame");
                            let _ = event_tx.send(LinkEvent::Error(e.to_string()));
                            reason = Some(e.to_string());
                            unsent.push(text);
                            break;
                        }
                        trace!("Frame sent");
                    }

                    Some(LinkCommand::Close(close_reason)) => {
                        debug!(reason = ?close_reason, "Close requested");
                        let _ = ws_write.close().await;
                        reason = close_reason;
                        break;
                    }

                    None => {
                        debug!("Command channel closed");
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
        }
    }

    // Refuse further frames so everything accepted so far is accounted for.
    command_rx.close();
    while let Ok(command) = command_rx.try_recv() {
        if let LinkCommand::Text(text) = command {
            unsent.push(text);
        }
    }
    if !unsent.is_empty() {
        debug!(count = unsent.len(), "Returning unwritten frames");
    }

    let _ = event_tx.send(LinkEvent::Closed { reason, unsent });
    debug!("Pump terminated");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    /// Binds a local echo server and returns its ws URL.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("upgrade");
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() && ws.send(message).await.is_err() {
                    break;
                }
            }
        });

        format!("ws://127.0.0.1:{port}")
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_CONNECT_TIMEOUT.as_secs(), 10);
        assert_eq!(MAX_FRAME_BYTES, 1_048_576);
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let url = echo_server().await;
        let mut link = WebSocketConnector::default()
            .connect(&url)
            .await
            .expect("connect");

        link.commands
            .send(LinkCommand::Text(r#"{"type":"ping"}"#.into()))
            .unwrap();
        assert_eq!(
            link.events.recv().await,
            Some(LinkEvent::Text(r#"{"type":"ping"}"#.into()))
        );

        link.commands.send(LinkCommand::Close(None)).unwrap();
        assert!(matches!(
            link.events.recv().await,
            Some(LinkEvent::Closed { unsent, .. }) if unsent.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = WebSocketConnector::default()
            .connect(&format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }
}
