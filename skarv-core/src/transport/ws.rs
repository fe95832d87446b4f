//! Streaming transport to the exchange depth feed.
//!
//! [`DepthStream`] owns a single WebSocket session and its reconnect
//! ladder. Inbound text frames are parsed as JSON; only well-formed depth
//! updates are surfaced — the stream carries occasional other frames and
//! those are dropped without comment. Network failures walk the capped
//! exponential backoff ladder; exhausting it surfaces a terminal error.

use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tungstenite::Message as WsMessage;

use crate::data::RawDelta;
use crate::resilience::{BackoffConfig, ExponentialBackoff};

/// Events surfaced by the transport to its owner.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Session established.
    Open,
    /// A parsed depth update.
    Delta(RawDelta),
    /// Session closed unexpectedly; a reconnect will follow if the
    /// ladder has budget.
    Closed,
    /// Waiting to reconnect; `attempt` counts from 1.
    Reconnecting { attempt: u32 },
    /// Reconnect ladder exhausted; the stream task has terminated.
    Error(String),
}

/// Why the reader loop exited.
enum DisconnectReason {
    ConnectionLost,
    Shutdown,
}

/// Handle to a running [`DepthStream`] task.
#[derive(Debug)]
pub struct DepthStreamHandle {
    shutdown: watch::Sender<bool>,
}

impl DepthStreamHandle {
    /// Graceful close; suppresses any pending reconnect.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for DepthStreamHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// WebSocket depth stream with automatic reconnection.
pub struct DepthStream {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Receiver<bool>,
}

impl DepthStream {
    /// Spawn the stream task. Events arrive on `events`; the returned
    /// handle disconnects the session when dropped.
    pub fn spawn(
        url: impl Into<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> DepthStreamHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stream = DepthStream {
            url: url.into(),
            events,
            shutdown: shutdown_rx,
        };
        tokio::spawn(stream.run());
        DepthStreamHandle {
            shutdown: shutdown_tx,
        }
    }

    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(BackoffConfig::transport());

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            info!(url = %self.url, "connecting to depth stream");
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    backoff.reset();
                    if self.events.send(TransportEvent::Open).is_err() {
                        return;
                    }

                    // The write half stays alive so the shared connection
                    // can flush automatic pong replies.
                    let (_write, read) = ws.split();
                    match self.read_loop(read).await {
                        DisconnectReason::Shutdown => {
                            info!("depth stream shut down");
                            return;
                        }
                        DisconnectReason::ConnectionLost => {
                            if self.events.send(TransportEvent::Closed).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("depth stream connect failed: {e}");
                }
            }

            match backoff.next_delay() {
                Some(delay) => {
                    let attempt = backoff.attempt_number();
                    if self
                        .events
                        .send(TransportEvent::Reconnecting { attempt })
                        .is_err()
                    {
                        return;
                    }
                    info!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {
                            if *self.shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
                None => {
                    let error = crate::error::SkarvError::RetriesExhausted {
                        attempts: backoff.attempt_number(),
                    };
                    let _ = self.events.send(TransportEvent::Error(error.to_string()));
                    return;
                }
            }
        }
    }

    async fn read_loop(
        &mut self,
        mut read: impl Stream<Item = tungstenite::Result<WsMessage>> + Unpin,
    ) -> DisconnectReason {
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(delta) = parse_depth_frame(&text) {
                                if self.events.send(TransportEvent::Delta(delta)).is_err() {
                                    return DisconnectReason::Shutdown;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) => {
                            warn!("depth stream closed by peer");
                            return DisconnectReason::ConnectionLost;
                        }
                        Some(Ok(_)) => {} // Binary/Ping/Pong frames
                        Some(Err(e)) => {
                            warn!("depth stream error: {e}");
                            return DisconnectReason::ConnectionLost;
                        }
                        None => {
                            warn!("depth stream ended");
                            return DisconnectReason::ConnectionLost;
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return DisconnectReason::Shutdown;
                    }
                }
            }
        }
    }
}

/// Parse one text frame into a depth update.
///
/// Returns `None` for anything that is not a conforming depth event; the
/// stream contains occasional non-depth frames and parse errors are
/// swallowed by design of the wire contract.
fn parse_depth_frame(text: &str) -> Option<RawDelta> {
    match serde_json::from_str::<RawDelta>(text) {
        Ok(delta) if delta.is_depth_update() => Some(delta),
        Ok(other) => {
            debug!(event_type = %other.event_type, "ignoring non-depth frame");
            None
        }
        Err(_) => None,
    }
}
