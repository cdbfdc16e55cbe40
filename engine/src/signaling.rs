//! Signaling Client
//!
//! Typed envelope transport to the rendezvous server with automatic
//! reconnection, heartbeat, and bounded outbound buffering. The mesh
//! controller re-joins the room after a reconnect; no envelopes are
//! replayed here.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mesh_proto::Envelope;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;

/// Heartbeat send cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// Declare the link dead after this long without inbound traffic.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(6);
/// Initial reconnect backoff.
const BACKOFF_INITIAL_MS: u64 = 500;
/// Reconnect backoff cap.
const BACKOFF_CAP_MS: u64 = 10_000;
/// Outbound envelopes buffered while disconnected; oldest dropped beyond this.
const PENDING_LIMIT: usize = 32;

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Events surfaced to the mesh controller.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Transport established (initially or after a reconnect).
    Connected,
    /// Transport lost; reconnection in progress.
    Disconnected,
    /// Reconnect attempt starting.
    Reconnecting { attempt: u32 },
    /// Inbound envelope (heartbeats are consumed internally).
    Envelope(Envelope),
}

/// Handle to a running signaling connection.
pub struct SignalingClient {
    tx: mpsc::Sender<Envelope>,
    status: Arc<RwLock<ConnectionStatus>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl SignalingClient {
    /// Start the connection loop. Events arrive on the returned receiver.
    #[must_use]
    pub fn connect(server_url: String) -> (Self, mpsc::Receiver<SignalingEvent>) {
        let (event_tx, event_rx) = mpsc::channel::<SignalingEvent>(100);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let status = Arc::new(RwLock::new(ConnectionStatus::Connecting));

        let status_clone = status.clone();
        tokio::spawn(async move {
            connection_loop(server_url, event_tx, outbound_rx, shutdown_rx, status_clone).await;
        });

        (
            Self {
                tx: outbound_tx,
                status,
                shutdown_tx: Some(shutdown_tx),
            },
            event_rx,
        )
    }

    /// Queue an envelope for sending. While disconnected the loop buffers
    /// a bounded number of envelopes and discards the oldest on overflow.
    pub async fn send(&self, envelope: Envelope) -> Result<(), EngineError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|e| EngineError::Transport(format!("signaling loop gone: {e}")))
    }

    /// Current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    /// Stop the connection loop. Idempotent; in-flight sends may be lost.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
    }
}

/// Outcome of one established link.
enum LinkOutcome {
    /// Shutdown requested; stop for good.
    Shutdown,
    /// Link dropped or went silent; reconnect.
    Dropped,
}

/// Main connection loop with reconnection and heartbeat.
async fn connection_loop(
    server_url: String,
    event_tx: mpsc::Sender<SignalingEvent>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: mpsc::Receiver<()>,
    status: Arc<RwLock<ConnectionStatus>>,
) {
    let mut attempt = 0u32;
    let mut pending: VecDeque<Envelope> = VecDeque::new();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            *status.write().await = ConnectionStatus::Disconnected;
            return;
        }

        if attempt > 0 {
            *status.write().await = ConnectionStatus::Reconnecting { attempt };
            if event_tx
                .send(SignalingEvent::Reconnecting { attempt })
                .await
                .is_err()
            {
                return;
            }
        } else {
            *status.write().await = ConnectionStatus::Connecting;
        }

        let ws_url = build_ws_url(&server_url);
        info!(url = %ws_url, attempt, "Connecting to rendezvous server");

        match connect_async(&ws_url).await {
            Ok((ws_stream, _)) => {
                info!("Signaling connected");
                attempt = 0;
                *status.write().await = ConnectionStatus::Connected;
                if event_tx.send(SignalingEvent::Connected).await.is_err() {
                    return;
                }

                let outcome = run_link(
                    ws_stream,
                    &event_tx,
                    &mut outbound_rx,
                    &mut shutdown_rx,
                    &mut pending,
                )
                .await;

                *status.write().await = ConnectionStatus::Disconnected;
                match outcome {
                    LinkOutcome::Shutdown => return,
                    LinkOutcome::Dropped => {
                        if event_tx.send(SignalingEvent::Disconnected).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to rendezvous server");
            }
        }

        attempt += 1;
        let backoff = backoff_delay(attempt);
        info!(?backoff, attempt, "Reconnecting after backoff");

        // Keep buffering outbound envelopes while we wait.
        let deadline = tokio::time::sleep(backoff);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                envelope = outbound_rx.recv() => {
                    match envelope {
                        Some(envelope) => buffer_pending(&mut pending, envelope),
                        None => return,
                    }
                }
                _ = shutdown_rx.recv() => {
                    *status.write().await = ConnectionStatus::Disconnected;
                    return;
                }
            }
        }
    }
}

/// Drive one established WebSocket until it drops, goes silent, or
/// shutdown is requested.
async fn run_link(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    event_tx: &mpsc::Sender<SignalingEvent>,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    shutdown_rx: &mut mpsc::Receiver<()>,
    pending: &mut VecDeque<Envelope>,
) -> LinkOutcome {
    let (mut write, mut read) = ws_stream.split();

    // Flush envelopes buffered while disconnected.
    while let Some(envelope) = pending.pop_front() {
        if send_envelope(&mut write, &envelope).await.is_err() {
            pending.push_front(envelope);
            return LinkOutcome::Dropped;
        }
    }

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    let mut liveness = interval(Duration::from_secs(1));
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(Envelope::Ping) => {
                                if send_envelope(&mut write, &Envelope::Pong).await.is_err() {
                                    return LinkOutcome::Dropped;
                                }
                            }
                            Ok(Envelope::Pong) => {}
                            Ok(envelope) => {
                                debug!(kind = envelope.kind(), "Inbound envelope");
                                if event_tx.send(SignalingEvent::Envelope(envelope)).await.is_err() {
                                    return LinkOutcome::Shutdown;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Malformed envelope dropped");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Server closed connection");
                        return LinkOutcome::Dropped;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        return LinkOutcome::Dropped;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return LinkOutcome::Dropped;
                    }
                    _ => {}
                }
            }

            envelope = outbound_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        if send_envelope(&mut write, &envelope).await.is_err() {
                            buffer_pending(pending, envelope);
                            return LinkOutcome::Dropped;
                        }
                    }
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return LinkOutcome::Shutdown;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if send_envelope(&mut write, &Envelope::Ping).await.is_err() {
                    return LinkOutcome::Dropped;
                }
            }

            _ = liveness.tick() => {
                if last_inbound.elapsed() > LIVENESS_TIMEOUT {
                    warn!(elapsed = ?last_inbound.elapsed(), "No inbound traffic, declaring link dead");
                    return LinkOutcome::Dropped;
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return LinkOutcome::Shutdown;
            }
        }
    }
}

async fn send_envelope<S>(write: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(envelope) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "Failed to serialize envelope");
            return Ok(());
        }
    };
    write.send(Message::text(json)).await.map_err(|_| ())
}

/// Buffer an envelope while disconnected, discarding the oldest beyond
/// the bound.
fn buffer_pending(pending: &mut VecDeque<Envelope>, envelope: Envelope) {
    if pending.len() >= PENDING_LIMIT {
        pending.pop_front();
    }
    pending.push_back(envelope);
}

/// Exponential backoff with jitter: 500 ms doubling to a 10 s cap, ±25%.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_CAP_MS.min(BACKOFF_INITIAL_MS.saturating_mul(1 << exp));
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

/// Build the WebSocket endpoint URL from a server base URL.
fn build_ws_url(server_url: &str) -> String {
    let base = server_url
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    format!("{}/ws", base.trim_end_matches('/'))
}
