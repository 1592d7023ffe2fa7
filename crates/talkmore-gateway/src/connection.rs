use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use talkmore_db::FanOut;
use talkmore_types::api::OutgoingMessage;
use talkmore_types::events::GatewayEvent;
use talkmore_types::models::Profile;

use crate::registry::{ConnectionRegistry, EventReceiver};
use crate::watcher::spawn_watcher;

/// Server sends a Ping every 30 seconds unless configured otherwise.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive unanswered pings before the connection is dropped.
const MAX_MISSED_PONGS: u8 = 2;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame.
    ClientClosed,
    /// The server is shutting down.
    Shutdown,
    HeartbeatTimeout,
    ReadError,
    /// The socket ended without a close frame.
    StreamEnded,
    SendFailed,
}

impl CloseReason {
    pub fn is_normal(self) -> bool {
        matches!(self, Self::ClientClosed | Self::Shutdown)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClientClosed => "client closed",
            Self::Shutdown => "server shutdown",
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::ReadError => "read error",
            Self::StreamEnded => "stream ended",
            Self::SendFailed => "send failed",
        };
        f.write_str(s)
    }
}

/// Everything a socket connection needs, shared by all connections.
#[derive(Clone)]
pub struct Gateway {
    registry: ConnectionRegistry,
    fanout: FanOut,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        registry: ConnectionRegistry,
        fanout: FanOut,
        heartbeat_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            fanout,
            heartbeat_interval,
            shutdown,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Serve a socket whose user was authenticated at the HTTP upgrade.
    ///
    /// Registers the connection, sends `Ready`, then runs until the client
    /// goes away, the heartbeat times out, or the server shuts down.
    pub async fn handle_connection(&self, socket: WebSocket, profile: Profile) -> CloseReason {
        let user_id = profile.user_id.clone();
        let (mut sender, receiver) = socket.split();

        let (conn_id, user_rx) = self.registry.register(&user_id).await;
        let cancel = self.shutdown.child_token();

        // Subscribe before Ready so nothing committed after Ready is missed.
        let changes = self.fanout.store().watch(&user_id);

        info!(user_id, %conn_id, "Connected to gateway");

        let ready = GatewayEvent::Ready {
            user_id: user_id.clone(),
            name: profile.display_name(),
        };
        if send_event(&mut sender, &ready).await.is_err() {
            self.registry.unregister(&user_id, conn_id).await;
            warn!(user_id, %conn_id, "Disconnected before Ready was sent");
            return CloseReason::SendFailed;
        }

        let watcher = spawn_watcher(changes, self.registry.clone(), cancel.clone());

        let pong_received = Arc::new(AtomicBool::new(true));

        let mut send_task = tokio::spawn(write_loop(
            sender,
            user_rx,
            self.heartbeat_interval,
            pong_received.clone(),
            cancel.clone(),
        ));

        let mut recv_task = tokio::spawn(read_loop(
            receiver,
            ReadContext {
                fanout: self.fanout.clone(),
                registry: self.registry.clone(),
                profile,
                conn_id,
                pong_received,
            },
            cancel.clone(),
        ));

        // Whichever side ends first decides the reason; the other is told to stop.
        let reason = tokio::select! {
            r = &mut send_task => {
                cancel.cancel();
                let _ = recv_task.await;
                r.unwrap_or(CloseReason::SendFailed)
            }
            r = &mut recv_task => {
                cancel.cancel();
                let _ = send_task.await;
                r.unwrap_or(CloseReason::ReadError)
            }
        };
        let _ = watcher.await;

        self.registry.unregister(&user_id, conn_id).await;

        if reason.is_normal() {
            info!(user_id, %conn_id, reason = %reason, "Disconnected from gateway");
        } else {
            warn!(user_id, %conn_id, reason = %reason, "Connection closed abnormally");
        }
        reason
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

/// Pushes registry events and heartbeat pings to the client.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut user_rx: EventReceiver,
    heartbeat_interval: Duration,
    pong_received: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> CloseReason {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    // With several connections open, each connection's watcher broadcasts the
    // same change to all of them; forward each revision once.
    let mut last_revision = 0u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sender.send(Message::Close(None)).await;
                return CloseReason::Shutdown;
            }
            event = user_rx.recv() => {
                let Some(event) = event else {
                    return CloseReason::Shutdown;
                };
                if let Some(revision) = event.revision() {
                    if revision <= last_revision {
                        continue;
                    }
                    last_revision = revision;
                }
                if send_event(&mut sender, &event).await.is_err() {
                    return CloseReason::SendFailed;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        let _ = sender.send(Message::Close(None)).await;
                        return CloseReason::HeartbeatTimeout;
                    }
                }
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    return CloseReason::SendFailed;
                }
            }
        }
    }
}

struct ReadContext {
    fanout: FanOut,
    registry: ConnectionRegistry,
    profile: Profile,
    conn_id: Uuid,
    pong_received: Arc<AtomicBool>,
}

/// Reads outgoing chat messages from the client and delivers them in the
/// order received. A send in progress always runs to completion.
async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    ctx: ReadContext,
    cancel: CancellationToken,
) -> CloseReason {
    let user_id = ctx.profile.user_id.as_str();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Shutdown,
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<OutgoingMessage>(text.as_str()) {
                    Ok(outgoing) => ctx.deliver(outgoing).await,
                    Err(e) => {
                        warn!(
                            user_id,
                            "Bad message: {} -- raw: {}",
                            e,
                            truncate(text.as_str(), 200)
                        );
                    }
                }
            }
            Some(Ok(Message::Pong(_))) => {
                ctx.pong_received.store(true, Ordering::Release);
            }
            Some(Ok(Message::Close(_))) => return CloseReason::ClientClosed,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(user_id, "Socket read error: {}", e);
                return CloseReason::ReadError;
            }
            None => return CloseReason::StreamEnded,
        }
    }
}

impl ReadContext {
    async fn deliver(&self, outgoing: OutgoingMessage) {
        let destination = outgoing.destination.clone();
        if let Err(e) = self.fanout.send(&self.profile, outgoing).await {
            warn!(user_id = %self.profile.user_id, destination, "Socket send failed: {}", e);
            let failed = GatewayEvent::DeliveryFailed {
                destination,
                reason: e.to_string(),
            };
            self.registry
                .send_to_connection(&self.profile.user_id, self.conn_id, failed)
                .await;
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
