#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{decode_client_message, send_json, ClientHandle, ClientMessage, ControlMessage, ServerMessage};
use super::registry::ConnectionRegistry;
use super::relay::SignalRelay;
use crate::metrics::ServerMetrics;
use crate::room::{ParticipantStatus, RoomManager};
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale; drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_USER_NAME_LEN: usize = 64;

/// Shared state every connection task needs
#[derive(Clone)]
pub struct ConnectionContext {
    pub room_manager: Arc<RoomManager>,
    pub registry: ConnectionRegistry,
    pub relay: SignalRelay,
    pub metrics: ServerMetrics,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
}

/// Token bucket, refilled continuously. Only the first rejected frame of a burst is
/// reported back to the client.
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

enum RateDecision {
    Allow,
    /// First rejection in this burst
    RejectAndWarn,
    Reject,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    fn check(&mut self, now: Instant) -> RateDecision {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        // Refill: RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            RateDecision::Allow
        } else if self.warned {
            RateDecision::Reject
        } else {
            self.warned = true;
            RateDecision::RejectAndWarn
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(socket: WebSocket, ctx: ConnectionContext, _permit: OwnedSemaphorePermit) {
    let metrics = ctx.metrics.clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);
    let connection_id = ctx.registry.connect(tx.clone());
    let client = ClientHandle::new(tx.clone());
    info!("New WebSocket connection: {}", connection_id);

    // Spawn task to send messages to client, pinging between frames.
    // Pongs count as inbound traffic for the idle timeout.
    let send_metrics = metrics.clone();
    let send_id = connection_id.clone();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.ping_interval,
        ctx.ping_interval,
    );
    let send_task = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(json) => {
                        send_metrics.inc_messages_sent();
                        Message::Text((*json).clone().into())
                    }
                    None => break,
                },
                _ = heartbeat.tick() => Message::Ping(Bytes::new()),
            };
            if ws_sender.send(outbound).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", send_id);
    });

    if let Err(e) = send_json(&tx, &ServerMessage::Connected { id: connection_id.clone() }) {
        warn!("Failed to greet connection {}: {}", connection_id, e);
    }

    let mut limiter = RateLimiter::new();

    loop {
        // Idle timeout: close connection if no message within the configured window
        let next = tokio::select! {
            next = tokio::time::timeout(ctx.idle_timeout, ws_receiver.next()) => next,
            _ = client.closed() => {
                warn!("Connection {} fell behind on room events, closing", connection_id);
                break;
            }
        };
        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                match limiter.check(Instant::now()) {
                    RateDecision::Allow => {}
                    RateDecision::RejectAndWarn => {
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"),
                        });
                        continue;
                    }
                    RateDecision::Reject => continue,
                }

                let client_msg = match decode_client_message(text.as_str()) {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message from {}: {}", connection_id, e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                        continue;
                    }
                };

                let start = Instant::now();
                let result = match client_msg {
                    ClientMessage::Signal(signal) => {
                        ctx.relay.relay(&connection_id, signal);
                        Ok(())
                    }
                    ClientMessage::Control(control) => handle_control(control, &connection_id, &client, &ctx).await,
                };
                metrics.observe_message_handling(start.elapsed());

                if let Err(e) = result {
                    warn!("Rejected request from {}: {}", connection_id, e);
                    metrics.inc_errors();
                    // If channel is closed, send task has exited
                    if tx.is_closed() {
                        break;
                    }
                    let _ = send_json(&tx, &ServerMessage::Error { message: e.to_string() });
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", connection_id);
            }
        }
    }

    ctx.registry.disconnect(&connection_id, &ctx.room_manager).await;

    // Other clones of the sender may linger briefly (a relay in flight); the socket is
    // done either way.
    drop(client);
    drop(tx);
    send_task.abort();

    info!("Connection handler finished for connection: {}", connection_id);
}

fn validate_room_id(room_id: &str) -> anyhow::Result<()> {
    if room_id.is_empty() || room_id.chars().count() > MAX_ROOM_ID_LEN {
        anyhow::bail!("Invalid roomId: must be 1-{MAX_ROOM_ID_LEN} characters");
    }
    Ok(())
}

/// Handle one room-scoped request
async fn handle_control(
    message: ControlMessage,
    connection_id: &str,
    client: &ClientHandle,
    ctx: &ConnectionContext,
) -> anyhow::Result<()> {
    let rooms = &ctx.room_manager;

    match message {
        ControlMessage::JoinRoom { room_id, user_name, is_muted, is_camera_off } => {
            validate_room_id(&room_id)?;
            if user_name.trim().chars().count() > MAX_USER_NAME_LEN {
                anyhow::bail!("Invalid userName: must be at most {MAX_USER_NAME_LEN} characters");
            }

            // One room per connection: leave the current one first
            if let Some(old_room_id) = ctx.registry.room_of(connection_id) {
                rooms.leave_room(&old_room_id, connection_id).await;
                ctx.registry.set_room(connection_id, None);
            }

            let initial = ParticipantStatus { is_muted, is_camera_off, ..Default::default() };
            let snapshot = rooms
                .join_room(&room_id, connection_id, &user_name, initial, client.clone())
                .await?;
            debug!(
                "{} joined {} room {} with {} others",
                connection_id,
                if snapshot.is_new_room { "new" } else { "existing" },
                room_id,
                snapshot.participants.len()
            );
            ctx.registry.set_room(connection_id, Some(room_id));
        }

        ControlMessage::LeaveRoom { room_id } => {
            if rooms.leave_room(&room_id, connection_id).await {
                ctx.registry.set_room(connection_id, None);
            }
        }

        ControlMessage::ToggleMute { room_id, is_muted } => {
            rooms.set_muted(&room_id, connection_id, is_muted).await;
        }

        ControlMessage::ToggleCamera { room_id, is_camera_off } => {
            rooms.set_camera_off(&room_id, connection_id, is_camera_off).await;
        }

        ControlMessage::ToggleScreenShare { room_id, is_screen_sharing } => {
            rooms.set_screen_sharing(&room_id, connection_id, is_screen_sharing).await;
        }

        ControlMessage::ToggleHandRaise { room_id, is_hand_raised } => {
            rooms.set_hand_raised(&room_id, connection_id, is_hand_raised).await;
        }

        ControlMessage::RemoteMute { room_id, target_id } => {
            rooms.force_mute(&room_id, connection_id, &target_id).await;
        }

        ControlMessage::RemoteCameraOff { room_id, target_id } => {
            rooms.force_camera_off(&room_id, connection_id, &target_id).await;
        }

        ControlMessage::ChatMessage { room_id, message, to_id } => {
            rooms
                .post_message(&room_id, connection_id, message, to_id.as_deref())
                .await?;
        }

        ControlMessage::UpdateRoomSettings { room_id, settings } => {
            rooms.update_settings(&room_id, connection_id, settings).await;
        }

        ControlMessage::StartRecording { room_id } => {
            rooms.start_recording(&room_id, connection_id).await;
        }

        ControlMessage::StopRecording { room_id } => {
            rooms.stop_recording(&room_id, connection_id).await;
        }
    }

    Ok(())
}
