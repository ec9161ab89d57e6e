#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod protocol;
pub mod registry;
pub mod relay;

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use crate::turn;
use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use connection::ConnectionContext;
use registry::ConnectionRegistry;
use relay::SignalRelay;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

/// Maximum inbound WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    registry: ConnectionRegistry,
    relay: SignalRelay,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    config: Arc<ServerConfig>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(config: ServerConfig, metrics: ServerMetrics) -> Self {
        info!("Max connections: {}", config.max_connections);
        info!(
            "Room limits: {} rooms, {} messages per room",
            config.room_limits.max_rooms, config.room_limits.max_messages_per_room
        );
        match &config.turn {
            Some(tc) => info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs),
            None => info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)"),
        }

        let room_manager = Arc::new(RoomManager::new(config.room_limits, metrics.clone()));
        let registry = ConnectionRegistry::new();
        let relay = SignalRelay::new(registry.clone(), metrics.clone());

        Self {
            room_manager,
            registry,
            relay,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
        }
    }

    pub fn room_manager(&self) -> Arc<RoomManager> {
        self.room_manager.clone()
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        let static_dir = self.config.static_dir.clone();

        let router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/ice-servers", get(ice_servers_handler))
            .with_state(self)
            .layer(CorsLayer::permissive());

        match static_dir {
            Some(dir) => {
                info!("Serving static files from {}", dir.display());
                router.fallback_service(ServeDir::new(dir))
            }
            None => router,
        }
    }

    /// Starts the signaling server on the configured port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        info!("Starting signaling server on {}", addr);

        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }

    fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            room_manager: self.room_manager.clone(),
            registry: self.registry.clone(),
            relay: self.relay.clone(),
            metrics: self.metrics.clone(),
            idle_timeout: self.config.idle_timeout,
            ping_interval: self.config.ping_interval,
        }
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "rooms": server.room_manager.room_count(),
        "participants": server.room_manager.total_participant_count(),
        "connections": server.registry.len(),
    }))
}

/// Metrics handler in Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = &server.config.metrics_token {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.room_manager.room_count();
    let participants = server.room_manager.total_participant_count();
    let body = server.metrics.render_prometheus(rooms, participants);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct IceServersQuery {
    /// Connection id the TURN username is bound to
    id: Option<String>,
}

/// ICE server list for a browser about to create its peer connections
async fn ice_servers_handler(
    State(server): State<SignalingServer>,
    Query(query): Query<IceServersQuery>,
) -> Response {
    let id = query
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match turn::ice_servers(&server.config.stun_urls, server.config.turn.as_ref(), &id) {
        Ok(ice_servers) => Json(serde_json::json!({ "iceServers": ice_servers })).into_response(),
        Err(e) => {
            error!("Failed to build ICE server list: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    let ctx = server.connection_context();
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, ctx, permit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn start_server() -> SocketAddr {
        let server = SignalingServer::new(ServerConfig::default(), ServerMetrics::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve_on(listener));
        addr
    }

    async fn recv(client: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn recv_type(client: &mut Client, kind: &str) -> serde_json::Value {
        loop {
            let frame = recv(client).await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    async fn send(client: &mut Client, value: serde_json::Value) {
        client.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    /// Connects and returns the client with its connection id
    async fn connect(addr: SocketAddr) -> (Client, String) {
        let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let hello = recv(&mut client).await;
        assert_eq!(hello["type"], "connected");
        let id = hello["id"].as_str().unwrap().to_string();
        (client, id)
    }

    #[tokio::test]
    async fn test_two_clients_chat_and_signal() {
        let addr = start_server().await;

        let (mut alice, alice_id) = connect(addr).await;
        send(&mut alice, serde_json::json!({"type":"join-room","roomId":"r1","userName":"Alice"})).await;
        recv_type(&mut alice, "recording-state-updated").await;

        let (mut bob, bob_id) = connect(addr).await;
        send(&mut bob, serde_json::json!({"type":"join-room","roomId":"r1","userName":"Bob"})).await;
        let roster = recv_type(&mut bob, "existing-participants").await;
        assert_eq!(roster["participants"][0]["id"], alice_id.as_str());
        recv_type(&mut bob, "recording-state-updated").await;

        let joined = recv_type(&mut alice, "user-joined").await;
        assert_eq!(joined["id"], bob_id.as_str());
        assert_eq!(joined["userName"], "Bob");

        send(&mut alice, serde_json::json!({
            "type":"chat-message","roomId":"r1","message":{"type":"text","content":"hi"}
        }))
        .await;
        for client in [&mut alice, &mut bob] {
            let msg = recv_type(client, "new-message").await;
            assert_eq!(msg["message"]["senderId"], alice_id.as_str());
            assert_eq!(msg["message"]["senderName"], "Alice");
            assert_eq!(msg["message"]["message"]["content"], "hi");
            assert!(msg["message"].get("toId").is_none());
        }

        let offer = r#"{"type":"offer","to":"TO","offer":{"type":"offer","sdp":"v=0\r\n"}}"#.replace("TO", &bob_id);
        alice.send(Message::Text(offer.into())).await.unwrap();
        let relayed = recv_type(&mut bob, "offer").await;
        assert_eq!(relayed["from"], alice_id.as_str());
        assert_eq!(relayed["offer"]["sdp"], "v=0\r\n");

        // Bob drops; Alice is told
        bob.close(None).await.unwrap();
        let left = recv_type(&mut alice, "user-left").await;
        assert_eq!(left["id"], bob_id.as_str());
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_connection_survives() {
        let addr = start_server().await;
        let (mut client, _id) = connect(addr).await;

        client.send(Message::Text("{not json".into())).await.unwrap();
        let err = recv(&mut client).await;
        assert_eq!(err["type"], "error");

        send(&mut client, serde_json::json!({"type":"join-room","roomId":"r1","userName":"Solo"})).await;
        let first = recv(&mut client).await;
        assert_eq!(first["type"], "existing-participants");
    }

    /// Reads frames in the background so pings get answered, collecting every text frame
    fn read_only(mut client: Client) -> tokio::sync::mpsc::UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = client.next().await {
                if let Message::Text(text) = msg {
                    let _ = tx.send(serde_json::from_str(text.as_str()).unwrap());
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn test_silent_members_outlive_idle_timeout() {
        let config = ServerConfig {
            idle_timeout: Duration::from_secs(1),
            ping_interval: Duration::from_millis(250),
            ..ServerConfig::default()
        };
        let server = SignalingServer::new(config, ServerMetrics::new());
        let rooms = server.room_manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve_on(listener));

        let (mut alice, _) = connect(addr).await;
        send(&mut alice, serde_json::json!({"type":"join-room","roomId":"r1","userName":"Alice"})).await;
        recv_type(&mut alice, "recording-state-updated").await;
        let (mut bob, _) = connect(addr).await;
        send(&mut bob, serde_json::json!({"type":"join-room","roomId":"r1","userName":"Bob"})).await;
        recv_type(&mut bob, "recording-state-updated").await;
        assert_eq!(rooms.participant_count_for_room("r1"), 2);

        // Neither client sends anything from here on
        let mut alice_frames = read_only(alice);
        let _bob_frames = read_only(bob);
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(rooms.participant_count_for_room("r1"), 2);
        while let Ok(frame) = alice_frames.try_recv() {
            assert_ne!(frame["type"], "user-left");
        }
    }

    #[tokio::test]
    async fn test_health_and_ice_servers() {
        let server = SignalingServer::new(ServerConfig::default(), ServerMetrics::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve_on(listener));

        let health = http_get(addr, "/health").await;
        assert!(health.contains(r#""status":"ok""#));
        assert!(health.contains(r#""connections":0"#));

        let ice = http_get(addr, "/api/ice-servers?id=abc").await;
        assert!(ice.contains("iceServers"));
        assert!(ice.contains("stun:stun.l.google.com:19302"));
    }

    /// Minimal HTTP/1.1 GET, returning the raw response text
    async fn http_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }
}
