//! Connection handlers for Tether server.
//!
//! This module wires the HTTP routes and drives each WebSocket connection:
//! inbound frames are decoded and handed to the relay, and everything the
//! relay queues on the connection's outbox is written back to the socket.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, Direction};
use crate::sweeper;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{ConnectionId, Registry, Relay, RelayError};
use tether_protocol::{codec, ClientEvent, Encoded, Encoding, ServerEvent, PROTOCOL_VERSION};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The relay, which also owns the group registry.
    pub relay: Arc<Relay>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::with_config(config.registry_config()));
        let relay = Arc::new(Relay::with_config(registry, config.relay_config()));
        Self { relay, config }
    }

    /// The group registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        self.relay.registry()
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route("/api/create-group", post(api::create_group))
        .route("/api/join-group", post(api::join_group))
        .route("/api/group/:group_id/members", get(api::list_members))
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));

    // Start metrics server if enabled
    if state.config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(state.config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let _sweeper = sweeper::spawn(
        Arc::clone(&state.relay),
        state.config.sweep_interval(),
        state.config.max_age(),
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Tether server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let groups = state.registry().stats();
    let relay = state.relay.stats();

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION,
        "groups": groups.group_count,
        "members": groups.member_count,
        "connections": relay.connection_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();

    let (connection_id, mut outbox) = match state.relay.connect() {
        Ok(registered) => registered,
        Err(e) => {
            warn!(error = %e, "Refusing WebSocket connection");
            metrics::record_error("capacity");
            let refusal = ServerEvent::error(503, e.to_string());
            if send_event(&mut sender, &refusal, Encoding::Json).await.is_ok() {
                let _ = sender.send(Message::Close(None)).await;
            }
            return;
        }
    };

    debug!(connection = %connection_id, "WebSocket connected");

    let heartbeat_ms = state.config.heartbeat.interval_ms;
    let connected = ServerEvent::connected(
        connection_id.as_str(),
        u32::try_from(heartbeat_ms).unwrap_or(u32::MAX),
    );
    if let Err(e) = send_event(&mut sender, &connected, Encoding::Json).await {
        error!(connection = %connection_id, error = %e, "Failed to send connected event");
        state.relay.disconnect(&connection_id);
        return;
    }

    // Replies follow the encoding of the last inbound frame
    let mut encoding = Encoding::Json;
    let mut read_buffer = BytesMut::with_capacity(4096);

    let period = Duration::from_millis(heartbeat_ms);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            // Events the relay queued for this connection
            Some(event) = outbox.recv() => {
                if send_event(&mut sender, &event, encoding).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                last_activity = Instant::now();
                let close = match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        match codec::decode_text::<ClientEvent>(&text) {
                            Ok(event) => dispatch(&state, &connection_id, event, text.len()),
                            Err(e) => reject(&mut sender, &connection_id, &e, encoding).await,
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        read_buffer.extend_from_slice(&data);
                        drain_frames(&state, &connection_id, &mut read_buffer, &mut sender).await
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => false,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        true
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        true
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        true
                    }
                };
                if close {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() > timeout {
                    info!(connection = %connection_id, "Heartbeat timed out");
                    metrics::record_error("timeout");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    // The peer may already be gone
    let _ = sender.send(Message::Close(None)).await;

    metrics::record_fan_out(state.relay.disconnect(&connection_id));
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and dispatch every complete MessagePack frame in `read_buffer`.
///
/// Returns `true` if the connection should close.
async fn drain_frames(
    state: &AppState,
    connection_id: &ConnectionId,
    read_buffer: &mut BytesMut,
    sender: &mut WsSender,
) -> bool {
    loop {
        let before = read_buffer.len();
        match codec::decode_from::<ClientEvent>(read_buffer) {
            Ok(Some(event)) => {
                let size = before - read_buffer.len();
                if dispatch(state, connection_id, event, size) {
                    return true;
                }
            }
            Ok(None) => return false,
            Err(e) => {
                read_buffer.clear();
                return reject(sender, connection_id, &e, Encoding::MessagePack).await;
            }
        }
    }
}

/// Hand one inbound event to the relay.
///
/// Returns `true` if the connection should close.
fn dispatch(state: &AppState, connection_id: &ConnectionId, event: ClientEvent, size: usize) -> bool {
    let kind = event.kind();
    let start = std::time::Instant::now();
    metrics::record_event(kind, size, Direction::Inbound);

    let close = match state.relay.handle(connection_id, event) {
        Ok(outcome) => {
            metrics::record_fan_out(outcome.fan_out);
            outcome.close
        }
        Err(e) => {
            warn!(connection = %connection_id, event = %kind, error = %e, "Event dropped");
            metrics::record_error(error_kind(&e));
            false
        }
    };

    metrics::record_latency(start.elapsed().as_secs_f64());
    close
}

/// Tell the client its frame could not be decoded.
///
/// Returns `true` if the reply could not be sent.
async fn reject(
    sender: &mut WsSender,
    connection_id: &ConnectionId,
    error: &codec::ProtocolError,
    encoding: Encoding,
) -> bool {
    debug!(connection = %connection_id, error = %error, "Undecodable frame");
    metrics::record_error("decode");
    let reply = ServerEvent::error(400, format!("Invalid event: {}", error));
    send_event(sender, &reply, encoding).await.is_err()
}

fn error_kind(error: &RelayError) -> &'static str {
    match error {
        RelayError::Registry(e) if e.is_not_found() => "not_found",
        RelayError::Registry(_) => "rejected",
        RelayError::NotAssociated | RelayError::AssociationMismatch => "association",
        RelayError::ConnectionClosed | RelayError::UnknownConnection(_) => "connection",
        RelayError::TooManyConnections => "capacity",
    }
}

/// Send an event to the WebSocket.
async fn send_event(sender: &mut WsSender, event: &ServerEvent, encoding: Encoding) -> Result<()> {
    let encoded = codec::encode(event, encoding)?;
    metrics::record_event(event.kind(), encoded.len(), Direction::Outbound);

    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use tether_protocol::{decode_binary, Location};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server(config: Config) -> (SocketAddr, Arc<AppState>) {
        let state = Arc::new(AppState::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = app(Arc::clone(&state));
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        (addr, state)
    }

    /// Connect and consume the `connected` handshake.
    async fn connect(addr: SocketAddr) -> Client {
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Connected { version, .. } => assert_eq!(version, PROTOCOL_VERSION),
            other => panic!("expected connected, got {:?}", other),
        }
        ws
    }

    async fn next_event(ws: &mut Client) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for event")
                .expect("stream ended")
                .unwrap();
            match msg {
                WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
                WsMessage::Binary(data) => return decode_binary(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send_json(ws: &mut Client, event: &ClientEvent) {
        let text = serde_json::to_string(event).unwrap();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn join(ws: &mut Client, group_id: &str, member_id: &str) -> Vec<tether_protocol::MemberInfo> {
        send_json(ws, &ClientEvent::join(group_id, member_id)).await;
        match next_event(ws).await {
            ServerEvent::FamilyMembers(members) => members,
            other => panic!("expected family-members, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_family_relay_over_websocket() {
        let (addr, state) = spawn_server(Config::default()).await;
        let alice = state.registry().create_group("Alice").unwrap();
        let bob = state.registry().join_group(&alice.group_id, "Bob").unwrap();

        let mut alice_ws = connect(addr).await;
        join(&mut alice_ws, &alice.group_id, &alice.member_id).await;

        let mut bob_ws = connect(addr).await;
        let members = join(&mut bob_ws, &bob.group_id, &bob.member_id).await;
        assert_eq!(members.len(), 2);
        let alice_info = members.iter().find(|m| m.id == alice.member_id).unwrap();
        assert!(alice_info.is_online);

        match next_event(&mut alice_ws).await {
            ServerEvent::MemberJoined { id, name, .. } => {
                assert_eq!(id, bob.member_id);
                assert_eq!(name, "Bob");
            }
            other => panic!("expected member-joined, got {:?}", other),
        }

        let here = Location::new(40.7128, -74.006);
        send_json(
            &mut bob_ws,
            &ClientEvent::location(&bob.group_id, &bob.member_id, here),
        )
        .await;
        match next_event(&mut alice_ws).await {
            ServerEvent::MemberLocationUpdated {
                member_id, location, ..
            } => {
                assert_eq!(member_id, bob.member_id);
                assert_eq!(location, here);
            }
            other => panic!("expected member-location-updated, got {:?}", other),
        }

        bob_ws.close(None).await.unwrap();
        match next_event(&mut alice_ws).await {
            ServerEvent::MemberLeft { id, .. } => assert_eq!(id, bob.member_id),
            other => panic!("expected member-left, got {:?}", other),
        }
        let bob_info = state
            .registry()
            .member(&bob.group_id, &bob.member_id)
            .unwrap();
        assert!(!bob_info.is_online);
    }

    #[tokio::test]
    async fn test_messagepack_client_gets_binary_replies() {
        let (addr, state) = spawn_server(Config::default()).await;
        let alice = state.registry().create_group("Alice").unwrap();

        let mut ws = connect(addr).await;
        let frame = codec::encode_binary(&ClientEvent::join(&alice.group_id, &alice.member_id)).unwrap();
        ws.send(WsMessage::Binary(frame.to_vec())).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let WsMessage::Binary(data) = msg else {
            panic!("expected a binary frame, got {:?}", msg);
        };
        match decode_binary::<ServerEvent>(&data).unwrap() {
            ServerEvent::FamilyMembers(members) => assert_eq!(members.len(), 1),
            other => panic!("expected family-members, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (addr, state) = spawn_server(Config::default()).await;
        let alice = state.registry().create_group("Alice").unwrap();

        let mut ws = connect(addr).await;
        ws.send(WsMessage::Text("not json".into())).await.unwrap();
        match next_event(&mut ws).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, 400),
            other => panic!("expected error, got {:?}", other),
        }

        let members = join(&mut ws, &alice.group_id, &alice.member_id).await;
        assert_eq!(members.len(), 1);
    }

    #[tokio::test]
    async fn test_join_unknown_group_reports_error() {
        let (addr, _state) = spawn_server(Config::default()).await;

        let mut ws = connect(addr).await;
        send_json(&mut ws, &ClientEvent::join("NOPE00", "m1")).await;
        match next_event(&mut ws).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, 404),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inbound_served_while_outbox_busy() {
        let (addr, state) = spawn_server(Config::default()).await;
        let alice = state.registry().create_group("Alice").unwrap();
        let bob = state.registry().join_group(&alice.group_id, "Bob").unwrap();

        let mut alice_ws = connect(addr).await;
        join(&mut alice_ws, &alice.group_id, &alice.member_id).await;
        let mut bob_ws = connect(addr).await;
        join(&mut bob_ws, &bob.group_id, &bob.member_id).await;

        // Keep Alice's outbox busy while she talks
        for i in 0..200 {
            let here = Location::new(40.0 + f64::from(i) * 0.001, -74.0);
            send_json(
                &mut bob_ws,
                &ClientEvent::location(&bob.group_id, &bob.member_id, here),
            )
            .await;
        }
        send_json(&mut alice_ws, &ClientEvent::message(&alice.group_id, "dinner at 7")).await;

        loop {
            match next_event(&mut bob_ws).await {
                ServerEvent::NewMessage { message, member_id, .. } => {
                    assert_eq!(message, "dinner at 7");
                    assert_eq!(member_id, alice.member_id);
                    break;
                }
                ServerEvent::MemberJoined { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_leave_family_closes_socket() {
        let (addr, state) = spawn_server(Config::default()).await;
        let alice = state.registry().create_group("Alice").unwrap();

        let mut ws = connect(addr).await;
        join(&mut ws, &alice.group_id, &alice.member_id).await;
        ws.send(WsMessage::Text(
            r#"{"event":"leave-family","data":{}}"#.to_string(),
        ))
        .await
        .unwrap();

        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("socket was not closed");
            match msg {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }

        let info = state
            .registry()
            .member(&alice.group_id, &alice.member_id)
            .unwrap();
        assert!(!info.is_online);
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        let mut config = Config::default();
        config.heartbeat.interval_ms = 20;
        config.heartbeat.timeout_ms = 50;
        let (addr, state) = spawn_server(config).await;
        let alice = state.registry().create_group("Alice").unwrap();

        let mut ws = connect(addr).await;
        join(&mut ws, &alice.group_id, &alice.member_id).await;

        // Not reading means the client never answers pings
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(state.relay.stats().connection_count, 0);
        let info = state
            .registry()
            .member(&alice.group_id, &alice.member_id)
            .unwrap();
        assert!(!info.is_online);
    }

    #[tokio::test]
    async fn test_health() {
        let state = Arc::new(AppState::new(Config::default()));
        state.registry().create_group("Alice").unwrap();

        let response = app(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["protocol"], PROTOCOL_VERSION);
        assert_eq!(health["groups"], 1);
        assert_eq!(health["members"], 1);
        assert_eq!(health["connections"], 0);
    }
}
