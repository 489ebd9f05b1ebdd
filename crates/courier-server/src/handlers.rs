//! Connection handlers for the Courier server.
//!
//! This module handles the connection lifecycle: the WebSocket upgrade,
//! the hello handshake, the per-connection event loop multiplexing engine
//! events with inbound frames, and cleanup on disconnect.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{
    ConnectionHandle, ConnectionId, EngineConfig, Event, PresenceEngine, RouteError, RouteOutcome,
};
use courier_protocol::{codec, codes, Frame, WireMessage, PROTOCOL_VERSION};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// The presence-and-routing engine.
    pub engine: PresenceEngine,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine = PresenceEngine::new(EngineConfig {
            session_policy: config.session.policy,
        });

        Self { engine, config }
    }
}

/// Build the HTTP router: the WebSocket endpoint plus the REST surface.
#[must_use]
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/users", get(users_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Online-users handler: the sorted roster as JSON.
async fn users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(state.engine.roster())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection end to end.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let conn_id = ConnectionId::generate();
    debug!(connection = %conn_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // The client must identify itself before anything else happens.
    let hello_deadline = Duration::from_millis(state.config.heartbeat.hello_timeout_ms);
    let username = match tokio::time::timeout(
        hello_deadline,
        await_hello(&mut sender, &mut receiver, &mut read_buffer),
    )
    .await
    {
        Ok(Some(name)) => name,
        Ok(None) => return,
        Err(_) => {
            debug!(connection = %conn_id, "Hello deadline expired");
            return;
        }
    };

    // Register with the engine. The mailbox receiver stays here, in the
    // connection's own task; the engine only ever holds the handle.
    let (handle, mut events) = ConnectionHandle::attached(conn_id.clone());
    if let Err(err) = state.engine.join(&username, handle.clone()) {
        warn!(connection = %conn_id, user = %username, %err, "Join rejected");
        metrics::record_error("join_rejected");
        let frame = Frame::error(0, codes::NAME_IN_USE, err.to_string());
        let _ = send_frame(&mut sender, &frame).await;
        return;
    }
    metrics::set_online_users(state.engine.online_count());

    let welcome = Frame::welcome(
        conn_id.as_str(),
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &welcome).await.is_err() {
        state.engine.disconnect(&conn_id);
        return;
    }

    debug!(connection = %conn_id, user = %username, "Session established");

    loop {
        tokio::select! {
            biased;

            // Events from the engine: roster pushes and message deliveries
            event = events.recv() => {
                match event {
                    Some(Event::Roster(users)) => {
                        let frame = Frame::roster(users.as_ref().clone());
                        metrics::record_roster_frame();
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Event::Delivery(message)) => {
                        let frame = Frame::deliver(wire_message(&message));
                        if send_frame(&mut sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    // Evicted by the engine, or the engine dropped the handle
                    Some(Event::Closed) | None => break,
                }
            }

            // Inbound frames from the client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > state.config.limits.max_message_size {
                            warn!(connection = %conn_id, bytes = data.len(), "Inbound message too large");
                            metrics::record_error("message_too_large");
                            break;
                        }
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        let mut failed = false;
                        while let Ok(Some(frame)) = codec::decode_from(&mut read_buffer) {
                            if let Err(e) = handle_frame(
                                &frame,
                                &handle,
                                &username,
                                &state,
                                &mut sender,
                            ).await {
                                warn!(connection = %conn_id, error = %e, "Frame handling error");
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %conn_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %conn_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // A disconnect for a handle the engine no longer knows is a no-op.
    state.engine.disconnect(&conn_id);
    metrics::set_online_users(state.engine.online_count());

    debug!(connection = %conn_id, user = %username, "WebSocket disconnected");
}

/// Wait for the client's hello and validate it.
///
/// Returns the username, or `None` when the connection should be dropped
/// (an error frame has already been sent where appropriate).
async fn await_hello(
    sender: &mut SplitSink<WebSocket, Message>,
    receiver: &mut SplitStream<WebSocket>,
    read_buffer: &mut BytesMut,
) -> Option<String> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => {
                read_buffer.extend_from_slice(&data);
            }
            Some(Ok(Message::Text(text))) => {
                read_buffer.extend_from_slice(text.as_bytes());
            }
            Some(Ok(Message::Ping(data))) => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    return None;
                }
                continue;
            }
            Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket error during handshake");
                return None;
            }
        }

        match codec::decode_from(read_buffer) {
            Ok(Some(Frame::Hello { version, username })) => {
                if version != PROTOCOL_VERSION {
                    let frame = Frame::error(
                        0,
                        codes::BAD_HELLO,
                        format!("Unsupported protocol version {version}"),
                    );
                    let _ = send_frame(sender, &frame).await;
                    return None;
                }
                let name = username.trim();
                if name.is_empty() {
                    let frame = Frame::error(0, codes::BAD_HELLO, "Username must not be empty");
                    let _ = send_frame(sender, &frame).await;
                    return None;
                }
                return Some(name.to_string());
            }
            Ok(Some(other)) => {
                warn!(frame_type = ?other.frame_type(), "Expected hello");
                let frame = Frame::error(0, codes::PROTOCOL, "Expected hello");
                let _ = send_frame(sender, &frame).await;
                return None;
            }
            Ok(None) => continue, // Need more data
            Err(e) => {
                debug!(error = %e, "Malformed handshake frame");
                let frame = Frame::error(0, codes::PROTOCOL, e.to_string());
                let _ = send_frame(sender, &frame).await;
                return None;
            }
        }
    }
}

/// Handle a decoded frame from an established session.
async fn handle_frame(
    frame: &Frame,
    handle: &ConnectionHandle,
    username: &str,
    state: &Arc<AppState>,
    sender: &mut SplitSink<WebSocket, Message>,
) -> Result<()> {
    match frame {
        Frame::Send { id, to, content } => {
            if content.len() > state.config.limits.max_content_length {
                metrics::record_error("content_too_long");
                let response = Frame::error(*id, codes::PROTOCOL, "Message content too long");
                send_frame(sender, &response).await?;
                return Ok(());
            }

            let response = match state.engine.route(handle, username, to, content) {
                Ok(result) => {
                    let delivered =
                        matches!(result.outcome, RouteOutcome::Delivered { .. });
                    metrics::record_routed(delivered);
                    debug!(
                        user = %username,
                        to = %to,
                        id = result.message.id,
                        delivered,
                        "Message routed"
                    );
                    Frame::ack(*id, delivered)
                }
                Err(e @ RouteError::EmptyMessage) => {
                    metrics::record_error("empty_message");
                    Frame::error(*id, codes::EMPTY_MESSAGE, e.to_string())
                }
            };

            send_frame(sender, &response).await?;
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(*timestamp)).await?;
        }

        Frame::Hello { .. } => {
            warn!(user = %username, "Duplicate hello on established session");
            send_frame(sender, &Frame::error(0, codes::PROTOCOL, "Already identified")).await?;
        }

        _ => {
            warn!(user = %username, frame_type = ?frame.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut SplitSink<WebSocket, Message>, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

/// Convert an engine message into its wire representation.
fn wire_message(message: &courier_core::Message) -> WireMessage {
    WireMessage {
        id: message.id,
        sender: message.sender.clone(),
        recipient: message.recipient.clone(),
        content: message.content.clone(),
        timestamp: message.timestamp,
    }
}
