use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parlor_core::chat::{MessageRole, SessionStatus, WELCOME_MESSAGE};
use parlor_core::generator::ReplyGenerator;
use parlor_core::ids::{SessionId, VisitorId};
use parlor_core::protocol::ServerEnvelope;
use parlor_core::AdminKey;
use parlor_store::{Database, StoreError};

use crate::connection::HEARTBEAT_INTERVAL;
use crate::handler::{self, ChatState};
use crate::limiter::{self, RateLimiter};
use crate::registry::{self, SessionRegistry};

/// Knobs the binary wires up at startup. Everything has a usable default;
/// port 0 binds an ephemeral port.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub admin_key: Option<AdminKey>,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub reply_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            max_send_queue: 256,
            admin_key: None,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
            reply_timeout_secs: 30,
        }
    }
}

/// State handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatState>,
}

/// Assemble the chat routes plus CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/{id}/close", post(close_session_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Create and start the server. Returns a handle that keeps it alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    generator: Arc<dyn ReplyGenerator>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SessionRegistry::new(config.max_send_queue));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max,
        Duration::from_secs(config.rate_limit_window_secs),
    ));

    // Background maintenance (every 60s)
    let _cleanup = registry::start_cleanup_task(Arc::clone(&registry), Duration::from_secs(60));
    let _sweep = limiter::start_sweep_task(Arc::clone(&limiter), Duration::from_secs(60));

    let mut chat = ChatState::new(db, Arc::clone(&registry), Arc::clone(&limiter), generator)
        .with_reply_timeout(Duration::from_secs(config.reply_timeout_secs));
    if let Some(key) = config.admin_key {
        chat = chat.with_admin_key(key);
    }

    let router = build_router(AppState {
        chat: Arc::new(chat),
    });
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Parlor server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _cleanup,
        _sweep,
    })
}

/// Handle returned by `start()`. Dropping it would abort nothing; the
/// tasks it holds run until the process exits.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
    _sweep: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler. The peer address becomes the rate-limit key.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Drive one WebSocket connection: writer task for outbound frames plus
/// heartbeat, inline reader for inbound frames.
async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let chat = state.chat;
    let (conn, mut rx) = chat.registry.register(addr.ip().to_string());
    tracing::info!(connection_id = %conn.id, ip = %addr.ip(), "WebSocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound side: queued frames plus heartbeat pings.
    let writer_cid = conn.id.clone();
    let writer = tokio::spawn(async move {
        // The first ping goes out one full interval after connect.
        let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
        let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(text) = queued else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    tracing::trace!(connection_id = %writer_cid, "Ping");
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            WsMessage::Text(text) => handler::dispatch(&chat, &conn, &text),
            WsMessage::Pong(_) => conn.record_pong(),
            WsMessage::Close(_) => break,
            // The websocket layer answers pings itself; binary frames are
            // not part of the protocol.
            _ => {}
        }
    }

    handler::disconnect(&chat, &conn);
    writer.abort();
    tracing::info!(connection_id = %conn.id, "WebSocket client disconnected");
}

/// Health check HTTP endpoint. Degraded when the store stops answering.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state
        .chat
        .db
        .with_conn(|c| {
            c.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .is_ok();

    let (http_status, status) = if db_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        http_status,
        Json(json!({
            "status": status,
            "connections": state.chat.registry.connection_count(),
        })),
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateSessionRequest {
    visitor_name: Option<String>,
    metadata: Option<serde_json::Value>,
}

/// Create a chat session and seed it with the welcome message. The body
/// is optional; an empty POST creates an anonymous session.
async fn create_session_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> axum::response::Response {
    let req: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("invalid request body: {e}")})),
                )
                    .into_response();
            }
        }
    };
    let visitor_id = VisitorId::new();
    let metadata = req.metadata.unwrap_or_else(|| json!({}));

    match state
        .chat
        .sessions
        .create(&visitor_id, req.visitor_name.as_deref(), metadata)
    {
        Ok(session) => {
            if let Err(e) =
                state
                    .chat
                    .messages
                    .append(&session.id, MessageRole::Assistant, WELCOME_MESSAGE)
            {
                tracing::warn!(session_id = %session.id, error = %e, "Failed to seed welcome message");
            }
            tracing::info!(session_id = %session.id, "Session created");
            (StatusCode::CREATED, Json(session)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to create session");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to create session"})),
            )
                .into_response()
        }
    }
}

/// Close a session. Requires the admin key; notifies connected members.
async fn close_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    let authorized = state.chat.admin_key.as_ref().is_some_and(|key| {
        headers
            .get("x-admin-key")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|candidate| key.verify(candidate))
    });
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid admin credential"})),
        )
            .into_response();
    }

    let session_id = SessionId::from_raw(session_id);
    match state
        .chat
        .sessions
        .update_status(&session_id, SessionStatus::Closed)
    {
        Ok(true) => {
            state
                .chat
                .registry
                .broadcast(&session_id, &ServerEnvelope::SessionClosed {}, None);
            tracing::info!(session_id = %session_id, "Session closed");
            (StatusCode::OK, Json(json!({"closed": true}))).into_response()
        }
        Ok(false) => (StatusCode::OK, Json(json!({"closed": false}))).into_response(),
        Err(StoreError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Failed to close session");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "failed to close session"})),
            )
                .into_response()
        }
    }
}
