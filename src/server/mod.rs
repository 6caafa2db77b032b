use crate::events::{EventSink, PanelEvent};
use crate::memory::ConversationMemory;
use crate::prompt::BotSettings;
use crate::supervisor::Supervisor;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

#[derive(Clone)]
pub struct PanelCredentials {
    pub user: String,
    pub pass: String,
}

struct ServerState {
    token: String,
    panel: PanelCredentials,
    supervisor: Supervisor,
    events: EventSink,
    memory: Arc<ConversationMemory>,
    settings_path: PathBuf,
}

pub struct ServerParts {
    pub token: String,
    pub panel: PanelCredentials,
    pub supervisor: Supervisor,
    pub events: EventSink,
    pub memory: Arc<ConversationMemory>,
    pub settings_path: PathBuf,
}

fn router(parts: ServerParts) -> Router {
    let state = Arc::new(ServerState {
        token: parts.token,
        panel: parts.panel,
        supervisor: parts.supervisor,
        events: parts.events,
        memory: parts.memory,
        settings_path: parts.settings_path,
    });

    Router::new()
        .route("/health", get(health_check))
        .route("/api/login", post(login))
        .route("/api/config", get(get_config).post(save_config))
        .route("/api/qr", get(get_qr))
        .route("/api/qr/regenerate", post(regenerate_qr))
        .route("/api/status", get(get_status))
        .route("/api/disconnect", post(disconnect))
        .route("/api/conversations/:identity", get(get_conversation))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    parts: ServerParts,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(parts);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control panel listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    Ok(())
}

#[derive(Deserialize)]
struct LoginPayload {
    #[serde(default)]
    user: String,
    #[serde(default)]
    pass: String,
}

async fn login(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<LoginPayload>,
) -> Response {
    if payload.user == state.panel.user && payload.pass == state.panel.pass {
        tracing::info!(user = %payload.user, "panel login");
        return Json(serde_json::json!({ "ok": true, "token": state.token })).into_response();
    }
    tracing::warn!(user = %payload.user, "panel login rejected");
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "ok": false })),
    )
        .into_response()
}

async fn get_config(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    match BotSettings::load(&state.settings_path) {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to load bot settings: {}", e),
        )
            .into_response(),
    }
}

async fn save_config(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(settings): Json<BotSettings>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    match settings.save(&state.settings_path) {
        Ok(()) => {
            tracing::info!(path = %state.settings_path.display(), "bot settings saved");
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save bot settings: {}", e),
        )
            .into_response(),
    }
}

async fn get_qr(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    Json(serde_json::json!({ "qr": state.supervisor.last_qr() })).into_response()
}

async fn get_status(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    Json(serde_json::json!({
        "connection": state.supervisor.status(),
        "conversations": state.memory.conversation_count(),
    }))
    .into_response()
}

async fn get_conversation(
    State(state): State<Arc<ServerState>>,
    Path(identity): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    match state.memory.snapshot(&identity) {
        Some(turns) => Json(turns).into_response(),
        None => (StatusCode::NOT_FOUND, "Unknown conversation").into_response(),
    }
}

async fn regenerate_qr(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    state.supervisor.force_pair().await;
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn disconnect(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    state.supervisor.stop().await;
    Json(serde_json::json!({ "ok": true })).into_response()
}

async fn ws_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if !is_token_valid(&headers, &query.0, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // subscribe before the snapshot so nothing emitted in between is lost
    let rx = state.events.subscribe();
    let status = state.supervisor.status();
    let snapshot = vec![
        PanelEvent::Connected(status.connected),
        PanelEvent::Qr(status.qr),
    ];
    ws.on_upgrade(move |socket| handle_socket(socket, snapshot, rx))
}

async fn handle_socket(
    mut socket: WebSocket,
    snapshot: Vec<PanelEvent>,
    mut rx: broadcast::Receiver<PanelEvent>,
) {
    tracing::info!("panel connected via websocket");

    for event in &snapshot {
        if send_event(&mut socket, event).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "panel websocket lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &PanelEvent) -> Result<(), axum::Error> {
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode panel event");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload)).await
}

fn is_token_valid(headers: &HeaderMap, query: &HashMap<String, String>, token: &str) -> bool {
    // Authorization: Bearer <token>
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided_token) = auth_str.strip_prefix("Bearer ") {
                return provided_token == token;
            }
        }
    }

    // browser websocket clients cannot set headers
    query.get("token").map(|t| t == token).unwrap_or(false)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}
