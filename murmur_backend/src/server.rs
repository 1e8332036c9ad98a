use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::actions::{self, ExecReport, WakeScope};
use crate::config::{BackendConfig, SimSettings};
use crate::context::SimContext;
use crate::error::{call_error, CallError};
use crate::events::{SimEvent, SimEventKind};
use crate::gate::{CallPriority, GateSnapshot};
use crate::heartbeat::{Heartbeat, TickReport, LAST_TICK_STATE_KEY};
use crate::model::{
    now_millis, Agent, BlockStatus, ChatMessage, Group, MessageKind, Sticker, SummaryRecord,
    USER_SENDER_ID,
};
use crate::runtime::SimRuntime;
use crate::summary::{self, PassReport};

#[derive(Clone)]
pub struct ServerState {
    pub ctx: SimContext,
    pub heartbeat: Arc<Heartbeat>,
    pub auth: BackendAuthConfig,
    pub config: Arc<tokio::sync::RwLock<BackendConfig>>,
    pub ws_events: broadcast::Sender<ApiEventEnvelope>,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiEventEnvelope {
    pub event_type: SimEventKind,
    pub emitted_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

type ApiError = (StatusCode, String);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    heartbeat_running: bool,
    last_tick_at: Option<i64>,
    gate: GateSnapshot,
    settings: SimSettings,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    running: bool,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    name: String,
    #[serde(default)]
    persona: String,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    content: String,
    /// Record the message as spoken by the agent rather than the user.
    #[serde(default)]
    from_agent: bool,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    enable_offline_sim: bool,
    #[serde(default)]
    members: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateStickerRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct SetEnabledResponse {
    id: String,
    enabled: bool,
}

pub async fn serve_backend(runtime: SimRuntime, event_rx: flume::Receiver<SimEvent>) -> Result<()> {
    let bind_addr = std::env::var("MURMUR_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8797".to_string())
        .parse::<SocketAddr>()
        .context("Invalid MURMUR_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let (ws_events, _) = broadcast::channel(512);

    let state = Arc::new(ServerState {
        ctx: runtime.ctx.clone(),
        heartbeat: runtime.heartbeat.clone(),
        auth,
        config: Arc::new(tokio::sync::RwLock::new(runtime.config.clone())),
        ws_events: ws_events.clone(),
    });

    spawn_event_bridge(event_rx, ws_events);
    runtime.start_background().await;

    let app = Router::new().nest("/v1", api_router(state));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Murmur backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn api_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/heartbeat/start", post(start_heartbeat))
        .route("/heartbeat/stop", post(stop_heartbeat))
        .route("/heartbeat/tick", post(tick_heartbeat))
        .route(
            "/config/simulation",
            get(get_simulation_config).put(update_simulation_config),
        )
        .route("/agents", get(list_agents).post(create_agent))
        .route("/agents/:id", get(get_agent))
        .route(
            "/agents/:id/messages",
            get(list_messages).post(post_message),
        )
        .route("/agents/:id/block", post(block_agent))
        .route("/agents/:id/unblock", post(unblock_agent))
        .route("/agents/:id/decline", post(decline_reconciliation))
        .route("/agents/:id/wake", post(wake_agent))
        .route("/agents/:id/summarize", post(summarize_agent))
        .route("/agents/:id/summaries", get(list_summaries))
        .route("/summaries/:id/enabled", put(set_summary_enabled))
        .route("/groups", get(list_groups).post(create_group))
        .route("/stickers", get(list_stickers).post(create_sticker))
        .route("/ws/events", get(ws_events_route))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware))
}

fn spawn_event_bridge(
    event_rx: flume::Receiver<SimEvent>,
    ws_events: broadcast::Sender<ApiEventEnvelope>,
) {
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            let _ = ws_events.send(envelope(event));
        }
    });
}

fn envelope(event: SimEvent) -> ApiEventEnvelope {
    ApiEventEnvelope {
        event_type: event.kind,
        emitted_at: Utc::now(),
        payload: serde_json::json!({ "id": event.id }),
    }
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("MURMUR_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("MURMUR_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "MURMUR_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid MURMUR_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Some(auth_value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|raw| raw.to_str().ok())
    else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn get_status(State(state): State<Arc<ServerState>>) -> Result<Json<StatusResponse>, ApiError> {
    let last_tick_at = state
        .ctx
        .db
        .get_state(LAST_TICK_STATE_KEY)
        .map_err(internal_error)?
        .and_then(|raw| raw.parse().ok());
    Ok(Json(StatusResponse {
        heartbeat_running: state.heartbeat.is_running(),
        last_tick_at,
        gate: state.ctx.gate.snapshot(),
        settings: state.ctx.settings().await,
    }))
}

async fn start_heartbeat(State(state): State<Arc<ServerState>>) -> Json<HeartbeatResponse> {
    state.heartbeat.start().await;
    Json(HeartbeatResponse {
        running: state.heartbeat.is_running(),
    })
}

async fn stop_heartbeat(State(state): State<Arc<ServerState>>) -> Json<HeartbeatResponse> {
    state.heartbeat.stop();
    Json(HeartbeatResponse { running: false })
}

async fn tick_heartbeat(State(state): State<Arc<ServerState>>) -> Result<Json<TickReport>, ApiError> {
    state.heartbeat.tick().await.map(Json).map_err(internal_error)
}

async fn get_simulation_config(State(state): State<Arc<ServerState>>) -> Json<SimSettings> {
    Json(state.ctx.settings().await)
}

async fn update_simulation_config(
    State(state): State<Arc<ServerState>>,
    Json(settings): Json<SimSettings>,
) -> Result<Json<SimSettings>, ApiError> {
    let settings = settings.sanitized();
    {
        let mut config = state.config.write().await;
        config.simulation = settings.clone();
        if let Err(error) = config.save() {
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to save config: {error}"),
            ));
        }
    }
    state.ctx.replace_settings(settings.clone()).await;
    Ok(Json(settings))
}

async fn list_agents(State(state): State<Arc<ServerState>>) -> Result<Json<Vec<Agent>>, ApiError> {
    state.ctx.db.list_agents().map(Json).map_err(internal_error)
}

async fn create_agent(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateAgentRequest>,
) -> Result<Json<Agent>, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(bad_request("name cannot be empty"));
    }
    let agent = state
        .ctx
        .db
        .create_agent(name, body.persona.trim())
        .map_err(internal_error)?;
    state.ctx.notifier.notify(SimEventKind::AgentUpdated, agent.id.clone());
    Ok(Json(agent))
}

async fn get_agent(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    require_agent(&state, &agent_id).map(Json)
}

async fn list_messages(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    require_agent(&state, &agent_id)?;
    let limit = clamp_limit(query.limit, 100, 1, 1000);
    state
        .ctx
        .db
        .recent_messages(&agent_id, limit)
        .map(Json)
        .map_err(internal_error)
}

/// Record one visible exchange in the agent's private conversation.
async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Json<ChatMessage>, ApiError> {
    require_agent(&state, &agent_id)?;
    let content = body.content.trim();
    if content.is_empty() {
        return Err(bad_request("content cannot be empty"));
    }

    let sender = if body.from_agent {
        agent_id.as_str()
    } else {
        USER_SENDER_ID
    };
    let message = state
        .ctx
        .db
        .append_message(&agent_id, sender, MessageKind::Text, content)
        .map_err(internal_error)?;
    state
        .ctx
        .db
        .record_exchange(&agent_id)
        .map_err(internal_error)?;
    state
        .ctx
        .notifier
        .notify(SimEventKind::MessageAdded, agent_id.clone());
    Ok(Json(message))
}

async fn block_agent(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    set_block_status(
        &state,
        &agent_id,
        Some(BlockStatus::BlockedByUser { since: now_millis() }),
    )
}

async fn unblock_agent(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    set_block_status(&state, &agent_id, None)
}

/// The user turned down a reconciliation request; start a new cooldown.
async fn decline_reconciliation(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    let agent = require_agent(&state, &agent_id)?;
    if !matches!(
        agent.block_status,
        Some(BlockStatus::PendingUserApproval { .. })
    ) {
        return Err((
            StatusCode::CONFLICT,
            format!("agent '{}' has no pending reconciliation", agent_id),
        ));
    }
    set_block_status(
        &state,
        &agent_id,
        Some(BlockStatus::BlockedByUser { since: now_millis() }),
    )
}

fn set_block_status(
    state: &ServerState,
    agent_id: &str,
    status: Option<BlockStatus>,
) -> Result<Json<Agent>, ApiError> {
    let changed = state
        .ctx
        .db
        .set_block_status(agent_id, status)
        .map_err(internal_error)?;
    if !changed {
        return Err(not_found(format!("agent '{}' not found", agent_id)));
    }
    state
        .ctx
        .notifier
        .notify(SimEventKind::AgentUpdated, agent_id.to_string());
    require_agent(state, agent_id).map(Json)
}

async fn wake_agent(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<ExecReport>, ApiError> {
    require_agent(&state, &agent_id)?;
    actions::wake(&state.ctx, &agent_id, WakeScope::Private, CallPriority::High)
        .await
        .map(Json)
        .map_err(generation_error)
}

async fn summarize_agent(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<PassReport>, ApiError> {
    require_agent(&state, &agent_id)?;
    if state.ctx.gate.is_queued(&summary::summary_key(&agent_id)) {
        return Err((
            StatusCode::CONFLICT,
            format!("summarization for '{}' is already queued", agent_id),
        ));
    }
    summary::summarize_now(&state.ctx, &agent_id)
        .await
        .map(Json)
        .map_err(generation_error)
}

async fn list_summaries(
    State(state): State<Arc<ServerState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Vec<SummaryRecord>>, ApiError> {
    require_agent(&state, &agent_id)?;
    state
        .ctx
        .db
        .list_summaries(&agent_id)
        .map(Json)
        .map_err(internal_error)
}

async fn set_summary_enabled(
    State(state): State<Arc<ServerState>>,
    Path(summary_id): Path<String>,
    Json(body): Json<SetEnabledRequest>,
) -> Result<Json<SetEnabledResponse>, ApiError> {
    let changed = state
        .ctx
        .db
        .set_summary_enabled(&summary_id, body.enabled)
        .map_err(internal_error)?;
    if !changed {
        return Err(not_found(format!("summary '{}' not found", summary_id)));
    }
    Ok(Json(SetEnabledResponse {
        id: summary_id,
        enabled: body.enabled,
    }))
}

async fn list_groups(State(state): State<Arc<ServerState>>) -> Result<Json<Vec<Group>>, ApiError> {
    state.ctx.db.list_groups().map(Json).map_err(internal_error)
}

async fn create_group(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateGroupRequest>,
) -> Result<Json<Group>, ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(bad_request("name cannot be empty"));
    }
    for member in &body.members {
        require_agent(&state, member)?;
    }
    state
        .ctx
        .db
        .create_group(name, body.enable_offline_sim, &body.members)
        .map(Json)
        .map_err(internal_error)
}

async fn list_stickers(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<Sticker>>, ApiError> {
    state.ctx.db.list_stickers().map(Json).map_err(internal_error)
}

async fn create_sticker(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateStickerRequest>,
) -> Result<Json<Sticker>, ApiError> {
    if body.name.trim().is_empty() {
        return Err(bad_request("name cannot be empty"));
    }
    state
        .ctx
        .db
        .add_sticker(&body.name, &body.description)
        .map(Json)
        .map_err(internal_error)
}

async fn ws_events_route(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(state, socket))
}

async fn handle_events_socket(state: Arc<ServerState>, mut socket: WebSocket) {
    let mut rx = state.ws_events.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(serialized) => serialized,
                            Err(error) => {
                                tracing::warn!("Failed to serialize websocket event: {}", error);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn require_agent(state: &ServerState, agent_id: &str) -> Result<Agent, ApiError> {
    state
        .ctx
        .db
        .get_agent(agent_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("agent '{}' not found", agent_id)))
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, message.to_string())
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

/// Interactive generation failures are shown to the user, mapped by class.
fn generation_error(error: anyhow::Error) -> ApiError {
    let status = match call_error(&error) {
        Some(CallError::Config(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Some(_) => StatusCode::BAD_GATEWAY,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    };
    tracing::warn!("Interactive request failed: {:#}", error);
    (status, format!("{:#}", error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn required(token: &str) -> BackendAuthConfig {
        BackendAuthConfig {
            mode: AuthMode::Required,
            token: Some(token.to_string()),
        }
    }

    #[test]
    fn authorize_accepts_matching_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        assert!(authorize(&headers, &required("token-123")).is_ok());
    }

    #[test]
    fn authorize_rejects_missing_or_invalid_token() {
        assert!(authorize(&HeaderMap::new(), &required("token-123")).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        );
        assert_eq!(
            authorize(&headers, &required("token-123")),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn authorize_allows_when_auth_mode_disabled() {
        let auth = BackendAuthConfig {
            mode: AuthMode::Disabled,
            token: None,
        };
        assert!(authorize(&HeaderMap::new(), &auth).is_ok());
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert_eq!(parse_auth_mode(None).unwrap(), AuthMode::Required);
        assert_eq!(
            parse_auth_mode(Some("off".to_string())).unwrap(),
            AuthMode::Disabled
        );
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }

    #[test]
    fn envelope_carries_event_type_and_id() {
        let envelope = envelope(SimEvent::new(SimEventKind::PostCreated, "post-1"));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event_type"], "post_created");
        assert_eq!(json["payload"]["id"], "post-1");
        assert!(envelope.emitted_at <= Utc::now());
    }

    #[test]
    fn generation_errors_map_to_gateway_statuses() {
        let config: anyhow::Error = CallError::Config("no model".to_string()).into();
        assert_eq!(generation_error(config).0, StatusCode::SERVICE_UNAVAILABLE);

        let transient: anyhow::Error = CallError::Transient("timeout".to_string()).into();
        assert_eq!(generation_error(transient).0, StatusCode::BAD_GATEWAY);

        assert_eq!(
            generation_error(anyhow!("disk full")).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
