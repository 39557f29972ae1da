use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, HeaderValue, Method, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_shared::call::{CallHistoryEntry, CallSession, CallStatus};
use parley_shared::constants::USER_ID_HEADER;
use parley_shared::protocol::{CleanupResponse, InitiateCallRequest};
use parley_shared::types::{SessionId, UserId};

use crate::config::ServerConfig;
use crate::coordinator::CallCoordinator;
use crate::error::CallError;
use crate::gateway;
use crate::presence::PresenceRegistry;
use crate::relay::SignalRelay;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: CallCoordinator,
    pub presence: PresenceRegistry,
    pub relay: SignalRelay,
    pub config: Arc<ServerConfig>,
}

/// Identity of the caller, as asserted by the upstream auth layer through the
/// `x-user-id` header. Unknown users are rejected the same way as anonymous ones.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = CallError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .ok_or(CallError::Unauthorized)?;

        if !state.coordinator.user_exists(user).await? {
            return Err(CallError::Unauthorized);
        }

        Ok(AuthUser(user))
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    let calls = Router::new()
        .route("/initiate/:receiver_id", post(initiate_call))
        .route("/answer/:session_id", put(answer_call))
        .route("/decline/:session_id", put(decline_call))
        .route("/end/:session_id", put(end_call))
        .route("/cleanup", post(force_cleanup))
        .route("/status", get(call_status))
        .route("/history", get(call_history));

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(gateway::ws_handler))
        .nest("/api/calls", calls)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    online_users: usize,
    /// Sessions ringing or ongoing.
    active_calls: usize,
    /// Relay groups with at least one joined connection.
    signaling_groups: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Result<Json<ServerInfoResponse>, CallError> {
    Ok(Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        online_users: state.presence.online_count().await,
        active_calls: state.coordinator.active_call_count().await?,
        signaling_groups: state.relay.group_count().await,
    }))
}

/// Ids in the path are parsed here rather than by the `Path` extractor, so a
/// malformed id gets the same JSON 404 as an unknown one.
fn parse_id<T: FromStr>(raw: &str, what: &'static str) -> Result<T, CallError> {
    raw.trim().parse().map_err(|_| CallError::NotFound(what))
}

/// No body means an audio call. A body that is there must parse.
fn parse_initiate_body(body: &[u8]) -> Result<InitiateCallRequest, CallError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(InitiateCallRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| CallError::InvalidRequest(e.to_string()))
}

async fn initiate_call(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(receiver): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<CallSession>), CallError> {
    let receiver: UserId = parse_id(&receiver, "User")?;
    let request = parse_initiate_body(&body)?;
    let session = state
        .coordinator
        .initiate(caller, receiver, request.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn answer_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<CallSession>, CallError> {
    let session_id: SessionId = parse_id(&session_id, "Call")?;
    Ok(Json(state.coordinator.answer(session_id, user).await?))
}

async fn decline_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<CallSession>, CallError> {
    let session_id: SessionId = parse_id(&session_id, "Call")?;
    Ok(Json(state.coordinator.decline(session_id, user).await?))
}

async fn end_call(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(session_id): Path<String>,
) -> Result<Json<CallSession>, CallError> {
    let session_id: SessionId = parse_id(&session_id, "Call")?;
    Ok(Json(state.coordinator.end(session_id, user).await?))
}

async fn force_cleanup(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<CleanupResponse>, CallError> {
    let cleaned_count = state.coordinator.force_cleanup(user).await?;
    Ok(Json(CleanupResponse { cleaned_count }))
}

async fn call_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<CallStatus>, CallError> {
    Ok(Json(state.coordinator.status(user).await?))
}

async fn call_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<CallHistoryEntry>>, CallError> {
    Ok(Json(state.coordinator.history(user).await?))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP + WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
