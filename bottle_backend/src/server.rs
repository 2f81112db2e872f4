use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::agent::{ChatEngine, Engagement, SubmitOutcome};
use crate::database::Turn;
use crate::error::ChatError;
use crate::runtime::{BackendRuntime, EngineRegistry};

#[derive(Clone)]
pub struct ServerState {
    pub engines: Arc<EngineRegistry>,
    pub auth: BackendAuthConfig,
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

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct SubmitTurnRequest {
    text: String,
}

#[derive(Debug, Serialize)]
struct ResetResponse {
    reset: bool,
}

type ApiError = (StatusCode, String);

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = std::env::var("BOTTLE_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid BOTTLE_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState {
        engines: runtime.engines.clone(),
        auth,
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Bottle backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route(
            "/conversations/:id/turns",
            get(list_turns).post(submit_turn),
        )
        .route("/conversations/:id/engagement", get(get_engagement))
        .route(
            "/conversations/:id",
            axum::routing::delete(reset_conversation),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth_middleware));

    Router::new().nest("/v1", protected)
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("BOTTLE_BACKEND_AUTH_MODE").ok().as_deref())?;
    let token = std::env::var("BOTTLE_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "BOTTLE_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<&str>) -> Result<AuthMode> {
    match raw.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("required") => Ok(AuthMode::Required),
        Some("disabled") => Ok(AuthMode::Disabled),
        Some(other) => Err(anyhow!(
            "Invalid BOTTLE_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
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

/// Every conversation route, health included, needs the bearer token unless
/// auth is disabled.
fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().strip_prefix("Bearer "));
    match (auth.token.as_deref(), presented) {
        (Some(expected), Some(presented)) if presented == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn list_turns(
    State(state): State<Arc<ServerState>>,
    Path(store_id): Path<String>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    let engine = engine_for(&state, &store_id).await?;
    engine.transcript().map(Json).map_err(chat_error)
}

async fn submit_turn(
    State(state): State<Arc<ServerState>>,
    Path(store_id): Path<String>,
    Json(body): Json<SubmitTurnRequest>,
) -> Result<Json<SubmitOutcome>, ApiError> {
    let engine = engine_for(&state, &store_id).await?;
    engine
        .submit_user_turn(&body.text)
        .await
        .map(Json)
        .map_err(chat_error)
}

async fn get_engagement(
    State(state): State<Arc<ServerState>>,
    Path(store_id): Path<String>,
) -> Result<Json<Engagement>, ApiError> {
    let engine = engine_for(&state, &store_id).await?;
    engine.engagement().map(Json).map_err(chat_error)
}

async fn reset_conversation(
    State(state): State<Arc<ServerState>>,
    Path(store_id): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    let engine = engine_for(&state, &store_id).await?;
    engine.reset().await.map_err(chat_error)?;
    Ok(Json(ResetResponse { reset: true }))
}

async fn engine_for(state: &ServerState, store_id: &str) -> Result<Arc<ChatEngine>, ApiError> {
    state.engines.engine(store_id).await.map_err(chat_error)
}

fn chat_error(error: ChatError) -> ApiError {
    let status = match &error {
        ChatError::Validation(_) => StatusCode::BAD_REQUEST,
        ChatError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ChatError::Service(_) | ChatError::Synthesis(_) => StatusCode::BAD_GATEWAY,
    };
    if status.is_server_error() {
        tracing::error!(kind = error.kind(), "Conversation request failed: {}", error);
    }
    (status, error.to_string())
}
