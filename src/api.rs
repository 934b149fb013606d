//! HTTP surface.
//!
//! Thin axum handlers over the services; all behaviour lives in the
//! service types. Queries stream back as server-sent events.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::{AgentService, QueryRequest};
use crate::channels::{ChannelSessionMapper, InboundRequest};
use crate::error::{ChannelError, ConfigError, PluginError, SessionError};
use crate::extensions::PluginManager;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<AgentService>,
    pub plugins: Arc<PluginManager>,
    pub mapper: Arc<ChannelSessionMapper>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(query))
        .route("/api/interrupt/{session_id}", post(interrupt))
        .route("/api/sessions", get(sessions))
        .route("/api/config", get(config))
        .route("/api/config/switch", post(switch_config))
        .route("/api/plugins", get(list_plugins))
        .route("/api/plugins/{id}", get(plugin_info))
        .route("/api/plugins/{id}/enable", post(enable_plugin))
        .route("/api/plugins/{id}/disable", post(disable_plugin))
        .route("/api/plugins/{id}/health", get(plugin_health))
        .route("/channels/{*path}", post(channel_inbound))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error body `{"error": "..."}` with a mapped status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        let status = match e {
            SessionError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            SessionError::DuplicateSession { .. } | SessionError::InvalidResume { .. } => {
                StatusCode::CONFLICT
            }
            SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        let status = match e {
            ConfigError::UnknownConfig { .. } => StatusCode::NOT_FOUND,
            ConfigError::InvalidConfig { .. } | ConfigError::InvalidValue { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<PluginError> for ApiError {
    fn from(e: PluginError) -> Self {
        let status = match &e {
            PluginError::NotFound(_) => StatusCode::NOT_FOUND,
            PluginError::AlreadyInstalled(_) => StatusCode::CONFLICT,
            PluginError::InvalidManifest { .. } => StatusCode::BAD_REQUEST,
            PluginError::Channel(ChannelError::InvalidMessage(_)) => StatusCode::BAD_REQUEST,
            PluginError::Channel(ChannelError::NotAccepting { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "sessions": state.agent.registry().len(),
        "provider": state.agent.switchboard().active_name(),
        "plugins": state.plugins.summary(),
    }))
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.agent.invoke(request).await?;
    Ok(Sse::new(events.map(|event| Ok(event.to_sse()))))
}

async fn interrupt(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.agent.interrupt(&session_id).await?;
    Ok(Json(json!({ "status": "interrupted", "session_id": session_id })))
}

async fn sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "sessions": state.agent.registry().list(),
        "mappings": state.mapper.stats(),
    }))
}

async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let switchboard = state.agent.switchboard();
    Json(json!({
        "active": switchboard.active_name(),
        "generation": switchboard.generation(),
        "providers": switchboard.list(),
    }))
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    name: String,
}

async fn switch_config(
    State(state): State<AppState>,
    Json(request): Json<SwitchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let active = state.agent.switchboard().switch(&request.name)?;
    Ok(Json(json!({ "active": active.name })))
}

async fn list_plugins(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "plugins": state.plugins.list(),
        "summary": state.plugins.summary(),
    }))
}

async fn plugin_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let info = state.plugins.info(&id)?;
    Ok(Json(serde_json::to_value(info).unwrap_or_else(|_| json!({}))))
}

async fn enable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = state.plugins.enable(&id)?;
    Ok(Json(json!({ "id": id, "enabled": true, "changed": changed })))
}

async fn disable_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let changed = state.plugins.disable(&id)?;
    Ok(Json(json!({ "id": id, "enabled": false, "changed": changed })))
}

async fn plugin_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state.plugins.health_check(&id).await?;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(report)).into_response())
}

async fn channel_inbound(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    let request = InboundRequest {
        path: format!("/{path}"),
        headers,
        query,
        body: body.to_vec(),
    };
    Ok(Json(state.plugins.handle_inbound(request).await?))
}
