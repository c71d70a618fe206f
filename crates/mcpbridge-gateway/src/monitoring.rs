//! Monitoring control plane (admin HTTP).

use crate::identity;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use mcpbridge_core::SessionId;
use mcpbridge_flow::FlowStore;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

fn require_admin(headers: &HeaderMap) -> Result<(), StatusCode> {
    match identity::from_headers(headers) {
        Some(i) if identity::is_admin(&i) => Ok(()),
        Some(_) => Err(StatusCode::FORBIDDEN),
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Deserialize)]
pub struct EnableParams {
    /// Hours until the registration lapses.
    pub ttl_hours: Option<u64>,
}

pub async fn enable_monitoring(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Query(params): Query<EnableParams>,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&headers)?;
    let ttl_hours = params.ttl_hours.unwrap_or(24);
    state
        .monitor
        .enable(user_id, Duration::from_secs(ttl_hours * 3600));
    info!(user_id, ttl_hours, "monitoring enabled");
    Ok(Json(json!({ "user_id": user_id, "ttl_hours": ttl_hours })))
}

pub async fn disable_monitoring(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&headers)?;
    let was_monitored = state.monitor.disable(user_id);
    info!(user_id, "monitoring disabled");
    Ok(Json(json!({ "user_id": user_id, "was_monitored": was_monitored })))
}

pub async fn list_monitoring(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&headers)?;
    let entries: Vec<Value> = state
        .monitor
        .list()
        .into_iter()
        .map(|(user_id, remaining)| json!({ "user_id": user_id, "remaining_seconds": remaining }))
        .collect();
    Ok(Json(json!({ "monitored": entries })))
}

#[derive(Deserialize)]
pub struct FlowsParams {
    pub limit: Option<usize>,
}

pub async fn flows_for_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Query(params): Query<FlowsParams>,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&headers)?;
    let limit = params.limit.unwrap_or(20);
    let flows = state
        .flows
        .flows_for_user(user_id, limit)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({ "user_id": user_id, "flows": flows })))
}

pub async fn flow_for_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    require_admin(&headers)?;
    let record = state
        .flows
        .flow_for_session(&SessionId::new(session_id))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    match record {
        Some(record) => Ok(Json(json!({ "flow": record }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mcps: Vec<Value> = state
        .coordinator
        .snapshot()
        .into_iter()
        .map(|d| {
            json!({
                "name": d.name,
                "health": d.health,
                "tools": d.tools.len(),
            })
        })
        .collect();
    Json(json!({ "status": "ok", "mcps": mcps }))
}
