//! Module lifecycle endpoints.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::IPCServer;
use crate::supervisor::error::SupervisorResult;
use crate::supervisor::AppInfo;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// GET /api/apps - an empty list when the apps directory cannot be read
pub async fn list_apps(State(state): State<IPCServer>) -> Response {
    match state.supervisor.list().await {
        Ok(apps) => Json(apps).into_response(),
        Err(e) => {
            tracing::error!("Failed to list modules: {:#}", e);
            Json(Vec::<AppInfo>::new()).into_response()
        }
    }
}

/// POST /api/apps/:name/start
pub async fn start_app(
    State(state): State<IPCServer>,
    Path(name): Path<String>,
) -> SupervisorResult<Json<Value>> {
    let outcome = state.supervisor.start(&name).await?;
    let message = if outcome.already_running {
        "Dev server already running"
    } else {
        "Dev server started"
    };
    Ok(Json(json!({
        "port": outcome.port,
        "message": message,
    })))
}

/// POST /api/apps/:name/stop
pub async fn stop_app(
    State(state): State<IPCServer>,
    Path(name): Path<String>,
) -> SupervisorResult<Json<Value>> {
    let was_running = state.supervisor.stop(&name).await?;
    Ok(Json(json!({
        "message": "Dev server stopped",
        "wasRunning": was_running,
    })))
}

/// DELETE /api/apps/:name
pub async fn delete_app(
    State(state): State<IPCServer>,
    Path(name): Path<String>,
) -> SupervisorResult<Json<Value>> {
    state.supervisor.delete(&name).await?;
    tracing::info!("Module {} deleted", name);
    Ok(Json(json!({
        "success": true,
        "message": "Module deleted successfully",
    })))
}

/// GET /api/apps/:name/logs?since=&count=
pub async fn app_logs(
    State(state): State<IPCServer>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> SupervisorResult<Json<Value>> {
    let lines = state
        .supervisor
        .logs(&name, query.since, query.count)
        .await?;
    Ok(Json(json!({ "lines": lines })))
}
