//! REST handlers under the `/ai/sandbox/v1/api` prefix (see [`crate::build_router`]).

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::Path;
use axum::extract::State;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use futures::StreamExt;
use sandbox_core::aggregate;
use sandbox_core::execute;
use sandbox_core::AcquireRequest;
use sandbox_core::CoreError;
use sandbox_core::ExecuteRequest;
use sandbox_core::FileRequest;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.manager.list().await.len(),
        "uptime": state.manager.uptime_secs(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    code: String,
    session_id: Option<String>,
    timeout: Option<u64>,
}

pub async fn execute_stream(
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> Result<Response, ApiError> {
    let stream = execute(
        &state.manager,
        ExecuteRequest {
            code: body.code,
            session_id: body.session_id,
            timeout: body.timeout.map(Duration::from_secs),
        },
    )
    .await?;

    let body_stream = stream.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_default();
        line.push('\n');
        Ok::<_, Infallible>(line)
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(axum::body::Body::from_stream(body_stream))
        .expect("building a streaming response never fails");
    Ok(response)
}

pub async fn execute_sync(
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stream = execute(
        &state.manager,
        ExecuteRequest {
            code: body.code,
            session_id: body.session_id,
            timeout: body.timeout.map(Duration::from_secs),
        },
    )
    .await?;

    let aggregated = aggregate(Box::pin(stream)).await;
    Ok(Json(json!({
        "resultCode": 0,
        "resultMsg": "success",
        "data": aggregated,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FileRequestBody {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    session_id: Option<String>,
    #[serde(default)]
    file_urls: Vec<String>,
    #[serde(default)]
    files: Vec<FileRequestBody>,
    timeout: Option<u64>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let outcome = state
        .manager
        .acquire(AcquireRequest {
            session_id: body.session_id,
            file_urls: body.file_urls,
            files: body
                .files
                .into_iter()
                .map(|f| FileRequest { id: f.id, url: f.url })
                .collect(),
            download_timeout: Duration::from_secs(
                body.timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            ),
        })
        .await?;

    info!(session_id = %outcome.session.id, "session acquired");
    Ok(Json(json!({
        "session_id": outcome.session.id,
        "working_directory": outcome.session.workdir.display().to_string(),
        "downloaded_files": outcome.downloaded_files,
        "errors": outcome.errors,
    })))
}

#[derive(Debug, Serialize)]
struct SessionEntry {
    created_at: u64,
    last_activity: u64,
    busy: bool,
    exec_count: u64,
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summaries = state.manager.list().await;
    let total = summaries.len();
    let sessions: HashMap<String, SessionEntry> = summaries
        .into_iter()
        .map(|s| {
            (
                s.id,
                SessionEntry {
                    created_at: s.created_at_secs,
                    last_activity: s.last_activity_secs,
                    busy: s.busy,
                    exec_count: s.exec_count,
                },
            )
        })
        .collect();
    Json(json!({ "sessions": sessions, "total": total }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .manager
        .get(&id)
        .await
        .ok_or_else(|| ApiError(CoreError::NotFound(id.clone())))?;

    let manifest = session.manifest.lock().await.all().clone();
    Ok(Json(json!({
        "session_id": session.id,
        "working_directory": session.workdir.display().to_string(),
        "busy": session.is_busy(),
        "exec_count": session.exec_count_snapshot(),
        "files": manifest,
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.terminate(&id).await?;
    Ok(Json(json!({ "resultCode": 0, "resultMsg": "success" })))
}

pub async fn interrupt_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.interrupt(&id).await?;
    Ok(Json(json!({ "resultCode": 0, "resultMsg": "success" })))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
