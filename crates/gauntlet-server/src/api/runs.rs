//! Run lifecycle and manual review endpoints.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use gauntlet_core::engine::{CreateRun, ReviewDecision};
use gauntlet_core::model::{Run, RunStatus};
use gauntlet_core::storage::RunResultDetail;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRun>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run = state.engine.create_run(req)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": run.id }))))
}

pub async fn execute_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run = state.engine.execute(&id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": run.id, "status": run.status })),
    ))
}

pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.engine.cancel_run(&id, "user")?;
    Ok(Json(json!({
        "id": id,
        "status": "cancelled",
        "cancelled": cancelled,
    })))
}

pub async fn cancel_model(
    State(state): State<Arc<AppState>>,
    Path((id, model_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.engine.cancel_model(&id, &model_id)?;
    Ok(Json(json!({
        "id": id,
        "model_id": model_id,
        "cancelled": cancelled,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
    pub problem_set_id: Option<String>,
    pub limit: Option<u32>,
}

pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(parse_status(raw)?),
    };
    let runs = state.store.list_runs(
        status,
        query.problem_set_id.as_deref(),
        query.limit.unwrap_or(50),
    )?;
    Ok(Json(runs))
}

pub async fn run_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<RunResultDetail>>, ApiError> {
    if state.store.get_run(&id)?.is_none() {
        return Err(ApiError::not_found(format!("run {} not found", id)));
    }
    Ok(Json(state.store.results_with_problems(&id)?))
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub decision: ReviewDecision,
    pub notes: Option<String>,
}

pub async fn review_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<Value>, ApiError> {
    let result = state.engine.review_result(&id, req.decision, req.notes)?;
    Ok(Json(json!({
        "id": result.id,
        "status": result.status,
        "score": result.score,
        "judged_by": result.judged_by,
    })))
}

fn parse_status(raw: &str) -> Result<RunStatus, ApiError> {
    match raw {
        "queued" => Ok(RunStatus::Queued),
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "cancelled" => Ok(RunStatus::Cancelled),
        "error" => Ok(RunStatus::Error),
        other => Err(ApiError::bad_request(format!("unknown status {}", other))),
    }
}
