//! Provider connectivity probe endpoint.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use gauntlet_core::model::now_rfc3339;
use gauntlet_core::providers::probe::{probe_provider, ProbeReport};
use std::sync::Arc;

pub async fn test_provider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ProbeReport>, ApiError> {
    let provider = state
        .store
        .get_provider(&id)?
        .ok_or_else(|| ApiError::not_found(format!("provider {} not found", id)))?;

    let report = probe_provider(&state.probe_http, &provider).await;
    if report.ok {
        state.store.set_provider_checked(&id, &now_rfc3339())?;
    }
    Ok(Json(report))
}
