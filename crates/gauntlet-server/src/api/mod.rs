pub mod providers;
pub mod runs;
pub mod stream;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/runs", post(runs::create_run).get(runs::list_runs))
        .route("/api/runs/:id/execute", post(runs::execute_run))
        .route("/api/runs/:id/cancel", post(runs::cancel_run))
        .route("/api/runs/:id/models/:model_id/cancel", post(runs::cancel_model))
        .route("/api/runs/:id/results", get(runs::run_results))
        .route("/api/runs/:id/events", get(stream::subscribe))
        .route("/api/results/:id/review", post(runs::review_result))
        .route("/api/providers/:id/test", post(providers::test_provider))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
