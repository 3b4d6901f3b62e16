//! Long-lived SSE subscription to a run's event stream.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures::StreamExt;
use gauntlet_core::events::RunEvent;
use std::convert::Infallible;
use std::sync::Arc;

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .store
        .get_run(&id)?
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", id)))?;
    if !run.stream {
        return Err(ApiError::bad_request(format!(
            "run {} was created without streaming",
            id
        )));
    }

    // Attach before the status echo so no event published in between is
    // missed; history is never replayed.
    let subscription = state.engine.bus().subscribe(&id);
    let initial = RunEvent::RunStatus {
        run_id: run.id,
        status: run.status,
    };
    let first = futures::stream::once(async move { sse_event(&initial) });
    let rest = futures::stream::unfold(subscription.rx, |mut rx| async move {
        rx.recv().await.map(|event| (sse_event(&event), rx))
    });
    let stream = first.chain(rest).map(Ok::<_, Infallible>);

    // Intermediaries must not buffer or transform the stream.
    Ok((
        [
            ("cache-control", "no-cache, no-transform"),
            ("x-accel-buffering", "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    ))
}

fn sse_event(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    Event::default().data(data)
}
