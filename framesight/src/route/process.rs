//! Processing job endpoints: accept a request, stream its progress, list
//! history.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Router, response::Response};
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::error::AppError;
use crate::job::{JobStatus, ProcessRequest, StartOutcome};
use crate::result::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/api/process", post(start))
        .route("/api/process/status", get(status))
        .route("/api/process/history", get(history))
}

async fn start(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> Result<Response> {
    match state.jobs.start(req).await {
        Ok(StartOutcome::AlreadyCached) => Ok((
            StatusCode::OK,
            Json(json!({ "job_id": "", "status": "already_cached" })),
        )
            .into_response()),
        Ok(StartOutcome::Started(job_id)) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": job_id, "status": "started" })),
        )
            .into_response()),
        Err(err) => Err(AppError::bad_request(err)),
    }
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    job_id: String,
}

/// SSE feed of a job's progress: replays everything recorded so far, then
/// follows new events until the job reaches a terminal state. A client can
/// reconnect at any time and replay from the start.
async fn status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Result<Response> {
    if !state.jobs.contains(&params.job_id).await {
        return Err(AppError::not_found("job not found"));
    }

    let jobs = state.jobs.clone();
    let job_id = params.job_id;
    let stream = async_stream::stream! {
        let mut cursor = 0usize;
        loop {
            let Some((events, status, _error)) = jobs.events(&job_id, cursor).await else {
                break;
            };
            cursor += events.len();
            for event in events {
                if let Ok(sse_event) = Event::default().json_data(&event) {
                    yield Ok::<_, Infallible>(sse_event);
                }
            }
            // Terminal status is only set after the collector has drained
            // every event, so this read saw the complete log.
            if status != JobStatus::Running {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

async fn history(State(state): State<AppState>) -> Response {
    Json(state.jobs.history().await).into_response()
}
