//! Recorder introspection: reachability, credential-verifying device info,
//! and channel snapshots.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header;
use serde_json::json;

use super::AppState;
use crate::error::AppError;
use crate::result::Result;

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/api/recorder/ping", get(ping))
        .route("/api/recorder/info", get(info))
        .route("/api/recorder/snapshot/:channel", get(snapshot))
}

fn client(state: &AppState) -> Result<isapi::Client> {
    let recorder = &state.config.recorder;
    if recorder.ip.is_empty() {
        return Err(AppError::unavailable("recorder address not configured"));
    }
    Ok(isapi::Client::new(
        &recorder.ip,
        &recorder.username,
        &recorder.password,
    ))
}

fn map_isapi(err: isapi::Error) -> AppError {
    match err {
        isapi::Error::Auth(_) => AppError::unauthorized(err),
        isapi::Error::Transport(_) => AppError::unavailable(err),
        _ => AppError::InternalServerError(err.into()),
    }
}

async fn ping(State(state): State<AppState>) -> Result<Response> {
    let reachable = client(&state)?.ping().await.is_ok();
    Ok(Json(json!({ "reachable": reachable })).into_response())
}

async fn info(State(state): State<AppState>) -> Result<Response> {
    let info = client(&state)?.device_info().await.map_err(map_isapi)?;
    Ok(Json(info).into_response())
}

async fn snapshot(State(state): State<AppState>, Path(channel): Path<i64>) -> Result<Response> {
    let jpeg = client(&state)?.snapshot(channel).await.map_err(map_isapi)?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}
