//! Live view endpoints: start/stop a camera's HLS transcode and serve its
//! playlist and segments, refreshing the idle timer on every read.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use http::header;
use serde_json::json;

use super::AppState;
use crate::config::is_safe_component;
use crate::error::AppError;
use crate::result::Result;

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/api/stream/:camera_id/start", post(start))
        .route("/api/stream/:camera_id/stop", post(stop))
        .route("/api/stream/:camera_id/status", get(status))
        .route("/api/stream/:camera_id/:file", get(file))
}

async fn start(State(state): State<AppState>, Path(camera_id): Path<String>) -> Result<Response> {
    let camera = state
        .store
        .camera(&camera_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("camera not found: {}", camera_id)))?;
    if !camera.is_recorder() {
        return Err(AppError::bad_request(
            "live view requires a recorder-backed camera",
        ));
    }

    let recorder = &state.config.recorder;
    if recorder.ip.is_empty() {
        return Err(AppError::unavailable("recorder address not configured"));
    }

    // Stream type 2 is the recorder's low-resolution sub stream.
    let source_url = isapi::rtsp_url(
        &recorder.ip,
        recorder.rtsp_port,
        &recorder.username,
        &recorder.password,
        camera.nvr_channel,
        2,
    );
    state.streamer.start(&camera_id, &source_url).await?;

    Ok(Json(json!({
        "status": "started",
        "playlist": format!("/api/stream/{}/index.m3u8", camera_id),
    }))
    .into_response())
}

async fn stop(State(state): State<AppState>, Path(camera_id): Path<String>) -> Response {
    state.streamer.stop(&camera_id).await;
    Json(json!({ "status": "stopped" })).into_response()
}

async fn status(State(state): State<AppState>, Path(camera_id): Path<String>) -> Response {
    Json(json!({ "active": state.streamer.is_active(&camera_id).await })).into_response()
}

async fn file(
    State(state): State<AppState>,
    Path((camera_id, file)): Path<(String, String)>,
) -> Result<Response> {
    if !is_safe_component(&file) {
        return Err(AppError::bad_request("invalid file name"));
    }

    let dir = state
        .streamer
        .dir(&camera_id)
        .await
        .ok_or_else(|| AppError::not_found("stream not active"))?;
    state.streamer.touch(&camera_id).await;

    let data = tokio::fs::read(dir.join(&file))
        .await
        .map_err(|_| AppError::not_found("segment not found"))?;

    let content_type = match file.rsplit('.').next() {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("ts") => "video/mp2t",
        Some("m4s") | Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}
