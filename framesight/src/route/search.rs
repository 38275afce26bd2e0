//! Text search over indexed frames, delegated to the embedding sidecar.

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use super::AppState;
use crate::error::AppError;
use crate::ml::SearchQuery;
use crate::result::Result;

pub fn route() -> Router<AppState> {
    Router::new().route("/api/search", post(search))
}

async fn search(State(state): State<AppState>, Json(query): Json<SearchQuery>) -> Result<Response> {
    if query.text.trim().is_empty() {
        return Err(AppError::bad_request("text is required"));
    }

    let db_path = state.config.data.db_path.to_string_lossy().into_owned();
    let results = state.ml.search_by_text(&db_path, &query).await?;
    Ok(Json(results).into_response())
}
