use std::sync::Arc;

use axum::Router;

use crate::config::Config;
use crate::job::JobManager;
use crate::ml::MlClient;
use crate::store::Storage;
use crate::stream::Streamer;

pub mod process;
pub mod recorder;
pub mod search;
pub mod stream;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jobs: JobManager,
    pub streamer: Streamer,
    pub ml: Arc<MlClient>,
    pub store: Storage,
}

pub fn router() -> Router<AppState> {
    process::route()
        .merge(stream::route())
        .merge(recorder::route())
        .merge(search::route())
}
