use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{Level, error, info_span};

use crate::config::Config;
use crate::extract::Ffmpeg;
use crate::job::JobManager;
use crate::ml::MlClient;
use crate::pipeline::Embedder;
use crate::route::AppState;
use crate::store::Storage;
use crate::stream::Streamer;

pub mod config;
pub mod error;
pub mod extract;
pub mod frame;
pub mod job;
pub mod ml;
pub mod pipeline;
pub mod result;
pub mod route;
pub mod store;
pub mod stream;

pub async fn server_up<F>(cfg: Config, listener: TcpListener, signal: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = Storage::open(&cfg.data.db_path).await?;
    let ml = Arc::new(MlClient::new(cfg.ml.url.clone()));
    let embedder: Arc<dyn Embedder> = ml.clone();
    let transcoder = Arc::new(Ffmpeg::new(
        cfg.transcoder.ffmpeg.clone(),
        cfg.transcoder.ffprobe.clone(),
    ));

    let streamer = Streamer::new(
        cfg.data.streams_dir.clone(),
        cfg.transcoder.ffmpeg.clone(),
        Duration::from_secs(cfg.stream.idle_timeout_secs),
    );
    streamer.spawn_sweep();

    let jobs = JobManager::new(cfg.clone(), store.clone(), embedder, transcoder);

    let app_state = AppState {
        config: cfg.clone(),
        jobs,
        streamer: streamer.clone(),
        ml,
        store,
    };

    let app = Router::new()
        .merge(route::router())
        .with_state(app_state)
        .layer(if cfg.http.cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        "http_request",
                        uri = ?request.uri(),
                        method = ?request.method(),
                    )
                })
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO))
                .on_failure(tower_http::trace::DefaultOnFailure::new().level(Level::INFO)),
        );

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap_or_else(|e| error!("application error: {e}"));

    streamer.stop_all().await;
    Ok(())
}
