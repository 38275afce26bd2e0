//! Incremental, resumable embedding indexing.
//!
//! The manifest says what exists; `index_state.json` says what is already
//! embedded. The pipeline diffs the two, embeds the remainder in fixed-size
//! batches, and flushes the state after every batch so a crash redoes at
//! most one batch of work.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::frame::{self, FrameMetadata, MANIFEST_FILE};
use crate::store::{Storage, vec_to_le_bytes};

pub const INDEX_STATE_FILE: &str = "index_state.json";

/// The embedding collaborator seam. Production talks to the sidecar over
/// HTTP; tests count calls.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One fixed-length vector per input image path.
    async fn encode_images(&self, paths: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Blocks until the collaborator answers its readiness probe, up to
    /// `timeout`, then fails with a descriptive error.
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    #[serde(default)]
    pub camera_id: String,
    #[serde(default)]
    pub frames_done: usize,
    #[serde(default)]
    pub frames_total: usize,
    pub message: String,
}

impl ProgressEvent {
    pub fn stage(stage: &str, camera_id: &str, message: String) -> Self {
        ProgressEvent {
            stage: stage.to_string(),
            camera_id: camera_id.to_string(),
            message,
            ..Default::default()
        }
    }
}

/// Resume checkpoint for one camera+date. An id present here has its
/// embedding durably stored; an absent id will be retried next run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexState {
    #[serde(default)]
    pub indexed_frames: HashMap<String, bool>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

pub async fn load_index_state(path: &Path) -> IndexState {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(_) => return IndexState::default(),
    };
    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(err) => {
            warn!("discarding unreadable index state {}: {}", path.display(), err);
            IndexState::default()
        }
    }
}

pub async fn save_index_state(path: &Path, state: &IndexState) -> Result<()> {
    let tmp = frame::tmp_path_for(path);
    let json = serde_json::to_string_pretty(state)?;
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing index state {}", path.display()))?;
    Ok(())
}

pub struct Pipeline {
    embedder: Arc<dyn Embedder>,
    store: Storage,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(embedder: Arc<dyn Embedder>, store: Storage, batch_size: usize) -> Self {
        Pipeline {
            embedder,
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Indexes every not-yet-embedded frame listed in the directory's
    /// manifest. Emits progress the whole way; an empty pending set is
    /// success, reported as "already indexed".
    pub async fn index_frames(
        &self,
        frames_dir: &Path,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> Result<()> {
        let manifest_path = frames_dir.join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("reading manifest {}", manifest_path.display()))?;
        let frames: Vec<FrameMetadata> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing manifest {}", manifest_path.display()))?;

        if frames.is_empty() {
            let _ = progress
                .send(ProgressEvent::stage("complete", "", "no frames to index".to_string()))
                .await;
            return Ok(());
        }

        let state_path = frames_dir.join(INDEX_STATE_FILE);
        let mut state = load_index_state(&state_path).await;

        let pending: Vec<&FrameMetadata> = frames
            .iter()
            .filter(|f| !state.indexed_frames.contains_key(&f.id()))
            .collect();

        if pending.is_empty() {
            let _ = progress
                .send(ProgressEvent::stage(
                    "complete",
                    &frames[0].camera_id,
                    format!("all {} frames already indexed", frames.len()),
                ))
                .await;
            return Ok(());
        }

        let camera_id = frames[0].camera_id.clone();
        let total = pending.len();
        let mut done = 0usize;

        let _ = progress
            .send(ProgressEvent {
                stage: "indexing".to_string(),
                camera_id: camera_id.clone(),
                frames_done: 0,
                frames_total: total,
                message: format!(
                    "indexing {} frames ({} already done)",
                    total,
                    frames.len() - total
                ),
            })
            .await;

        for (batch_index, batch) in pending.chunks(self.batch_size).enumerate() {
            let paths: Vec<String> = batch
                .iter()
                .map(|f| absolute_frame_path(frames_dir, &f.frame_path))
                .collect();

            let embeddings = self
                .embedder
                .encode_images(&paths)
                .await
                .with_context(|| format!("encoding batch {}", batch_index))?;

            for (frame, embedding) in batch.iter().zip(embeddings.iter()) {
                let id = frame.id();
                self.store
                    .put_embedding(
                        &id,
                        &vec_to_le_bytes(embedding),
                        &frame.camera_id,
                        &frame.timestamp.to_rfc3339(),
                        &frame.frame_path,
                        &frame.source_video,
                    )
                    .await?;
                state.indexed_frames.insert(id, true);
            }

            // Checkpoint before reporting the batch; a crash from here on
            // redoes at most this batch.
            state.last_updated = Some(Utc::now());
            save_index_state(&state_path, &state).await?;

            done += batch.len();
            let _ = progress
                .send(ProgressEvent {
                    stage: "indexing".to_string(),
                    camera_id: camera_id.clone(),
                    frames_done: done,
                    frames_total: total,
                    message: format!("batch {} complete", batch_index + 1),
                })
                .await;
        }

        let _ = progress
            .send(ProgressEvent {
                stage: "complete".to_string(),
                camera_id,
                frames_done: total,
                frames_total: total,
                message: "indexing complete".to_string(),
            })
            .await;
        Ok(())
    }
}

fn absolute_frame_path(frames_dir: &Path, frame_path: &str) -> String {
    let path = Path::new(frame_path);
    if path.is_absolute() {
        frame_path.to_string()
    } else {
        let file = path.file_name().map(PathBuf::from).unwrap_or_default();
        frames_dir.join(file).to_string_lossy().into_owned()
    }
}
