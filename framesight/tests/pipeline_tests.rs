//! Resume and incrementality behavior of the indexing pipeline.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use framesight::frame::{FrameMetadata, save_manifest};
use framesight::pipeline::{
    Embedder, INDEX_STATE_FILE, Pipeline, ProgressEvent, load_index_state,
};
use framesight::store::Storage;

/// Counts batch calls and encoded images; optionally starts failing after a
/// number of successful batch calls to simulate a backend crash.
struct CountingEmbedder {
    calls: AtomicUsize,
    images: AtomicUsize,
    fail_after_calls: Option<usize>,
}

impl CountingEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            images: AtomicUsize::new(0),
            fail_after_calls: None,
        })
    }

    fn failing_after(calls: usize) -> Arc<Self> {
        Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            images: AtomicUsize::new(0),
            fail_after_calls: Some(calls),
        })
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn encode_images(&self, paths: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.fail_after_calls {
            if call > limit {
                bail!("embedding backend crashed");
            }
        }
        self.images.fetch_add(paths.len(), Ordering::SeqCst);
        Ok(paths.iter().map(|_| vec![0.5f32; 8]).collect())
    }

    async fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Frames as one extraction run would produce them: 1-indexed, one per
/// interval, all from the same source video.
fn make_frames(camera: &str, hour: u32, count: u32) -> Vec<FrameMetadata> {
    let base = Utc.with_ymd_and_hms(2026, 2, 18, hour, 0, 0).unwrap();
    (1..=count)
        .map(|n| FrameMetadata {
            frame_path: format!("frame_{:02}00_{:06}.jpg", hour, n),
            camera_id: camera.to_string(),
            timestamp: base + chrono::Duration::seconds(((n - 1) * 5) as i64),
            source_video: format!("data/videos/{}/2026-02-18/{:02}00.mp4", camera, hour),
            frame_number: n,
            extraction_method: "time".to_string(),
        })
        .collect()
}

fn drain(rx: &mut mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn open_storage(root: &Path) -> Storage {
    Storage::open(&root.join("test.db")).await.unwrap()
}

#[tokio::test]
async fn rerun_on_unchanged_manifest_makes_zero_embedding_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let frames_dir = tmp.path().join("frames");
    save_manifest(&frames_dir, &make_frames("cam1", 8, 10))
        .await
        .unwrap();

    let store = open_storage(tmp.path()).await;
    let embedder = CountingEmbedder::new();
    let pipeline = Pipeline::new(embedder.clone(), store, 4);
    let (tx, mut rx) = mpsc::channel(256);

    pipeline.index_frames(&frames_dir, &tx).await.unwrap();
    assert_eq!(embedder.images.load(Ordering::SeqCst), 10);
    drain(&mut rx);

    pipeline.index_frames(&frames_dir, &tx).await.unwrap();
    assert_eq!(
        embedder.images.load(Ordering::SeqCst),
        10,
        "second run must not re-embed anything"
    );

    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| e.stage == "complete" && e.message.contains("all 10 frames already indexed")),
        "events: {:?}",
        events
    );
}

#[tokio::test]
async fn merged_manifest_only_embeds_the_new_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let frames_dir = tmp.path().join("frames");

    let mut manifest = make_frames("cam1", 8, 10);
    save_manifest(&frames_dir, &manifest).await.unwrap();

    let store = open_storage(tmp.path()).await;
    let embedder = CountingEmbedder::new();
    let pipeline = Pipeline::new(embedder.clone(), store.clone(), 32);
    let (tx, mut rx) = mpsc::channel(256);

    pipeline.index_frames(&frames_dir, &tx).await.unwrap();
    assert_eq!(embedder.images.load(Ordering::SeqCst), 10);

    // A second video appears: merge, never replace.
    manifest.extend(make_frames("cam1", 9, 5));
    save_manifest(&frames_dir, &manifest).await.unwrap();

    pipeline.index_frames(&frames_dir, &tx).await.unwrap();
    assert_eq!(embedder.images.load(Ordering::SeqCst), 15);

    let state = load_index_state(&frames_dir.join(INDEX_STATE_FILE)).await;
    assert_eq!(state.indexed_frames.len(), 15);
    assert_eq!(store.embedding_count("cam1").await.unwrap(), 15);
    drain(&mut rx);
}

#[tokio::test]
async fn crash_after_three_batches_resumes_with_seventy_frames() {
    let tmp = tempfile::tempdir().unwrap();
    let frames_dir = tmp.path().join("frames");
    save_manifest(&frames_dir, &make_frames("cam1", 8, 100))
        .await
        .unwrap();

    let store = open_storage(tmp.path()).await;

    // First run dies on the fourth batch; three batches of ten are durable.
    let crashing = CountingEmbedder::failing_after(3);
    let pipeline = Pipeline::new(crashing.clone(), store.clone(), 10);
    let (tx, mut rx) = mpsc::channel(256);
    pipeline.index_frames(&frames_dir, &tx).await.unwrap_err();
    assert_eq!(crashing.images.load(Ordering::SeqCst), 30);

    let state = load_index_state(&frames_dir.join(INDEX_STATE_FILE)).await;
    assert_eq!(state.indexed_frames.len(), 30);

    // Restart embeds exactly the remaining seventy.
    let embedder = CountingEmbedder::new();
    let pipeline = Pipeline::new(embedder.clone(), store, 10);
    pipeline.index_frames(&frames_dir, &tx).await.unwrap();
    assert_eq!(embedder.images.load(Ordering::SeqCst), 70);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 7);

    let state = load_index_state(&frames_dir.join(INDEX_STATE_FILE)).await;
    assert_eq!(state.indexed_frames.len(), 100);
    drain(&mut rx);
}

#[tokio::test]
async fn empty_manifest_completes_without_error() {
    let tmp = tempfile::tempdir().unwrap();
    let frames_dir = tmp.path().join("frames");
    save_manifest(&frames_dir, &[]).await.unwrap();

    let store = open_storage(tmp.path()).await;
    let embedder = CountingEmbedder::new();
    let pipeline = Pipeline::new(embedder.clone(), store, 4);
    let (tx, mut rx) = mpsc::channel(16);

    pipeline.index_frames(&frames_dir, &tx).await.unwrap();
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| e.stage == "complete" && e.message == "no frames to index"));
}

#[tokio::test]
async fn missing_manifest_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_storage(tmp.path()).await;
    let pipeline = Pipeline::new(CountingEmbedder::new(), store, 4);
    let (tx, _rx) = mpsc::channel(16);

    let err = pipeline
        .index_frames(&tmp.path().join("nonexistent"), &tx)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("manifest"));
}

#[tokio::test]
async fn progress_reports_cumulative_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let frames_dir = tmp.path().join("frames");
    save_manifest(&frames_dir, &make_frames("cam1", 8, 7)).await.unwrap();

    let store = open_storage(tmp.path()).await;
    let pipeline = Pipeline::new(CountingEmbedder::new(), store, 3);
    let (tx, mut rx) = mpsc::channel(256);
    pipeline.index_frames(&frames_dir, &tx).await.unwrap();

    let events = drain(&mut rx);
    let done: Vec<usize> = events
        .iter()
        .filter(|e| e.stage == "indexing" && e.message.starts_with("batch"))
        .map(|e| e.frames_done)
        .collect();
    assert_eq!(done, vec![3, 6, 7]);
    assert!(events.iter().all(|e| e.frames_total == 7 || e.frames_total == 0));
    assert_eq!(events.last().map(|e| e.stage.as_str()), Some("complete"));
}
