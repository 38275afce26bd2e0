//! Background processing jobs: one per accepted request, owning the
//! download → extract → dedup → index loop and an append-only, replayable
//! progress log.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};

use crate::config::Config;
use crate::extract::{self, Transcoder};
use crate::pipeline::{Embedder, Pipeline, ProgressEvent};
use crate::store::{CameraRecord, Storage};

pub mod download;
pub mod history;

use history::ProcessHistoryEntry;

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequest {
    pub camera_ids: Vec<String>,
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Complete,
    Failed,
}

#[derive(Debug)]
struct JobInner {
    status: JobStatus,
    error: String,
    events: Vec<ProgressEvent>,
}

/// Handle to one job's mutable record. All mutation happens under the lock;
/// the event list is append-only so any cursor can replay from where it
/// left off.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    inner: Arc<RwLock<JobInner>>,
}

impl JobHandle {
    fn new(id: String) -> Self {
        JobHandle {
            id,
            inner: Arc::new(RwLock::new(JobInner {
                status: JobStatus::Running,
                error: String::new(),
                events: Vec::new(),
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn push_event(&self, event: ProgressEvent) {
        self.inner.write().await.events.push(event);
    }

    async fn finish(&self, status: JobStatus, error: String) {
        let mut inner = self.inner.write().await;
        inner.status = status;
        inner.error = error;
    }

    /// Everything appended since `cursor`, plus the current status/error.
    pub async fn events_since(&self, cursor: usize) -> (Vec<ProgressEvent>, JobStatus, String) {
        let inner = self.inner.read().await;
        let events = inner.events.get(cursor..).unwrap_or_default().to_vec();
        (events, inner.status, inner.error.clone())
    }
}

/// Outcome of accepting a processing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Every requested camera+date combination is already covered.
    AlreadyCached,
    /// A background job was spawned.
    Started(String),
}

#[derive(Clone)]
pub struct JobManager {
    cfg: Config,
    store: Storage,
    embedder: Arc<dyn Embedder>,
    transcoder: Arc<dyn Transcoder>,
    jobs: Arc<RwLock<HashMap<String, JobHandle>>>,
    // Serializes history read-modify-write sequences across jobs.
    history_lock: Arc<Mutex<()>>,
}

impl JobManager {
    pub fn new(
        cfg: Config,
        store: Storage,
        embedder: Arc<dyn Embedder>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        JobManager {
            cfg,
            store,
            embedder,
            transcoder,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            history_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Accepts a processing request. Never blocks on pipeline work: either
    /// the request is already fully covered by history, or a job id comes
    /// back immediately and the work runs in a spawned task.
    pub async fn start(&self, mut req: ProcessRequest) -> Result<StartOutcome> {
        if req.camera_ids.is_empty() || req.start_date.is_empty() {
            bail!("camera_ids and start_date are required");
        }
        if req.end_date.is_empty() {
            req.end_date = req.start_date.clone();
        }
        let dates = date_range(&req.start_date, &req.end_date)?;

        if self.all_cached(&req.camera_ids, &dates).await? {
            return Ok(StartOutcome::AlreadyCached);
        }

        let job_id = format!("job_{}", Utc::now().timestamp_millis());
        let job = JobHandle::new(job_id.clone());
        self.jobs.write().await.insert(job_id.clone(), job.clone());
        info!("job {} accepted for cameras {:?}", job_id, req.camera_ids);

        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(job, req, dates).await;
        });

        Ok(StartOutcome::Started(job_id))
    }

    pub async fn events(
        &self,
        job_id: &str,
        cursor: usize,
    ) -> Option<(Vec<ProgressEvent>, JobStatus, String)> {
        let job = self.jobs.read().await.get(job_id).cloned();
        match job {
            Some(job) => Some(job.events_since(cursor).await),
            None => None,
        }
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    pub async fn history(&self) -> Vec<ProcessHistoryEntry> {
        history::load_history(&self.cfg.data.history_path).await
    }

    /// Whether every requested camera+date is already covered. Recorder-backed
    /// cameras always force a run: the recorder may hold recordings we have
    /// never seen.
    async fn all_cached(&self, camera_ids: &[String], dates: &[String]) -> Result<bool> {
        let hist = history::load_history(&self.cfg.data.history_path).await;
        for camera_id in camera_ids {
            if self.camera_record(camera_id).await.is_some_and(|c| c.is_recorder()) {
                return Ok(false);
            }
            for date in dates {
                let videos_dir = self.cfg.videos_dir(camera_id, date);
                let all_videos = history::list_video_files(&videos_dir).await;
                if !history::new_videos_for_date(&hist, camera_id, date, &all_videos).is_empty() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn camera_record(&self, camera_id: &str) -> Option<CameraRecord> {
        match self.store.camera(camera_id).await {
            Ok(record) => record,
            Err(err) => {
                warn!("camera lookup failed for {}: {}", camera_id, err);
                None
            }
        }
    }

    async fn run(&self, job: JobHandle, req: ProcessRequest, dates: Vec<String>) {
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);

        // Collector: drains the bounded channel into the job's append-only
        // log. The log, not the channel, is the record of truth for replay.
        let collector = {
            let job = job.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    job.push_event(event).await;
                }
            })
        };

        let result = self.run_inner(&tx, &req, &dates).await;

        drop(tx);
        let _ = collector.await;

        match result {
            Ok(()) => {
                info!("job {} complete", job.id());
                job.finish(JobStatus::Complete, String::new()).await;
            }
            Err(err) => {
                warn!("job {} failed: {:#}", job.id(), err);
                job.finish(JobStatus::Failed, format!("{:#}", err)).await;
            }
        }
    }

    async fn run_inner(
        &self,
        events: &mpsc::Sender<ProgressEvent>,
        req: &ProcessRequest,
        dates: &[String],
    ) -> Result<()> {
        let _ = events
            .send(ProgressEvent::stage(
                "waiting",
                "",
                "waiting for embedding service...".to_string(),
            ))
            .await;
        if let Err(err) = self
            .embedder
            .wait_ready(std::time::Duration::from_secs(self.cfg.ml.ready_timeout_secs))
            .await
        {
            let _ = events
                .send(ProgressEvent::stage(
                    "error",
                    "",
                    format!("embedding service not ready: {}", err),
                ))
                .await;
            return Err(err);
        }

        let pipeline = Pipeline::new(
            self.embedder.clone(),
            self.store.clone(),
            self.cfg.ml.batch_size,
        );

        for camera_id in &req.camera_ids {
            let camera = self.camera_record(camera_id).await;

            if camera.as_ref().is_some_and(|c| c.is_recorder()) {
                self.download_phase(events, camera_id, camera.as_ref(), dates)
                    .await;
            }

            for date in dates {
                self.process_date(&pipeline, events, camera_id, date).await;
            }
        }

        let _ = events
            .send(ProgressEvent::stage(
                "complete",
                "",
                "all processing complete".to_string(),
            ))
            .await;
        Ok(())
    }

    async fn download_phase(
        &self,
        events: &mpsc::Sender<ProgressEvent>,
        camera_id: &str,
        camera: Option<&CameraRecord>,
        dates: &[String],
    ) {
        let recorder = &self.cfg.recorder;
        if recorder.ip.is_empty() {
            let _ = events
                .send(ProgressEvent::stage(
                    "error",
                    camera_id,
                    "recorder address not configured".to_string(),
                ))
                .await;
            return;
        }

        let camera_name = camera.map(|c| c.name.as_str()).unwrap_or(camera_id);
        let ctx = download::DownloadContext {
            client: isapi::Client::new(&recorder.ip, &recorder.username, &recorder.password),
            camera_id,
            camera_name,
            channel: camera.map(|c| c.nvr_channel).filter(|c| *c >= 1).unwrap_or(1),
            transcode: camera.map(|c| c.transcode).unwrap_or(true),
            transcoder: self.transcoder.as_ref(),
        };
        let videos_root = self.cfg.data.dir.join("videos").join(camera_id);
        let downloaded =
            download::download_from_recorder(&ctx, dates, &videos_root, events).await;
        if downloaded > 0 {
            info!("downloaded {} recordings for {}", downloaded, camera_id);
        }
    }

    /// One camera+date unit of work: extract new videos, merge the manifest,
    /// index, record history. Failures are contained to this unit.
    async fn process_date(
        &self,
        pipeline: &Pipeline,
        events: &mpsc::Sender<ProgressEvent>,
        camera_id: &str,
        date: &str,
    ) {
        let videos_dir = self.cfg.videos_dir(camera_id, date);
        let frames_dir = self.cfg.frames_dir(camera_id, date);

        let hist = history::load_history(&self.cfg.data.history_path).await;
        let all_videos = history::list_video_files(&videos_dir).await;
        let to_process = history::new_videos_for_date(&hist, camera_id, date, &all_videos);

        if to_process.is_empty() {
            let _ = events
                .send(ProgressEvent::stage(
                    "skipped",
                    camera_id,
                    format!("{}/{} already indexed", camera_id, date),
                ))
                .await;
            return;
        }

        let _ = events
            .send(ProgressEvent::stage(
                "extracting",
                camera_id,
                format!(
                    "extracting frames from {} video(s) for {}/{}",
                    to_process.len(),
                    camera_id,
                    date
                ),
            ))
            .await;

        let existing = match crate::frame::load_manifest(&frames_dir).await {
            Ok(frames) => frames,
            Err(err) => {
                warn!("manifest for {}/{} unreadable: {}", camera_id, date, err);
                Vec::new()
            }
        };

        let mut new_frames = Vec::new();
        for video in &to_process {
            let video_path = videos_dir.join(video);
            let frames = match extract::extract_frames(
                self.transcoder.as_ref(),
                &video_path,
                &frames_dir,
                self.cfg.extraction.interval_sec,
                self.cfg.extraction.quality,
            )
            .await
            {
                Ok(frames) => frames,
                Err(err) => {
                    warn!("extraction failed for {}: {:#}", video_path.display(), err);
                    continue;
                }
            };

            let frames = if self.cfg.extraction.dedup_enabled {
                match extract::deduplicate(frames, self.cfg.extraction.dedup_threshold).await {
                    Ok(frames) => frames,
                    Err(err) => {
                        warn!("dedup failed for {}: {:#}", video_path.display(), err);
                        continue;
                    }
                }
            } else {
                frames
            };

            new_frames.extend(frames);
        }

        let mut merged = existing;
        merged.extend(new_frames);
        if let Err(err) = crate::frame::save_manifest(&frames_dir, &merged).await {
            warn!("writing manifest for {}/{}: {:#}", camera_id, date, err);
        }

        if !frames_dir.join(crate::frame::MANIFEST_FILE).exists() {
            let _ = events
                .send(ProgressEvent::stage(
                    "error",
                    camera_id,
                    format!("no manifest for {}/{} after extraction", camera_id, date),
                ))
                .await;
            return;
        }

        let _ = events
            .send(ProgressEvent::stage(
                "indexing",
                camera_id,
                format!("indexing frames for {}/{}", camera_id, date),
            ))
            .await;

        if let Err(err) = pipeline.index_frames(&frames_dir, events).await {
            warn!("indexing failed for {}/{}: {:#}", camera_id, date, err);
            let _ = events
                .send(ProgressEvent::stage(
                    "error",
                    camera_id,
                    format!("indexing failed: {}", err),
                ))
                .await;
            return;
        }

        // Only a fully indexed camera+date enters the history; a partial
        // failure above means the next run retries this unit.
        let all_videos = history::list_video_files(&videos_dir).await;
        let _guard = self.history_lock.lock().await;
        if let Err(err) =
            history::add_history(&self.cfg.data.history_path, camera_id, date, all_videos).await
        {
            warn!("recording history for {}/{}: {:#}", camera_id, date, err);
        }
    }
}

/// Inclusive list of `YYYY-MM-DD` dates from `start` to `end`.
pub fn date_range(start: &str, end: &str) -> Result<Vec<String>> {
    let start_date =
        NaiveDate::parse_from_str(start, "%Y-%m-%d").context("invalid start date")?;
    let end_date = NaiveDate::parse_from_str(end, "%Y-%m-%d").context("invalid end date")?;
    if end_date < start_date {
        bail!("end date {} is before start date {}", end, start);
    }

    let mut dates = Vec::new();
    let mut day = start_date;
    while day <= end_date {
        dates.push(day.format("%Y-%m-%d").to_string());
        day += ChronoDuration::days(1);
    }
    Ok(dates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_range_is_inclusive() {
        let dates = date_range("2026-02-27", "2026-03-02").unwrap();
        assert_eq!(dates, vec!["2026-02-27", "2026-02-28", "2026-03-01", "2026-03-02"]);
    }

    #[test]
    fn date_range_rejects_garbage_and_reversed_ranges() {
        assert!(date_range("2026-13-01", "2026-13-02").is_err());
        assert!(date_range("2026-02-02", "2026-02-01").is_err());
    }
}
