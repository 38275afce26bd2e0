//! On-demand live transcode processes, one per camera.
//!
//! Each stream spawns the external transcoder for RTSP → HLS into its own
//! directory. A reaper task owns the child process: it removes the entry
//! when the process dies on its own and handles the kill on explicit stop.
//! A periodic sweep stops streams nobody has touched recently, so the number
//! of running transcodes tracks actively viewed cameras.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct StreamEntry {
    dir: PathBuf,
    last_access: Instant,
    generation: u64,
    kill_tx: oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct Streamer {
    streams: Arc<Mutex<HashMap<String, StreamEntry>>>,
    base_dir: PathBuf,
    transcoder_bin: String,
    idle_timeout: Duration,
    next_generation: Arc<AtomicU64>,
}

impl Streamer {
    pub fn new(base_dir: impl Into<PathBuf>, transcoder_bin: impl Into<String>, idle_timeout: Duration) -> Self {
        Streamer {
            streams: Arc::new(Mutex::new(HashMap::new())),
            base_dir: base_dir.into(),
            transcoder_bin: transcoder_bin.into(),
            idle_timeout,
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts an HLS transcode for the camera. Idempotent: a second start
    /// while the process is alive only refreshes the access time.
    pub async fn start(&self, camera_id: &str, source_url: &str) -> Result<()> {
        let mut streams = self.streams.lock().await;
        if let Some(entry) = streams.get_mut(camera_id) {
            entry.last_access = Instant::now();
            return Ok(());
        }

        let dir = self.base_dir.join(camera_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating stream dir {}", dir.display()))?;

        let playlist = dir.join("index.m3u8");
        let mut child = Command::new(&self.transcoder_bin)
            .args(["-rtsp_transport", "tcp", "-i"])
            .arg(source_url)
            .args(["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"])
            .args(["-c:a", "aac"])
            .args(["-f", "hls", "-hls_time", "2", "-hls_list_size", "5"])
            .args(["-hls_flags", "delete_segments", "-y"])
            .arg(&playlist)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {}", self.transcoder_bin))?;

        info!(
            "live stream started for camera {} (pid {:?})",
            camera_id,
            child.id()
        );

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (kill_tx, kill_rx) = oneshot::channel();
        streams.insert(
            camera_id.to_string(),
            StreamEntry {
                dir,
                last_access: Instant::now(),
                generation,
                kill_tx,
            },
        );
        drop(streams);

        // Reaper: owns the child until it exits or a stop asks for the kill.
        let streams = self.streams.clone();
        let camera = camera_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!("stream process for camera {} exited: {:?}", camera, status);
                    let mut map = streams.lock().await;
                    if map.get(&camera).map(|e| e.generation) == Some(generation) {
                        map.remove(&camera);
                    }
                }
                _ = kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        });

        Ok(())
    }

    /// Kills the camera's transcode process and removes its directory.
    /// Both are best-effort; stopping an unknown camera is a no-op.
    pub async fn stop(&self, camera_id: &str) {
        let entry = self.streams.lock().await.remove(camera_id);
        let Some(entry) = entry else { return };

        let _ = entry.kill_tx.send(());
        if let Err(err) = tokio::fs::remove_dir_all(&entry.dir).await {
            debug!("removing stream dir {}: {}", entry.dir.display(), err);
        }
        info!("live stream stopped for camera {}", camera_id);
    }

    /// HLS directory for an active stream, or `None`.
    pub async fn dir(&self, camera_id: &str) -> Option<PathBuf> {
        self.streams
            .lock()
            .await
            .get(camera_id)
            .map(|entry| entry.dir.clone())
    }

    /// Refreshes the access time that the idle sweep looks at.
    pub async fn touch(&self, camera_id: &str) {
        if let Some(entry) = self.streams.lock().await.get_mut(camera_id) {
            entry.last_access = Instant::now();
        }
    }

    pub async fn is_active(&self, camera_id: &str) -> bool {
        self.streams.lock().await.contains_key(camera_id)
    }

    pub async fn active_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Spawns the periodic sweep that stops idle streams.
    pub fn spawn_sweep(&self) {
        let streamer = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                streamer.clean_idle().await;
            }
        });
    }

    /// One sweep pass: stops every stream idle past the threshold.
    pub async fn clean_idle(&self) {
        let idle: Vec<String> = {
            let streams = self.streams.lock().await;
            streams
                .iter()
                .filter(|(_, entry)| entry.last_access.elapsed() > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for camera_id in idle {
            warn!("stopping idle stream for camera {}", camera_id);
            self.stop(&camera_id).await;
        }
    }

    /// Stops every active stream; used on graceful shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.streams.lock().await.keys().cloned().collect();
        for camera_id in ids {
            self.stop(&camera_id).await;
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
