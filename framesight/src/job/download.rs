//! Recorder download phase of a processing job.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, NaiveTime};
use tokio::sync::mpsc;
use tracing::warn;

use crate::extract::{Transcoder, transcode_if_needed};
use crate::pipeline::ProgressEvent;

/// First destination `{dir}/{base}.{ext}` that does not exist yet, probing
/// `{base}_1.{ext}` .. `{base}_100.{ext}` on collision. Never overwrites.
pub fn next_available_path(dir: &Path, base: &str, ext: &str) -> Option<PathBuf> {
    let candidate = dir.join(format!("{}.{}", base, ext));
    if !candidate.exists() {
        return Some(candidate);
    }
    for i in 1..=100 {
        let candidate = dir.join(format!("{}_{}.{}", base, i, ext));
        if !candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

/// Removes stale `*.tmp` leftovers from interrupted downloads.
pub async fn clean_tmp_files(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(".tmp") {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

pub(crate) struct DownloadContext<'a> {
    pub client: isapi::Client,
    pub camera_id: &'a str,
    pub camera_name: &'a str,
    pub channel: i64,
    pub transcode: bool,
    pub transcoder: &'a dyn Transcoder,
}

/// Downloads any recordings the recorder has for the given dates into the
/// camera's video directories. Per-date and per-recording failures are
/// reported as `error` events and skipped; one bad day never blocks another.
pub(crate) async fn download_from_recorder(
    ctx: &DownloadContext<'_>,
    dates: &[String],
    videos_root: &Path,
    events: &mpsc::Sender<ProgressEvent>,
) -> usize {
    let mut downloaded = 0usize;

    for date in dates {
        let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            continue;
        };
        let day_start = day.and_time(NaiveTime::MIN).and_utc();
        let day_end = day_start + Duration::hours(24) - Duration::seconds(1);

        let _ = events
            .send(ProgressEvent::stage(
                "downloading",
                ctx.camera_id,
                format!("searching recordings for {} on {}", ctx.camera_name, date),
            ))
            .await;

        let recordings = match ctx.client.search(ctx.channel, day_start, day_end).await {
            Ok(recordings) => recordings,
            Err(err) => {
                warn!("recorder search failed for {}/{}: {}", ctx.camera_id, date, err);
                let _ = events
                    .send(ProgressEvent::stage(
                        "error",
                        ctx.camera_id,
                        format!("recorder search failed for {}: {}", date, err),
                    ))
                    .await;
                continue;
            }
        };

        if recordings.is_empty() {
            let _ = events
                .send(ProgressEvent::stage(
                    "downloading",
                    ctx.camera_id,
                    format!("no recordings found for {} on {}", ctx.camera_name, date),
                ))
                .await;
            continue;
        }

        let videos_dir = videos_root.join(date);
        if let Err(err) = tokio::fs::create_dir_all(&videos_dir).await {
            warn!("creating {}: {}", videos_dir.display(), err);
            continue;
        }
        clean_tmp_files(&videos_dir).await;

        let total = recordings.len();
        for (i, recording) in recordings.iter().enumerate() {
            let base = recording.start_time.format("%H%M").to_string();
            let Some(dest) = next_available_path(&videos_dir, &base, "mp4") else {
                warn!("no free filename for {} in {}", base, videos_dir.display());
                continue;
            };
            let filename = dest
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}.mp4", base));

            let _ = events
                .send(ProgressEvent::stage(
                    "downloading",
                    ctx.camera_id,
                    format!(
                        "downloading {} {}-{} ({}/{})...",
                        ctx.camera_name,
                        recording.start_time.format("%H:%M"),
                        recording.end_time.format("%H:%M"),
                        i + 1,
                        total
                    ),
                ))
                .await;

            if let Err(err) = ctx.client.download(&recording.playback_uri, &dest).await {
                warn!("recorder download failed for {}: {}", filename, err);
                let _ = events
                    .send(ProgressEvent::stage(
                        "error",
                        ctx.camera_id,
                        format!("download failed for {}: {}", filename, err),
                    ))
                    .await;
                continue;
            }

            if ctx.transcode {
                let _ = events
                    .send(ProgressEvent::stage(
                        "transcoding",
                        ctx.camera_id,
                        format!("transcoding {} ({}/{})...", filename, i + 1, total),
                    ))
                    .await;
                if let Err(err) = transcode_if_needed(ctx.transcoder, &dest).await {
                    warn!("transcode failed for {}: {}", filename, err);
                    let _ = events
                        .send(ProgressEvent::stage(
                            "error",
                            ctx.camera_id,
                            format!("transcode failed for {}: {}", filename, err),
                        ))
                        .await;
                }
            }

            downloaded += 1;
        }
    }

    downloaded
}
