//! Frame extraction via an external transcoder, plus perceptual-hash
//! deduplication across one extraction run.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use img_hash::{HasherConfig, ImageHash};
use tokio::process::Command;
use tracing::{debug, info};

use crate::frame::FrameMetadata;

/// Capability seam over the external media binary. Keeps codec work out of
/// the core and lets tests substitute a fake that writes synthetic frames.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Emits one JPEG per `interval_sec` of video into `output_pattern`
    /// (a printf-style `%06d` pattern).
    async fn extract_frames(
        &self,
        video: &Path,
        output_pattern: &Path,
        interval_sec: u32,
        quality: u32,
    ) -> Result<()>;

    /// Codec name of the first video stream, e.g. `h264` or `hevc`.
    async fn probe_codec(&self, video: &Path) -> Result<String>;

    /// Re-encodes the file to H.264 in place (via a temp file + rename).
    async fn convert_to_h264(&self, video: &Path) -> Result<()>;
}

pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }
}

#[async_trait]
impl Transcoder for Ffmpeg {
    async fn extract_frames(
        &self,
        video: &Path,
        output_pattern: &Path,
        interval_sec: u32,
        quality: u32,
    ) -> Result<()> {
        let status = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(video)
            .args(["-vf", &format!("fps=1/{}", interval_sec)])
            .args(["-q:v", &quality.to_string(), "-y"])
            .arg(output_pattern)
            .stdout(Stdio::null())
            .status()
            .await
            .with_context(|| format!("running {}", self.ffmpeg))?;
        if !status.success() {
            bail!("{} exited with {}", self.ffmpeg, status);
        }
        Ok(())
    }

    async fn probe_codec(&self, video: &Path) -> Result<String> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=codec_name", "-of", "csv=p=0"])
            .arg(video)
            .output()
            .await
            .with_context(|| format!("running {}", self.ffprobe))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.ffprobe,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn convert_to_h264(&self, video: &Path) -> Result<()> {
        let tmp = video.with_extension("transcoding.mp4");
        let output = Command::new(&self.ffmpeg)
            .arg("-i")
            .arg(video)
            .args(["-c:v", "libx264", "-crf", "23", "-c:a", "aac", "-y"])
            .arg(&tmp)
            .output()
            .await
            .with_context(|| format!("running {}", self.ffmpeg))?;
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            bail!(
                "{} exited with {}: {}",
                self.ffmpeg,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        if let Err(err) = tokio::fs::rename(&tmp, video).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("replacing {}", video.display()));
        }
        Ok(())
    }
}

/// Probes the codec and re-encodes HEVC files to H.264 in place.
/// Returns whether a conversion happened.
pub async fn transcode_if_needed(transcoder: &dyn Transcoder, video: &Path) -> Result<bool> {
    let codec = transcoder.probe_codec(video).await?;
    if codec != "hevc" {
        return Ok(false);
    }
    info!("converting HEVC video {}", video.display());
    transcoder.convert_to_h264(video).await?;
    Ok(true)
}

/// Derives the camera id and the segment's wall-clock start from the video
/// path shape `.../{camera_id}/{date}/{HHMM}.mp4`. Anything else is a hard
/// error. Only the hour digits of the stem count toward the start time; the
/// collision suffixes produced by downloads (`0800_1.mp4`) parse the same as
/// the base name.
pub fn parse_video_path(video: &Path) -> Result<(String, DateTime<Utc>)> {
    let stem = video
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("video path has no file name: {}", video.display()))?;
    let date_str = video
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("video path has no date directory: {}", video.display()))?;
    let camera_id = video
        .parent()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("video path has no camera directory: {}", video.display()))?;

    if stem.len() < 2 {
        bail!("cannot parse hour from video name: {}", video.display());
    }
    let hour: u32 = stem[..2]
        .parse()
        .with_context(|| format!("parsing hour from {}", stem))?;
    if hour > 23 {
        bail!("hour out of range in video name: {}", video.display());
    }
    let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
        .with_context(|| format!("parsing date directory {}", date_str))?;

    let segment_start = (date.and_time(NaiveTime::MIN) + Duration::hours(hour as i64)).and_utc();
    Ok((camera_id.to_string(), segment_start))
}

/// Extracts frames from one video into `output_dir` at a fixed interval.
///
/// Output names carry a per-video prefix (`frame_{stem}_000001.jpg`) so
/// repeated or concurrent runs into a shared directory never collide. Frame
/// `n` (1-indexed) is stamped `segment_start + (n-1) * interval`; frame 1 is
/// time zero of the segment, independent of what the transcoder reports.
pub async fn extract_frames(
    transcoder: &dyn Transcoder,
    video_path: &Path,
    output_dir: &Path,
    interval_sec: u32,
    quality: u32,
) -> Result<Vec<FrameMetadata>> {
    let (camera_id, segment_start) = parse_video_path(video_path)?;

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("creating output dir {}", output_dir.display()))?;

    let stem = video_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("video path has no file name: {}", video_path.display()))?;
    let prefix = format!("frame_{}_", stem);
    let pattern = output_dir.join(format!("frame_{}_%06d.jpg", stem));

    transcoder
        .extract_frames(video_path, &pattern, interval_sec, quality)
        .await?;

    let mut frames = Vec::new();
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .with_context(|| format!("reading output dir {}", output_dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(num) = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".jpg"))
        else {
            continue;
        };
        let Ok(frame_number) = num.parse::<u32>() else {
            continue;
        };

        let timestamp =
            segment_start + Duration::seconds(((frame_number - 1) * interval_sec) as i64);
        frames.push(FrameMetadata {
            frame_path: output_dir.join(name).to_string_lossy().into_owned(),
            camera_id: camera_id.clone(),
            timestamp,
            source_video: video_path.to_string_lossy().into_owned(),
            frame_number,
            extraction_method: "time".to_string(),
        });
    }

    frames.sort_by_key(|f| f.frame_number);
    debug!(
        "extracted {} frames from {}",
        frames.len(),
        video_path.display()
    );
    Ok(frames)
}

/// Drops near-duplicate frames by perceptual hash.
///
/// Greedy and order-dependent: a frame survives only if its hash distance to
/// every previously kept frame of this run is at least `threshold`; rejected
/// frames' files are deleted.
pub async fn deduplicate(
    frames: Vec<FrameMetadata>,
    threshold: u32,
) -> Result<Vec<FrameMetadata>> {
    if frames.is_empty() {
        return Ok(frames);
    }

    let hasher = HasherConfig::new().hash_size(8, 8).preproc_dct().to_hasher();
    let mut kept: Vec<(FrameMetadata, ImageHash)> = Vec::new();
    let mut dropped = 0usize;

    for frame in frames {
        let image = image::open(&frame.frame_path)
            .with_context(|| format!("opening {}", frame.frame_path))?;
        let hash = hasher.hash_image(&image);

        let is_dup = kept.iter().any(|(_, seen)| hash.dist(seen) < threshold);
        if is_dup {
            let _ = tokio::fs::remove_file(&frame.frame_path).await;
            dropped += 1;
        } else {
            kept.push((frame, hash));
        }
    }

    if dropped > 0 {
        debug!("dedup dropped {} near-duplicate frames", dropped);
    }
    Ok(kept.into_iter().map(|(frame, _)| frame).collect())
}
