//! Process history: the work-skipping cache of which camera+date+video
//! combinations have been through the full pipeline. Never the source of
//! truth for what is embedded; the index state is.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::frame::tmp_path_for;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHistoryEntry {
    pub camera_id: String,
    pub date: String,
    #[serde(default)]
    pub videos: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

pub async fn load_history(path: &Path) -> Vec<ProcessHistoryEntry> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(history) => history,
        Err(err) => {
            warn!("discarding unreadable history {}: {}", path.display(), err);
            Vec::new()
        }
    }
}

/// Records (or refreshes) the processed video list for a camera+date.
pub async fn add_history(
    path: &Path,
    camera_id: &str,
    date: &str,
    videos: Vec<String>,
) -> Result<()> {
    let mut history = load_history(path).await;

    match history
        .iter_mut()
        .find(|h| h.camera_id == camera_id && h.date == date)
    {
        Some(entry) => {
            entry.videos = videos;
            entry.indexed_at = Utc::now();
        }
        None => history.push(ProcessHistoryEntry {
            camera_id: camera_id.to_string(),
            date: date.to_string(),
            videos,
            indexed_at: Utc::now(),
        }),
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating history directory {}", parent.display()))?;
    }
    let tmp = tmp_path_for(path);
    let json = serde_json::to_string_pretty(&history)?;
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing history {}", path.display()))?;
    Ok(())
}

/// Basenames of `.mp4` files in a directory, sorted. A missing directory is
/// an empty list.
pub async fn list_video_files(dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return files;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(file_type) = entry.file_type().await else {
            continue;
        };
        if file_type.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.to_ascii_lowercase().ends_with(".mp4") {
            files.push(name.to_string());
        }
    }
    files.sort();
    files
}

/// Video basenames not yet covered by the history for this camera+date.
///
/// A history entry with an empty video list is a legacy record from before
/// per-video tracking; it means the whole date is already processed.
pub fn new_videos_for_date(
    history: &[ProcessHistoryEntry],
    camera_id: &str,
    date: &str,
    all_videos: &[String],
) -> Vec<String> {
    if all_videos.is_empty() {
        return Vec::new();
    }

    let processed: &[String] = match history
        .iter()
        .find(|h| h.camera_id == camera_id && h.date == date)
    {
        Some(entry) if entry.videos.is_empty() => return Vec::new(),
        Some(entry) => &entry.videos,
        None => &[],
    };

    all_videos
        .iter()
        .filter(|v| !processed.contains(v))
        .cloned()
        .collect()
}
