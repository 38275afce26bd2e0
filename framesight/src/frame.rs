//! Frame metadata and the per camera+date manifest.
//!
//! The manifest is the append-only ledger of what has been extracted for one
//! camera on one date. Repeated extraction runs merge into it; nothing ever
//! rewrites history except explicit deletion of a source video.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub frame_path: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_video: String,
    pub frame_number: u32,
    pub extraction_method: String,
}

impl FrameMetadata {
    /// Deterministic identity: `{camera}_{YYYYMMDD_HHMMSS}_{number}`.
    /// Doubles as the resume key in the index state and the embedding row id.
    pub fn id(&self) -> String {
        format!(
            "{}_{}_{:06}",
            self.camera_id,
            self.timestamp.format("%Y%m%d_%H%M%S"),
            self.frame_number
        )
    }
}

/// Reads the manifest for a frames directory. A missing manifest is an empty
/// one, not an error.
pub async fn load_manifest(dir: &Path) -> Result<Vec<FrameMetadata>> {
    let path = dir.join(MANIFEST_FILE);
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("reading manifest {}", path.display()));
        }
    };
    serde_json::from_str(&raw).with_context(|| format!("parsing manifest {}", path.display()))
}

/// Writes the manifest atomically: to `manifest.json.tmp` first, renamed into
/// place so a crash never leaves a truncated ledger behind.
pub async fn save_manifest(dir: &Path, frames: &[FrameMetadata]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating frames dir {}", dir.display()))?;

    let path = dir.join(MANIFEST_FILE);
    let tmp = tmp_path_for(&path);
    let json = serde_json::to_string_pretty(frames)?;
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("replacing manifest {}", path.display()))?;
    Ok(())
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    if let Some(ext) = path.extension() {
        let mut ext = ext.to_os_string();
        ext.push(".tmp");
        tmp.set_extension(ext);
    } else {
        tmp.set_extension("tmp");
    }
    tmp
}
