//! SQLite-backed rows: frame embeddings and camera metadata.
//!
//! Vectors are persisted as raw little-endian f32 bytes regardless of the
//! numeric width used in memory, so downstream readers can `frombuffer` them
//! without caring what produced the file.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS clip_embeddings (
        id           TEXT PRIMARY KEY,
        embedding    BLOB NOT NULL,
        camera_id    TEXT NOT NULL,
        timestamp    TEXT NOT NULL,
        frame_path   TEXT NOT NULL,
        source_video TEXT NOT NULL,
        created_at   TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_clip_camera_ts ON clip_embeddings(camera_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_clip_created ON clip_embeddings(created_at)",
    "CREATE TABLE IF NOT EXISTS cameras (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        kind        TEXT NOT NULL,
        nvr_channel INTEGER NOT NULL DEFAULT 1,
        transcode   INTEGER NOT NULL DEFAULT 1
    )",
];

/// Camera metadata row. `kind` is `recorder` for cameras reached through the
/// network recorder and `local` for upload-only cameras.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraRecord {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub nvr_channel: i64,
    pub transcode: bool,
}

impl CameraRecord {
    pub fn is_recorder(&self) -> bool {
        self.kind == "recorder"
    }
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating db directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {}", db_path.display()))?;

        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("running migrations")?;
        }

        Ok(Storage { pool })
    }

    pub async fn put_embedding(
        &self,
        id: &str,
        embedding: &[u8],
        camera_id: &str,
        timestamp: &str,
        frame_path: &str,
        source_video: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO clip_embeddings
                (id, embedding, camera_id, timestamp, frame_path, source_video)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(embedding)
        .bind(camera_id)
        .bind(timestamp)
        .bind(frame_path)
        .bind(source_video)
        .execute(&self.pool)
        .await
        .with_context(|| format!("storing embedding {}", id))?;
        Ok(())
    }

    pub async fn embedding_count(&self, camera_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM clip_embeddings WHERE camera_id = ?")
            .bind(camera_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn camera(&self, id: &str) -> Result<Option<CameraRecord>> {
        let row = sqlx::query(
            "SELECT id, name, kind, nvr_channel, transcode FROM cameras WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("querying camera {}", id))?;

        Ok(row.map(|row| CameraRecord {
            id: row.get("id"),
            name: row.get("name"),
            kind: row.get("kind"),
            nvr_channel: row.get("nvr_channel"),
            transcode: row.get::<i64, _>("transcode") != 0,
        }))
    }

    pub async fn upsert_camera(&self, camera: &CameraRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO cameras (id, name, kind, nvr_channel, transcode)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&camera.id)
        .bind(&camera.name)
        .bind(&camera.kind)
        .bind(camera.nvr_channel)
        .bind(camera.transcode as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting camera {}", camera.id))?;
        Ok(())
    }
}

/// Serializes a vector as raw little-endian f32 bytes.
pub fn vec_to_le_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_to_le_bytes_is_four_bytes_per_float() {
        let bytes = vec_to_le_bytes(&[1.0, -2.5]);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_le_bytes());
        assert_eq!(&bytes[4..], &(-2.5f32).to_le_bytes());
    }

    #[test]
    fn vec_to_le_bytes_of_empty_is_empty() {
        assert!(vec_to_le_bytes(&[]).is_empty());
    }
}
