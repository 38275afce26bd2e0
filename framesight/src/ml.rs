//! Client for the embedding sidecar: batch image encoding and delegated
//! similarity search. Inference on CPU is slow, so the request timeout is
//! generous and readiness is polled with a bounded deadline.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;

use crate::pipeline::Embedder;

#[derive(Clone)]
pub struct MlClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub camera_ids: Vec<String>,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub min_score: f64,
}

fn default_limit() -> u32 {
    50
}

impl MlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        MlClient {
            base_url: base_url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()
                .unwrap(),
        }
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("health check returned {}", resp.status());
        }
        Ok(())
    }

    /// Forwards a text query to the sidecar's search endpoint; ranking
    /// happens there, against the embedding store it is pointed at.
    pub async fn search_by_text(
        &self,
        db_path: &str,
        query: &SearchQuery,
    ) -> Result<serde_json::Value> {
        let body = json!({
            "db_path": db_path,
            "text": query.text,
            "camera_ids": query.camera_ids,
            "start_time": query.start_time,
            "end_time": query.end_time,
            "limit": query.limit,
            "min_score": query.min_score,
        });
        let resp = self
            .client
            .post(format!("{}/search/image", self.base_url))
            .json(&body)
            .send()
            .await
            .context("search request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("search returned {}: {}", status, resp.text().await.unwrap_or_default());
        }
        resp.json().await.context("decoding search response")
    }
}

#[async_trait]
impl Embedder for MlClient {
    async fn encode_images(&self, paths: &[String]) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(format!("{}/encode/image", self.base_url))
            .json(&json!({ "paths": paths }))
            .send()
            .await
            .context("encode images request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            bail!("encode images returned {}: {}", status, resp.text().await.unwrap_or_default());
        }

        #[derive(Deserialize)]
        struct EncodeImagesResponse {
            embeddings: Vec<Vec<f32>>,
        }
        let result: EncodeImagesResponse =
            resp.json().await.context("decoding encode images response")?;
        Ok(result.embeddings)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.health().await {
                Ok(()) => return Ok(()),
                Err(err) => debug!("embedding service not ready yet: {}", err),
            }
            if Instant::now() >= deadline {
                bail!("embedding service not ready after {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}
