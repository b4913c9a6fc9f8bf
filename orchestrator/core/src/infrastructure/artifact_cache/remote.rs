// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP Artifact Source
//!
//! Read-only client for a shared artifact cache server. Artifacts are
//! addressed as `<base_url>/1.0/artifacts/<fingerprint>`; `HEAD` answers
//! whether the server has one and `GET` streams it.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::domain::cache::{ArtifactSource, CacheError};
use crate::domain::graph::Fingerprint;

pub struct HttpArtifactSource {
    /// Base URL of the cache server
    base_url: String,

    /// HTTP client
    client: Client,
}

impl HttpArtifactSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn artifact_url(&self, fingerprint: &Fingerprint) -> String {
        format!("{}/1.0/artifacts/{}", self.base_url, fingerprint.as_str())
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn has(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
        let response = self
            .client
            .head(self.artifact_url(fingerprint))
            .send()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(CacheError::Remote(format!(
                "HEAD {} returned {}",
                self.artifact_url(fingerprint),
                status
            ))),
        }
    }

    async fn fetch(&self, fingerprint: &Fingerprint, dest: &Path) -> Result<bool, CacheError> {
        let url = self.artifact_url(fingerprint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CacheError::Remote(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(false),
            status if !status.is_success() => {
                return Err(CacheError::Remote(format!("GET {} returned {}", url, status)));
            }
            _ => {}
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| CacheError::io(dest, e))?;
        let mut body = response.bytes_stream();
        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| CacheError::Remote(e.to_string()))?;
            written += chunk.len();
            file.write_all(&chunk).await.map_err(|e| CacheError::io(dest, e))?;
        }
        file.flush().await.map_err(|e| CacheError::io(dest, e))?;

        debug!(fingerprint = %fingerprint, bytes = written, "Downloaded artifact");
        Ok(true)
    }
}
