// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Artifact Source Trait - Anti-Corruption Layer for remote artifact caches
//!
//! The local artifact cache (`infrastructure::artifact_cache`) is the single
//! source of truth for a node; an [`ArtifactSource`] is a secondary tier it
//! consults on a local miss, pulling artifacts through into the local store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::graph::Fingerprint;

/// A committed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub fingerprint: Fingerprint,
    /// Local path of the artifact file
    pub path: PathBuf,
    /// URL a client can fetch the artifact from
    pub location: String,
}

/// Secondary artifact tier
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    fn name(&self) -> &str;

    async fn has(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;

    /// Downloads the artifact into `dest`; `Ok(false)` if the tier lacks it
    async fn fetch(&self, fingerprint: &Fingerprint, dest: &Path) -> Result<bool, CacheError>;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Artifact {0} is not in the cache")]
    NotPresent(Fingerprint),

    #[error("Artifact cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote artifact cache error: {0}")]
    Remote(String),

    #[error("Artifact production for {fingerprint} failed: {reason}")]
    ProductionFailed {
        fingerprint: Fingerprint,
        reason: String,
    },

    #[error("Artifact {0} was not written before commit")]
    NothingWritten(Fingerprint),
}

impl CacheError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}
