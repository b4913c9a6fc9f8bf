// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-process service graph
//!
//! Builds the repository service, artifact cache, local worker pool and
//! coordinator described by a node configuration.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use morph_core::{
    application::{BuildCoordinator, MorphologyLoader, WorkerPool},
    domain::node_config::NodeConfigManifest,
    domain::repository::RepositoryService,
    infrastructure::{ArtifactCache, EventBus, GitRepositoryService, HttpArtifactSource},
};
use morph_worker::local_workers;

pub struct BuildServices {
    pub config: NodeConfigManifest,
    pub repositories: Arc<dyn RepositoryService>,
    pub loader: Arc<MorphologyLoader>,
    pub cache: Arc<ArtifactCache>,
    pub coordinator: Arc<BuildCoordinator>,
}

impl BuildServices {
    /// Services backed by the local git clones the configuration points at
    pub fn from_config(config: NodeConfigManifest) -> Result<Self> {
        let repositories = Arc::new(GitRepositoryService::new(config.spec.repositories.clone()));
        Self::with_repositories(config, repositories)
    }

    pub fn with_repositories(
        config: NodeConfigManifest,
        repositories: Arc<dyn RepositoryService>,
    ) -> Result<Self> {
        config.validate().context("Configuration validation failed")?;
        let spec = &config.spec;

        let mut cache = ArtifactCache::open(spec.cache.dir.clone()).with_context(|| {
            format!("Failed to open artifact cache at {:?}", spec.cache.dir)
        })?;
        if let Some(url) = &spec.cache.remote_url {
            info!(remote = %url, "Using remote artifact cache");
            cache = cache.with_remote(Arc::new(HttpArtifactSource::new(url.clone())));
        }
        let cache = Arc::new(cache);

        let loader = Arc::new(MorphologyLoader::new(repositories.clone()));
        let pool = WorkerPool::new(local_workers(
            &spec.workers,
            &spec.build,
            Some(repositories.clone()),
        ))
        .context("Failed to create worker pool")?;
        info!(
            workers = spec.workers.count,
            slots = pool.capacity(),
            cache = ?spec.cache.dir,
            "Build services ready"
        );

        let coordinator = Arc::new(BuildCoordinator::new(
            loader.clone(),
            cache.clone(),
            pool,
            EventBus::new(spec.coordinator.event_capacity),
            spec.build.clone(),
        ));

        Ok(Self {
            config,
            repositories,
            loader,
            cache,
            coordinator,
        })
    }
}
