// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Morphology Loader
//!
//! Fetches a root morphology and everything it transitively references from
//! the repository service, validating each document on the way in, and
//! records the commits refs resolved to so fingerprints pin exact sources.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Bridge between the [`RepositoryService`] and the pure
//!   [`GraphBuilder`]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::domain::graph::{
    child_references, BuildGraph, GraphBuilder, MorphologyLookup, MorphologyRef, DEFAULT_CHUNK_REF,
};
use crate::domain::morphology::{Morphology, MorphologyKind};
use crate::domain::repository::{RepositoryError, RepositoryService};
use crate::infrastructure::morphology_parser::MorphologyParser;

/// Morphologies loaded for one resolution, plus the commits their refs
/// resolved to
#[derive(Debug, Clone, Default)]
pub struct MorphologySet {
    morphologies: HashMap<MorphologyRef, Morphology>,
    commits: HashMap<(String, String), String>,
}

impl MorphologySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: MorphologyRef, morph: Morphology) {
        self.morphologies.insert(reference, morph);
    }

    pub fn record_commit(&mut self, repo: &str, git_ref: &str, commit: impl Into<String>) {
        self.commits
            .insert((repo.to_string(), git_ref.to_string()), commit.into());
    }

    pub fn get(&self, reference: &MorphologyRef) -> Option<&Morphology> {
        self.morphologies.get(reference)
    }

    pub fn len(&self) -> usize {
        self.morphologies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.morphologies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MorphologyRef, &Morphology)> {
        self.morphologies.iter()
    }
}

impl MorphologyLookup for MorphologySet {
    fn lookup(&self, reference: &MorphologyRef) -> Option<&Morphology> {
        self.morphologies.get(reference)
    }

    fn resolved_commit(&self, repo: &str, git_ref: &str) -> Option<&str> {
        self.commits
            .get(&(repo.to_string(), git_ref.to_string()))
            .map(String::as_str)
    }
}

pub struct MorphologyLoader {
    repositories: Arc<dyn RepositoryService>,
}

impl MorphologyLoader {
    pub fn new(repositories: Arc<dyn RepositoryService>) -> Self {
        Self { repositories }
    }

    /// Fetches, validates and defaults one morphology
    pub async fn load(&self, reference: &MorphologyRef) -> Result<Morphology> {
        let bytes = self
            .repositories
            .cat_file(&reference.repo, &reference.git_ref, &reference.path())
            .await
            .with_context(|| format!("Failed to read {}", reference))?
            .ok_or_else(|| anyhow!("Morphology {} not found", reference))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| anyhow!("Morphology {} is not valid UTF-8", reference))?;
        Ok(MorphologyParser::load_from_string(&text, &reference.to_string())?)
    }

    /// Loads `root` and every morphology reachable from it
    pub async fn collect(&self, root: &MorphologyRef) -> Result<MorphologySet> {
        let mut set = MorphologySet::new();
        let mut seen: HashSet<MorphologyRef> = HashSet::from([root.clone()]);
        let mut pending = vec![root.clone()];
        let mut sources: HashSet<(String, String)> = HashSet::new();

        let commit = self
            .repositories
            .resolve_ref(&root.repo, &root.git_ref)
            .await
            .with_context(|| format!("Failed to resolve {} in {}", root.git_ref, root.repo))?;
        set.record_commit(&root.repo, &root.git_ref, commit);

        while let Some(reference) = pending.pop() {
            let morph = self.load(&reference).await?;
            debug!(morphology = %reference, kind = ?morph.kind(), "Loaded morphology");

            for child in child_references(&morph, &reference)? {
                if seen.insert(child.clone()) {
                    pending.push(child);
                }
            }

            if morph.kind() == Some(MorphologyKind::Stratum) {
                for spec in morph.chunk_specs()? {
                    let git_ref = spec.git_ref.clone().unwrap_or_else(|| DEFAULT_CHUNK_REF.to_string());
                    sources.insert((spec.repo().to_string(), git_ref));
                }
            }

            set.insert(reference, morph);
        }

        for (repo, git_ref) in sources {
            match self.repositories.resolve_ref(&repo, &git_ref).await {
                Ok(commit) => set.record_commit(&repo, &git_ref, commit),
                // Sources without a local clone are fingerprinted by ref name
                Err(RepositoryError::UnknownRepository(_)) => {
                    warn!(repo = %repo, git_ref = %git_ref, "Chunk source repository not available");
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to resolve {} in {}", git_ref, repo));
                }
            }
        }

        Ok(set)
    }

    /// Loads everything reachable from `root` and builds its graph
    pub async fn resolve(&self, root: &MorphologyRef) -> Result<BuildGraph> {
        let set = self.collect(root).await?;
        let graph = GraphBuilder::new(&set).resolve(root)?;
        info!(
            root = %root,
            morphologies = set.len(),
            nodes = graph.len(),
            "Resolved build graph"
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::{GraphError, NodeKind};
    use crate::infrastructure::repositories::InMemoryRepositoryService;

    fn definitions() -> Arc<InMemoryRepositoryService> {
        let repos = InMemoryRepositoryService::new();
        repos.add_file("defs", "master", "systems/base.morph",
            "name: base\nkind: system\narch: x86_64\nstrata:\n  - morph: strata/core\n");
        repos.add_file("defs", "master", "strata/core.morph",
            "name: core\nkind: stratum\nchunks:\n  - name: gcc\n    morph: strata/core/gcc\n    repo: upstream:gcc\n    ref: v13\n    build-mode: bootstrap\n  - name: zlib\n    morph: strata/core/zlib\n    build-depends: [gcc]\n");
        repos.add_file("defs", "master", "strata/core/gcc.morph",
            "name: gcc\nkind: chunk\nbuild-system: autotools\n");
        repos.add_file("defs", "master", "strata/core/zlib.morph",
            "name: zlib\nkind: chunk\nbuild-commands: [make]\ninstall-commands: ['make install DESTDIR=\"$DESTDIR\"']\n");
        repos.add_file("upstream:gcc", "v13", "configure", "#!/bin/sh\n");
        Arc::new(repos)
    }

    fn root() -> MorphologyRef {
        MorphologyRef::new("defs", "master", "systems/base")
    }

    #[tokio::test]
    async fn test_collect_follows_references() {
        let repos = definitions();
        let set = MorphologyLoader::new(repos.clone()).collect(&root()).await.unwrap();

        assert_eq!(set.len(), 4);
        let zlib = set.get(&MorphologyRef::new("defs", "master", "strata/core/zlib")).unwrap();
        assert_eq!(zlib.get_str("build-system"), Some("manual"));

        let gcc_commit = repos.resolve_ref("upstream:gcc", "v13").await.unwrap();
        assert_eq!(set.resolved_commit("upstream:gcc", "v13"), Some(gcc_commit.as_str()));
        assert_eq!(set.resolved_commit("zlib", "HEAD"), None);
    }

    #[tokio::test]
    async fn test_resolve_builds_graph() {
        let graph = MorphologyLoader::new(definitions()).resolve(&root()).await.unwrap();
        assert_eq!(graph.len(), 4);

        let gcc = graph.nodes().find(|n| n.name == "gcc").unwrap();
        assert_eq!(gcc.repo, "upstream:gcc");
        assert!(gcc.commit.is_some());
        let zlib = graph.nodes().find(|n| n.name == "zlib").unwrap();
        assert_eq!(zlib.dependencies, vec![gcc.fingerprint.clone()]);
        assert_eq!(graph.node(&graph.roots()[0]).unwrap().kind, NodeKind::System);
    }

    #[tokio::test]
    async fn test_source_commit_changes_fingerprint() {
        let repos = definitions();
        let loader = MorphologyLoader::new(repos.clone());
        let before = loader.resolve(&root()).await.unwrap();

        repos.add_file("upstream:gcc", "v13", "configure", "#!/bin/sh\nexit 0\n");
        let after = loader.resolve(&root()).await.unwrap();

        let gcc = |g: &BuildGraph| g.nodes().find(|n| n.name == "gcc").unwrap().fingerprint.clone();
        assert_ne!(gcc(&before), gcc(&after));
    }

    #[tokio::test]
    async fn test_missing_morphology() {
        let repos = definitions();
        repos.add_file("defs", "master", "systems/broken.morph",
            "name: broken\nkind: system\narch: x86_64\nstrata:\n  - morph: strata/missing\n");
        let err = MorphologyLoader::new(repos)
            .resolve(&MorphologyRef::new("defs", "master", "systems/broken"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("strata/missing.morph not found"));
    }

    #[tokio::test]
    async fn test_invalid_document_is_reported() {
        let repos = definitions();
        repos.add_file("defs", "master", "strata/core/zlib.morph", "name: zlib\nkind: chunk\nconfigure: yes\n");
        let err = MorphologyLoader::new(repos).resolve(&root()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("configure"));
    }

    #[tokio::test]
    async fn test_unknown_definitions_ref() {
        let err = MorphologyLoader::new(definitions())
            .resolve(&MorphologyRef::new("defs", "nope", "systems/base"))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<RepositoryError>().is_some());
    }

    #[tokio::test]
    async fn test_cycle_surfaces_graph_error() {
        let repos = definitions();
        repos.add_file("defs", "master", "strata/a.morph",
            "name: a\nkind: stratum\nbuild-depends: [{morph: strata/b}]\nchunks:\n  - {name: zlib, morph: strata/core/zlib, build-depends: []}\n");
        repos.add_file("defs", "master", "strata/b.morph",
            "name: b\nkind: stratum\nbuild-depends: [{morph: strata/a}]\nchunks:\n  - {name: zlib, morph: strata/core/zlib, build-depends: []}\n");
        let err = MorphologyLoader::new(repos)
            .resolve(&MorphologyRef::new("defs", "master", "strata/a"))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<GraphError>(), Some(GraphError::Cycle { .. })));
    }
}
