// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dependency Graph
//!
//! Resolves a root morphology and everything it references into a directed
//! acyclic graph of buildable units, keyed by content fingerprint.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure, deterministic graph resolution over already-loaded
//!   morphologies. Fetching morphology text is the loader's job
//!   (`application::morphology_loader`); the builder only sees a
//!   [`MorphologyLookup`].
//!
//! # Edges
//!
//! | Node | Depends on |
//! |------|------------|
//! | chunk | chunks named in its `build-depends`, then the strata its stratum build-depends on |
//! | stratum | its chunks |
//! | system | its strata |
//!
//! A cluster root contributes each of its systems (subsystems included) as
//! a root of the graph.
//!
//! # Fingerprints
//!
//! A node's fingerprint is the SHA-256 of its kind, its name, its canonical
//! content and the sorted fingerprints of its dependencies. Identical inputs
//! give identical fingerprints on every run; any content change to a node
//! changes the fingerprint of that node and of everything depending on it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::morphology::{Morphology, MorphologyError, MorphologyKind};
use crate::domain::normalization::to_canonical_yaml;
use crate::domain::specs::{BuildMode, ChunkSpec, ClusterSystemSpec};

/// Ref used for chunk sources that do not name one
pub const DEFAULT_CHUNK_REF: &str = "HEAD";

// ============================================================================
// Value Objects
// ============================================================================

/// Hex-encoded SHA-256 content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(kind: NodeKind, name: &str, content: &str, dependencies: &[Fingerprint]) -> Self {
        let mut sorted: Vec<&str> = dependencies.iter().map(|d| d.as_str()).collect();
        sorted.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        for dep in sorted {
            hasher.update([0u8]);
            hasher.update(dep.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parses a fingerprint received over the wire
    pub fn parse(text: &str) -> Option<Self> {
        (text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit()))
            .then(|| Self(text.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for ids and log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::parse(&text).ok_or_else(|| format!("invalid fingerprint {:?}", text))
    }
}

impl From<Fingerprint> for String {
    fn from(fingerprint: Fingerprint) -> Self {
        fingerprint.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Chunk,
    Stratum,
    System,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Chunk => "chunk",
            NodeKind::Stratum => "stratum",
            NodeKind::System => "system",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of a morphology: repository, ref and path within the tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MorphologyRef {
    pub repo: String,
    pub git_ref: String,
    pub name: String,
}

impl MorphologyRef {
    pub fn new(repo: impl Into<String>, git_ref: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            git_ref: git_ref.into(),
            name: name.into(),
        }
    }

    /// Path of the morphology file within the repository tree
    pub fn path(&self) -> String {
        if self.name.ends_with(".morph") {
            self.name.clone()
        } else {
            format!("{}.morph", self.name)
        }
    }

    fn sibling(&self, name: &str) -> Self {
        Self::new(&self.repo, &self.git_ref, name)
    }
}

impl fmt::Display for MorphologyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.repo, self.git_ref, self.path())
    }
}

/// One buildable unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildNode {
    pub fingerprint: Fingerprint,
    pub kind: NodeKind,
    pub name: String,
    /// Source repository and ref (chunks) or definitions repository (others)
    pub repo: String,
    pub git_ref: String,
    pub commit: Option<String>,
    pub build_mode: BuildMode,
    /// Direct dependencies in declared order
    pub dependencies: Vec<Fingerprint>,
    /// Shell commands to run, in phase order; empty for strata and systems
    pub commands: Vec<String>,
    pub max_jobs: Option<u32>,
}

/// Resolved build graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildGraph {
    roots: Vec<Fingerprint>,
    nodes: BTreeMap<Fingerprint, BuildNode>,
    order: Vec<Fingerprint>,
}

impl BuildGraph {
    pub fn roots(&self) -> &[Fingerprint] {
        &self.roots
    }

    pub fn node(&self, fingerprint: &Fingerprint) -> Option<&BuildNode> {
        self.nodes.get(fingerprint)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.nodes.contains_key(fingerprint)
    }

    /// Fingerprints ordered so that every dependency precedes its dependents
    pub fn topological_order(&self) -> &[Fingerprint] {
        &self.order
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.order.iter().filter_map(|fp| self.nodes.get(fp))
    }

    /// Nodes that depend directly on `fingerprint`
    pub fn dependents(&self, fingerprint: &Fingerprint) -> Vec<&Fingerprint> {
        self.order
            .iter()
            .filter(|fp| {
                self.nodes
                    .get(*fp)
                    .is_some_and(|n| n.dependencies.contains(fingerprint))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ============================================================================
// Lookup
// ============================================================================

/// Read access to already-loaded morphologies
pub trait MorphologyLookup {
    fn lookup(&self, reference: &MorphologyRef) -> Option<&Morphology>;

    /// Commit a (repo, ref) pair resolved to, when known
    fn resolved_commit(&self, _repo: &str, _git_ref: &str) -> Option<&str> {
        None
    }
}

impl MorphologyLookup for HashMap<MorphologyRef, Morphology> {
    fn lookup(&self, reference: &MorphologyRef) -> Option<&Morphology> {
        self.get(reference)
    }
}

/// Morphologies directly referenced by `morph`, in declared order
pub fn child_references(
    morph: &Morphology,
    location: &MorphologyRef,
) -> Result<Vec<MorphologyRef>, MorphologyError> {
    let refs = match morph.kind() {
        Some(MorphologyKind::System) => morph
            .system_strata()?
            .into_iter()
            .map(|s| location.sibling(&s.morph))
            .collect(),
        Some(MorphologyKind::Stratum) => {
            let mut refs: Vec<MorphologyRef> = morph
                .stratum_build_depends()?
                .into_iter()
                .map(|s| location.sibling(&s.morph))
                .collect();
            refs.extend(
                morph
                    .chunk_specs()?
                    .iter()
                    .map(|c| location.sibling(c.morph())),
            );
            refs
        }
        Some(MorphologyKind::Cluster) => flatten_systems(&morph.cluster_systems()?)
            .into_iter()
            .map(|s| location.sibling(&s.morph))
            .collect(),
        _ => Vec::new(),
    };
    Ok(refs)
}

/// Systems of a cluster in declared order, each followed by its subsystems
pub fn flatten_systems(systems: &[ClusterSystemSpec]) -> Vec<&ClusterSystemSpec> {
    let mut flat = Vec::new();
    let mut pending: Vec<&ClusterSystemSpec> = systems.iter().rev().collect();
    while let Some(system) = pending.pop() {
        flat.push(system);
        pending.extend(system.subsystems.iter().rev());
    }
    flat
}

// ============================================================================
// Builder
// ============================================================================

struct StratumContext<'s> {
    key: String,
    name: String,
    location: MorphologyRef,
    chunks: &'s [ChunkSpec],
    by_name: HashMap<&'s str, usize>,
    build_depends: Vec<Fingerprint>,
}

/// Depth-first resolver with memoisation and cycle detection
pub struct GraphBuilder<'a> {
    lookup: &'a dyn MorphologyLookup,
    resolved: HashMap<String, Fingerprint>,
    in_progress: Vec<(String, String)>,
    nodes: BTreeMap<Fingerprint, BuildNode>,
    order: Vec<Fingerprint>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(lookup: &'a dyn MorphologyLookup) -> Self {
        Self {
            lookup,
            resolved: HashMap::new(),
            in_progress: Vec::new(),
            nodes: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn resolve(mut self, root: &MorphologyRef) -> Result<BuildGraph, GraphError> {
        let morph = self.fetch(root, "build request")?;
        let roots = match morph.kind() {
            Some(MorphologyKind::Cluster) => {
                let systems = morph.cluster_systems()?;
                let mut roots = Vec::new();
                for system in flatten_systems(&systems) {
                    let fp = self.resolve_system(&root.sibling(&system.morph), &root.to_string())?;
                    if !roots.contains(&fp) {
                        roots.push(fp);
                    }
                }
                roots
            }
            Some(MorphologyKind::System) => vec![self.resolve_system(root, "build request")?],
            Some(MorphologyKind::Stratum) => vec![self.resolve_stratum(root, "build request")?],
            _ => {
                return Err(GraphError::NotBuildable {
                    reference: root.to_string(),
                    kind: morph.kind_str().unwrap_or("<none>").to_string(),
                })
            }
        };

        Ok(BuildGraph {
            roots,
            nodes: self.nodes,
            order: self.order,
        })
    }

    fn fetch(&self, reference: &MorphologyRef, from: &str) -> Result<&'a Morphology, GraphError> {
        self.lookup
            .lookup(reference)
            .ok_or_else(|| GraphError::Unresolved {
                reference: reference.to_string(),
                referenced_from: from.to_string(),
            })
    }

    fn fetch_kind(
        &self,
        reference: &MorphologyRef,
        from: &str,
        expected: MorphologyKind,
    ) -> Result<&'a Morphology, GraphError> {
        let morph = self.fetch(reference, from)?;
        if morph.kind() != Some(expected) {
            return Err(GraphError::KindMismatch {
                reference: reference.to_string(),
                expected,
                actual: morph.kind_str().unwrap_or("<none>").to_string(),
            });
        }
        Ok(morph)
    }

    /// Memoised fingerprint for `key`, or marks `key` as in progress
    fn enter(&mut self, key: &str, label: &str) -> Result<Option<Fingerprint>, GraphError> {
        if let Some(fp) = self.resolved.get(key) {
            return Ok(Some(fp.clone()));
        }
        if let Some(pos) = self.in_progress.iter().position(|(k, _)| k == key) {
            let mut path: Vec<String> = self.in_progress[pos..]
                .iter()
                .map(|(_, l)| l.clone())
                .collect();
            path.push(label.to_string());
            return Err(GraphError::Cycle { path });
        }
        self.in_progress.push((key.to_string(), label.to_string()));
        Ok(None)
    }

    fn leave(&mut self, key: &str, node: BuildNode) -> Fingerprint {
        self.in_progress.pop();
        let fp = node.fingerprint.clone();
        self.resolved.insert(key.to_string(), fp.clone());
        if !self.nodes.contains_key(&fp) {
            self.order.push(fp.clone());
            self.nodes.insert(fp.clone(), node);
        }
        fp
    }

    fn resolve_system(&mut self, reference: &MorphologyRef, from: &str) -> Result<Fingerprint, GraphError> {
        let key = format!("system|{}", reference);
        if let Some(fp) = self.enter(&key, &reference.to_string())? {
            return Ok(fp);
        }
        let morph = self.fetch_kind(reference, from, MorphologyKind::System)?;

        let mut dependencies = Vec::new();
        for stratum in morph.system_strata()? {
            let fp = self.resolve_stratum(&reference.sibling(&stratum.morph), &reference.to_string())?;
            dependencies.push(fp);
        }

        let node = self.aggregate_node(NodeKind::System, morph, reference, dependencies)?;
        Ok(self.leave(&key, node))
    }

    fn resolve_stratum(&mut self, reference: &MorphologyRef, from: &str) -> Result<Fingerprint, GraphError> {
        let key = format!("stratum|{}", reference);
        if let Some(fp) = self.enter(&key, &reference.to_string())? {
            return Ok(fp);
        }
        let morph = self.fetch_kind(reference, from, MorphologyKind::Stratum)?;

        let mut build_depends = Vec::new();
        for spec in morph.stratum_build_depends()? {
            let fp = self.resolve_stratum(&reference.sibling(&spec.morph), &reference.to_string())?;
            build_depends.push(fp);
        }

        let chunks = morph.chunk_specs()?;
        let ctx = StratumContext {
            key: key.clone(),
            name: morph.display_name().to_string(),
            location: reference.clone(),
            chunks: &chunks,
            by_name: chunks
                .iter()
                .enumerate()
                .map(|(i, c)| (c.reference_name(), i))
                .collect(),
            build_depends,
        };

        let mut dependencies = Vec::with_capacity(chunks.len());
        for index in 0..chunks.len() {
            dependencies.push(self.resolve_chunk(&ctx, index)?);
        }

        let node = self.aggregate_node(NodeKind::Stratum, morph, reference, dependencies)?;
        Ok(self.leave(&key, node))
    }

    fn resolve_chunk(&mut self, ctx: &StratumContext<'_>, index: usize) -> Result<Fingerprint, GraphError> {
        let spec = &ctx.chunks[index];
        let key = format!("chunk|{}|{}", ctx.key, spec.reference_name());
        let label = format!("{}/{}", ctx.name, spec.reference_name());
        if let Some(fp) = self.enter(&key, &label)? {
            return Ok(fp);
        }

        let mut dependencies = Vec::new();
        for dep in &spec.build_depends {
            let dep_index = *ctx.by_name.get(dep.as_str()).ok_or_else(|| {
                GraphError::UnknownChunkDependency {
                    stratum: ctx.name.clone(),
                    chunk: spec.reference_name().to_string(),
                    dependency: dep.clone(),
                }
            })?;
            dependencies.push(self.resolve_chunk(ctx, dep_index)?);
        }
        dependencies.extend(ctx.build_depends.iter().cloned());

        let chunk_ref = ctx.location.sibling(spec.morph());
        let morph = self.fetch_kind(&chunk_ref, &ctx.location.to_string(), MorphologyKind::Chunk)?;
        let recipe = morph.chunk_recipe(spec.build_mode)?;

        let git_ref = spec.git_ref.clone().unwrap_or_else(|| DEFAULT_CHUNK_REF.to_string());
        let commit = self
            .lookup
            .resolved_commit(spec.repo(), &git_ref)
            .map(str::to_string);
        let content = format!(
            "repo: {}\nsource: {}\nbuild-mode: {}\n{}",
            spec.repo(),
            commit.as_deref().unwrap_or(&git_ref),
            spec.build_mode,
            to_canonical_yaml(morph)?
        );

        let node = BuildNode {
            fingerprint: Fingerprint::compute(NodeKind::Chunk, spec.reference_name(), &content, &dependencies),
            kind: NodeKind::Chunk,
            name: spec.reference_name().to_string(),
            repo: spec.repo().to_string(),
            git_ref,
            commit,
            build_mode: spec.build_mode,
            dependencies,
            commands: recipe.commands(),
            max_jobs: recipe.max_jobs,
        };
        Ok(self.leave(&key, node))
    }

    fn aggregate_node(
        &self,
        kind: NodeKind,
        morph: &Morphology,
        reference: &MorphologyRef,
        dependencies: Vec<Fingerprint>,
    ) -> Result<BuildNode, GraphError> {
        let name = morph.display_name().to_string();
        let content = to_canonical_yaml(morph)?;
        Ok(BuildNode {
            fingerprint: Fingerprint::compute(kind, &name, &content, &dependencies),
            kind,
            name,
            repo: reference.repo.clone(),
            git_ref: reference.git_ref.clone(),
            commit: self
                .lookup
                .resolved_commit(&reference.repo, &reference.git_ref)
                .map(str::to_string),
            build_mode: BuildMode::Staging,
            dependencies,
            commands: Vec::new(),
            max_jobs: None,
        })
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("Cannot resolve morphology {reference} (referenced from {referenced_from})")]
    Unresolved {
        reference: String,
        referenced_from: String,
    },

    #[error("Morphology {reference} should be a {expected}, found kind {actual}")]
    KindMismatch {
        reference: String,
        expected: MorphologyKind,
        actual: String,
    },

    #[error("Chunk {chunk} in stratum {stratum} build-depends on unknown chunk {dependency}")]
    UnknownChunkDependency {
        stratum: String,
        chunk: String,
        dependency: String,
    },

    #[error("Dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("Morphology {reference} of kind {kind} cannot be built on its own")]
    NotBuildable { reference: String, kind: String },

    #[error(transparent)]
    Morphology(#[from] MorphologyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn morph(yaml: &str) -> Morphology {
        Morphology::new(serde_yaml::from_str(yaml).unwrap(), "test")
    }

    fn r(name: &str) -> MorphologyRef {
        MorphologyRef::new("defs", "master", name)
    }

    fn chunk(name: &str, build: &str) -> Morphology {
        morph(&format!("kind: chunk\nname: {name}\nbuild-commands: [{build}]\n"))
    }

    fn fixture() -> HashMap<MorphologyRef, Morphology> {
        let mut set = HashMap::new();
        set.insert(r("a"), chunk("a", "make a"));
        set.insert(r("b"), chunk("b", "make b"));
        set.insert(
            r("core"),
            morph(
                "kind: stratum\nname: core\nbuild-depends: []\nchunks:\n  - {name: a, morph: a, build-depends: []}\n  - {name: b, morph: b, build-depends: [a]}\n",
            ),
        );
        set.insert(
            r("sys"),
            morph("kind: system\nname: sys\narch: x86_64\nstrata: [{morph: core}]\n"),
        );
        set
    }

    #[test]
    fn test_resolves_system_into_dag() {
        let set = fixture();
        let graph = GraphBuilder::new(&set).resolve(&r("sys")).unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots().len(), 1);
        let names: Vec<&str> = graph.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "core", "sys"]);

        let b = graph.nodes().find(|n| n.name == "b").unwrap();
        let a = graph.nodes().find(|n| n.name == "a").unwrap();
        assert_eq!(b.dependencies, vec![a.fingerprint.clone()]);
        assert_eq!(b.commands, vec!["make b"]);
        assert_eq!(graph.dependents(&a.fingerprint), vec![&b.fingerprint]);
    }

    #[test]
    fn test_fingerprints_are_deterministic() {
        let set = fixture();
        let first = GraphBuilder::new(&set).resolve(&r("sys")).unwrap();
        let second = GraphBuilder::new(&set).resolve(&r("sys")).unwrap();
        assert_eq!(first.topological_order(), second.topological_order());
    }

    #[test]
    fn test_content_change_propagates_to_dependents() {
        let set = fixture();
        let before = GraphBuilder::new(&set).resolve(&r("sys")).unwrap();

        let mut changed = fixture();
        changed.insert(r("a"), chunk("a", "make a V=1"));
        let after = GraphBuilder::new(&changed).resolve(&r("sys")).unwrap();

        let fp = |g: &BuildGraph, name: &str| {
            g.nodes().find(|n| n.name == name).unwrap().fingerprint.clone()
        };
        for name in ["a", "b", "core", "sys"] {
            assert_ne!(fp(&before, name), fp(&after, name), "{name} should change");
        }
    }

    #[test]
    fn test_unrelated_change_keeps_fingerprint() {
        let mut set = fixture();
        set.insert(r("c"), chunk("c", "make c"));
        set.insert(
            r("extra"),
            morph("kind: stratum\nname: extra\nbuild-depends: [{morph: core}]\nchunks:\n  - {name: c, morph: c, build-depends: []}\n"),
        );
        let before = GraphBuilder::new(&set).resolve(&r("extra")).unwrap();
        set.insert(r("c"), chunk("c", "make c V=1"));
        let after = GraphBuilder::new(&set).resolve(&r("extra")).unwrap();

        let core = |g: &BuildGraph| g.nodes().find(|n| n.name == "core").unwrap().fingerprint.clone();
        assert_eq!(core(&before), core(&after));
    }

    #[test]
    fn test_unresolved_reference() {
        let mut set = fixture();
        set.remove(&r("core"));
        let err = GraphBuilder::new(&set).resolve(&r("sys")).unwrap_err();
        assert!(matches!(err, GraphError::Unresolved { .. }));
    }

    #[test]
    fn test_stratum_cycle_is_reported() {
        let mut set = fixture();
        set.insert(
            r("x"),
            morph("kind: stratum\nname: x\nbuild-depends: [{morph: y}]\nchunks:\n  - {name: a, morph: a, build-depends: []}\n"),
        );
        set.insert(
            r("y"),
            morph("kind: stratum\nname: y\nbuild-depends: [{morph: x}]\nchunks:\n  - {name: b, morph: b, build-depends: []}\n"),
        );
        let err = GraphBuilder::new(&set).resolve(&r("x")).unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                assert_eq!(path.len(), 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_chunk_cycle_is_reported() {
        let mut set = fixture();
        set.insert(
            r("core"),
            morph("kind: stratum\nname: core\nbuild-depends: []\nchunks:\n  - {name: a, morph: a, build-depends: [b]}\n  - {name: b, morph: b, build-depends: [a]}\n"),
        );
        let err = GraphBuilder::new(&set).resolve(&r("sys")).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn test_cluster_roots_include_subsystems() {
        let mut set = fixture();
        set.insert(
            r("other"),
            morph("kind: system\nname: other\narch: x86_64\nstrata: [{morph: core}]\n"),
        );
        set.insert(
            r("cluster"),
            morph("kind: cluster\nname: c\nsystems:\n  - morph: sys\n    subsystems:\n      - morph: other\n"),
        );
        let graph = GraphBuilder::new(&set).resolve(&r("cluster")).unwrap();
        assert_eq!(graph.roots().len(), 2);
        // core stratum and its chunks are shared between both systems
        assert_eq!(graph.len(), 5);
    }

    #[test]
    fn test_fingerprint_parse() {
        let fp = Fingerprint::compute(NodeKind::Chunk, "a", "x", &[]);
        assert_eq!(Fingerprint::parse(fp.as_str()), Some(fp.clone()));
        assert_eq!(Fingerprint::parse("not-hex"), None);
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn test_fingerprint_deserialization_is_checked() {
        let fp = Fingerprint::compute(NodeKind::Stratum, "core", "", &[]);
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.as_str()));
        assert_eq!(serde_json::from_str::<Fingerprint>(&json).unwrap(), fp);

        assert!(serde_json::from_str::<Fingerprint>("\"abc\"").is_err());
        assert!(serde_json::from_str::<Fingerprint>("\"\"").is_err());
    }
}
