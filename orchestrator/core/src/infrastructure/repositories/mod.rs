// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Service Implementations
//!
//! Infrastructure implementations of [`RepositoryService`], the read-only
//! view of version-controlled trees the morphology loader works from.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Serve morphology text and commit ids to the loader
//! - **Pattern:** Adapter (Hexagonal Architecture)
//!
//! # Available Implementations
//!
//! - **GitRepositoryService** - local clones read through libgit2
//! - **InMemoryRepositoryService** - fixed trees for tests and dry runs

pub mod git;

pub use git::GitRepositoryService;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::domain::repository::{EntryKind, RepositoryError, RepositoryService, TreeEntry};

const FILE_MODE: u32 = 0o100644;
const TREE_MODE: u32 = 0o040000;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    files: BTreeMap<String, Vec<u8>>,
}

impl Snapshot {
    /// Content hash standing in for a commit id
    fn commit_id(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, contents) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(contents);
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())[..40].to_string()
    }
}

/// Thread-safe map of repository name to refs to file trees
#[derive(Default)]
pub struct InMemoryRepositoryService {
    repos: RwLock<HashMap<String, HashMap<String, Snapshot>>>,
}

impl InMemoryRepositoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the file at `path` under `repo`/`git_ref`
    pub fn add_file(&self, repo: &str, git_ref: &str, path: &str, contents: impl Into<Vec<u8>>) {
        self.repos
            .write()
            .entry(repo.to_string())
            .or_default()
            .entry(git_ref.to_string())
            .or_default()
            .files
            .insert(path.trim_matches('/').to_string(), contents.into());
    }

    /// Finds a snapshot by ref name or by the commit id it resolves to
    fn with_snapshot<T>(
        &self,
        repo: &str,
        git_ref: &str,
        f: impl FnOnce(&Snapshot) -> T,
    ) -> Result<T, RepositoryError> {
        let repos = self.repos.read();
        let refs = repos
            .get(repo)
            .ok_or_else(|| RepositoryError::UnknownRepository(repo.to_string()))?;
        let snapshot = refs
            .get(git_ref)
            .or_else(|| refs.values().find(|s| s.commit_id() == git_ref))
            .ok_or_else(|| RepositoryError::UnknownRef {
                repo: repo.to_string(),
                git_ref: git_ref.to_string(),
            })?;
        Ok(f(snapshot))
    }
}

#[async_trait]
impl RepositoryService for InMemoryRepositoryService {
    async fn resolve_ref(&self, repo: &str, git_ref: &str) -> Result<String, RepositoryError> {
        self.with_snapshot(repo, git_ref, Snapshot::commit_id)
    }

    async fn cat_file(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RepositoryError> {
        self.with_snapshot(repo, git_ref, |s| s.files.get(path.trim_matches('/')).cloned())
    }

    async fn ls_tree(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<TreeEntry>, RepositoryError> {
        let dir = path.trim_matches('/');
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let (files, dirs) = self.with_snapshot(repo, git_ref, |s| {
            let mut files = BTreeSet::new();
            let mut dirs = BTreeSet::new();
            for name in s.files.keys().filter_map(|p| p.strip_prefix(&prefix)) {
                match name.split_once('/') {
                    Some((child, _)) => dirs.insert(child.to_string()),
                    None => files.insert(name.to_string()),
                };
            }
            (files, dirs)
        })?;

        if !dir.is_empty() && files.is_empty() && dirs.is_empty() {
            return Err(RepositoryError::NotADirectory {
                repo: repo.to_string(),
                path: dir.to_string(),
            });
        }

        let mut entries: Vec<TreeEntry> = dirs
            .into_iter()
            .map(|name| TreeEntry {
                name,
                kind: EntryKind::Tree,
                mode: TREE_MODE,
            })
            .chain(files.into_iter().map(|name| TreeEntry {
                name,
                kind: EntryKind::Blob,
                mode: FILE_MODE,
            }))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
