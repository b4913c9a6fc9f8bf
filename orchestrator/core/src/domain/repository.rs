// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Source Repository Interface
//!
//! Read-only access to the version-controlled repositories that hold
//! morphology text and chunk sources. Defined in the domain layer,
//! implemented in `crate::infrastructure::repositories`.
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | `InMemoryRepositoryService` | fixed trees, for tests and dry runs |
//! | `GitRepositoryService` | local git clones via libgit2 |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Blob,
    Tree,
    Commit,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
}

/// Repository access used by the morphology loader
#[async_trait]
pub trait RepositoryService: Send + Sync {
    /// Resolves a symbolic ref to an immutable commit id
    async fn resolve_ref(&self, repo: &str, git_ref: &str) -> Result<String, RepositoryError>;

    /// Contents of the file at `path`, or `None` if there is no such file
    async fn cat_file(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RepositoryError>;

    /// Entries of the directory at `path` (`""` for the root)
    async fn ls_tree(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<TreeEntry>, RepositoryError>;
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    #[error("Unknown repository: {0}")]
    UnknownRepository(String),

    #[error("Ref {git_ref} not found in repository {repo}")]
    UnknownRef { repo: String, git_ref: String },

    #[error("Path {path} is not a directory in {repo}")]
    NotADirectory { repo: String, path: String },

    #[error("Repository backend error: {0}")]
    Backend(String),
}
