// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Source Export
//!
//! Writes the tree of a chunk's source commit into a build directory using
//! the same [`RepositoryService`] the morphology loader reads from.
//! Submodule entries are skipped.

use std::path::Path;

use morph_core::domain::repository::{EntryKind, RepositoryService};
use tracing::debug;

use crate::domain::StepError;

/// Exports `repo` at `git_ref` into `dest`; returns the number of files written
pub async fn export_tree(
    repos: &dyn RepositoryService,
    repo: &str,
    git_ref: &str,
    dest: &Path,
) -> Result<usize, StepError> {
    let mut pending = vec![String::new()];
    let mut written = 0usize;

    while let Some(dir) = pending.pop() {
        for entry in repos.ls_tree(repo, git_ref, &dir).await? {
            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };
            let target = dest.join(&path);
            match entry.kind {
                EntryKind::Tree => {
                    tokio::fs::create_dir_all(&target)
                        .await
                        .map_err(|e| StepError::io("Failed to create source directory", &target, e))?;
                    pending.push(path);
                }
                EntryKind::Blob => {
                    let Some(contents) = repos.cat_file(repo, git_ref, &path).await? else {
                        continue;
                    };
                    tokio::fs::write(&target, contents)
                        .await
                        .map_err(|e| StepError::io("Failed to write source file", &target, e))?;
                    set_mode(&target, entry.mode).await?;
                    written += 1;
                }
                EntryKind::Commit => {
                    debug!(repo = %repo, path = %path, "Skipping submodule");
                }
            }
        }
    }

    Ok(written)
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StepError> {
    use std::os::unix::fs::PermissionsExt;
    if mode & 0o111 == 0 {
        return Ok(());
    }
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| StepError::io("Failed to set source file mode", path, e))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), StepError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_core::infrastructure::InMemoryRepositoryService;

    #[tokio::test]
    async fn test_export_nested_tree() {
        let repos = InMemoryRepositoryService::new();
        repos.add_file("upstream:zlib", "v1.3", "configure", "#!/bin/sh\n");
        repos.add_file("upstream:zlib", "v1.3", "src/zlib.c", "int main;\n");
        repos.add_file("upstream:zlib", "v1.3", "src/inc/zlib.h", "#pragma once\n");

        let dir = tempfile::tempdir().unwrap();
        let written = export_tree(&repos, "upstream:zlib", "v1.3", dir.path()).await.unwrap();

        assert_eq!(written, 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/inc/zlib.h")).unwrap(),
            "#pragma once\n"
        );
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let repos = InMemoryRepositoryService::new();
        let dir = tempfile::tempdir().unwrap();
        let err = export_tree(&repos, "upstream:nope", "master", dir.path()).await.unwrap_err();
        assert!(matches!(err, StepError::Source(_)));
    }
}
