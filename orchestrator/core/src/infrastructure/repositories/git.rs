// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Git Repository Service
//!
//! Reads refs, blobs and trees from local git repositories with libgit2.
//! `git2::Repository` handles are neither `Send` nor `Sync`, so every call
//! opens the repository inside `spawn_blocking` and drops it there.
//!
//! A repository name is first expanded through the configured aliases. An
//! absolute result is used as a path as-is; anything else names a clone
//! under `base_dir`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{ErrorCode, ObjectType, Repository};
use tracing::debug;

use crate::domain::node_config::RepositoriesConfig;
use crate::domain::repository::{EntryKind, RepositoryError, RepositoryService, TreeEntry};

pub struct GitRepositoryService {
    config: RepositoriesConfig,
}

impl GitRepositoryService {
    pub fn new(config: RepositoriesConfig) -> Self {
        Self { config }
    }

    /// Local path of the clone backing `repo`
    pub fn repo_path(&self, repo: &str) -> PathBuf {
        let expanded = self.config.expand(repo);
        let path = Path::new(&expanded);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let dir_name: String = expanded
            .chars()
            .map(|c| if matches!(c, '/' | ':' | '\\') { '_' } else { c })
            .collect();
        self.config.base_dir.join(dir_name)
    }

    async fn with_repo<T, F>(&self, repo: &str, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T, RepositoryError> + Send + 'static,
    {
        let path = self.repo_path(repo);
        let name = repo.to_string();
        tokio::task::spawn_blocking(move || {
            let repository = Repository::open(&path).map_err(|e| match e.code() {
                ErrorCode::NotFound => RepositoryError::UnknownRepository(name.clone()),
                _ => backend(e),
            })?;
            f(&repository)
        })
        .await
        .map_err(|e| RepositoryError::Backend(e.to_string()))?
    }
}

fn backend(e: git2::Error) -> RepositoryError {
    RepositoryError::Backend(e.message().to_string())
}

fn find_commit<'r>(
    repository: &'r Repository,
    repo: &str,
    git_ref: &str,
) -> Result<git2::Commit<'r>, RepositoryError> {
    let object = repository
        .revparse_single(git_ref)
        .or_else(|_| repository.revparse_single(&format!("origin/{}", git_ref)))
        .map_err(|_| RepositoryError::UnknownRef {
            repo: repo.to_string(),
            git_ref: git_ref.to_string(),
        })?;
    object.peel_to_commit().map_err(|_| RepositoryError::UnknownRef {
        repo: repo.to_string(),
        git_ref: git_ref.to_string(),
    })
}

#[async_trait]
impl RepositoryService for GitRepositoryService {
    async fn resolve_ref(&self, repo: &str, git_ref: &str) -> Result<String, RepositoryError> {
        let (name, reference) = (repo.to_string(), git_ref.to_string());
        let commit = self
            .with_repo(repo, move |r| {
                find_commit(r, &name, &reference).map(|c| c.id().to_string())
            })
            .await?;
        debug!(repo = %repo, git_ref = %git_ref, commit = %commit, "Resolved ref");
        Ok(commit)
    }

    async fn cat_file(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Option<Vec<u8>>, RepositoryError> {
        let (name, reference) = (repo.to_string(), git_ref.to_string());
        let path = path.trim_matches('/').to_string();
        self.with_repo(repo, move |r| {
            let tree = find_commit(r, &name, &reference)?.tree().map_err(backend)?;
            let entry = match tree.get_path(Path::new(&path)) {
                Ok(entry) => entry,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(backend(e)),
            };
            if entry.kind() != Some(ObjectType::Blob) {
                return Ok(None);
            }
            let blob = r.find_blob(entry.id()).map_err(backend)?;
            Ok(Some(blob.content().to_vec()))
        })
        .await
    }

    async fn ls_tree(
        &self,
        repo: &str,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<TreeEntry>, RepositoryError> {
        let (name, reference) = (repo.to_string(), git_ref.to_string());
        let path = path.trim_matches('/').to_string();
        self.with_repo(repo, move |r| {
            let root = find_commit(r, &name, &reference)?.tree().map_err(backend)?;
            let not_a_directory = || RepositoryError::NotADirectory {
                repo: name.clone(),
                path: path.clone(),
            };
            let tree = if path.is_empty() {
                root
            } else {
                let entry = root.get_path(Path::new(&path)).map_err(|_| not_a_directory())?;
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(not_a_directory());
                }
                r.find_tree(entry.id()).map_err(backend)?
            };

            Ok(tree
                .iter()
                .map(|entry| TreeEntry {
                    name: entry.name().unwrap_or_default().to_string(),
                    kind: match entry.kind() {
                        Some(ObjectType::Tree) => EntryKind::Tree,
                        Some(ObjectType::Commit) => EntryKind::Commit,
                        _ => EntryKind::Blob,
                    },
                    mode: entry.filemode() as u32,
                })
                .collect())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use std::collections::HashMap;

    /// Creates `<base>/defs` with one commit on master
    fn fixture(base: &Path) -> String {
        let repository = Repository::init(base.join("defs")).unwrap();
        let system = repository.blob(b"name: base\nkind: system\n").unwrap();
        let readme = repository.blob(b"definitions").unwrap();

        let mut systems = repository.treebuilder(None).unwrap();
        systems.insert("base.morph", system, 0o100644).unwrap();
        let systems_oid = systems.write().unwrap();

        let mut root = repository.treebuilder(None).unwrap();
        root.insert("README", readme, 0o100644).unwrap();
        root.insert("systems", systems_oid, 0o040000).unwrap();
        let tree = repository.find_tree(root.write().unwrap()).unwrap();

        let sig = Signature::now("morph", "morph@localhost").unwrap();
        repository
            .commit(Some("refs/heads/master"), &sig, &sig, "initial", &tree, &[])
            .unwrap()
            .to_string()
    }

    fn service(base: &Path) -> GitRepositoryService {
        GitRepositoryService::new(RepositoriesConfig {
            base_dir: base.to_path_buf(),
            aliases: HashMap::new(),
        })
    }

    #[tokio::test]
    async fn test_resolve_ref() {
        let dir = tempfile::tempdir().unwrap();
        let commit = fixture(dir.path());
        let repos = service(dir.path());

        assert_eq!(repos.resolve_ref("defs", "master").await.unwrap(), commit);
        assert_eq!(repos.resolve_ref("defs", &commit).await.unwrap(), commit);
        assert!(matches!(
            repos.resolve_ref("defs", "no-such-branch").await,
            Err(RepositoryError::UnknownRef { .. })
        ));
        assert_eq!(
            repos.resolve_ref("missing", "master").await,
            Err(RepositoryError::UnknownRepository("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_cat_file() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let repos = service(dir.path());

        let text = repos.cat_file("defs", "master", "systems/base.morph").await.unwrap();
        assert_eq!(text.as_deref(), Some(&b"name: base\nkind: system\n"[..]));
        assert_eq!(repos.cat_file("defs", "master", "systems/x.morph").await.unwrap(), None);
        assert_eq!(repos.cat_file("defs", "master", "systems").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ls_tree() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let repos = service(dir.path());

        let root = repos.ls_tree("defs", "master", "").await.unwrap();
        assert_eq!(root.len(), 2);
        assert!(root.iter().any(|e| e.name == "systems" && e.kind == EntryKind::Tree));

        let systems = repos.ls_tree("defs", "master", "systems").await.unwrap();
        assert_eq!(systems[0].name, "base.morph");
        assert_eq!(systems[0].mode, 0o100644);

        assert!(matches!(
            repos.ls_tree("defs", "master", "README").await,
            Err(RepositoryError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_repo_path_expands_aliases() {
        let repos = GitRepositoryService::new(RepositoriesConfig {
            base_dir: PathBuf::from("/var/cache/morph/gits"),
            aliases: HashMap::from([(
                "upstream".to_string(),
                "git://git.example.org/delta/%s".to_string(),
            )]),
        });
        assert_eq!(
            repos.repo_path("upstream:zlib"),
            PathBuf::from("/var/cache/morph/gits/git___git.example.org_delta_zlib")
        );
        assert_eq!(repos.repo_path("/srv/defs"), PathBuf::from("/srv/defs"));
    }
}
