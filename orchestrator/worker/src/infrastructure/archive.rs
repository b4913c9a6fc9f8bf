// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Artifact archives are plain tarballs of an install root.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::domain::StepError;

/// Archives the contents of `source` into `artifact`
pub async fn pack(source: &Path, artifact: &Path) -> Result<(), StepError> {
    let (source, artifact): (PathBuf, PathBuf) = (source.into(), artifact.into());
    blocking(move || {
        let file = File::create(&artifact)
            .map_err(|e| StepError::io("Failed to create artifact", &artifact, e))?;
        let mut builder = tar::Builder::new(file);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", &source)
            .map_err(|e| StepError::io("Failed to archive install root", &source, e))?;
        builder
            .into_inner()
            .and_then(|file| file.sync_all())
            .map_err(|e| StepError::io("Failed to write artifact", &artifact, e))
    })
    .await
}

/// Unpacks `artifact` on top of whatever `dest` already holds
pub async fn unpack(artifact: &Path, dest: &Path) -> Result<(), StepError> {
    let (artifact, dest): (PathBuf, PathBuf) = (artifact.into(), dest.into());
    blocking(move || {
        let file = File::open(&artifact)
            .map_err(|e| StepError::io("Failed to open dependency artifact", &artifact, e))?;
        let mut archive = tar::Archive::new(file);
        archive.set_preserve_permissions(true);
        archive
            .unpack(&dest)
            .map_err(|e| StepError::io("Failed to unpack dependency artifact", &artifact, e))
    })
    .await
}

async fn blocking<F>(f: F) -> Result<(), StepError>
where
    F: FnOnce() -> Result<(), StepError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        StepError::io("Archive task failed", PathBuf::new(), std::io::Error::other(e))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unpack_layers_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for (name, file) in [("a", "usr/lib/liba.so"), ("b", "usr/bin/b")] {
            let root = dir.path().join(name);
            let path = root.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, name).unwrap();
            pack(&root, &dir.path().join(format!("{}.tar", name))).await.unwrap();
        }

        let dest = dir.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        unpack(&dir.path().join("a.tar"), &dest).await.unwrap();
        unpack(&dir.path().join("b.tar"), &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("usr/lib/liba.so")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(dest.join("usr/bin/b")).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let err = unpack(&dir.path().join("nope.tar"), dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("nope.tar"));
    }
}
