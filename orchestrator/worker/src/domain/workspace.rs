// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Step Workspace
//!
//! Scratch directories for one step execution, removed when dropped:
//!
//! ```text
//! <tempdir>/<name>-XXXXXX/
//!     staging/   dependency artifacts, unpacked (chunks only)
//!     build/     sources and the commands' working directory
//!     install/   DESTDIR; archived into the step's artifact
//! ```

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use super::errors::StepError;

pub struct StepWorkspace {
    root: TempDir,
}

impl StepWorkspace {
    pub fn create(tempdir: &Path, name: &str) -> Result<Self, StepError> {
        std::fs::create_dir_all(tempdir)
            .map_err(|e| StepError::io("Failed to create build tempdir", tempdir, e))?;
        let root = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .tempdir_in(tempdir)
            .map_err(|e| StepError::io("Failed to create step workspace", tempdir, e))?;

        let workspace = Self { root };
        for dir in [workspace.staging(), workspace.build(), workspace.install()] {
            std::fs::create_dir(&dir)
                .map_err(|e| StepError::io("Failed to create step workspace", dir.clone(), e))?;
        }
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn staging(&self) -> PathBuf {
        self.root.path().join("staging")
    }

    pub fn build(&self) -> PathBuf {
        self.root.path().join("build")
    }

    pub fn install(&self) -> PathBuf {
        self.root.path().join("install")
    }
}
