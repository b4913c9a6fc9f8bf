// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::PathBuf;

use morph_core::domain::protocol::ProtocolError;
use morph_core::domain::repository::RepositoryError;
use thiserror::Error;

/// Why a step did not produce its artifact
///
/// The display text becomes the last `stderr` line a worker reports before
/// `step-failed`, so it is what users see as the failure reason.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{context} ({path}): {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to fetch sources: {0}")]
    Source(#[from] RepositoryError),

    #[error("Invalid exec request: {0}")]
    Request(#[from] ProtocolError),

    #[error("Command `{command}` exited with status {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Command `{command}` was killed by a signal")]
    Killed { command: String },

    #[error("Step was cancelled")]
    Cancelled,
}

impl StepError {
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }
}
