// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Worker Interface
//!
//! The coordinator hands each ready step to a [`StepExecutor`] as a
//! [`StepAssignment`]. Executors report progress back as protocol messages
//! (`step-started`, `step-output`, `step-finished`, `step-failed`) on the
//! channel given at dispatch, and stop work on `exec-cancel`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Seam between scheduling and execution; local workers live
//!   in the `morph-worker` crate

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::graph::{BuildNode, Fingerprint};

use crate::domain::protocol::{Message, MessageType, ProtocolError};
use crate::domain::session::SessionId;

/// Work handed to a worker for one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAssignment {
    pub session_id: SessionId,
    /// The client's build id, carried as `id` by every step report
    pub build_id: String,
    /// Identifies this execution; `exec-cancel` carries it as `id`
    pub exec_id: String,
    pub node: BuildNode,
    /// Artifact files of the step's direct dependencies, in dependency order
    pub dependency_artifacts: Vec<PathBuf>,
    /// Where the worker must write the step's artifact
    pub artifact_path: PathBuf,
    /// Effective parallelism for the build commands
    pub max_jobs: u32,
}

impl StepAssignment {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.node.fingerprint
    }

    /// `step_name` used in step reports
    pub fn step_name(&self) -> &str {
        self.node.fingerprint.as_str()
    }

    /// One `exec-request` per build command, run through the shell
    pub fn exec_requests(&self) -> Vec<Message> {
        self.node
            .commands
            .iter()
            .map(|command| {
                Message::exec_request(
                    &self.exec_id,
                    &["sh".to_string(), "-c".to_string(), command.clone()],
                    "",
                )
            })
            .collect()
    }

    pub fn exec_cancel(&self) -> Message {
        Message::exec_cancel(&self.exec_id)
    }
}

/// A command taken from an `exec-request` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub argv: Vec<String>,
    pub stdin_contents: String,
}

impl ExecCommand {
    pub fn from_message(request: &Message) -> Result<Self, ProtocolError> {
        if request.message_type() != MessageType::ExecRequest {
            return Err(ProtocolError::Malformed(format!(
                "expected exec-request, got {}",
                request.message_type()
            )));
        }
        let invalid_argv = |actual| ProtocolError::InvalidFieldType {
            message_type: MessageType::ExecRequest,
            field: "argv".to_string(),
            expected: "non-empty array of strings",
            actual,
        };
        let argv = match request.get("argv") {
            Some(Value::Array(items)) if !items.is_empty() => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or(invalid_argv("array")))
                .collect::<Result<Vec<_>, _>>()?,
            Some(Value::Array(_)) => return Err(invalid_argv("empty array")),
            Some(_) => return Err(invalid_argv("non-array")),
            None => {
                return Err(ProtocolError::MissingField {
                    message_type: MessageType::ExecRequest,
                    field: "argv".to_string(),
                })
            }
        };
        Ok(Self {
            argv,
            stdin_contents: request.require_str("stdin_contents")?.to_string(),
        })
    }

    /// The command as users wrote it: the script of `sh -c`, else the argv
    pub fn display(&self) -> String {
        match self.argv.as_slice() {
            [shell, flag, script] if shell == "sh" && flag == "-c" => script.clone(),
            argv => argv.join(" "),
        }
    }
}

/// Something that can run build steps
#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Steps this executor runs concurrently
    fn slots(&self) -> usize;

    /// Accepts a step; progress arrives on `reports`
    async fn dispatch(
        &self,
        assignment: StepAssignment,
        reports: mpsc::Sender<Message>,
    ) -> Result<(), WorkerError>;

    /// Handles an `exec-cancel` message; unknown or finished executions are a no-op
    async fn cancel(&self, request: &Message) -> Result<(), WorkerError>;
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No workers available")]
    NoWorkers,

    #[error("Worker {worker} rejected step: {reason}")]
    Rejected { worker: String, reason: String },

    #[error("Worker {worker} is unreachable: {reason}")]
    Unreachable { worker: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}
