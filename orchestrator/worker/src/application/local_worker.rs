// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Local Worker
//!
//! A [`StepExecutor`] that runs steps as child processes on this host.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Execute build steps and report their progress
//!
//! # Step Execution
//!
//! Chunk steps unpack their dependencies' artifacts into `staging/`, export
//! the chunk's source commit into `build/` when a repository service is
//! configured, and run the `exec-request` of each build command there with
//! `DESTDIR` pointing at `install/`. Stratum and system steps only assemble
//! their dependencies' artifacts into `install/`. Either way `install/` is archived into the
//! assignment's artifact path.
//!
//! Every execution reports exactly one `step-started`, its output, and then
//! exactly one of `step-finished` or `step-failed`. A cancelled execution
//! still ends with `step-failed`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use morph_core::domain::graph::NodeKind;
use morph_core::domain::node_config::{BuildConfig, WorkersConfig};
use morph_core::domain::protocol::{Message, MessageType, ProtocolError};
use morph_core::domain::repository::RepositoryService;
use morph_core::domain::worker::{ExecCommand, StepAssignment, StepExecutor, WorkerError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{StepError, StepWorkspace};
use crate::infrastructure::archive;
use crate::infrastructure::process::{run_command, CommandOutcome, OutputLine, Stream};
use crate::infrastructure::sources::export_tree;

pub struct LocalWorker {
    name: String,
    slots: usize,
    tempdir: PathBuf,
    sources: Option<Arc<dyn RepositoryService>>,
    /// Cancellation tokens of running executions, by exec id
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LocalWorker {
    pub fn new(name: impl Into<String>, slots: usize, tempdir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            slots,
            tempdir: tempdir.into(),
            sources: None,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Exports chunk sources from `repos` before running build commands
    pub fn with_sources(mut self, repos: Arc<dyn RepositoryService>) -> Self {
        self.sources = Some(repos);
        self
    }

    pub fn running(&self) -> usize {
        self.running.lock().len()
    }
}

/// The local worker pool described by the node configuration
pub fn local_workers(
    workers: &WorkersConfig,
    build: &BuildConfig,
    sources: Option<Arc<dyn RepositoryService>>,
) -> Vec<Arc<dyn StepExecutor>> {
    (1..=workers.count)
        .map(|n| {
            let mut worker = LocalWorker::new(
                format!("{}-{}", workers.name_prefix, n),
                workers.slots,
                build.tempdir.clone(),
            );
            if let Some(repos) = &sources {
                worker = worker.with_sources(repos.clone());
            }
            Arc::new(worker) as Arc<dyn StepExecutor>
        })
        .collect()
}

#[async_trait]
impl StepExecutor for LocalWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn slots(&self) -> usize {
        self.slots
    }

    async fn dispatch(
        &self,
        assignment: StepAssignment,
        reports: mpsc::Sender<Message>,
    ) -> Result<(), WorkerError> {
        let reporter = Reporter {
            reports,
            id: assignment.build_id.clone(),
            step: assignment.step_name().to_string(),
            worker: self.name.clone(),
        };

        let token = {
            let mut running = self.running.lock();
            if running.contains_key(&assignment.exec_id) {
                None
            } else {
                let token = CancellationToken::new();
                running.insert(assignment.exec_id.clone(), token.clone());
                Some(token)
            }
        };
        let Some(token) = token else {
            warn!(worker = %self.name, exec_id = %assignment.exec_id, "Step is already running");
            reporter
                .send(Message::step_already_started(&reporter.id, &reporter.step, &reporter.worker))
                .await;
            return Ok(());
        };

        let running = self.running.clone();
        let tempdir = self.tempdir.clone();
        let sources = self.sources.clone();
        tokio::spawn(async move {
            reporter
                .send(Message::step_started(&reporter.id, &reporter.step, &reporter.worker))
                .await;
            let result = execute(&assignment, &tempdir, sources.as_deref(), &token, &reporter).await;
            running.lock().remove(&assignment.exec_id);

            match result {
                Ok(()) => {
                    metrics::counter!("morph_worker_steps_total", "outcome" => "finished").increment(1);
                    info!(worker = %reporter.worker, step = %assignment.node.name, "Step finished");
                    reporter.send(Message::step_finished(&reporter.id, &reporter.step)).await;
                }
                Err(e) => {
                    let outcome = if matches!(e, StepError::Cancelled) { "cancelled" } else { "failed" };
                    metrics::counter!("morph_worker_steps_total", "outcome" => outcome).increment(1);
                    warn!(worker = %reporter.worker, step = %assignment.node.name, error = %e, "Step failed");
                    reporter.output("", &format!("{}\n", e)).await;
                    reporter.send(Message::step_failed(&reporter.id, &reporter.step)).await;
                }
            }
        });
        Ok(())
    }

    async fn cancel(&self, request: &Message) -> Result<(), WorkerError> {
        if request.message_type() != MessageType::ExecCancel {
            return Err(ProtocolError::Malformed(format!(
                "expected exec-cancel, got {}",
                request.message_type()
            ))
            .into());
        }
        let exec_id = request.require_str("id")?;
        match self.running.lock().get(exec_id) {
            Some(token) => {
                info!(worker = %self.name, exec_id = %exec_id, "Cancelling step");
                token.cancel();
            }
            None => debug!(worker = %self.name, exec_id = %exec_id, "Nothing to cancel"),
        }
        Ok(())
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Clone)]
struct Reporter {
    reports: mpsc::Sender<Message>,
    id: String,
    step: String,
    worker: String,
}

impl Reporter {
    async fn send(&self, report: Message) {
        // A coordinator that stopped listening no longer needs reports
        if let Err(e) = self.reports.send(report).await {
            debug!(
                worker = %self.worker,
                step = %self.step,
                message_type = %e.0.message_type(),
                "Dropped step report, coordinator is gone"
            );
        }
    }

    async fn output(&self, stdout: &str, stderr: &str) {
        self.send(Message::step_output(&self.id, &self.step, stdout, stderr)).await;
    }

    async fn line(&self, line: OutputLine) {
        match line.stream {
            Stream::Stdout => self.output(&line.text, "").await,
            Stream::Stderr => self.output("", &line.text).await,
        }
    }
}

async fn execute(
    assignment: &StepAssignment,
    tempdir: &Path,
    sources: Option<&dyn RepositoryService>,
    token: &CancellationToken,
    reporter: &Reporter,
) -> Result<(), StepError> {
    if token.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    let node = &assignment.node;
    let workspace = StepWorkspace::create(tempdir, &node.name)?;

    match node.kind {
        NodeKind::Chunk => {
            for artifact in &assignment.dependency_artifacts {
                archive::unpack(artifact, &workspace.staging()).await?;
            }
            if let Some(repos) = sources {
                let git_ref = node.commit.as_deref().unwrap_or(&node.git_ref);
                let files = export_tree(repos, &node.repo, git_ref, &workspace.build()).await?;
                debug!(step = %node.name, repo = %node.repo, files, "Exported sources");
            }
            let env = build_env(assignment, &workspace);
            let build_dir = workspace.build();
            let (lines_tx, mut lines_rx) = mpsc::channel(256);
            let requests = assignment.exec_requests();
            let commands = run_commands(&requests, &build_dir, &env, token, lines_tx);
            let forward = async {
                while let Some(line) = lines_rx.recv().await {
                    reporter.line(line).await;
                }
            };
            let (result, ()) = tokio::join!(commands, forward);
            result?;
        }
        NodeKind::Stratum | NodeKind::System => {
            for artifact in &assignment.dependency_artifacts {
                archive::unpack(artifact, &workspace.install()).await?;
            }
        }
    }

    if token.is_cancelled() {
        return Err(StepError::Cancelled);
    }
    archive::pack(&workspace.install(), &assignment.artifact_path).await
}

/// Runs each `exec-request` in order, stopping at the first that does not succeed
async fn run_commands(
    requests: &[Message],
    cwd: &Path,
    env: &[(String, String)],
    token: &CancellationToken,
    output: mpsc::Sender<OutputLine>,
) -> Result<(), StepError> {
    for request in requests {
        if token.is_cancelled() {
            return Err(StepError::Cancelled);
        }
        let exec = ExecCommand::from_message(request)?;
        let command = exec.display();
        debug!(command = %command, "Running build command");
        let outcome = run_command(&exec, cwd, env, token, &output)
            .await
            .map_err(|e| StepError::io("Failed to run build command", cwd, e))?;
        match outcome {
            CommandOutcome::Cancelled => return Err(StepError::Cancelled),
            CommandOutcome::Exited(status) if status.success() => {}
            CommandOutcome::Exited(status) => {
                return Err(match status.code() {
                    Some(code) => StepError::CommandFailed { command, code },
                    None => StepError::Killed { command },
                });
            }
        }
    }
    Ok(())
}

fn build_env(assignment: &StepAssignment, workspace: &StepWorkspace) -> Vec<(String, String)> {
    let staging = workspace.staging();
    let path = format!(
        "{}:{}:{}",
        staging.join("usr/bin").display(),
        staging.join("bin").display(),
        std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string())
    );
    vec![
        ("DESTDIR".to_string(), workspace.install().display().to_string()),
        ("PREFIX".to_string(), "/usr".to_string()),
        ("MAKEFLAGS".to_string(), format!("-j{}", assignment.max_jobs)),
        ("MORPH_STAGING".to_string(), staging.display().to_string()),
        ("PATH".to_string(), path),
        ("LC_ALL".to_string(), "C".to_string()),
    ]
}
