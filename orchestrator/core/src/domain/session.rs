// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Session Domain Model
//!
//! A [`BuildSession`] tracks one build request from submission to a terminal
//! state, and every step of its graph through the step lifecycle.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Aggregate Root:** BuildSession
//! - **Owner:** the coordinator's per-session task is the only writer
//!
//! # Build States
//!
//! ```text
//! Requested -> Resolving -> Scheduling -> Building -> Finished
//!                  |             |            |----> Failed
//!                  +-------------+------------+----> Cancelled
//! ```
//!
//! # Step States
//!
//! ```text
//! Pending -> Cached
//! Pending -> Assigned -> Started -> Finished
//!                 |          +----> Failed
//!                 +---------------> Failed
//! Pending -> Blocked      (a dependency failed)
//! Pending | Assigned | Started -> Cancelled
//! ```
//!
//! Worker reports that repeat an already-recorded transition are reported as
//! [`ReportOutcome::Duplicate`] and change nothing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::graph::{BuildGraph, Fingerprint, MorphologyRef, NodeKind};
use crate::domain::protocol::{Message, MessageType, ProtocolError};

// ============================================================================
// Identifiers and Requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a client asked to build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub repo: String,
    pub git_ref: String,
    pub morphology: String,
    pub original_ref: Option<String>,
}

impl BuildRequest {
    pub fn new(repo: impl Into<String>, git_ref: impl Into<String>, morphology: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            git_ref: git_ref.into(),
            morphology: morphology.into(),
            original_ref: None,
        }
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        if message.message_type() != MessageType::BuildRequest {
            return Err(ProtocolError::Malformed(format!(
                "expected build-request, got {}",
                message.message_type()
            )));
        }

        let original_ref = match message.get("original_ref") {
            None => None,
            Some(_) => Some(message.require_str("original_ref")?.to_string()),
        };

        Ok(Self {
            repo: message.require_str("repo")?.to_string(),
            git_ref: message.require_str("ref")?.to_string(),
            morphology: message.require_str("morphology")?.to_string(),
            original_ref,
        })
    }

    pub fn to_message(&self, id: &str) -> Message {
        Message::build_request(
            id,
            &self.repo,
            &self.git_ref,
            &self.morphology,
            self.original_ref.as_deref(),
        )
    }

    pub fn root(&self) -> MorphologyRef {
        MorphologyRef::new(&self.repo, &self.git_ref, &self.morphology)
    }
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Requested,
    Resolving,
    Scheduling,
    Building,
    Finished,
    Failed,
    Cancelled,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Finished | BuildState::Failed | BuildState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Cached,
    Assigned,
    Started,
    Finished,
    Failed,
    Blocked,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Assigned | StepStatus::Started)
    }

    /// Artifact is available for dependents
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepStatus::Cached | StepStatus::Finished)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Assigned | StepStatus::Started)
    }
}

/// Result of applying a worker report to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    /// The report repeats a transition already recorded
    Duplicate,
    /// The step or session is already settled; the report is dropped
    Ignored,
}

// ============================================================================
// Step Records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub stdout: String,
    pub stderr: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransition {
    pub status: StepStatus,
    pub worker: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub fingerprint: Fingerprint,
    pub name: String,
    pub kind: NodeKind,
    pub dependencies: Vec<Fingerprint>,
    pub status: StepStatus,
    pub worker: Option<String>,
    pub exec_id: Option<String>,
    pub failure: Option<String>,
    output: Vec<StepOutput>,
    history: Vec<StepTransition>,
}

impl StepRecord {
    fn new(fingerprint: Fingerprint, name: String, kind: NodeKind, dependencies: Vec<Fingerprint>) -> Self {
        let mut record = Self {
            fingerprint,
            name,
            kind,
            dependencies,
            status: StepStatus::Pending,
            worker: None,
            exec_id: None,
            failure: None,
            output: Vec::new(),
            history: Vec::new(),
        };
        record.push_history();
        record
    }

    fn transition(&mut self, status: StepStatus) {
        self.status = status;
        self.push_history();
    }

    fn push_history(&mut self) {
        self.history.push(StepTransition {
            status: self.status,
            worker: self.worker.clone(),
            at: Utc::now(),
        });
    }

    pub fn output(&self) -> &[StepOutput] {
        &self.output
    }

    pub fn history(&self) -> &[StepTransition] {
        &self.history
    }

    /// Concatenated stdout received so far
    pub fn stdout(&self) -> String {
        self.output.iter().map(|o| o.stdout.as_str()).collect()
    }

    /// Number of times this step entered `Started`
    pub fn times_started(&self) -> usize {
        self.history
            .iter()
            .filter(|t| t.status == StepStatus::Started)
            .count()
    }
}

// ============================================================================
// Aggregate Root: BuildSession
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSession {
    id: SessionId,
    request: BuildRequest,
    state: BuildState,
    steps: BTreeMap<Fingerprint, StepRecord>,
    order: Vec<Fingerprint>,
    roots: Vec<Fingerprint>,
    failure: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BuildSession {
    pub fn new(id: SessionId, request: BuildRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            state: BuildState::Requested,
            steps: BTreeMap::new(),
            order: Vec::new(),
            roots: Vec::new(),
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn roots(&self) -> &[Fingerprint] {
        &self.roots
    }

    pub fn step(&self, fingerprint: &Fingerprint) -> Option<&StepRecord> {
        self.steps.get(fingerprint)
    }

    /// Steps in dependency order
    pub fn steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.order.iter().filter_map(|fp| self.steps.get(fp))
    }

    pub fn in_flight(&self) -> Vec<Fingerprint> {
        self.steps()
            .filter(|s| s.status.is_in_flight())
            .map(|s| s.fingerprint.clone())
            .collect()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| s.status == status).count()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_state(&mut self, from: &[BuildState], to: BuildState) -> Result<(), SessionError> {
        if !from.contains(&self.state) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin_resolving(&mut self) -> Result<(), SessionError> {
        self.set_state(&[BuildState::Requested], BuildState::Resolving)
    }

    /// Records the resolved graph; every step starts `Pending`
    pub fn plan(&mut self, graph: &BuildGraph) -> Result<(), SessionError> {
        self.set_state(&[BuildState::Resolving], BuildState::Scheduling)?;
        for node in graph.nodes() {
            self.order.push(node.fingerprint.clone());
            self.steps.insert(
                node.fingerprint.clone(),
                StepRecord::new(
                    node.fingerprint.clone(),
                    node.name.clone(),
                    node.kind,
                    node.dependencies.clone(),
                ),
            );
        }
        self.roots = graph.roots().to_vec();
        Ok(())
    }

    pub fn begin_building(&mut self) -> Result<(), SessionError> {
        self.set_state(&[BuildState::Scheduling], BuildState::Building)
    }

    /// Fails a session that has not reached a terminal state
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.set_state(
            &[
                BuildState::Requested,
                BuildState::Resolving,
                BuildState::Scheduling,
                BuildState::Building,
            ],
            BuildState::Failed,
        )?;
        self.failure.get_or_insert_with(|| reason.into());
        Ok(())
    }

    fn step_mut(&mut self, fingerprint: &Fingerprint) -> Result<&mut StepRecord, SessionError> {
        self.updated_at = Utc::now();
        self.steps
            .get_mut(fingerprint)
            .ok_or_else(|| SessionError::UnknownStep(fingerprint.to_string()))
    }

    fn dependencies_satisfied(&self, step: &StepRecord) -> bool {
        step.dependencies
            .iter()
            .all(|d| self.steps.get(d).is_some_and(|s| s.status.is_satisfied()))
    }

    /// `Pending` steps whose dependencies are all satisfied, in dependency order
    pub fn ready_steps(&self) -> Vec<Fingerprint> {
        if self.state != BuildState::Building {
            return Vec::new();
        }
        self.steps()
            .filter(|s| s.status == StepStatus::Pending && self.dependencies_satisfied(s))
            .map(|s| s.fingerprint.clone())
            .collect()
    }

    pub fn mark_cached(&mut self, fingerprint: &Fingerprint) -> Result<(), SessionError> {
        if !matches!(self.state, BuildState::Scheduling | BuildState::Building) {
            return Err(SessionError::NotBuilding(self.state));
        }
        let step = self.step_mut(fingerprint)?;
        if step.status != StepStatus::Pending {
            return Err(step_error(step, "cached"));
        }
        step.transition(StepStatus::Cached);
        Ok(())
    }

    pub fn assign(&mut self, fingerprint: &Fingerprint, worker: &str, exec_id: &str) -> Result<(), SessionError> {
        if self.state != BuildState::Building {
            return Err(SessionError::NotBuilding(self.state));
        }
        let ready = self
            .steps
            .get(fingerprint)
            .is_some_and(|s| self.dependencies_satisfied(s));
        let step = self.step_mut(fingerprint)?;
        if step.status != StepStatus::Pending || !ready {
            return Err(step_error(step, "assigned"));
        }
        step.worker = Some(worker.to_string());
        step.exec_id = Some(exec_id.to_string());
        step.transition(StepStatus::Assigned);
        Ok(())
    }

    pub fn record_started(&mut self, fingerprint: &Fingerprint, worker: &str) -> Result<ReportOutcome, SessionError> {
        let settled = self.state.is_terminal();
        let step = self.step_mut(fingerprint)?;
        check_worker(step, worker)?;
        match step.status {
            StepStatus::Cancelled => Ok(ReportOutcome::Ignored),
            _ if settled => Ok(ReportOutcome::Ignored),
            StepStatus::Assigned => {
                step.transition(StepStatus::Started);
                Ok(ReportOutcome::Applied)
            }
            StepStatus::Started | StepStatus::Finished | StepStatus::Failed => Ok(ReportOutcome::Duplicate),
            _ => Err(step_error(step, "started")),
        }
    }

    pub fn record_output(
        &mut self,
        fingerprint: &Fingerprint,
        worker: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<ReportOutcome, SessionError> {
        let step = self.step_mut(fingerprint)?;
        check_worker(step, worker)?;
        match step.status {
            StepStatus::Started => {
                step.output.push(StepOutput {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    received_at: Utc::now(),
                });
                Ok(ReportOutcome::Applied)
            }
            status if status.is_terminal() => Ok(ReportOutcome::Ignored),
            _ => Err(step_error(step, "output")),
        }
    }

    pub fn record_finished(&mut self, fingerprint: &Fingerprint, worker: &str) -> Result<ReportOutcome, SessionError> {
        let step = self.step_mut(fingerprint)?;
        check_worker(step, worker)?;
        match step.status {
            StepStatus::Started => {
                step.transition(StepStatus::Finished);
                Ok(ReportOutcome::Applied)
            }
            StepStatus::Finished => Ok(ReportOutcome::Duplicate),
            StepStatus::Cancelled => Ok(ReportOutcome::Ignored),
            _ => Err(step_error(step, "finished")),
        }
    }

    /// Records a step failure and blocks everything that depends on it
    pub fn record_failed(
        &mut self,
        fingerprint: &Fingerprint,
        worker: &str,
        reason: &str,
    ) -> Result<ReportOutcome, SessionError> {
        let step = self.step_mut(fingerprint)?;
        check_worker(step, worker)?;
        match step.status {
            StepStatus::Assigned | StepStatus::Started => {
                step.failure = Some(reason.to_string());
                step.transition(StepStatus::Failed);
                let name = step.name.clone();
                if self.failure.is_none() {
                    self.failure = Some(format!("step {} failed: {}", name, reason));
                }
                self.block_dependents();
                Ok(ReportOutcome::Applied)
            }
            StepStatus::Failed => Ok(ReportOutcome::Duplicate),
            StepStatus::Cancelled => Ok(ReportOutcome::Ignored),
            _ => Err(step_error(step, "failed")),
        }
    }

    /// Order is topological, so one pass reaches transitive dependents.
    fn block_dependents(&mut self) {
        for fp in self.order.clone() {
            let blocked = self.steps.get(&fp).is_some_and(|s| {
                s.status == StepStatus::Pending
                    && s.dependencies.iter().any(|d| {
                        self.steps
                            .get(d)
                            .is_some_and(|dep| matches!(dep.status, StepStatus::Failed | StepStatus::Blocked))
                    })
            });
            if blocked {
                if let Some(step) = self.steps.get_mut(&fp) {
                    step.transition(StepStatus::Blocked);
                }
            }
        }
    }

    /// Cancels the session; returns the steps that were in flight
    ///
    /// Steps that already reached a terminal state keep it.
    pub fn cancel(&mut self) -> Vec<Fingerprint> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.state = BuildState::Cancelled;
        self.updated_at = Utc::now();

        let mut in_flight = Vec::new();
        for fp in &self.order {
            if let Some(step) = self.steps.get_mut(fp) {
                if step.status.is_in_flight() {
                    in_flight.push(fp.clone());
                }
                if !step.status.is_terminal() {
                    step.transition(StepStatus::Cancelled);
                }
            }
        }
        in_flight
    }

    /// Moves a building session to `Finished` or `Failed` once it can make no
    /// further progress; returns the new state if it changed
    ///
    /// Without `keep_going`, the first failure stops scheduling, so the build
    /// fails as soon as nothing is in flight.
    pub fn settle(&mut self, keep_going: bool) -> Option<BuildState> {
        if self.state != BuildState::Building {
            return None;
        }
        let roots_done = self
            .roots
            .iter()
            .all(|r| self.steps.get(r).is_some_and(|s| s.status.is_satisfied()));
        if roots_done {
            self.state = BuildState::Finished;
        } else if self.in_flight().is_empty()
            && (self.ready_steps().is_empty() || (!keep_going && self.failure.is_some()))
        {
            self.state = BuildState::Failed;
            if self.failure.is_none() {
                self.failure = Some("no further steps can be scheduled".to_string());
            }
        } else {
            return None;
        }
        self.updated_at = Utc::now();
        Some(self.state)
    }
}

fn check_worker(step: &StepRecord, worker: &str) -> Result<(), SessionError> {
    match step.worker.as_deref() {
        Some(expected) if expected != worker => Err(SessionError::WorkerMismatch {
            step: step.name.clone(),
            expected: expected.to_string(),
            actual: worker.to_string(),
        }),
        _ => Ok(()),
    }
}

fn step_error(step: &StepRecord, event: &'static str) -> SessionError {
    SessionError::InvalidStepTransition {
        step: step.name.clone(),
        from: step.status,
        event,
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("Invalid build state transition from {from:?} to {to:?}")]
    InvalidTransition { from: BuildState, to: BuildState },

    #[error("Session is not building (state {0:?})")]
    NotBuilding(BuildState),

    #[error("Unknown step {0}")]
    UnknownStep(String),

    #[error("Step {step} cannot be {event} from {from:?}")]
    InvalidStepTransition {
        step: String,
        from: StepStatus,
        event: &'static str,
    },

    #[error("Step {step} is assigned to {expected}, report came from {actual}")]
    WorkerMismatch {
        step: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown session {0}")]
    UnknownSession(String),
}
