// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build Coordinator
//!
//! Runs build sessions: resolves the requested morphology into a graph,
//! satisfies what it can from the artifact cache, and schedules the rest
//! onto the worker pool as dependencies complete.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrates loader, cache, workers and event bus
//!
//! # Concurrency
//!
//! Every session is owned by one task (its actor). Worker reports, cache
//! reservations and client commands for the session arrive on channels and
//! are applied one at a time, so no two handlers ever touch the same
//! session concurrently. The coordinator itself only keeps a read-only
//! view of each live session and the sender for its command channel.
//!
//! Cache writer slots are claimed in background tasks; a session waiting on
//! a fingerprint another session is producing keeps processing its own
//! reports meanwhile.
//!
//! Each dispatched step reports on its own channel. When a worker drops that
//! channel without a terminal report, the step fails as lost.
//!
//! # Build Ids
//!
//! Messages of a session carry the `id` of the `build-request` that started
//! it, verbatim. The coordinator keys its own bookkeeping by [`SessionId`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::application::morphology_loader::MorphologyLoader;
use crate::application::worker_pool::{WorkerLease, WorkerPool};
use crate::domain::cache::{ArtifactHandle, CacheError};
use crate::domain::events::BuildEvent;
use crate::domain::graph::{BuildGraph, Fingerprint};
use crate::domain::node_config::BuildConfig;
use crate::domain::protocol::{Message, MessageType};
use crate::domain::session::{
    BuildRequest, BuildSession, BuildState, ReportOutcome, SessionError, SessionId, StepStatus,
};
use crate::domain::worker::StepAssignment;
use crate::infrastructure::artifact_cache::{ArtifactCache, ArtifactWriter, PutOutcome};
use crate::infrastructure::event_bus::{EventBus, SessionEventReceiver};

const REPORT_BUFFER: usize = 256;

// ============================================================================
// Public API
// ============================================================================

/// Final result of a build session
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub session: BuildSession,
    /// Artifacts of the requested morphology, one per graph root
    pub artifacts: Vec<ArtifactHandle>,
}

impl BuildOutcome {
    pub fn state(&self) -> BuildState {
        self.session.state()
    }

    /// Retrieval location of each requested artifact, by node name
    pub fn urls(&self) -> BTreeMap<String, String> {
        self.session
            .roots()
            .iter()
            .filter_map(|root| {
                let name = self.session.step(root)?.name.clone();
                let artifact = self.artifacts.iter().find(|a| &a.fingerprint == root)?;
                Some((name, artifact.location.clone()))
            })
            .collect()
    }
}

/// A submitted build: its id, its event stream, and its eventual outcome
pub struct BuildHandle {
    id: SessionId,
    build_id: String,
    events: SessionEventReceiver,
    outcome: oneshot::Receiver<BuildOutcome>,
}

impl BuildHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The `id` carried by this session's messages
    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// Messages published for this session, starting at submission
    pub fn events(&mut self) -> &mut SessionEventReceiver {
        &mut self.events
    }

    pub async fn wait(self) -> Result<BuildOutcome> {
        self.outcome
            .await
            .map_err(|_| anyhow!("Build session {} ended without an outcome", self.id))
    }

    pub fn into_parts(self) -> (SessionEventReceiver, oneshot::Receiver<BuildOutcome>) {
        (self.events, self.outcome)
    }
}

enum SessionCommand {
    Cancel,
}

struct SessionEntry {
    session: Arc<RwLock<BuildSession>>,
    commands: mpsc::Sender<SessionCommand>,
}

pub struct BuildCoordinator {
    loader: Arc<MorphologyLoader>,
    cache: Arc<ArtifactCache>,
    pool: Arc<WorkerPool>,
    event_bus: EventBus,
    config: BuildConfig,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
    /// Live sessions by the build id clients know them as
    builds: Arc<DashMap<String, SessionId>>,
}

impl BuildCoordinator {
    pub fn new(
        loader: Arc<MorphologyLoader>,
        cache: Arc<ArtifactCache>,
        pool: Arc<WorkerPool>,
        event_bus: EventBus,
        config: BuildConfig,
    ) -> Self {
        Self {
            loader,
            cache,
            pool,
            event_bus,
            config,
            sessions: Arc::new(DashMap::new()),
            builds: Arc::new(DashMap::new()),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Starts a build session
    pub fn submit(&self, request: BuildRequest) -> BuildHandle {
        let id = SessionId::new();
        self.start(id, id.to_string(), request)
    }

    fn start(&self, id: SessionId, build_id: String, request: BuildRequest) -> BuildHandle {
        let session = Arc::new(RwLock::new(BuildSession::new(id, request)));
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (reports_tx, reports_rx) = mpsc::channel(REPORT_BUFFER);
        let (reserved_tx, reserved_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        // Subscribe before the actor can publish anything
        let events = self.event_bus.subscribe_session(id);
        self.builds.insert(build_id.clone(), id);
        self.sessions.insert(
            id,
            SessionEntry {
                session: session.clone(),
                commands: commands_tx,
            },
        );

        let actor = SessionActor {
            id,
            build_id: build_id.clone(),
            session,
            loader: self.loader.clone(),
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            event_bus: self.event_bus.clone(),
            config: self.config.clone(),
            commands: commands_rx,
            reports_tx,
            reports_rx,
            reserved_tx,
            reserved_rx,
            graph: BuildGraph::default(),
            artifacts: HashMap::new(),
            reserving: HashSet::new(),
            queued: VecDeque::new(),
            running: HashMap::new(),
        };

        let sessions = self.sessions.clone();
        let builds = self.builds.clone();
        let key = build_id.clone();
        tokio::spawn(async move {
            let outcome = actor.run().await;
            sessions.remove(&id);
            builds.remove(&key);
            // The submitter may have stopped waiting
            let _ = outcome_tx.send(outcome);
        });

        BuildHandle {
            id,
            build_id,
            events,
            outcome: outcome_rx,
        }
    }

    /// Requests cancellation of a running session
    pub async fn cancel(&self, id: SessionId) -> Result<()> {
        let commands = self
            .sessions
            .get(&id)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))?;
        // A session that settled in the meantime has dropped its receiver
        let _ = commands.send(SessionCommand::Cancel).await;
        Ok(())
    }

    /// Applies a client message: `build-request` starts a session (returned),
    /// `exec-cancel` cancels the session started under its `id`
    pub async fn handle_client_message(&self, message: &Message) -> Result<Option<BuildHandle>> {
        match message.message_type() {
            MessageType::BuildRequest => {
                let request = BuildRequest::from_message(message)?;
                let build_id = message.require_str("id")?.to_string();
                let id = match self.builds.entry(build_id.clone()) {
                    Entry::Occupied(_) => bail!("Build {} is already running", build_id),
                    Entry::Vacant(entry) => {
                        let id = SessionId::parse(&build_id)
                            .filter(|id| !self.sessions.contains_key(id))
                            .unwrap_or_default();
                        entry.insert(id);
                        id
                    }
                };
                Ok(Some(self.start(id, build_id, request)))
            }
            MessageType::ExecCancel => {
                let build_id = message.require_str("id")?;
                let id = self
                    .builds
                    .get(build_id)
                    .map(|entry| *entry.value())
                    .ok_or_else(|| SessionError::UnknownSession(build_id.to_string()))?;
                self.cancel(id).await?;
                Ok(None)
            }
            other => bail!("Unexpected {} message from client", other),
        }
    }

    /// Snapshot of a live session
    pub fn session(&self, id: SessionId) -> Option<BuildSession> {
        self.sessions.get(&id).map(|entry| entry.session.read().clone())
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }
}

// ============================================================================
// Session Actor
// ============================================================================

struct Reservation {
    fingerprint: Fingerprint,
    outcome: std::result::Result<PutOutcome, CacheError>,
}

struct RunningStep {
    assignment: StepAssignment,
    writer: ArtifactWriter,
    lease: WorkerLease,
}

impl RunningStep {
    fn worker(&self) -> &str {
        self.lease.worker_name()
    }
}

enum StepReport {
    Message(Message),
    /// The worker closed the step's report channel without a terminal report
    Lost(Fingerprint),
}

struct SessionActor {
    id: SessionId,
    build_id: String,
    session: Arc<RwLock<BuildSession>>,
    loader: Arc<MorphologyLoader>,
    cache: Arc<ArtifactCache>,
    pool: Arc<WorkerPool>,
    event_bus: EventBus,
    config: BuildConfig,
    commands: mpsc::Receiver<SessionCommand>,
    reports_tx: mpsc::Sender<StepReport>,
    reports_rx: mpsc::Receiver<StepReport>,
    reserved_tx: mpsc::UnboundedSender<Reservation>,
    reserved_rx: mpsc::UnboundedReceiver<Reservation>,
    graph: BuildGraph,
    /// Artifacts available to this session, cached or produced
    artifacts: HashMap<Fingerprint, ArtifactHandle>,
    /// Ready steps whose writer slot is being claimed
    reserving: HashSet<Fingerprint>,
    /// Steps holding a writer slot, waiting for a worker
    queued: VecDeque<ArtifactWriter>,
    running: HashMap<Fingerprint, RunningStep>,
}

impl SessionActor {
    async fn run(mut self) -> BuildOutcome {
        metrics::gauge!("morph_sessions_active").increment(1.0);
        let state = self.drive().await;
        metrics::gauge!("morph_sessions_active").decrement(1.0);

        let session = self.session.read().clone();
        let artifacts: Vec<ArtifactHandle> = session
            .roots()
            .iter()
            .filter_map(|root| self.artifacts.get(root).cloned())
            .collect();
        let outcome = BuildOutcome { session, artifacts };

        match state {
            BuildState::Finished => {
                let urls = outcome.urls();
                info!(session_id = %self.id, build_id = %self.build_id, artifacts = urls.len(), "Build finished");
                self.emit(Message::build_finished(&self.build_id, urls));
            }
            BuildState::Failed => {
                let reason = outcome.session.failure().unwrap_or("build failed").to_string();
                warn!(session_id = %self.id, build_id = %self.build_id, reason = %reason, "Build failed");
                self.emit(Message::build_failed(&self.build_id, &reason));
            }
            _ => {}
        }

        outcome
    }

    async fn drive(&mut self) -> BuildState {
        let root = self.session.read().request().root();
        info!(session_id = %self.id, root = %root, "Build session started");
        self.emit(Message::build_progress(&self.build_id, &format!("Resolving {}", root)));
        self.log_transition(|s| s.begin_resolving());

        let resolved = tokio::select! {
            result = self.loader.resolve(&root) => Some(result),
            Some(SessionCommand::Cancel) = self.commands.recv() => None,
        };
        let graph = match resolved {
            None => return self.cancel().await,
            Some(Err(e)) => {
                let reason = format!("{:#}", e);
                self.log_transition(|s| s.fail(reason));
                return BuildState::Failed;
            }
            Some(Ok(graph)) => graph,
        };

        self.log_transition(|s| s.plan(&graph));
        self.emit(Message::build_steps(&self.build_id, steps_json(&graph)));
        self.graph = graph;

        if !self.check_cache().await {
            return self.cancel().await;
        }
        self.log_transition(|s| s.begin_building());

        loop {
            let may_schedule = self.may_schedule();
            if may_schedule {
                self.reserve_ready();
                self.dispatch_queued().await;
            } else {
                self.queued.clear();
            }

            let state = self.session.read().state();
            if state.is_terminal() {
                return state;
            }
            let keep_going = self.config.keep_going;
            if let Some(state) = self.session.write().settle(keep_going) {
                return state;
            }

            let want_worker = may_schedule && !self.queued.is_empty();
            tokio::select! {
                Some(report) = self.reports_rx.recv() => match report {
                    StepReport::Message(report) => self.apply_report(report).await,
                    StepReport::Lost(fp) => self.step_lost(&fp),
                },
                Some(reservation) = self.reserved_rx.recv() => self.apply_reservation(reservation).await,
                Some(SessionCommand::Cancel) = self.commands.recv() => return self.cancel().await,
                lease = self.pool.acquire(), if want_worker => match lease {
                    Ok(lease) => {
                        if let Some(writer) = self.queued.pop_front() {
                            self.dispatch(writer, lease).await;
                        }
                    }
                    Err(e) => {
                        self.abort(e.to_string()).await;
                    }
                },
            }
        }
    }

    fn emit(&self, message: Message) {
        self.event_bus.publish(BuildEvent::new(self.id, message));
    }

    /// Applies a session transition the actor's own sequencing makes valid
    fn log_transition<T>(&self, f: impl FnOnce(&mut BuildSession) -> std::result::Result<T, SessionError>) {
        if let Err(e) = f(&mut self.session.write()) {
            warn!(session_id = %self.id, error = %e, "Unexpected session transition");
        }
    }

    fn may_schedule(&self) -> bool {
        self.config.keep_going || self.session.read().failure().is_none()
    }

    /// Marks every node the cache already holds; false if cancelled meanwhile
    async fn check_cache(&mut self) -> bool {
        let fingerprints: Vec<Fingerprint> = self.graph.topological_order().to_vec();
        let mut cached = 0usize;
        for fp in &fingerprints {
            let lookup = tokio::select! {
                lookup = self.cache.get(fp) => lookup,
                Some(SessionCommand::Cancel) = self.commands.recv() => return false,
            };
            match lookup {
                Ok(handle) => {
                    metrics::counter!("morph_cache_hits_total").increment(1);
                    debug!(session_id = %self.id, step = %fp, "Cache hit");
                    self.log_transition(|s| s.mark_cached(fp));
                    self.artifacts.insert(fp.clone(), handle);
                    cached += 1;
                }
                Err(CacheError::NotPresent(_)) => {
                    metrics::counter!("morph_cache_misses_total").increment(1);
                }
                Err(e) => {
                    metrics::counter!("morph_cache_misses_total").increment(1);
                    warn!(session_id = %self.id, step = %fp, error = %e, "Artifact cache lookup failed");
                }
            }
        }
        self.emit(Message::build_progress(
            &self.build_id,
            &format!("{} of {} steps cached", cached, fingerprints.len()),
        ));
        true
    }

    /// Starts claiming writer slots for newly ready steps
    fn reserve_ready(&mut self) {
        let ready = self.session.read().ready_steps();
        for fp in ready {
            if self.reserving.contains(&fp) || self.queued.iter().any(|w| w.fingerprint() == &fp) {
                continue;
            }
            self.reserving.insert(fp.clone());
            let cache = self.cache.clone();
            let reserved = self.reserved_tx.clone();
            tokio::spawn(async move {
                let outcome = cache.put(&fp).await;
                // Dropping an unclaimed writer releases its slot
                let _ = reserved.send(Reservation {
                    fingerprint: fp,
                    outcome,
                });
            });
        }
    }

    async fn apply_reservation(&mut self, reservation: Reservation) {
        let fp = reservation.fingerprint;
        self.reserving.remove(&fp);
        if self.session.read().state() != BuildState::Building {
            return;
        }
        match reservation.outcome {
            Ok(PutOutcome::Present(handle)) => {
                metrics::counter!("morph_cache_hits_total").increment(1);
                debug!(session_id = %self.id, step = %fp, "Artifact produced elsewhere");
                self.log_transition(|s| s.mark_cached(&fp));
                self.artifacts.insert(fp, handle);
            }
            Ok(PutOutcome::Write(writer)) => self.queued.push_back(writer),
            Err(e) => {
                self.abort(format!("artifact cache error for step {}: {}", fp.short(), e))
                    .await;
            }
        }
    }

    async fn dispatch_queued(&mut self) {
        while !self.queued.is_empty() {
            let Some(lease) = self.pool.try_acquire() else {
                break;
            };
            if let Some(writer) = self.queued.pop_front() {
                self.dispatch(writer, lease).await;
            }
        }
    }

    async fn dispatch(&mut self, writer: ArtifactWriter, lease: WorkerLease) {
        let fp = writer.fingerprint().clone();
        let Some(node) = self.graph.node(&fp).cloned() else {
            return;
        };
        let worker = lease.worker_name().to_string();
        let exec_id = format!("{}:{}", self.id, fp.short());

        if let Err(e) = self.session.write().assign(&fp, &worker, &exec_id) {
            warn!(session_id = %self.id, step = %fp, error = %e, "Step could not be assigned");
            return;
        }

        let assignment = StepAssignment {
            session_id: self.id,
            build_id: self.build_id.clone(),
            exec_id,
            dependency_artifacts: node
                .dependencies
                .iter()
                .filter_map(|d| self.artifacts.get(d).map(|h| h.path.clone()))
                .collect(),
            artifact_path: writer.path().to_path_buf(),
            max_jobs: node.max_jobs.unwrap_or(self.config.max_jobs),
            node,
        };

        debug!(
            session_id = %self.id,
            step = %fp,
            name = %assignment.node.name,
            worker = %worker,
            "Dispatching step"
        );

        let (step_tx, step_rx) = mpsc::channel(REPORT_BUFFER);
        match lease.executor().dispatch(assignment.clone(), step_tx).await {
            Ok(()) => {
                metrics::counter!("morph_steps_dispatched_total").increment(1);
                tokio::spawn(forward_reports(fp.clone(), step_rx, self.reports_tx.clone()));
                self.running.insert(
                    fp,
                    RunningStep {
                        assignment,
                        writer,
                        lease,
                    },
                );
            }
            Err(e) => {
                warn!(session_id = %self.id, step = %fp, worker = %worker, error = %e, "Worker rejected step");
                metrics::counter!("morph_steps_failed_total").increment(1);
                let reason = e.to_string();
                self.log_transition(|s| s.record_failed(&fp, &worker, &reason));
                self.emit(Message::step_failed(&self.build_id, fp.as_str()));
            }
        }
    }

    async fn apply_report(&mut self, report: Message) {
        let Some(fp) = report.get_str("step_name").and_then(Fingerprint::parse) else {
            warn!(session_id = %self.id, "Dropping report without a step name");
            return;
        };
        if report.id() != Some(self.build_id.as_str()) {
            warn!(session_id = %self.id, id = ?report.id(), "Dropping report for another session");
            return;
        }
        // Only start announcements name their worker
        let worker = match (report.get_str("worker_name"), self.running.get(&fp)) {
            (Some(worker), _) => worker.to_string(),
            (None, Some(running)) => running.worker().to_string(),
            (None, None) => self
                .session
                .read()
                .step(&fp)
                .and_then(|s| s.worker.clone())
                .unwrap_or_default(),
        };

        let result = match report.message_type() {
            MessageType::StepStarted | MessageType::StepAlreadyStarted => {
                self.session.write().record_started(&fp, &worker)
            }
            MessageType::StepOutput => self.session.write().record_output(
                &fp,
                &worker,
                report.get_str("stdout").unwrap_or_default(),
                report.get_str("stderr").unwrap_or_default(),
            ),
            MessageType::StepFinished => self.finish_step(&fp, &worker),
            MessageType::StepFailed => self.fail_step(&fp, &worker),
            other => {
                warn!(session_id = %self.id, message_type = %other, "Ignoring unexpected worker message");
                return;
            }
        };

        match result {
            Ok(ReportOutcome::Applied) => self.emit(report),
            Ok(ReportOutcome::Duplicate) => {
                metrics::counter!("morph_duplicate_reports_total").increment(1);
                warn!(
                    session_id = %self.id,
                    step = %fp,
                    worker = %worker,
                    message_type = %report.message_type(),
                    "Dropped duplicate report"
                );
            }
            Ok(ReportOutcome::Ignored) => {
                debug!(session_id = %self.id, step = %fp, "Ignored report for settled step");
            }
            Err(e) => {
                warn!(session_id = %self.id, step = %fp, worker = %worker, error = %e, "Rejected worker report");
            }
        }
    }

    fn finish_step(&mut self, fp: &Fingerprint, worker: &str) -> std::result::Result<ReportOutcome, SessionError> {
        let owns_step = self.session.read().step(fp).is_some_and(|s| {
            s.status == StepStatus::Started && s.worker.as_deref() == Some(worker)
        });
        let running = if owns_step { self.running.remove(fp) } else { None };
        let Some(running) = running else {
            return self.session.write().record_finished(fp, worker);
        };

        match running.writer.commit() {
            Ok(handle) => {
                metrics::counter!("morph_steps_finished_total").increment(1);
                debug!(session_id = %self.id, step = %fp, location = %handle.location, "Step finished");
                self.artifacts.insert(fp.clone(), handle);
                self.session.write().record_finished(fp, worker)
            }
            Err(e) => {
                metrics::counter!("morph_steps_failed_total").increment(1);
                let reason = format!("artifact was not stored: {}", e);
                warn!(session_id = %self.id, step = %fp, error = %e, "Finished step left no artifact");
                self.session.write().record_failed(fp, worker, &reason)?;
                self.emit(Message::step_failed(&self.build_id, fp.as_str()));
                Ok(ReportOutcome::Ignored)
            }
        }
    }

    fn fail_step(&mut self, fp: &Fingerprint, worker: &str) -> std::result::Result<ReportOutcome, SessionError> {
        let reason = {
            let session = self.session.read();
            session
                .step(fp)
                .and_then(|s| {
                    s.output()
                        .iter()
                        .rev()
                        .find_map(|o| o.stderr.trim().lines().last().map(str::to_string))
                })
                .unwrap_or_else(|| format!("build commands failed on {}", worker))
        };

        let outcome = self.session.write().record_failed(fp, worker, &reason)?;
        if outcome == ReportOutcome::Applied {
            metrics::counter!("morph_steps_failed_total").increment(1);
            // Drops the writer (discarding partial output) and frees the slot
            self.running.remove(fp);
        }
        Ok(outcome)
    }

    /// Fails a step whose worker went away without reporting its end
    fn step_lost(&mut self, fp: &Fingerprint) {
        let Some(running) = self.running.remove(fp) else {
            return;
        };
        let worker = running.worker().to_string();
        let reason = format!("worker {} was lost", worker);
        warn!(session_id = %self.id, step = %fp, worker = %worker, "Worker stopped reporting");
        match self.session.write().record_failed(fp, &worker, &reason) {
            Ok(ReportOutcome::Applied) => {
                metrics::counter!("morph_steps_failed_total").increment(1);
            }
            Ok(_) => return,
            Err(e) => {
                warn!(session_id = %self.id, step = %fp, error = %e, "Unexpected session transition");
                return;
            }
        }
        // Dropping the writer discards whatever the worker left behind
        drop(running);
        self.emit(Message::step_failed(&self.build_id, fp.as_str()));
    }

    async fn stop_running(&mut self) {
        for (fp, running) in self.running.drain() {
            let request = running.assignment.exec_cancel();
            if let Err(e) = running.lease.executor().cancel(&request).await {
                warn!(session_id = %self.id, step = %fp, error = %e, "Failed to cancel step");
            }
        }
        self.queued.clear();
        self.reserving.clear();
    }

    async fn cancel(&mut self) -> BuildState {
        let in_flight = self.session.write().cancel();
        self.stop_running().await;
        info!(session_id = %self.id, in_flight = in_flight.len(), "Build session cancelled");
        self.emit(Message::build_progress(&self.build_id, "Build cancelled"));
        self.session.read().state()
    }

    async fn abort(&mut self, reason: String) {
        self.stop_running().await;
        self.log_transition(|s| s.fail(reason));
    }
}

/// Forwards one step's reports to its session, then notes whether the
/// worker ended the step
async fn forward_reports(
    fingerprint: Fingerprint,
    mut reports: mpsc::Receiver<Message>,
    session: mpsc::Sender<StepReport>,
) {
    let mut settled = false;
    let mut duplicate = false;
    while let Some(report) = reports.recv().await {
        match report.message_type() {
            MessageType::StepFinished | MessageType::StepFailed => settled = true,
            // The original execution reports on the channel it was given
            MessageType::StepAlreadyStarted => duplicate = true,
            _ => {}
        }
        if session.send(StepReport::Message(report)).await.is_err() {
            return;
        }
    }
    if !settled && !duplicate {
        debug!(step = %fingerprint, "Step report channel closed early");
        let _ = session.send(StepReport::Lost(fingerprint)).await;
    }
}

fn steps_json(graph: &BuildGraph) -> Value {
    Value::Array(
        graph
            .nodes()
            .map(|node| {
                json!({
                    "name": node.name,
                    "kind": node.kind.as_str(),
                    "fingerprint": node.fingerprint.as_str(),
                    "build_mode": node.build_mode.as_str(),
                    "dependencies": node
                        .dependencies
                        .iter()
                        .map(|d| d.as_str())
                        .collect::<Vec<_>>(),
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::worker::{StepExecutor, WorkerError};
    use crate::infrastructure::artifact_cache::HttpArtifactSource;
    use crate::infrastructure::repositories::InMemoryRepositoryService;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum Script {
        Succeed,
        Fail,
        AnnounceTwice,
        Hang,
        /// Announces the step, then drops its report channel
        Vanish,
    }

    /// Runs steps according to a per-name script instead of executing anything
    struct ScriptedWorker {
        scripts: HashMap<String, Script>,
        dispatched: parking_lot::Mutex<Vec<String>>,
        cancelled: parking_lot::Mutex<Vec<String>>,
        hanging: parking_lot::Mutex<HashMap<String, (mpsc::Sender<Message>, String, String)>>,
    }

    impl ScriptedWorker {
        fn new(scripts: &[(&str, Script)]) -> Arc<Self> {
            Arc::new(Self {
                scripts: scripts.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
                dispatched: Default::default(),
                cancelled: Default::default(),
                hanging: Default::default(),
            })
        }

        fn dispatched(&self) -> Vec<String> {
            self.dispatched.lock().clone()
        }
    }

    #[async_trait]
    impl StepExecutor for ScriptedWorker {
        fn name(&self) -> &str {
            "scripted"
        }

        fn slots(&self) -> usize {
            2
        }

        async fn dispatch(&self, assignment: StepAssignment, reports: mpsc::Sender<Message>) -> Result<(), WorkerError> {
            let name = assignment.node.name.clone();
            self.dispatched.lock().push(name.clone());
            let script = self.scripts.get(&name).copied().unwrap_or(Script::Succeed);
            let id = assignment.build_id.clone();
            let step = assignment.step_name().to_string();
            let worker = self.name().to_string();

            if script == Script::Hang {
                let _ = reports.send(Message::step_started(&id, &step, &worker)).await;
                self.hanging.lock().insert(assignment.exec_id.clone(), (reports, id, step));
                return Ok(());
            }

            tokio::spawn(async move {
                let _ = reports.send(Message::step_started(&id, &step, &worker)).await;
                match script {
                    Script::Vanish => return,
                    Script::AnnounceTwice => {
                        let _ = reports.send(Message::step_already_started(&id, &step, &worker)).await;
                    }
                    Script::Fail => {
                        let _ = reports
                            .send(Message::step_output(&id, &step, "", "error: compile failed\n"))
                            .await;
                        let _ = reports.send(Message::step_failed(&id, &step)).await;
                        return;
                    }
                    _ => {}
                }
                let _ = reports.send(Message::step_output(&id, &step, "building\n", "")).await;
                tokio::fs::write(&assignment.artifact_path, name.as_bytes()).await.unwrap();
                let _ = reports.send(Message::step_finished(&id, &step)).await;
            });
            Ok(())
        }

        async fn cancel(&self, request: &Message) -> Result<(), WorkerError> {
            let exec_id = request.id().unwrap_or_default().to_string();
            self.cancelled.lock().push(exec_id.clone());
            let hung = self.hanging.lock().remove(&exec_id);
            if let Some((reports, id, step)) = hung {
                let _ = reports.send(Message::step_failed(&id, &step)).await;
            }
            Ok(())
        }
    }

    fn definitions() -> Arc<InMemoryRepositoryService> {
        let repos = InMemoryRepositoryService::new();
        repos.add_file("defs", "master", "strata/core.morph",
            "name: core\nkind: stratum\nchunks:\n  - name: gcc\n    morph: strata/core/gcc\n    build-mode: bootstrap\n  - name: zlib\n    morph: strata/core/zlib\n    build-depends: [gcc]\n  - name: bzip2\n    morph: strata/core/bzip2\n    build-depends: [gcc]\n");
        repos.add_file("defs", "master", "strata/core/gcc.morph",
            "name: gcc\nkind: chunk\nbuild-system: autotools\n");
        repos.add_file("defs", "master", "strata/core/zlib.morph",
            "name: zlib\nkind: chunk\nbuild-commands: [make]\n");
        repos.add_file("defs", "master", "strata/core/bzip2.morph",
            "name: bzip2\nkind: chunk\nbuild-commands: [make]\n");
        Arc::new(repos)
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: Arc<ArtifactCache>,
        repos: Arc<InMemoryRepositoryService>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(ArtifactCache::open(dir.path()).unwrap());
            Self {
                _dir: dir,
                cache,
                repos: definitions(),
            }
        }

        fn with_remote(remote_url: String) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = ArtifactCache::open(dir.path())
                .unwrap()
                .with_remote(Arc::new(HttpArtifactSource::new(remote_url)));
            Self {
                _dir: dir,
                cache: Arc::new(cache),
                repos: definitions(),
            }
        }

        async fn graph(&self) -> BuildGraph {
            MorphologyLoader::new(self.repos.clone())
                .resolve(&core().root())
                .await
                .unwrap()
        }

        fn coordinator(&self, worker: Arc<ScriptedWorker>, keep_going: bool) -> BuildCoordinator {
            let pool = WorkerPool::new(vec![worker as Arc<dyn StepExecutor>]).unwrap();
            BuildCoordinator::new(
                Arc::new(MorphologyLoader::new(self.repos.clone())),
                self.cache.clone(),
                pool,
                EventBus::new(256),
                BuildConfig {
                    keep_going,
                    ..BuildConfig::default()
                },
            )
        }
    }

    fn core() -> BuildRequest {
        BuildRequest::new("defs", "master", "strata/core")
    }

    fn status_of(outcome: &BuildOutcome, name: &str) -> StepStatus {
        outcome.session.steps().find(|s| s.name == name).unwrap().status
    }

    #[tokio::test]
    async fn test_build_finishes_with_artifact_urls() {
        let fixture = Fixture::new();
        let worker = ScriptedWorker::new(&[]);
        let coordinator = fixture.coordinator(worker.clone(), true);

        let (mut events, outcome) = coordinator.submit(core()).into_parts();
        let events = events.collect_until_terminal().await.unwrap();
        let outcome = outcome.await.unwrap();

        assert_eq!(outcome.state(), BuildState::Finished);
        assert_eq!(worker.dispatched().len(), 4);
        assert_eq!(worker.dispatched()[0], "gcc");
        assert_eq!(worker.dispatched()[3], "core");

        let last = events.last().unwrap();
        assert_eq!(last.message_type(), MessageType::BuildFinished);
        let urls = outcome.urls();
        assert_eq!(urls.len(), 1);
        assert!(urls["core"].starts_with("file://"));
        assert_eq!(
            last.message.get("urls").unwrap(),
            &serde_json::json!({ "core": urls["core"] })
        );
        assert!(events.iter().any(|e| e.message_type() == MessageType::BuildSteps));
        assert!(coordinator.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_second_build_is_served_from_cache() {
        let fixture = Fixture::new();
        let first = fixture.coordinator(ScriptedWorker::new(&[]), true);
        let first_outcome = first.submit(core()).wait().await.unwrap();

        let worker = ScriptedWorker::new(&[]);
        let second = fixture.coordinator(worker.clone(), true);
        let outcome = second.submit(core()).wait().await.unwrap();

        assert_eq!(outcome.state(), BuildState::Finished);
        assert!(worker.dispatched().is_empty());
        assert_eq!(outcome.session.count(StepStatus::Cached), 4);
        assert_eq!(outcome.urls(), first_outcome.urls());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_dropped() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(ScriptedWorker::new(&[("gcc", Script::AnnounceTwice)]), true);

        let (mut events, outcome) = coordinator.submit(core()).into_parts();
        let events = events.collect_until_terminal().await.unwrap();
        let outcome = outcome.await.unwrap();

        assert_eq!(outcome.state(), BuildState::Finished);
        let gcc = outcome.session.steps().find(|s| s.name == "gcc").unwrap();
        assert_eq!(gcc.times_started(), 1);
        let starts = events
            .iter()
            .filter(|e| {
                matches!(e.message_type(), MessageType::StepStarted | MessageType::StepAlreadyStarted)
                    && e.message.get_str("step_name") == Some(gcc.fingerprint.as_str())
            })
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let fixture = Fixture::new();
        let worker = ScriptedWorker::new(&[("zlib", Script::Fail)]);
        let coordinator = fixture.coordinator(worker.clone(), true);

        let (mut events, outcome) = coordinator.submit(core()).into_parts();
        let events = events.collect_until_terminal().await.unwrap();
        let outcome = outcome.await.unwrap();

        assert_eq!(outcome.state(), BuildState::Failed);
        assert_eq!(status_of(&outcome, "zlib"), StepStatus::Failed);
        assert_eq!(status_of(&outcome, "bzip2"), StepStatus::Finished);
        assert_eq!(status_of(&outcome, "core"), StepStatus::Blocked);
        assert!(!worker.dispatched().contains(&"core".to_string()));

        let last = events.last().unwrap();
        assert_eq!(last.message_type(), MessageType::BuildFailed);
        assert!(last.message.get_str("reason").unwrap().contains("compile failed"));

        let zlib = outcome.session.steps().find(|s| s.name == "zlib").unwrap();
        assert!(!fixture.cache.has_local(&zlib.fingerprint));
    }

    #[tokio::test]
    async fn test_resolution_error_fails_session() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(ScriptedWorker::new(&[]), true);

        let (mut events, outcome) = coordinator
            .submit(BuildRequest::new("defs", "master", "strata/missing"))
            .into_parts();
        let events = events.collect_until_terminal().await.unwrap();
        let outcome = outcome.await.unwrap();

        assert_eq!(outcome.state(), BuildState::Failed);
        let reason = events.last().unwrap().message.get_str("reason").unwrap().to_string();
        assert!(reason.contains("strata/missing.morph not found"));
    }

    #[tokio::test]
    async fn test_cancel_leaves_finished_steps_alone() {
        let fixture = Fixture::new();
        let worker = ScriptedWorker::new(&[("zlib", Script::Hang), ("bzip2", Script::Hang)]);
        let coordinator = fixture.coordinator(worker.clone(), true);

        let handle = coordinator.submit(core());
        let id = handle.id();
        while worker.hanging.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let cancel = Message::exec_cancel(&id.to_string());
        assert!(coordinator.handle_client_message(&cancel).await.unwrap().is_none());
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.state(), BuildState::Cancelled);
        assert_eq!(status_of(&outcome, "gcc"), StepStatus::Finished);
        assert_eq!(status_of(&outcome, "zlib"), StepStatus::Cancelled);
        assert_eq!(status_of(&outcome, "core"), StepStatus::Cancelled);
        assert_eq!(worker.cancelled.lock().len(), 2);

        let gcc = outcome.session.steps().find(|s| s.name == "gcc").unwrap();
        assert!(fixture.cache.has_local(&gcc.fingerprint));
        let zlib = outcome.session.steps().find(|s| s.name == "zlib").unwrap();
        assert!(!fixture.cache.has_local(&zlib.fingerprint));

        // The writer slot was released with the session
        assert!(matches!(
            fixture.cache.put(&zlib.fingerprint).await.unwrap(),
            PutOutcome::Write(_)
        ));
    }

    #[tokio::test]
    async fn test_client_messages() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(ScriptedWorker::new(&[]), true);

        let id = SessionId::new().to_string();
        let request = core().to_message(&id);
        let handle = coordinator.handle_client_message(&request).await.unwrap().unwrap();
        assert_eq!(handle.id().to_string(), id);
        assert_eq!(handle.wait().await.unwrap().state(), BuildState::Finished);

        let unknown = Message::exec_cancel(&SessionId::new().to_string());
        assert!(coordinator.handle_client_message(&unknown).await.is_err());
        let progress = Message::build_progress(&id, "hello");
        assert!(coordinator.handle_client_message(&progress).await.is_err());
    }

    #[tokio::test]
    async fn test_client_build_id_is_echoed() {
        let fixture = Fixture::new();
        let coordinator = fixture.coordinator(ScriptedWorker::new(&[]), true);

        let request = core().to_message("req-1");
        let handle = coordinator.handle_client_message(&request).await.unwrap().unwrap();
        assert_eq!(handle.build_id(), "req-1");
        assert!(coordinator.handle_client_message(&request).await.is_err());

        let (mut events, outcome) = handle.into_parts();
        let events = events.collect_until_terminal().await.unwrap();
        assert_eq!(outcome.await.unwrap().state(), BuildState::Finished);

        let last = events.last().unwrap();
        assert_eq!(last.message_type(), MessageType::BuildFinished);
        assert_eq!(last.message.id(), Some("req-1"));
        assert!(events.iter().all(|e| e.message.id() == Some("req-1")));

        // A settled build frees its id
        assert!(coordinator
            .handle_client_message(&Message::exec_cancel("req-1"))
            .await
            .is_err());
        let again = coordinator.handle_client_message(&request).await.unwrap().unwrap();
        assert_eq!(again.wait().await.unwrap().state(), BuildState::Finished);
    }

    #[tokio::test]
    async fn test_cancel_by_client_build_id() {
        let fixture = Fixture::new();
        let worker = ScriptedWorker::new(&[("zlib", Script::Hang)]);
        let coordinator = fixture.coordinator(worker.clone(), true);

        let handle = coordinator
            .handle_client_message(&core().to_message("42"))
            .await
            .unwrap()
            .unwrap();
        let (mut events, outcome) = handle.into_parts();
        while worker.hanging.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        coordinator
            .handle_client_message(&Message::exec_cancel("42"))
            .await
            .unwrap();
        assert_eq!(outcome.await.unwrap().state(), BuildState::Cancelled);

        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let cancelled = event.message.get_str("message") == Some("Build cancelled");
            seen.push(event.message);
            if cancelled {
                break;
            }
        }
        assert!(seen.iter().any(|m| m.message_type() == MessageType::StepStarted));
        assert!(seen.iter().all(|m| m.id() == Some("42")));
    }

    #[tokio::test]
    async fn test_lost_worker_fails_its_step() {
        let fixture = Fixture::new();
        let worker = ScriptedWorker::new(&[("zlib", Script::Vanish)]);
        let coordinator = fixture.coordinator(worker.clone(), true);

        let (mut events, outcome) = coordinator.submit(core()).into_parts();
        let events = tokio::time::timeout(Duration::from_secs(10), events.collect_until_terminal())
            .await
            .unwrap()
            .unwrap();
        let outcome = outcome.await.unwrap();

        assert_eq!(outcome.state(), BuildState::Failed);
        assert_eq!(status_of(&outcome, "zlib"), StepStatus::Failed);
        assert_eq!(status_of(&outcome, "bzip2"), StepStatus::Finished);
        assert_eq!(status_of(&outcome, "core"), StepStatus::Blocked);

        let zlib = outcome.session.steps().find(|s| s.name == "zlib").unwrap();
        assert!(events.iter().any(|e| {
            e.message_type() == MessageType::StepFailed
                && e.message.get_str("step_name") == Some(zlib.fingerprint.as_str())
        }));
        let reason = events.last().unwrap().message.get_str("reason").unwrap().to_string();
        assert!(reason.contains("worker scripted was lost"), "{}", reason);
        assert!(!fixture.cache.has_local(&zlib.fingerprint));
    }

    #[tokio::test]
    async fn test_cancel_while_another_session_writes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        let fixture = Fixture::with_remote(server.url());
        let worker = ScriptedWorker::new(&[]);
        let coordinator = fixture.coordinator(worker.clone(), true);

        // Someone else is producing the bootstrap compiler
        let graph = fixture.graph().await;
        let gcc = graph.nodes().find(|n| n.name == "gcc").unwrap().fingerprint.clone();
        let held = fixture.cache.put(&gcc).await.unwrap();
        assert!(matches!(held, PutOutcome::Write(_)));

        let (mut events, outcome) = coordinator.submit(core()).into_parts();
        let id = coordinator.active_sessions()[0];
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.message.get_str("message") == Some("0 of 4 steps cached") {
                break;
            }
        }

        coordinator.cancel(id).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcome)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.state(), BuildState::Cancelled);
        assert!(worker.dispatched().is_empty());
        drop(held);
    }
}
