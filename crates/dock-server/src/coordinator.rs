use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dock_agents::{AgentError, AgentFrame, AgentSupervisor, PlanSession};
use dock_core::{AuditLog, EventBus, PlanError, PlanRegistry};
use dock_types::{
    AgentKind, AgentState, BridgeEvent, ErrorCode, ExecutionStatus, ExecutionSummary, Plan,
    PlanState, SessionEvent,
};
use dock_workspace::{validate_workdir, WorkspaceAdapter, WorkspaceError};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error("execution not found")]
    ExecutionNotFound,
    #[error("execution already reached a terminal state")]
    ExecutionAlreadyTerminal,
}

impl CoordinatorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Plan(error) => error.code(),
            Self::Workspace(error) => error.code(),
            Self::Agent(error) => error.code(),
            Self::ExecutionNotFound => ErrorCode::ExecutionNotFound,
            Self::ExecutionAlreadyTerminal => ErrorCode::ExecutionAlreadyTerminal,
        }
    }
}

struct ExecutionEntry {
    summary: ExecutionSummary,
    abort: CancellationToken,
    workdir: PathBuf,
    stdin: Option<dock_agents::AgentStdin>,
}

struct PlanSessionSlot {
    session_id: String,
    session: PlanSession,
    id_cell: Arc<RwLock<String>>,
}

struct Job {
    execution_id: String,
    plan: Plan,
    abort: CancellationToken,
}

/// Drives the plan → approve → execute state machine. Executions are
/// serialised per session through a fair mutex: at most one execution per
/// session is STARTING or RUNNING, and queued submissions drain in order.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    supervisor: AgentSupervisor,
    workspace: Arc<dyn WorkspaceAdapter>,
    plans: PlanRegistry,
    bus: EventBus,
    audit: AuditLog,
    executions: Arc<RwLock<HashMap<String, ExecutionEntry>>>,
    queues: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>>,
    plan_sessions: Arc<Mutex<HashMap<String, PlanSessionSlot>>>,
    auto_commit: bool,
}

impl ExecutionCoordinator {
    pub fn new(
        supervisor: AgentSupervisor,
        workspace: Arc<dyn WorkspaceAdapter>,
        plans: PlanRegistry,
        bus: EventBus,
        audit: AuditLog,
        auto_commit: bool,
    ) -> Self {
        Self {
            supervisor,
            workspace,
            plans,
            bus,
            audit,
            executions: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(Mutex::new(HashMap::new())),
            plan_sessions: Arc::new(Mutex::new(HashMap::new())),
            auto_commit,
        }
    }

    pub fn plans(&self) -> &PlanRegistry {
        &self.plans
    }

    pub fn workspace(&self) -> &Arc<dyn WorkspaceAdapter> {
        &self.workspace
    }

    pub fn supervisor(&self) -> &AgentSupervisor {
        &self.supervisor
    }

    /// Plan-mode entry point: validates the workdir, captures status and an
    /// optional backup snapshot, runs the agent in plan mode, and registers
    /// the PROPOSED plan.
    pub async fn submit_plan_request(
        &self,
        session_id: &str,
        prompt: &str,
        workdir: &Path,
        kind: AgentKind,
    ) -> Result<Plan, CoordinatorError> {
        validate_workdir(workdir)?;

        // Status and snapshot are advisory; a non-git workdir is still
        // plannable.
        if let Err(error) = self.workspace.status(workdir).await {
            warn!(workdir = %workdir.display(), "workspace status unavailable: {error}");
        }
        if let Err(error) = self.workspace.create_backup_snapshot(workdir).await {
            warn!(workdir = %workdir.display(), "backup snapshot failed: {error}");
        }

        let plan_id = format!("pl-{}", short_id());
        let id_cell = Arc::new(RwLock::new(plan_id.clone()));
        let frames_tx = self.spawn_frame_forwarder(session_id.to_string(), id_cell.clone());

        let plan_session = self
            .supervisor
            .start_plan(kind, prompt, workdir, &plan_id, frames_tx)
            .await?;

        let extract = &plan_session.extract;
        let plan = Plan {
            id: plan_id.clone(),
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
            workdir: workdir.to_string_lossy().into_owned(),
            agent_kind: kind,
            plan_text: extract.text(),
            modified_files_hint: dock_agents::extract_file_hints(&extract.text()),
            state: PlanState::Proposed,
            metadata: dock_agents::assess_plan(extract),
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            executed_at: None,
            rejection_reason: None,
        };
        self.plans.insert(plan.clone()).await;

        if plan_session.awaits_interactive_approval {
            self.plan_sessions.lock().await.insert(
                plan_id.clone(),
                PlanSessionSlot {
                    session_id: session_id.to_string(),
                    session: plan_session,
                    id_cell,
                },
            );
        }

        self.audit
            .append(
                "plan_proposed",
                json!({"planId": plan_id, "sessionId": session_id}),
            )
            .await;
        self.bus.publish(SessionEvent::new(
            session_id,
            BridgeEvent::plan_proposed(&plan),
        ));
        Ok(plan)
    }

    pub async fn approve_plan(
        &self,
        session_id: &str,
        plan_id: &str,
    ) -> Result<Plan, CoordinatorError> {
        let plan = self.plans.approve(plan_id, session_id).await?;
        self.audit
            .append(
                "plan_approved",
                json!({"planId": plan_id, "sessionId": session_id}),
            )
            .await;
        self.bus.publish(SessionEvent::new(
            session_id,
            BridgeEvent::PlanApproved {
                plan_id: plan_id.to_string(),
            },
        ));
        Ok(plan)
    }

    /// Terminal for the plan artifact. An interactive planning child gets
    /// the rejection and feedback first; if it counter-proposes a fresh plan
    /// before exiting, that surfaces as a brand new PROPOSED plan.
    pub async fn reject_plan(
        &self,
        session_id: &str,
        plan_id: &str,
        reason: &str,
    ) -> Result<(), CoordinatorError> {
        let rejected = self.plans.reject(plan_id, session_id, reason).await?;
        self.audit
            .append(
                "plan_rejected",
                json!({"planId": plan_id, "sessionId": session_id, "reason": reason}),
            )
            .await;
        self.bus.publish(SessionEvent::new(
            session_id,
            BridgeEvent::PlanRejected {
                plan_id: plan_id.to_string(),
                reason: reason.to_string(),
            },
        ));

        let slot = self.plan_sessions.lock().await.remove(plan_id);
        if let Some(mut slot) = slot {
            match self.supervisor.reject(&mut slot.session, reason).await {
                Ok(()) if slot.session.awaits_interactive_approval => {
                    let revised_id = format!("pl-{}", short_id());
                    *slot.id_cell.write().await = revised_id.clone();
                    let extract = &slot.session.extract;
                    let revised = Plan {
                        id: revised_id.clone(),
                        plan_text: extract.text(),
                        modified_files_hint: dock_agents::extract_file_hints(&extract.text()),
                        state: PlanState::Proposed,
                        metadata: dock_agents::assess_plan(extract),
                        created_at: Utc::now(),
                        approved_at: None,
                        rejected_at: None,
                        executed_at: None,
                        rejection_reason: None,
                        ..rejected
                    };
                    self.plans.insert(revised.clone()).await;
                    self.plan_sessions.lock().await.insert(revised_id, slot);
                    self.bus
                        .publish(SessionEvent::new(
                            session_id,
                            BridgeEvent::plan_proposed(&revised),
                        ));
                }
                Ok(()) => {}
                Err(error) => {
                    warn!(plan_id, "rejected planning child did not revise: {error}");
                    let _ = slot.session.handle.cancel().await;
                }
            }
        }
        Ok(())
    }

    /// Dispatches an APPROVED plan owned by the caller onto the session's
    /// FIFO queue and returns the execution id immediately.
    pub async fn execute_plan(
        &self,
        session_id: &str,
        plan_id: &str,
    ) -> Result<String, CoordinatorError> {
        let plan = self.plans.take_for_execution(plan_id, session_id).await?;
        let execution_id = format!("e-{}", short_id());
        let abort = CancellationToken::new();

        self.executions.write().await.insert(
            execution_id.clone(),
            ExecutionEntry {
                summary: ExecutionSummary {
                    id: execution_id.clone(),
                    plan_id: plan.id.clone(),
                    session_id: session_id.to_string(),
                    status: ExecutionStatus::Queued,
                    started_at: Utc::now(),
                    finished_at: None,
                    progress_percent: 0,
                    modified_files: Vec::new(),
                    error_reason: None,
                },
                abort: abort.clone(),
                workdir: PathBuf::from(&plan.workdir),
                stdin: None,
            },
        );

        let sender = self.session_queue(session_id).await;
        let job = Job {
            execution_id: execution_id.clone(),
            plan,
            abort,
        };
        if sender.send(job).is_err() {
            self.executions.write().await.remove(&execution_id);
            return Err(CoordinatorError::ExecutionNotFound);
        }
        Ok(execution_id)
    }

    /// One worker per session drains its queue in submission order; the next
    /// execution only starts after the previous one reached a terminal state.
    async fn run_session_worker(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            let already_terminal = self
                .execution(&job.execution_id)
                .await
                .map(|s| s.status.is_terminal())
                .unwrap_or(true);
            if job.abort.is_cancelled() || already_terminal {
                let reason = self
                    .execution(&job.execution_id)
                    .await
                    .and_then(|s| s.error_reason)
                    .unwrap_or_else(|| "rejected before start".to_string());
                self.finish(&job.execution_id, ExecutionStatus::Aborted, Some(reason.clone()))
                    .await;
                self.bus.publish(SessionEvent::new(
                    &job.plan.session_id,
                    BridgeEvent::ExecutionFailed {
                        execution_id: job.execution_id.clone(),
                        error: reason,
                        code: ErrorCode::ExecutionAlreadyTerminal,
                    },
                ));
                continue;
            }
            self.run_execution(job).await;
        }
    }

    async fn run_execution(&self, job: Job) {
        let Job {
            execution_id,
            plan,
            abort,
        } = job;
        let session_id = plan.session_id.clone();

        self.set_progress(&execution_id, ExecutionStatus::Starting, 0).await;
        self.bus.publish(SessionEvent::new(
            &session_id,
            BridgeEvent::ExecutionStarted {
                execution_id: execution_id.clone(),
                plan_id: plan.id.clone(),
            },
        ));

        let workdir = PathBuf::from(&plan.workdir);
        let modified = Arc::new(Mutex::new(Vec::<String>::new()));
        let watch_stop = CancellationToken::new();
        self.spawn_change_watcher(&session_id, &execution_id, &workdir, modified.clone(), watch_stop.clone())
            .await;

        let outcome = self.drive_agent(&execution_id, &plan, abort.clone()).await;
        watch_stop.cancel();

        let modified_files = {
            let guard = modified.lock().await;
            guard.clone()
        };
        self.bus.publish(SessionEvent::new(
            &session_id,
            BridgeEvent::AgentStateChange {
                execution_id: execution_id.clone(),
                state: AgentState::Exited,
            },
        ));
        self.set_progress(&execution_id, ExecutionStatus::Running, 80).await;

        match outcome {
            Ok(outcome) if outcome.exit_code == 0 => {
                if self.auto_commit {
                    let message = format!("prompt-dock: {}", plan.prompt.chars().take(60).collect::<String>());
                    match self.workspace.commit(&workdir, &message, &modified_files).await {
                        Ok(_) => {
                            self.set_progress(&execution_id, ExecutionStatus::Running, 90).await
                        }
                        Err(error) => {
                            warn!(%execution_id, "auto-commit failed: {error}")
                        }
                    }
                }
                self.plans.mark_executed(&plan.id).await;
                self.set_modified_files(&execution_id, modified_files.clone()).await;
                // State flips terminal before any completion event goes out.
                self.finish(&execution_id, ExecutionStatus::Completed, None).await;
                self.bus.publish(SessionEvent::new(
                    &session_id,
                    BridgeEvent::ExecutionProgress {
                        execution_id: execution_id.clone(),
                        status: ExecutionStatus::Completed,
                        progress: 100,
                    },
                ));
                self.bus.publish(SessionEvent::new(
                    &session_id,
                    BridgeEvent::FileList {
                        files: modified_files.clone(),
                        execution_id: Some(execution_id.clone()),
                    },
                ));
                for file in modified_files.iter().take(5) {
                    let Ok(diff) = self.workspace.diff(file, &workdir).await else {
                        continue;
                    };
                    if diff.trim().is_empty() {
                        continue;
                    }
                    self.bus.publish(SessionEvent::new(
                        &session_id,
                        BridgeEvent::FileDiff {
                            execution_id: execution_id.clone(),
                            file: file.clone(),
                            diff: tail(&diff, 8_000),
                        },
                    ));
                }
                self.bus.publish(SessionEvent::new(
                    &session_id,
                    BridgeEvent::ExecutionComplete {
                        execution_id: execution_id.clone(),
                        plan_id: plan.id.clone(),
                        modified_files,
                        result: tail(&outcome.transcript, 2_000),
                    },
                ));
                self.audit
                    .append(
                        "execution_completed",
                        json!({"executionId": execution_id, "planId": plan.id}),
                    )
                    .await;
            }
            Ok(outcome) => {
                let reason = format!("agent exited with code {}", outcome.exit_code);
                self.finish(&execution_id, ExecutionStatus::Failed, Some(reason.clone())).await;
                self.bus.publish(SessionEvent::new(
                    &session_id,
                    BridgeEvent::ExecutionFailed {
                        execution_id: execution_id.clone(),
                        error: reason,
                        code: ErrorCode::AgentCrashed,
                    },
                ));
            }
            Err(AgentError::Aborted) => {
                self.finish(
                    &execution_id,
                    ExecutionStatus::Aborted,
                    Some("aborted by client".to_string()),
                )
                .await;
                self.bus.publish(SessionEvent::new(
                    &session_id,
                    BridgeEvent::ExecutionProgress {
                        execution_id: execution_id.clone(),
                        status: ExecutionStatus::Aborted,
                        progress: 100,
                    },
                ));
                self.audit
                    .append("execution_aborted", json!({"executionId": execution_id}))
                    .await;
            }
            Err(error) => {
                let code = error.code();
                let reason = error.to_string();
                self.finish(&execution_id, ExecutionStatus::Failed, Some(reason.clone())).await;
                self.bus.publish(SessionEvent::new(
                    &session_id,
                    BridgeEvent::ExecutionFailed {
                        execution_id: execution_id.clone(),
                        error: reason,
                        code,
                    },
                ));
            }
        }
    }

    async fn drive_agent(
        &self,
        execution_id: &str,
        plan: &Plan,
        abort: CancellationToken,
    ) -> Result<dock_agents::ExecOutcome, AgentError> {
        let session_id = plan.session_id.clone();
        let workdir = PathBuf::from(&plan.workdir);

        let slot = self.plan_sessions.lock().await.remove(&plan.id);
        if let Some(mut slot) = slot {
            // The planning child is still alive: approve on its stdin and
            // retag its output stream with the execution id.
            *slot.id_cell.write().await = execution_id.to_string();
            {
                let mut executions = self.executions.write().await;
                if let Some(entry) = executions.get_mut(execution_id) {
                    entry.stdin = Some(slot.session.handle.stdin_writer());
                }
            }
            self.set_progress(execution_id, ExecutionStatus::Running, 10).await;
            self.bus.publish(SessionEvent::new(
                &session_id,
                BridgeEvent::AgentStateChange {
                    execution_id: execution_id.to_string(),
                    state: AgentState::Executing,
                },
            ));
            return self
                .supervisor
                .approve_interactively(&mut slot.session, None, abort)
                .await;
        }

        let id_cell = Arc::new(RwLock::new(execution_id.to_string()));
        let frames_tx = self.spawn_frame_forwarder(session_id.clone(), id_cell);
        let prompt = format!(
            "Apply this approved plan exactly.\n\nPlan:\n{}\n\nOriginal request: {}",
            plan.plan_text, plan.prompt
        );
        self.set_progress(execution_id, ExecutionStatus::Running, 10).await;
        self.bus.publish(SessionEvent::new(
            &session_id,
            BridgeEvent::AgentStateChange {
                execution_id: execution_id.to_string(),
                state: AgentState::Executing,
            },
        ));
        self.supervisor
            .start_one_shot(
                plan.agent_kind,
                &prompt,
                &workdir,
                execution_id,
                frames_tx,
                &[],
                abort,
            )
            .await
    }

    /// Flips a non-terminal execution to ABORTED and signals its subprocess.
    /// The terminal event is emitted by the run task once the child exits.
    pub async fn abort(
        &self,
        session_id: &str,
        execution_id: &str,
    ) -> Result<(), CoordinatorError> {
        let mut executions = self.executions.write().await;
        let entry = executions
            .get_mut(execution_id)
            .ok_or(CoordinatorError::ExecutionNotFound)?;
        if entry.summary.session_id != session_id {
            return Err(CoordinatorError::ExecutionNotFound);
        }
        if entry.summary.status.is_terminal() {
            return Err(CoordinatorError::ExecutionAlreadyTerminal);
        }
        // A queued execution has no subprocess yet; it dies right here and
        // its worker skips it on dequeue.
        if entry.summary.status == ExecutionStatus::Queued {
            entry.summary.status = ExecutionStatus::Aborted;
            entry.summary.finished_at = Some(Utc::now());
            entry.summary.error_reason = Some("aborted while queued".to_string());
        }
        entry.abort.cancel();
        info!(execution_id, "abort requested");
        Ok(())
    }

    /// Best-effort parallel stop of everything: running executions get the
    /// polite-then-hard cancel, queued ones are rejected, and interactive
    /// planning children are cancelled.
    pub async fn emergency_stop(&self, reason: &str) -> Vec<String> {
        let mut aborted = Vec::new();
        {
            let executions = self.executions.read().await;
            for (id, entry) in executions.iter() {
                if !entry.summary.status.is_terminal() {
                    entry.abort.cancel();
                    aborted.push(id.clone());
                }
            }
        }

        let slots: Vec<PlanSessionSlot> = {
            let mut sessions = self.plan_sessions.lock().await;
            sessions.drain().map(|(_, slot)| slot).collect()
        };
        for mut slot in slots {
            let _ = slot.session.handle.cancel().await;
        }

        self.audit
            .append(
                "emergency_stop",
                json!({"reason": reason, "abortedExecutions": aborted}),
            )
            .await;
        aborted
    }

    /// Cancels everything a disconnecting session left running. Plans stay
    /// registered until their own sweep.
    pub async fn cancel_session(&self, session_id: &str) {
        let to_abort: Vec<CancellationToken> = {
            let executions = self.executions.read().await;
            executions
                .values()
                .filter(|e| e.summary.session_id == session_id && !e.summary.status.is_terminal())
                .map(|e| e.abort.clone())
                .collect()
        };
        for token in to_abort {
            token.cancel();
        }

        let slots: Vec<PlanSessionSlot> = {
            let mut sessions = self.plan_sessions.lock().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, slot)| slot.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id))
                .collect()
        };
        for mut slot in slots {
            let _ = slot.session.handle.cancel().await;
        }
    }

    /// Free-form interactive input to this session's awaiting planning child.
    pub async fn interact(&self, session_id: &str, message: &str) -> Result<(), CoordinatorError> {
        let sessions = self.plan_sessions.lock().await;
        let slot = sessions
            .values()
            .find(|slot| slot.session_id == session_id)
            .ok_or(CoordinatorError::ExecutionNotFound)?;
        slot.session
            .handle
            .write_stdin_line(message)
            .await
            .map_err(CoordinatorError::Agent)
    }

    /// Mid-execution feedback to a running interactive agent.
    pub async fn feedback(
        &self,
        session_id: &str,
        execution_id: &str,
        feedback: &str,
    ) -> Result<(), CoordinatorError> {
        let stdin = {
            let executions = self.executions.read().await;
            let entry = executions
                .get(execution_id)
                .ok_or(CoordinatorError::ExecutionNotFound)?;
            if entry.summary.session_id != session_id {
                return Err(CoordinatorError::ExecutionNotFound);
            }
            if entry.summary.status.is_terminal() {
                return Err(CoordinatorError::ExecutionAlreadyTerminal);
            }
            entry
                .stdin
                .clone()
                .ok_or(CoordinatorError::ExecutionNotFound)?
        };
        stdin
            .write_line(feedback)
            .await
            .map_err(CoordinatorError::Agent)
    }

    pub async fn execution(&self, execution_id: &str) -> Option<ExecutionSummary> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|e| e.summary.clone())
    }

    pub async fn execution_workdir(&self, execution_id: &str) -> Option<PathBuf> {
        self.executions
            .read()
            .await
            .get(execution_id)
            .map(|e| e.workdir.clone())
    }

    async fn session_queue(&self, session_id: &str) -> mpsc::UnboundedSender<Job> {
        let mut queues = self.queues.lock().await;
        if let Some(sender) = queues.get(session_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        queues.insert(session_id.to_string(), tx.clone());
        let worker = self.clone();
        tokio::spawn(worker.run_session_worker(rx));
        tx
    }

    fn spawn_frame_forwarder(
        &self,
        session_id: String,
        id_cell: Arc<RwLock<String>>,
    ) -> mpsc::Sender<AgentFrame> {
        let (tx, mut rx) = mpsc::channel::<AgentFrame>(256);
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let execution_id = id_cell.read().await.clone();
                let event = match frame {
                    AgentFrame::Output(frame) => BridgeEvent::AgentOutput {
                        execution_id,
                        stream: frame.stream,
                        data: frame.data,
                        ts: frame.ts,
                    },
                    AgentFrame::Truncated { stream, .. } => BridgeEvent::AgentOutput {
                        execution_id,
                        stream,
                        data: "[outputTruncated]\n".to_string(),
                        ts: Utc::now(),
                    },
                };
                bus.publish(SessionEvent::new(session_id.clone(), event));
            }
        });
        tx
    }

    async fn spawn_change_watcher(
        &self,
        session_id: &str,
        execution_id: &str,
        workdir: &Path,
        modified: Arc<Mutex<Vec<String>>>,
        stop: CancellationToken,
    ) {
        let mut watch = match self.workspace.watch(workdir).await {
            Ok(watch) => watch,
            Err(error) => {
                warn!(execution_id, "workspace watch unavailable: {error}");
                return;
            }
        };
        let bus = self.bus.clone();
        let session_id = session_id.to_string();
        let execution_id = execution_id.to_string();
        let root = workdir.to_path_buf();
        tokio::spawn(async move {
            loop {
                let path = tokio::select! {
                    path = watch.recv() => path,
                    _ = stop.cancelled() => break,
                };
                let Some(path) = path else { break };
                let display = path
                    .strip_prefix(&root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                {
                    let mut modified = modified.lock().await;
                    if !modified.contains(&display) {
                        modified.push(display.clone());
                    }
                }
                bus.publish(SessionEvent::new(
                    session_id.clone(),
                    BridgeEvent::FileChanged {
                        execution_id: execution_id.clone(),
                        file: display,
                    },
                ));
            }
        });
    }

    async fn set_progress(&self, execution_id: &str, status: ExecutionStatus, progress: u8) {
        let session_id = {
            let mut executions = self.executions.write().await;
            let Some(entry) = executions.get_mut(execution_id) else {
                return;
            };
            if !entry.summary.status.is_terminal() {
                entry.summary.status = status;
            }
            entry.summary.progress_percent = progress;
            entry.summary.session_id.clone()
        };
        self.bus.publish(SessionEvent::new(
            session_id,
            BridgeEvent::ExecutionProgress {
                execution_id: execution_id.to_string(),
                status,
                progress,
            },
        ));
    }

    async fn set_modified_files(&self, execution_id: &str, files: Vec<String>) {
        let mut executions = self.executions.write().await;
        if let Some(entry) = executions.get_mut(execution_id) {
            entry.summary.modified_files = files;
        }
    }

    async fn finish(&self, execution_id: &str, status: ExecutionStatus, reason: Option<String>) {
        let mut executions = self.executions.write().await;
        if let Some(entry) = executions.get_mut(execution_id) {
            entry.summary.status = status;
            entry.summary.finished_at = Some(Utc::now());
            entry.summary.error_reason = reason;
            if status == ExecutionStatus::Completed {
                entry.summary.progress_percent = 100;
            }
        }
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let start = text.len() - max;
    let boundary = (start..text.len())
        .find(|i| text.is_char_boundary(*i))
        .unwrap_or(start);
    text[boundary..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use dock_agents::AgentCatalog;
    use dock_core::{AuditLog, PlanRegistry};
    use dock_workspace::GitWorkspace;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    fn install_script(dir: &Path, body: &str) -> String {
        let path = dir.join("agent.sh");
        std::fs::write(&path, body).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    async fn coordinator_for(script_body: &str) -> (ExecutionCoordinator, tempfile::TempDir, tempfile::TempDir) {
        let state = tempfile::tempdir().expect("state dir");
        let repo = tempfile::tempdir().expect("repo dir");
        let script = install_script(state.path(), script_body);
        let catalog = AgentCatalog::new(std::collections::HashMap::from([(
            "claude-code".to_string(),
            script,
        )]));
        let supervisor = AgentSupervisor::new(catalog, 4 * 1024 * 1024, 30_000);
        let audit = AuditLog::open(state.path()).await.expect("audit");
        let coordinator = ExecutionCoordinator::new(
            supervisor,
            Arc::new(GitWorkspace::new(Default::default())),
            PlanRegistry::new(),
            EventBus::new(),
            audit,
            false,
        );
        (coordinator, state, repo)
    }

    const PLAN_THEN_EXEC: &str = "#!/bin/sh\nread prompt\necho \"=== PLAN ===\"\necho \"- write demo.txt\"\necho \"=== END PLAN ===\"\nread decision\necho applying\nexit 0\n";

    #[tokio::test]
    async fn plan_approve_execute_happy_path() {
        let (coordinator, _state, repo) = coordinator_for(PLAN_THEN_EXEC).await;
        let mut events = coordinator.bus.subscribe();

        let plan = coordinator
            .submit_plan_request("s-1", "write demo", repo.path(), AgentKind::ClaudeCode)
            .await
            .expect("plan");
        assert_eq!(plan.state, PlanState::Proposed);
        assert!(plan.plan_text.contains("write demo.txt"));

        coordinator.approve_plan("s-1", &plan.id).await.expect("approve");
        let execution_id = coordinator
            .execute_plan("s-1", &plan.id)
            .await
            .expect("execute");

        // The completion event is published only after the record is
        // terminal, so waiting on the bus is race-free.
        let mut saw_started = false;
        let mut progress_values = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("execution stalled")
                .expect("bus open");
            match event.event {
                BridgeEvent::ExecutionStarted { .. } => saw_started = true,
                BridgeEvent::ExecutionProgress { progress, .. } => progress_values.push(progress),
                BridgeEvent::ExecutionComplete { execution_id: done, .. } => {
                    assert_eq!(done, execution_id);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(progress_values.contains(&10));
        assert!(progress_values.contains(&80));
        assert!(progress_values.contains(&100));

        let summary = coordinator.execution(&execution_id).await.expect("summary");
        assert_eq!(summary.status, ExecutionStatus::Completed);
        assert_eq!(summary.progress_percent, 100);

        let plan_after = coordinator.plans.get(&plan.id).await.expect("plan kept");
        assert_eq!(plan_after.state, PlanState::Executed);
    }

    #[tokio::test]
    async fn executing_an_unknown_plan_is_plan_not_found() {
        let (coordinator, _state, _repo) = coordinator_for(PLAN_THEN_EXEC).await;
        let err = coordinator
            .execute_plan("s-1", "pl-NONE")
            .await
            .expect_err("no plan");
        assert_eq!(err.code(), ErrorCode::PlanNotFound);
    }

    #[tokio::test]
    async fn executing_an_unapproved_plan_is_refused() {
        let (coordinator, _state, repo) = coordinator_for(PLAN_THEN_EXEC).await;
        let plan = coordinator
            .submit_plan_request("s-1", "p", repo.path(), AgentKind::ClaudeCode)
            .await
            .expect("plan");
        let err = coordinator
            .execute_plan("s-1", &plan.id)
            .await
            .expect_err("unapproved");
        assert_eq!(err.code(), ErrorCode::PlanNotApproved);
        coordinator.emergency_stop("test teardown").await;
    }

    #[tokio::test]
    async fn foreign_session_cannot_execute_an_approved_plan() {
        let (coordinator, _state, repo) = coordinator_for(PLAN_THEN_EXEC).await;
        let plan = coordinator
            .submit_plan_request("s-1", "p", repo.path(), AgentKind::ClaudeCode)
            .await
            .expect("plan");
        coordinator.approve_plan("s-1", &plan.id).await.expect("approve");
        let err = coordinator
            .execute_plan("s-2", &plan.id)
            .await
            .expect_err("foreign session");
        assert_eq!(err.code(), ErrorCode::PlanOwnershipViolation);
        coordinator.emergency_stop("test teardown").await;
    }

    #[tokio::test]
    async fn abort_reaches_a_terminal_aborted_state() {
        let script = "#!/bin/sh\nread prompt\necho \"=== PLAN ===\"\necho \"- wait\"\necho \"=== END PLAN ===\"\nread decision\nsleep 60\n";
        let (coordinator, _state, repo) = coordinator_for(script).await;

        let plan = coordinator
            .submit_plan_request("s-1", "p", repo.path(), AgentKind::ClaudeCode)
            .await
            .expect("plan");
        coordinator.approve_plan("s-1", &plan.id).await.expect("approve");
        let execution_id = coordinator
            .execute_plan("s-1", &plan.id)
            .await
            .expect("execute");

        // Let the execution reach the running child before aborting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        coordinator.abort("s-1", &execution_id).await.expect("abort");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(12);
        loop {
            let summary = coordinator.execution(&execution_id).await.expect("summary");
            if summary.status.is_terminal() {
                assert_eq!(summary.status, ExecutionStatus::Aborted);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "abort stalled");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(matches!(
            coordinator.abort("s-1", &execution_id).await,
            Err(CoordinatorError::ExecutionAlreadyTerminal)
        ));
        assert!(matches!(
            coordinator.abort("s-1", "e-missing").await,
            Err(CoordinatorError::ExecutionNotFound)
        ));
    }

    #[tokio::test]
    async fn per_session_executions_run_in_submission_order() {
        let script = "#!/bin/sh\nread prompt\necho \"=== PLAN ===\"\necho \"- step\"\necho \"=== END PLAN ===\"\nread decision\nsleep 1\necho done\nexit 0\n";
        let (coordinator, _state, repo) = coordinator_for(script).await;

        let first = coordinator
            .submit_plan_request("s-1", "one", repo.path(), AgentKind::ClaudeCode)
            .await
            .expect("plan one");
        let second = coordinator
            .submit_plan_request("s-1", "two", repo.path(), AgentKind::ClaudeCode)
            .await
            .expect("plan two");
        coordinator.approve_plan("s-1", &first.id).await.expect("approve one");
        coordinator.approve_plan("s-1", &second.id).await.expect("approve two");

        let exec_one = coordinator.execute_plan("s-1", &first.id).await.expect("exec one");
        let exec_two = coordinator.execute_plan("s-1", &second.id).await.expect("exec two");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let one = coordinator.execution(&exec_one).await.expect("one");
            let two = coordinator.execution(&exec_two).await.expect("two");

            // Never two actives at once.
            let actives = [one.status, two.status]
                .iter()
                .filter(|s| s.is_active())
                .count();
            assert!(actives <= 1, "per-session serialisation violated");

            if one.status.is_terminal() && two.status.is_terminal() {
                let one_done = one.finished_at.expect("one finished");
                let two_done = two.finished_at.expect("two finished");
                assert!(one_done <= two_done, "submission order violated");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "queue stalled");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn emergency_stop_with_nothing_running_is_empty() {
        let (coordinator, _state, _repo) = coordinator_for(PLAN_THEN_EXEC).await;
        assert!(coordinator.emergency_stop("drill").await.is_empty());
    }
}
