// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The engine façade.
//!
//! Wires the subsystems together and exposes the operations a transport
//! layer (HTTP routes, a UI, the CLI) calls.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Engine                            │
//! │                                                              │
//! │  ResourceGovernor ──▶ WorkspaceBuilder ──▶ SessionManager    │
//! │   (admission)          (worktrees,          or               │
//! │                         manifest)          ProcessSupervisor │
//! │                              │                    │          │
//! │                              ▼                    ▼ exit     │
//! │                      PreviewSupervisor     ChangeIntegrator  │
//! │                                                              │
//! │  CleanupCoordinator     Store (sqlite)     EventBus          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::cleanup::{CleanupCoordinator, CleanupReport, RollbackReport};
use crate::config::EngineConfig;
use crate::error::{EngineError, ProcessError, SessionError};
use crate::events::{EventBus, ExecutionEvent};
use crate::feedback::{FeedbackSink, HttpFeedback};
use crate::git::{MergeOutcome, RefStore};
use crate::governor::{ResourceGovernor, ResourceReport};
use crate::integrate::{ChangeIntegrator, ChangeReport, CommitOutcome, SyncOutcome};
use crate::preview::{PreviewOptions, PreviewSupervisor};
use crate::process::{ExecutionExit, ProcessSupervisor};
use crate::session::{AgentStream, ClaudeCliStream, SessionManager};
use crate::store::Store;
use crate::telemetry::metrics::{MetricsSnapshot, GLOBAL_METRICS};
use crate::types::{
    AgentKind, ChangeRecord, Execution, ExecutionStatus, LogRecord, LogStream, OperationSummary,
    PreviewProcess, RefType,
};
use crate::workspace::{
    ExecutionManifest, PendingPreview, RefPermissions, StagedWorkspace, WorkspaceBuilder,
    WorkspaceLayout,
};

/// A request to start an execution.
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Generated when absent.
    pub execution_id: Option<String>,
    pub agent: AgentKind,
    pub prompt: String,
    pub permissions: RefPermissions,
    /// Start previews for mutate/create refs that look like web projects.
    pub start_previews: bool,
}

impl StartRequest {
    pub fn new(agent: AgentKind, prompt: impl Into<String>, permissions: RefPermissions) -> Self {
        Self {
            execution_id: None,
            agent,
            prompt: prompt.into(),
            permissions,
            start_previews: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedExecution {
    pub execution: Execution,
    pub manifest: ExecutionManifest,
    pub previews: Vec<PreviewProcess>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResourceReport {
    pub resources: ResourceReport,
    pub running_agents: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub operations: Vec<OperationSummary>,
    /// Change records of one execution, when asked for.
    pub changes: Vec<ChangeRecord>,
}

pub struct Engine {
    config: EngineConfig,
    refs: RefStore,
    store: Store,
    events: EventBus,
    builder: WorkspaceBuilder,
    integrator: ChangeIntegrator,
    cleanup: CleanupCoordinator,
    governor: ResourceGovernor,
    processes: ProcessSupervisor,
    sessions: SessionManager,
    previews: PreviewSupervisor,
    exit_rx: Mutex<Option<mpsc::UnboundedReceiver<ExecutionExit>>>,
    /// Held from the limit check until the new row counts as active.
    admission: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Open the store under the configured root and wire every subsystem.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let stream =
            ClaudeCliStream::new(config.agent(AgentKind::Claude).cloned().unwrap_or_default());
        Self::with_agent_stream(config, Arc::new(stream))
    }

    /// Like [`Engine::new`] with a custom SDK-session stream.
    pub fn with_agent_stream(
        config: EngineConfig,
        stream: Arc<dyn AgentStream>,
    ) -> Result<Self, EngineError> {
        let layout = WorkspaceLayout::new(&config.workspace_root);
        layout.ensure()?;
        let store = Store::open(&config.database_path())?;
        let feedback: Arc<dyn FeedbackSink> =
            Arc::new(HttpFeedback::new(config.feedback_url.clone()));
        Ok(Self::assemble(config, layout, store, stream, feedback))
    }

    /// Wire subsystems around an already opened store.
    pub fn assemble(
        config: EngineConfig,
        layout: WorkspaceLayout,
        store: Store,
        stream: Arc<dyn AgentStream>,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        let events = EventBus::new();
        let refs = RefStore::new(layout.clone()).with_audit(Arc::new(store.clone()));
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let cleanup = CleanupCoordinator::new(refs.clone(), store.clone());
        let governor =
            ResourceGovernor::new(config.limits.clone(), store.clone(), layout, cleanup.clone());
        let processes = ProcessSupervisor::new(
            config.process.clone(),
            config.agents.clone(),
            store.clone(),
            events.clone(),
        )
        .with_exit_notifier(exit_tx.clone());
        let sessions = SessionManager::new(
            config.session.clone(),
            stream,
            store.clone(),
            events.clone(),
            feedback.clone(),
        )
        .with_exit_notifier(exit_tx);
        let previews =
            PreviewSupervisor::new(config.preview.clone(), store.clone(), events.clone(), feedback);

        Self {
            builder: WorkspaceBuilder::new(refs.clone()),
            integrator: ChangeIntegrator::new(refs.clone(), store.clone()),
            config,
            refs,
            store,
            events,
            cleanup,
            governor,
            processes,
            sessions,
            previews,
            exit_rx: Mutex::new(Some(exit_rx)),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn refs(&self) -> &RefStore {
        &self.refs
    }

    pub fn previews(&self) -> &PreviewSupervisor {
        &self.previews
    }

    fn uses_sdk(&self, agent: AgentKind) -> bool {
        agent == AgentKind::Claude && self.config.agent(agent).is_some_and(|a| a.sdk)
    }

    // ========================================================================
    // Executions
    // ========================================================================

    /// Admit, stage and launch an execution.
    ///
    /// A governor rejection happens before anything is written to disk or
    /// the store.
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip(self, request), fields(agent = %request.agent))
    )]
    pub async fn start_execution(
        &self,
        request: StartRequest,
    ) -> Result<StartedExecution, EngineError> {
        if request.prompt.trim().is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".to_string()));
        }
        request.permissions.validate()?;
        let id = self.admit(&request).await?;
        self.store.update_execution_phase(&id, "staging").await?;

        let staged = match self.builder.stage(&id, &request.permissions).await {
            Ok(staged) => staged,
            Err(e) => {
                self.mark_failed(&id, &format!("Staging failed: {}", e)).await;
                return Err(e.into());
            }
        };
        let working_dir = staged.working_dir().to_path_buf();
        self.store.set_working_dir(&id, &working_dir).await?;
        self.store
            .insert_grants(&id, &request.permissions.grants())
            .await?;

        // Previews read the persisted working directory, so they start only now.
        let previews = if request.start_previews {
            self.previews.start_pending(&staged.pending_previews).await
        } else {
            Vec::new()
        };

        let launched = if self.uses_sdk(request.agent) {
            self.sessions
                .start_execution(&id, &request.prompt, &working_dir)
                .await
                .map_err(EngineError::from)
        } else {
            self.processes
                .spawn(&id, request.agent.as_str(), &request.prompt, &working_dir, false)
                .await
                .map(|_| ())
                .map_err(EngineError::from)
        };
        if let Err(e) = launched {
            self.mark_failed(&id, &format!("Launch failed: {}", e)).await;
            if let Err(stop) = self.previews.stop_all_for(&id).await {
                warn!(execution_id = %id, "Failed to stop previews: {}", stop);
            }
            return Err(e);
        }

        info!(execution_id = %id, agent = %request.agent, "Execution started");
        Ok(StartedExecution {
            execution: self.store.get_execution(&id).await?,
            manifest: staged.manifest,
            previews,
        })
    }

    /// Check the limits and insert the execution row as one step, so
    /// concurrent starts cannot both pass the concurrency check.
    async fn admit(&self, request: &StartRequest) -> Result<String, EngineError> {
        let _admission = self.admission.lock().await;
        self.governor.ensure_can_start().await?;

        let id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        crate::workspace::validate_ref_id(&id)?;
        if self.store.find_execution(&id).await?.is_some() {
            return Err(EngineError::Validation(format!("execution {} already exists", id)));
        }
        self.store
            .create_execution(&id, request.agent, &request.prompt)
            .await?;
        Ok(id)
    }

    /// Send a follow-up prompt to an execution whose agent is idle.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, prompt)))]
    pub async fn resume_execution(
        &self,
        execution_id: &str,
        prompt: &str,
    ) -> Result<(), EngineError> {
        if prompt.trim().is_empty() {
            return Err(EngineError::Validation("prompt must not be empty".to_string()));
        }
        let execution = self.store.get_execution(execution_id).await?;
        if self.uses_sdk(execution.agent_kind) {
            self.sessions.send_message(execution_id, prompt).await?;
            return Ok(());
        }
        if self.processes.is_running(execution_id).await {
            return Err(SessionError::Busy(execution_id.to_string()).into());
        }
        let working_dir = execution.working_dir.ok_or_else(|| {
            EngineError::Validation(format!("execution {} has no workspace", execution_id))
        })?;
        self.processes
            .spawn(execution_id, execution.agent_kind.as_str(), prompt, &working_dir, true)
            .await?;
        Ok(())
    }

    /// Stop the agent of an execution. Previews keep running.
    ///
    /// Returns false when nothing was running.
    pub async fn stop_execution(&self, execution_id: &str) -> Result<bool, EngineError> {
        self.store.get_execution(execution_id).await?;
        if self.sessions.is_alive(execution_id).await {
            self.sessions.abort(execution_id).await?;
            return Ok(true);
        }
        match self.processes.terminate(execution_id).await {
            Ok(()) => Ok(true),
            Err(ProcessError::NotRunning(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    /// Executions in any of `statuses`, or all of them.
    pub async fn list_executions(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, EngineError> {
        Ok(self.store.list_executions(statuses).await?)
    }

    pub async fn logs(
        &self,
        execution_id: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogRecord>, EngineError> {
        Ok(self
            .store
            .list_execution_logs(execution_id, after_id, limit)
            .await?)
    }

    /// Live events for one execution, in emission order.
    pub fn subscribe(&self, execution_id: &str) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe(execution_id)
    }

    // ========================================================================
    // Workspaces and changes
    // ========================================================================

    /// Stage a workspace without launching an agent. Previews are returned
    /// pending; pass them to [`Engine::start_pending_previews`].
    pub async fn setup_workspace(
        &self,
        execution_id: &str,
        permissions: &RefPermissions,
    ) -> Result<StagedWorkspace, EngineError> {
        let staged = self.builder.stage(execution_id, permissions).await?;
        if self.store.find_execution(execution_id).await?.is_some() {
            self.store
                .set_working_dir(execution_id, staged.working_dir())
                .await?;
            self.store
                .insert_grants(execution_id, &permissions.grants())
                .await?;
        }
        Ok(staged)
    }

    pub async fn start_pending_previews(&self, pending: &[PendingPreview]) -> Vec<PreviewProcess> {
        self.previews.start_pending(pending).await
    }

    /// Stop previews and remove the workspace.
    pub async fn teardown_workspace(
        &self,
        execution_id: &str,
        keep_branches: bool,
    ) -> Result<CleanupReport, EngineError> {
        self.previews.stop_all_for(execution_id).await?;
        Ok(self
            .cleanup
            .cleanup_execution(execution_id, keep_branches)
            .await?)
    }

    pub fn workspace_manifest(&self, execution_id: &str) -> Result<ExecutionManifest, EngineError> {
        Ok(ExecutionManifest::load_for(self.refs.layout(), execution_id)?)
    }

    pub async fn commit(
        &self,
        execution_id: &str,
        ref_id: &str,
        message: &str,
    ) -> Result<CommitOutcome, EngineError> {
        Ok(self
            .integrator
            .commit_changes(execution_id, ref_id, message)
            .await?)
    }

    pub async fn sync(&self, execution_id: &str, ref_id: &str) -> Result<SyncOutcome, EngineError> {
        Ok(self
            .integrator
            .sync_execution_branch(execution_id, ref_id)
            .await?)
    }

    /// Merge the execution branch into main.
    pub async fn promote(
        &self,
        execution_id: &str,
        ref_id: &str,
    ) -> Result<MergeOutcome, EngineError> {
        Ok(self.integrator.promote_to_main(execution_id, ref_id).await?)
    }

    pub async fn process_changes(&self, execution_id: &str) -> Result<ChangeReport, EngineError> {
        Ok(self
            .integrator
            .process_execution_changes(execution_id)
            .await?)
    }

    pub async fn diff(&self, execution_id: &str, ref_id: &str) -> Result<String, EngineError> {
        Ok(self.integrator.diff_execution(execution_id, ref_id).await?)
    }

    /// Stop the agent and previews, then undo the execution.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn rollback(&self, execution_id: &str) -> Result<RollbackReport, EngineError> {
        self.stop_execution(execution_id).await?;
        self.previews.stop_all_for(execution_id).await?;
        Ok(self.cleanup.rollback_execution(execution_id).await?)
    }

    // ========================================================================
    // Previews
    // ========================================================================

    pub async fn start_preview(
        &self,
        execution_id: &str,
        ref_type: RefType,
        ref_id: &str,
        options: PreviewOptions,
    ) -> Result<PreviewProcess, EngineError> {
        Ok(self
            .previews
            .start_preview(execution_id, ref_type, ref_id, options)
            .await?)
    }

    pub async fn stop_preview(&self, preview_id: &str) -> Result<PreviewProcess, EngineError> {
        Ok(self.previews.stop_preview(preview_id).await?)
    }

    pub async fn restart_preview(&self, preview_id: &str) -> Result<PreviewProcess, EngineError> {
        Ok(self.previews.restart_preview(preview_id).await?)
    }

    pub async fn get_preview(&self, preview_id: &str) -> Result<PreviewProcess, EngineError> {
        Ok(self.previews.get_preview(preview_id).await?)
    }

    pub async fn list_previews(
        &self,
        execution_id: Option<&str>,
    ) -> Result<Vec<PreviewProcess>, EngineError> {
        Ok(self.previews.list_previews(execution_id).await?)
    }

    pub async fn preview_logs(
        &self,
        preview_id: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogRecord>, EngineError> {
        Ok(self
            .previews
            .preview_logs(preview_id, after_id, limit)
            .await?)
    }

    // ========================================================================
    // Reports
    // ========================================================================

    pub async fn resource_report(&self) -> Result<EngineResourceReport, EngineError> {
        let resources = self.governor.report().await?;
        let running_agents =
            self.processes.running_ids().await.len() + self.sessions.live_ids().await.len();
        Ok(EngineResourceReport {
            resources,
            running_agents,
            metrics: GLOBAL_METRICS.snapshot(),
        })
    }

    pub async fn audit_report(
        &self,
        execution_id: Option<&str>,
    ) -> Result<AuditReport, EngineError> {
        let operations = self.store.audit_summary().await?;
        let changes = match execution_id {
            Some(id) => self.store.list_changes(id).await?,
            None => Vec::new(),
        };
        Ok(AuditReport { operations, changes })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Reconcile state left behind by a previous engine process.
    pub async fn recover(&self) -> Result<(), EngineError> {
        self.previews.recover_stale().await?;
        for execution in self.store.list_executions(&ExecutionStatus::ACTIVE).await? {
            if self.sessions.is_alive(&execution.id).await
                || self.processes.is_running(&execution.id).await
            {
                continue;
            }
            warn!(execution_id = %execution.id, "Execution interrupted by engine restart");
            self.mark_failed(&execution.id, "Interrupted by engine restart")
                .await;
        }
        Ok(())
    }

    /// Start the governor sweep, the preview monitor and the exit listener.
    ///
    /// The exit listener can only be started once per engine.
    pub fn spawn_background_tasks(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.governor.clone().run(cancel.clone())),
            tokio::spawn(self.previews.clone().run(cancel.clone())),
        ];
        let exit_rx = self
            .exit_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match exit_rx {
            Some(rx) => handles.push(tokio::spawn(Arc::clone(self).listen_for_exits(rx, cancel))),
            None => warn!("Exit listener already running"),
        }
        handles
    }

    /// Integrate changes after every successful agent run.
    async fn listen_for_exits(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ExecutionExit>,
        cancel: CancellationToken,
    ) {
        loop {
            let exit = tokio::select! {
                _ = cancel.cancelled() => break,
                exit = rx.recv() => match exit {
                    Some(exit) => exit,
                    None => break,
                },
            };
            self.on_exit(exit).await;
            self.events.prune();
        }
        debug!("Exit listener stopped");
    }

    async fn on_exit(&self, exit: ExecutionExit) {
        let id = exit.execution_id.as_str();
        if !exit.success || exit.cancelled {
            debug!(execution_id = id, "No integration for unsuccessful run");
            return;
        }
        match self.integrator.process_execution_changes(id).await {
            Ok(report) => {
                let summary = format!(
                    "Integrated changes: {} commit(s), {} created ref(s), {} error(s)",
                    report.commits.iter().filter(|c| c.committed).count(),
                    report.creates.len(),
                    report.errors.len()
                );
                info!(execution_id = id, "{}", summary);
                if let Err(e) = self
                    .store
                    .append_execution_log(id, LogStream::System, &summary)
                    .await
                {
                    warn!(execution_id = id, "Failed to log integration: {}", e);
                }
                for failure in &report.errors {
                    warn!(
                        execution_id = id,
                        ref_id = %failure.ref_id,
                        "{}: {}",
                        failure.stage,
                        failure.error
                    );
                }
            }
            Err(e) => warn!(execution_id = id, "Change integration failed: {}", e),
        }
    }

    /// Stop every agent and preview.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.sessions.abort_all().await;
        self.processes.terminate_all().await;
        self.previews.stop_all().await;
    }

    async fn mark_failed(&self, execution_id: &str, message: &str) {
        if let Err(e) = self
            .store
            .update_execution_status(execution_id, ExecutionStatus::Failed, Some(message))
            .await
        {
            warn!(execution_id, "Failed to record failure: {}", e);
        }
        if let Err(e) = self
            .store
            .append_execution_log(execution_id, LogStream::System, message)
            .await
        {
            warn!(execution_id, "Failed to log failure: {}", e);
        }
    }

    /// Where the engine keeps its database.
    pub fn database_path(&self) -> PathBuf {
        self.config.database_path()
    }
}
