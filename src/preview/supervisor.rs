// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor for preview dev servers.
//!
//! One active preview per `(execution, ref type, ref id)`. Each preview runs
//! as a background task (see `runner`) that installs dependencies, spawns the
//! dev server, discovers its port, confirms health and restarts it once after
//! an unexpected exit. The live map is the authority on which previews this
//! engine owns; rows in the store without a live entry are leftovers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::config::PreviewConfig;
use crate::error::PreviewError;
use crate::events::{EventBus, ExecutionEvent};
use crate::feedback::{ErrorBatcher, FeedbackSink};
use crate::process::signal;
use crate::store::Store;
use crate::types::{LogRecord, LogStream, PreviewProcess, PreviewStatus, RefType};
use crate::workspace::PendingPreview;

use super::health::HealthProber;
use super::ports::{is_port_free, PortAllocator};

/// Extra time allowed past the stop grace for the runner to wind down.
const STOP_WAIT_SLACK: Duration = Duration::from_secs(5);

/// How to start a preview.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewOptions {
    /// Run this instead of the detected dev command.
    pub command: Option<String>,
    pub skip_install: bool,
}

/// What the runner task needs to know about its preview.
#[derive(Debug, Clone)]
pub(super) struct PreviewJob {
    pub preview_id: String,
    pub execution_id: String,
    pub ref_type: RefType,
    pub ref_id: String,
    pub dir: PathBuf,
    pub options: PreviewOptions,
}

impl PreviewJob {
    /// Label used in feedback messages.
    pub fn source(&self) -> String {
        format!("{}/{}", self.ref_type, self.ref_id)
    }
}

struct LivePreview {
    stop: CancellationToken,
    done: CancellationToken,
}

#[derive(Clone)]
pub struct PreviewSupervisor {
    pub(super) config: PreviewConfig,
    pub(super) store: Store,
    pub(super) events: EventBus,
    pub(super) ports: PortAllocator,
    pub(super) health: HealthProber,
    pub(super) feedback: Arc<dyn FeedbackSink>,
    pub(super) errors: ErrorBatcher,
    live: Arc<RwLock<HashMap<String, LivePreview>>>,
    /// Serializes the check-then-insert in `start_preview`.
    start_lock: Arc<Mutex<()>>,
}

impl PreviewSupervisor {
    pub fn new(
        config: PreviewConfig,
        store: Store,
        events: EventBus,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            ports: PortAllocator::new(store.clone(), config.port_range),
            health: HealthProber::from_config(&config),
            errors: ErrorBatcher::new(feedback.clone(), config.feedback_debounce()),
            config,
            store,
            events,
            feedback,
            live: Arc::new(RwLock::new(HashMap::new())),
            start_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Start a dev server for one of an execution's mutate/create refs.
    ///
    /// An existing preview that is verifiably alive is returned as is; one
    /// whose process is gone is marked stopped and replaced.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, options)))]
    pub async fn start_preview(
        &self,
        execution_id: &str,
        ref_type: RefType,
        ref_id: &str,
        options: PreviewOptions,
    ) -> Result<PreviewProcess, PreviewError> {
        let execution = self.store.get_execution(execution_id).await?;
        let working_dir = execution.working_dir.ok_or_else(|| {
            PreviewError::NotFound(format!("working directory of execution {}", execution_id))
        })?;
        let dir = working_dir.join(ref_type.as_str()).join(ref_id);
        if !dir.is_dir() {
            return Err(PreviewError::NotFound(dir.display().to_string()));
        }

        // Held until the new preview is in the live map.
        let guard = self.start_lock.lock().await;
        if let Some(existing) = self
            .store
            .find_active_preview(execution_id, ref_type, ref_id)
            .await?
        {
            if self.is_actually_alive(&existing).await {
                debug!(preview_id = %existing.id, "Preview already running");
                return Ok(existing);
            }
            info!(preview_id = %existing.id, "Superseding dead preview");
            self.retire(&existing, PreviewStatus::Stopped, "process no longer running")
                .await?;
        }

        let preview_id = uuid::Uuid::new_v4().to_string();
        let preview = self
            .store
            .insert_preview(&preview_id, execution_id, ref_type, ref_id)
            .await?;
        self.publish_status(&preview);

        let job = PreviewJob {
            preview_id: preview_id.clone(),
            execution_id: execution_id.to_string(),
            ref_type,
            ref_id: ref_id.to_string(),
            dir,
            options,
        };
        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        self.live.write().await.insert(
            preview_id.clone(),
            LivePreview {
                stop: stop.clone(),
                done: done.clone(),
            },
        );
        drop(guard);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.run_preview(job, stop).await;
            supervisor.live.write().await.remove(&preview_id);
            done.cancel();
        });

        info!(preview_id = %preview.id, execution_id, ref_id, "Preview starting");
        Ok(preview)
    }

    /// Start previews queued by staging, once the working directory is
    /// persisted. Refs without a `package.json` are skipped.
    pub async fn start_pending(&self, pending: &[PendingPreview]) -> Vec<PreviewProcess> {
        let mut started = Vec::new();
        for entry in pending {
            if !entry.dir.join("package.json").is_file() {
                debug!(ref_id = %entry.ref_id, "No package.json; no preview");
                continue;
            }
            match self
                .start_preview(
                    &entry.execution_id,
                    entry.ref_type,
                    &entry.ref_id,
                    PreviewOptions::default(),
                )
                .await
            {
                Ok(preview) => started.push(preview),
                Err(e) => warn!(
                    execution_id = %entry.execution_id,
                    ref_id = %entry.ref_id,
                    "Failed to start preview: {}",
                    e
                ),
            }
        }
        started
    }

    /// Stop a preview and wait for its process to exit.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn stop_preview(&self, preview_id: &str) -> Result<PreviewProcess, PreviewError> {
        let preview = self.get_preview(preview_id).await?;
        let handles = self
            .live
            .read()
            .await
            .get(preview_id)
            .map(|live| (live.stop.clone(), live.done.clone()));

        match handles {
            Some((stop, done)) => {
                stop.cancel();
                let wait = self.config.stop_grace() + STOP_WAIT_SLACK;
                if tokio::time::timeout(wait, done.cancelled()).await.is_err() {
                    warn!(preview_id, "Preview did not stop within {:?}", wait);
                }
            }
            None if !preview.status.is_terminal() => {
                self.retire(&preview, PreviewStatus::Stopped, "stopped without a live process")
                    .await?;
            }
            None => {}
        }
        self.errors.discard(&preview.execution_id);
        self.get_preview(preview_id).await
    }

    /// Stop a preview and start a fresh one for the same ref, reusing its
    /// resolved command and skipping the install.
    pub async fn restart_preview(&self, preview_id: &str) -> Result<PreviewProcess, PreviewError> {
        let old = self.stop_preview(preview_id).await?;
        let options = PreviewOptions {
            command: old.command.clone(),
            skip_install: true,
        };
        self.start_preview(&old.execution_id, old.ref_type, &old.ref_id, options)
            .await
    }

    pub async fn get_preview(&self, preview_id: &str) -> Result<PreviewProcess, PreviewError> {
        self.store
            .find_preview(preview_id)
            .await?
            .ok_or_else(|| PreviewError::NotFound(preview_id.to_string()))
    }

    pub async fn list_previews(
        &self,
        execution_id: Option<&str>,
    ) -> Result<Vec<PreviewProcess>, PreviewError> {
        Ok(self.store.list_previews(execution_id).await?)
    }

    pub async fn preview_logs(
        &self,
        preview_id: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LogRecord>, PreviewError> {
        self.get_preview(preview_id).await?;
        Ok(self.store.list_preview_logs(preview_id, after_id, limit).await?)
    }

    /// Stop every active preview of an execution.
    pub async fn stop_all_for(&self, execution_id: &str) -> Result<usize, PreviewError> {
        let mut stopped = 0;
        for preview in self.store.list_previews(Some(execution_id)).await? {
            if preview.status.is_terminal() {
                continue;
            }
            self.stop_preview(&preview.id).await?;
            stopped += 1;
        }
        Ok(stopped)
    }

    /// Stop everything this supervisor owns.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.live.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop_preview(&id).await {
                debug!(preview_id = %id, "stop during shutdown: {}", e);
            }
        }
    }

    pub async fn is_live(&self, preview_id: &str) -> bool {
        self.live.read().await.contains_key(preview_id)
    }

    /// Mark previews left active by a previous engine run as stopped, killing
    /// their processes if still present, and free stale port reservations.
    pub async fn recover_stale(&self) -> Result<usize, PreviewError> {
        let mut recovered = 0;
        for preview in self
            .store
            .list_previews_by_status(&PreviewStatus::ACTIVE)
            .await?
        {
            if self.is_live(&preview.id).await {
                continue;
            }
            self.retire(&preview, PreviewStatus::Stopped, "engine restarted")
                .await?;
            recovered += 1;
        }
        self.ports.reclaim_stale().await?;
        if recovered > 0 {
            info!(recovered, "Recovered stale previews");
        }
        Ok(recovered)
    }

    /// Re-check the health of running previews until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.monitor_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.monitor_once().await {
                        warn!("Preview monitor pass failed: {}", e);
                    }
                }
            }
        }
        debug!("Preview monitor stopped");
    }

    /// One monitor pass. Returns how many running previews answered.
    pub async fn monitor_once(&self) -> Result<usize, PreviewError> {
        let mut healthy = 0;
        for preview in self
            .store
            .list_previews_by_status(&[PreviewStatus::Running])
            .await?
        {
            if !self.is_live(&preview.id).await {
                self.retire(&preview, PreviewStatus::Failed, "preview process lost")
                    .await?;
                continue;
            }
            let Some(port) = preview.port else { continue };
            if self.health.check_once(&HealthProber::local_url(port)).await {
                self.store.touch_preview_health(&preview.id).await?;
                healthy += 1;
            } else {
                warn!(preview_id = %preview.id, port, "Running preview failed a health check");
                self.preview_log(
                    &preview.id,
                    &preview.execution_id,
                    LogStream::System,
                    "Health check failed",
                )
                .await;
            }
        }
        Ok(healthy)
    }

    // ========================================================================
    // Shared helpers (also used by the runner)
    // ========================================================================

    /// Whether a recorded preview is really running under this supervisor.
    async fn is_actually_alive(&self, preview: &PreviewProcess) -> bool {
        if !self.is_live(&preview.id).await {
            return false;
        }
        if let Some(pid) = preview.pid {
            if !signal::is_alive(pid) {
                return false;
            }
        }
        match (preview.status, preview.port) {
            (PreviewStatus::Running, Some(port)) => !is_port_free(port),
            _ => true,
        }
    }

    /// Force a preview we do not (or no longer) supervise into a terminal state.
    async fn retire(
        &self,
        preview: &PreviewProcess,
        status: PreviewStatus,
        reason: &str,
    ) -> Result<(), PreviewError> {
        if let Some(stop) = self.live.write().await.remove(&preview.id).map(|l| l.stop) {
            stop.cancel();
        }
        if let Some(pid) = preview.pid.filter(|pid| signal::is_alive(*pid)) {
            signal::kill_group(pid);
        }
        self.transition(&preview.id, status, false, Some(reason)).await?;
        self.store.set_preview_pid(&preview.id, None).await?;
        self.ports.release_for(&preview.id).await?;
        Ok(())
    }

    /// Apply a status change if the state machine allows it and publish it.
    pub(super) async fn transition(
        &self,
        preview_id: &str,
        next: PreviewStatus,
        restarting: bool,
        error: Option<&str>,
    ) -> Result<bool, PreviewError> {
        let current = self.get_preview(preview_id).await?;
        if !current.status.can_transition(next, restarting) {
            debug!(
                preview_id,
                from = %current.status,
                to = %next,
                "Ignoring illegal preview transition"
            );
            return Ok(false);
        }
        self.store
            .update_preview_status(preview_id, next, error)
            .await?;
        let updated = self.get_preview(preview_id).await?;
        self.publish_status(&updated);
        Ok(true)
    }

    pub(super) fn publish_status(&self, preview: &PreviewProcess) {
        self.events.publish(ExecutionEvent::PreviewStatus {
            execution_id: preview.execution_id.clone(),
            preview_id: preview.id.clone(),
            status: preview.status,
            port: preview.port,
            error: preview.error.clone(),
        });
    }

    /// Persist and publish one preview output line.
    pub(super) async fn preview_log(
        &self,
        preview_id: &str,
        execution_id: &str,
        stream: LogStream,
        content: &str,
    ) {
        if let Err(e) = self.store.append_preview_log(preview_id, stream, content).await {
            warn!(preview_id, "Failed to persist preview log: {}", e);
            return;
        }
        self.events.publish(ExecutionEvent::PreviewLog {
            execution_id: execution_id.to_string(),
            preview_id: preview_id.to_string(),
            stream,
            content: content.to_string(),
        });
    }
}
