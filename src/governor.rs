// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resource governor.
//!
//! Three independent admission checks (concurrency, workspace disk usage and
//! engine memory) plus a periodic sweep that flags overlong executions for
//! review and reclaims expired workspaces.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::cleanup::CleanupCoordinator;
use crate::config::LimitsConfig;
use crate::error::GovernorError;
use crate::store::Store;
use crate::types::{ExecutionStatus, LogStream};
use crate::workspace::WorkspaceLayout;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCheck {
    pub check: String,
    pub allowed: bool,
    pub current: u64,
    pub limit: u64,
    pub message: String,
}

impl ResourceCheck {
    fn new(check: &str, current: u64, limit: u64, unit: &str) -> Self {
        let allowed = current < limit;
        let message = if allowed {
            format!("{} {}/{}{}", check, current, limit, unit)
        } else {
            format!("{} at {}{}, limit is {}{}", check, current, unit, limit, unit)
        };
        Self {
            check: check.to_string(),
            allowed,
            current,
            limit,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub allowed: bool,
    pub concurrency: ResourceCheck,
    pub disk: ResourceCheck,
    pub memory: ResourceCheck,
}

impl ResourceReport {
    pub fn checks(&self) -> [&ResourceCheck; 3] {
        [&self.concurrency, &self.disk, &self.memory]
    }

    /// First failing check, if any.
    pub fn denied(&self) -> Option<&ResourceCheck> {
        self.checks().into_iter().find(|c| !c.allowed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub flagged: Vec<String>,
    pub expired: Vec<String>,
}

#[derive(Clone)]
pub struct ResourceGovernor {
    limits: LimitsConfig,
    store: Store,
    layout: WorkspaceLayout,
    cleanup: CleanupCoordinator,
    system: Arc<Mutex<System>>,
}

impl ResourceGovernor {
    pub fn new(
        limits: LimitsConfig,
        store: Store,
        layout: WorkspaceLayout,
        cleanup: CleanupCoordinator,
    ) -> Self {
        Self {
            limits,
            store,
            layout,
            cleanup,
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    pub async fn check_concurrency(&self) -> Result<ResourceCheck, GovernorError> {
        let active = self.store.count_active_executions().await?;
        Ok(ResourceCheck::new(
            "concurrency",
            active,
            self.limits.max_concurrent_executions,
            "",
        ))
    }

    pub async fn check_disk(&self) -> Result<ResourceCheck, GovernorError> {
        let root = self.layout.root().to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || dir_size(&root))
            .await
            .map_err(|e| GovernorError::Io(std::io::Error::other(e)))?;
        Ok(ResourceCheck::new(
            "disk",
            bytes / BYTES_PER_MB,
            self.limits.max_workspace_mb,
            "MB",
        ))
    }

    /// Resident memory of the engine process.
    pub fn check_memory(&self) -> ResourceCheck {
        let pid = Pid::from_u32(std::process::id());
        let bytes = {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system.process(pid).map(|p| p.memory()).unwrap_or(0)
        };
        ResourceCheck::new("memory", bytes / BYTES_PER_MB, self.limits.max_memory_mb, "MB")
    }

    pub async fn report(&self) -> Result<ResourceReport, GovernorError> {
        let concurrency = self.check_concurrency().await?;
        let disk = self.check_disk().await?;
        let memory = self.check_memory();
        Ok(ResourceReport {
            allowed: concurrency.allowed && disk.allowed && memory.allowed,
            concurrency,
            disk,
            memory,
        })
    }

    pub async fn can_start(&self) -> Result<bool, GovernorError> {
        Ok(self.report().await?.allowed)
    }

    /// Fail with the first exceeded limit.
    pub async fn ensure_can_start(&self) -> Result<(), GovernorError> {
        let report = self.report().await?;
        match report.denied() {
            Some(check) => {
                #[cfg(feature = "telemetry")]
                GLOBAL_METRICS.increment("governor.rejections");
                warn!(check = %check.check, "Rejecting execution: {}", check.message);
                Err(GovernorError::LimitExceeded {
                    check: check.check.clone(),
                    message: check.message.clone(),
                })
            }
            None => Ok(()),
        }
    }

    /// Flag overlong executions and remove expired terminal workspaces.
    pub async fn sweep(&self) -> Result<SweepReport, GovernorError> {
        let mut report = SweepReport::default();

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.limits.max_execution_duration())
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
        for execution in self.store.running_since_before(cutoff).await? {
            let message = format!(
                "Running longer than {} minutes; flagged for review",
                self.limits.max_execution_minutes
            );
            self.store
                .update_execution_status(&execution.id, ExecutionStatus::NeedsReview, None)
                .await?;
            self.store
                .append_execution_log(&execution.id, LogStream::System, &message)
                .await?;
            warn!(execution_id = %execution.id, "{}", message);
            report.flagged.push(execution.id);
        }

        let retention = self.limits.retention();
        for id in self.layout.list_execution_ids()? {
            let Some(execution) = self.store.find_execution(&id).await? else {
                debug!(execution_id = %id, "Workspace without an execution row; leaving it");
                continue;
            };
            if !execution.status.is_terminal() {
                continue;
            }
            if !is_older_than(&self.layout.execution_dir(&id), retention) {
                continue;
            }
            match self.cleanup.cleanup_execution(&id, true).await {
                Ok(_) => report.expired.push(id),
                Err(e) => warn!(execution_id = %id, "Failed to reclaim workspace: {}", e),
            }
        }

        if !report.flagged.is_empty() || !report.expired.is_empty() {
            info!(
                flagged = report.flagged.len(),
                expired = report.expired.len(),
                "Governor sweep"
            );
        }
        Ok(report)
    }

    /// Sweep every `sweep_interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.limits.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!("Governor sweep failed: {}", e);
                    }
                }
            }
        }
        debug!("Governor stopped");
    }
}

/// Total size of regular files under `root`. Symlinks are not followed.
pub fn dir_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn is_older_than(path: &Path, age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed >= age)
}
