// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Supervisor for agent CLI subprocesses.
//!
//! One live process per execution id. Output is read in chunks, split into
//! lines by a [`LineBuffer`] per stream, persisted as log records and
//! published on the event bus. When the process exits the execution's status
//! is updated and an [`ExecutionExit`] is sent to the optional notifier.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::config::{AgentCommandConfig, ProcessConfig};
use crate::error::ProcessError;
use crate::events::{EventBus, ExecutionEvent};
use crate::store::Store;
use crate::types::{AgentKind, CompletionMetrics, ExecutionStatus, LogStream};

use super::line_buffer::LineBuffer;
use super::signal;

/// How long to wait for output readers to hit EOF after the child exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bytes read from a pipe per call.
const READ_CHUNK: usize = 8 * 1024;

/// Sent once per finished agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionExit {
    pub execution_id: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    /// The run was stopped on request rather than exiting on its own.
    pub cancelled: bool,
}

/// Bookkeeping for one running child.
struct LiveProcess {
    pid: u32,
    generation: u64,
    started_at: Instant,
    terminating: Arc<AtomicBool>,
    force_kill: CancellationToken,
    exited: CancellationToken,
}

/// The parts of a [`LiveProcess`] the exit waiter needs.
struct ExitHandles {
    pid: u32,
    generation: u64,
    terminating: Arc<AtomicBool>,
    force_kill: CancellationToken,
    exited: CancellationToken,
}

impl From<&LiveProcess> for ExitHandles {
    fn from(live: &LiveProcess) -> Self {
        Self {
            pid: live.pid,
            generation: live.generation,
            terminating: live.terminating.clone(),
            force_kill: live.force_kill.clone(),
            exited: live.exited.clone(),
        }
    }
}

/// Spawns and tracks agent CLI processes.
#[derive(Clone)]
pub struct ProcessSupervisor {
    config: ProcessConfig,
    agents: Arc<BTreeMap<AgentKind, AgentCommandConfig>>,
    store: Store,
    events: EventBus,
    processes: Arc<RwLock<HashMap<String, LiveProcess>>>,
    generation: Arc<AtomicU64>,
    exit_tx: Option<mpsc::UnboundedSender<ExecutionExit>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: ProcessConfig,
        agents: BTreeMap<AgentKind, AgentCommandConfig>,
        store: Store,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            agents: Arc::new(agents),
            store,
            events,
            processes: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            exit_tx: None,
        }
    }

    /// Send an [`ExecutionExit`] to `tx` whenever a process finishes.
    pub fn with_exit_notifier(mut self, tx: mpsc::UnboundedSender<ExecutionExit>) -> Self {
        self.exit_tx = Some(tx);
        self
    }

    /// Start the agent CLI for an execution and return its pid.
    ///
    /// Any process already running for `execution_id` is terminated first.
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip(self, prompt, working_dir), fields(execution_id = %execution_id))
    )]
    pub async fn spawn(
        &self,
        execution_id: &str,
        agent_kind: &str,
        prompt: &str,
        working_dir: &Path,
        is_continuation: bool,
    ) -> Result<u32, ProcessError> {
        let kind: AgentKind = agent_kind
            .parse()
            .map_err(|_| ProcessError::UnknownAgent(agent_kind.to_string()))?;
        let agent = self
            .agents
            .get(&kind)
            .filter(|a| !a.command.trim().is_empty())
            .ok_or_else(|| ProcessError::NotConfigured(kind.to_string()))?
            .clone();
        let working_dir = resolve_working_dir(working_dir).await?;

        if self.is_running(execution_id).await {
            info!(execution_id, "Stopping previous process before respawn");
            match self.terminate(execution_id).await {
                Ok(()) | Err(ProcessError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let args = agent.build_args(prompt, is_continuation);
        debug!(execution_id, command = %agent.command, "Spawning agent with {} args", args.len());

        let mut command = Command::new(&agent.command);
        command
            .args(&args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", agent.command, e);
                self.mark_failed(execution_id, &message).await;
                return Err(ProcessError::SpawnFailed(message));
            }
        };

        let Some(pid) = wait_for_pid(&child, self.config.spawn_timeout()).await else {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let timeout_ms = self.config.spawn_timeout_ms;
            self.mark_failed(execution_id, &format!("no pid within {}ms", timeout_ms))
                .await;
            return Err(ProcessError::SpawnTimeout(timeout_ms));
        };

        self.store.set_pid(execution_id, Some(pid)).await?;
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Running, None)
            .await?;
        self.store.update_execution_phase(execution_id, "running").await?;
        self.system_log(
            execution_id,
            &format!("Started {} (pid {}) in {}", agent.command, pid, working_dir.display()),
        )
        .await;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment("process.spawned");

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let live = LiveProcess {
            pid,
            generation,
            started_at: Instant::now(),
            terminating: Arc::new(AtomicBool::new(false)),
            force_kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        };
        let handles = ExitHandles::from(&live);
        // Registered before the waiter starts so a fast exit finds its entry.
        self.processes
            .write()
            .await
            .insert(execution_id.to_string(), live);

        let readers = self.start_readers(execution_id, &mut child);
        self.spawn_waiter(execution_id, child, readers, handles);

        info!(execution_id, pid, "Agent process started");
        Ok(pid)
    }

    /// Stop an execution's process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Returns once the process has exited.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn terminate(&self, execution_id: &str) -> Result<(), ProcessError> {
        let (pid, terminating, force_kill, exited) = {
            let processes = self.processes.read().await;
            let live = processes
                .get(execution_id)
                .ok_or_else(|| ProcessError::NotRunning(execution_id.to_string()))?;
            (
                live.pid,
                live.terminating.clone(),
                live.force_kill.clone(),
                live.exited.clone(),
            )
        };

        info!(execution_id, pid, "Terminating agent process");
        terminating.store(true, Ordering::SeqCst);
        if !signal::terminate_group(pid) {
            force_kill.cancel();
        }

        let grace = self.config.grace_period();
        tokio::select! {
            _ = exited.cancelled() => {}
            _ = tokio::time::sleep(grace) => {
                warn!(execution_id, pid, "Process ignored SIGTERM for {:?}, killing", grace);
                force_kill.cancel();
                if tokio::time::timeout(grace, exited.cancelled()).await.is_err() {
                    warn!(execution_id, pid, "Process still not reaped after SIGKILL");
                }
            }
        }
        Ok(())
    }

    /// Terminate every tracked process.
    pub async fn terminate_all(&self) {
        for id in self.running_ids().await {
            if let Err(e) = self.terminate(&id).await {
                debug!(execution_id = %id, "terminate during shutdown: {}", e);
            }
        }
    }

    pub async fn is_running(&self, execution_id: &str) -> bool {
        self.processes.read().await.contains_key(execution_id)
    }

    pub async fn pid(&self, execution_id: &str) -> Option<u32> {
        self.processes.read().await.get(execution_id).map(|p| p.pid)
    }

    /// How long the execution's current process has been running.
    pub async fn uptime(&self, execution_id: &str) -> Option<Duration> {
        self.processes
            .read()
            .await
            .get(execution_id)
            .map(|p| p.started_at.elapsed())
    }

    pub async fn running_ids(&self) -> Vec<String> {
        self.processes.read().await.keys().cloned().collect()
    }

    // ========================================================================
    // Output and exit handling
    // ========================================================================

    fn start_readers(&self, execution_id: &str, child: &mut Child) -> Vec<JoinHandle<LineBuffer>> {
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.clone().pump(
                execution_id.to_string(),
                stdout,
                LogStream::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.clone().pump(
                execution_id.to_string(),
                stderr,
                LogStream::Stderr,
            )));
        }
        readers
    }

    /// Read `reader` to EOF, emitting complete lines. Returns the buffer so
    /// the caller can flush any trailing partial line.
    async fn pump<R>(self, execution_id: String, mut reader: R, stream: LogStream) -> LineBuffer
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = LineBuffer::new(self.config.max_buffer_bytes, self.config.max_line_length);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        self.emit_line(&execution_id, stream, &line).await;
                    }
                }
                Err(e) => {
                    warn!(execution_id = %execution_id, "Error reading {}: {}", stream.as_str(), e);
                    break;
                }
            }
        }
        if buffer.dropped_bytes() > 0 {
            warn!(
                execution_id = %execution_id,
                "Dropped {} bytes of {} output past the buffer cap",
                buffer.dropped_bytes(),
                stream.as_str()
            );
        }
        buffer
    }

    fn spawn_waiter(
        &self,
        execution_id: &str,
        mut child: Child,
        readers: Vec<JoinHandle<LineBuffer>>,
        handles: ExitHandles,
    ) {
        let supervisor = self.clone();
        let execution_id = execution_id.to_string();
        let ExitHandles {
            pid,
            generation,
            terminating,
            force_kill,
            exited,
        } = handles;

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = force_kill.cancelled() => {
                    signal::kill_group(pid);
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // Trailing partial lines are flushed as stdout.
            for reader in readers {
                match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
                    Ok(Ok(mut buffer)) => {
                        if let Some(line) = buffer.flush() {
                            supervisor
                                .emit_line(&execution_id, LogStream::Stdout, &line)
                                .await;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(execution_id = %execution_id, "Output reader panicked: {}", e)
                    }
                    Err(_) => {
                        debug!(execution_id = %execution_id, "Output reader still open after exit")
                    }
                }
            }

            let (exit_code, success) = match &status {
                Ok(status) => (status.code(), status.success()),
                Err(e) => {
                    warn!(execution_id = %execution_id, "Failed to wait for process: {}", e);
                    (None, false)
                }
            };
            let cancelled = terminating.load(Ordering::SeqCst);
            supervisor
                .finish(ExecutionExit {
                    execution_id,
                    exit_code,
                    success,
                    cancelled,
                }, generation)
                .await;
            exited.cancel();
        });
    }

    async fn finish(&self, exit: ExecutionExit, generation: u64) {
        let id = exit.execution_id.as_str();
        let current = {
            let mut processes = self.processes.write().await;
            match processes.get(id) {
                Some(live) if live.generation == generation => {
                    processes.remove(id);
                    true
                }
                Some(_) => false,
                None => true,
            }
        };
        if !current {
            debug!(execution_id = id, "Superseded process exited");
            return;
        }

        info!(
            execution_id = id,
            exit_code = ?exit.exit_code,
            cancelled = exit.cancelled,
            "Agent process exited"
        );

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment(if exit.success { "process.succeeded" } else { "process.failed" });

        self.system_log(id, &format!("Process exited with code {:?}", exit.exit_code))
            .await;
        self.events.publish(ExecutionEvent::ProcessExited {
            execution_id: id.to_string(),
            exit_code: exit.exit_code,
            success: exit.success,
        });

        if let Err(e) = self.store.set_exit_code(id, exit.exit_code).await {
            warn!(execution_id = id, "Failed to record exit code: {}", e);
        }

        let (status, error) = if exit.cancelled {
            (ExecutionStatus::Cancelled, None)
        } else if exit.success {
            (ExecutionStatus::Completed, None)
        } else {
            let message = match exit.exit_code {
                Some(code) => format!("Process exited with code {}", code),
                None => "Process terminated by signal".to_string(),
            };
            (ExecutionStatus::Failed, Some(message))
        };
        if let Err(e) = self
            .store
            .update_execution_status(id, status, error.as_deref())
            .await
        {
            warn!(execution_id = id, "Failed to record exit status: {}", e);
        }

        match error {
            Some(error) => self.events.publish(ExecutionEvent::Failed {
                execution_id: id.to_string(),
                error,
            }),
            None => self.events.publish(ExecutionEvent::Completed {
                execution_id: id.to_string(),
                metrics: CompletionMetrics::default(),
            }),
        };

        if let Some(tx) = &self.exit_tx {
            let _ = tx.send(exit);
        }
    }

    async fn emit_line(&self, execution_id: &str, stream: LogStream, content: &str) {
        match self
            .store
            .append_execution_log(execution_id, stream, content)
            .await
        {
            Ok(log_id) => {
                self.events.publish(ExecutionEvent::Log {
                    execution_id: execution_id.to_string(),
                    log_id,
                    stream,
                    content: content.to_string(),
                });
            }
            Err(e) => warn!(execution_id, "Failed to persist log line: {}", e),
        }
    }

    async fn system_log(&self, execution_id: &str, content: &str) {
        self.emit_line(execution_id, LogStream::System, content).await;
    }

    async fn mark_failed(&self, execution_id: &str, message: &str) {
        warn!(execution_id, "Spawn failed: {}", message);
        self.system_log(execution_id, &format!("Spawn failed: {}", message))
            .await;
        if let Err(e) = self
            .store
            .update_execution_status(execution_id, ExecutionStatus::Failed, Some(message))
            .await
        {
            warn!(execution_id, "Failed to record spawn failure: {}", e);
        }
    }
}

/// Poll for the child's pid until `timeout` elapses.
async fn wait_for_pid(child: &Child, timeout: Duration) -> Option<u32> {
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(pid) = child.id() {
                return pid;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .ok()
}

/// Canonicalize `dir` and require that it is an existing directory.
async fn resolve_working_dir(dir: &Path) -> Result<PathBuf, ProcessError> {
    let resolved = tokio::fs::canonicalize(dir)
        .await
        .map_err(|e| ProcessError::InvalidWorkingDir(format!("{}: {}", dir.display(), e)))?;
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|e| ProcessError::InvalidWorkingDir(format!("{}: {}", dir.display(), e)))?;
    if !metadata.is_dir() {
        return Err(ProcessError::InvalidWorkingDir(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    Ok(resolved)
}
