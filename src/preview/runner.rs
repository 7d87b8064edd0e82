// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The background task behind one preview.
//!
//! installing → starting → running, with at most `max_restarts` trips back
//! through starting after an unexpected exit. Every way out of the task ends
//! with the pid cleared and the preview's ports released.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::error::PreviewError;
use crate::feedback::notify;
use crate::process::{signal, LineBuffer};
use crate::types::{LogStream, PreviewStatus};

use super::detect::{build_argv, detect_project, resolve_command, Framework, ProjectInfo};
use super::health::HealthProber;
use super::patterns::{detect_port, detect_urls, is_error_line, strip_ansi};
use super::supervisor::{PreviewJob, PreviewSupervisor};

/// How long a dev server may run before it must have reported a port.
const PORT_DETECT_TIMEOUT: Duration = Duration::from_secs(60);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 8 * 1024;
const MAX_BUFFER_BYTES: usize = 1024 * 1024;
const MAX_LINE_LENGTH: usize = 4096;
/// Output lines kept for install failure messages.
const TAIL_LINES: usize = 20;

enum RunExit {
    Stopped,
    Exited { code: Option<i32>, was_running: bool },
    Unhealthy(PreviewError),
}

/// Shared by the stdout and stderr pumps of one process.
struct PumpContext {
    preview_id: String,
    execution_id: String,
    source: String,
    /// Present while the dev server runs; absent during install.
    port_tx: Option<watch::Sender<Option<u16>>>,
    urls: Mutex<Vec<String>>,
}

impl PreviewSupervisor {
    pub(super) async fn run_preview(&self, job: PreviewJob, stop: CancellationToken) {
        #[cfg(feature = "telemetry")]
        let started = std::time::Instant::now();

        let result = self.lifecycle(&job, &stop).await;
        if let Err(e) = &result {
            self.fail(&job, &e.to_string()).await;
        }

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("preview.run", started.elapsed(), result.is_ok());

        if let Err(e) = self.store.set_preview_pid(&job.preview_id, None).await {
            warn!(preview_id = %job.preview_id, "Failed to clear pid: {}", e);
        }
        match self.ports.release_for(&job.preview_id).await {
            Ok(n) => debug!(preview_id = %job.preview_id, released = n, "Released preview ports"),
            Err(e) => warn!(preview_id = %job.preview_id, "Failed to release ports: {}", e),
        }
    }

    async fn lifecycle(
        &self,
        job: &PreviewJob,
        stop: &CancellationToken,
    ) -> Result<(), PreviewError> {
        let project = detect_project(&job.dir)?;
        if let Some(info) = &project {
            let wants_install = !job.options.skip_install && info.needs_install();
            if wants_install && !self.install(job, info, stop).await? {
                return self.stopped(job).await;
            }
        }

        let command = resolve_command(job.options.command.as_deref(), project.as_ref())
            .ok_or_else(|| PreviewError::NoCommand(job.dir.display().to_string()))?;
        let framework = project.as_ref().map_or(Framework::Unknown, |p| p.framework);
        self.store.set_preview_command(&job.preview_id, &command).await?;

        let port = self.ports.allocate(&job.preview_id).await?;
        self.store.set_preview_port(&job.preview_id, Some(port)).await?;
        let argv = build_argv(&command, framework, Some(port))?;
        // Only a port we put on the command line can be probed without being announced.
        let pinned = argv.iter().any(|a| *a == port.to_string()).then_some(port);

        let mut restarting = false;
        loop {
            if !self
                .transition(&job.preview_id, PreviewStatus::Starting, restarting, None)
                .await?
            {
                debug!(preview_id = %job.preview_id, "Preview retired before start");
                return Ok(());
            }

            match self.run_server(job, &argv, pinned, stop).await? {
                RunExit::Stopped => return self.stopped(job).await,
                RunExit::Unhealthy(e) => return Err(e),
                RunExit::Exited { code, was_running } => {
                    let exit = describe_exit(code);
                    if !was_running {
                        return Err(PreviewError::Spawn(format!(
                            "dev server {} before becoming healthy",
                            exit
                        )));
                    }
                    let attempts = self.get_preview(&job.preview_id).await?.restart_attempts;
                    if attempts >= self.config.max_restarts {
                        self.system_log(job, &format!("Dev server {}", exit)).await;
                        return Err(PreviewError::RestartLimit(self.config.max_restarts));
                    }
                    self.store
                        .set_preview_restart_attempts(&job.preview_id, attempts + 1)
                        .await?;
                    self.system_log(
                        job,
                        &format!(
                            "Dev server {}; restarting (attempt {} of {})",
                            exit,
                            attempts + 1,
                            self.config.max_restarts
                        ),
                    )
                    .await;
                    warn!(preview_id = %job.preview_id, "Dev server {}, restarting", exit);

                    #[cfg(feature = "telemetry")]
                    GLOBAL_METRICS.increment("preview.restarts");

                    tokio::select! {
                        _ = stop.cancelled() => return self.stopped(job).await,
                        _ = tokio::time::sleep(self.config.restart_delay()) => {}
                    }
                    restarting = true;
                }
            }
        }
    }

    /// Install dependencies. Returns false if stopped midway.
    async fn install(
        &self,
        job: &PreviewJob,
        info: &ProjectInfo,
        stop: &CancellationToken,
    ) -> Result<bool, PreviewError> {
        let argv = info.package_manager.install_argv();
        self.system_log(job, &format!("Installing dependencies: {}", argv.join(" ")))
            .await;

        let mut child = spawn_command(&argv, job, false)
            .map_err(|e| PreviewError::InstallFailed(format!("{}: {}", argv[0], e)))?;
        let pid = child.id();
        self.store.set_preview_pid(&job.preview_id, pid).await?;
        let readers = self.start_pumps(job, &mut child, None);

        let status = tokio::select! {
            status = tokio::time::timeout(self.config.install_timeout(), child.wait()) => status,
            _ = stop.cancelled() => {
                self.terminate_child(pid, &mut child).await;
                collect_tail(readers).await;
                return Ok(false);
            }
        };

        let outcome = match status {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(describe_exit(status.code())),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                self.terminate_child(pid, &mut child).await;
                Err(format!("timed out after {:?}", self.config.install_timeout()))
            }
        };
        let tail = collect_tail(readers).await;
        self.store.set_preview_pid(&job.preview_id, None).await?;

        match outcome {
            Ok(()) => {
                self.system_log(job, "Dependencies installed").await;
                Ok(true)
            }
            Err(reason) => Err(PreviewError::InstallFailed(format!(
                "{} {}\n{}",
                argv.join(" "),
                reason,
                tail.join("\n")
            ))),
        }
    }

    /// Run the dev server once, until it exits, is stopped or proves unhealthy.
    async fn run_server(
        &self,
        job: &PreviewJob,
        argv: &[String],
        pinned: Option<u16>,
        stop: &CancellationToken,
    ) -> Result<RunExit, PreviewError> {
        let mut child = spawn_command(argv, job, true)
            .map_err(|e| PreviewError::Spawn(format!("{}: {}", argv[0], e)))?;
        let pid = child.id();
        self.store.set_preview_pid(&job.preview_id, pid).await?;
        self.system_log(
            job,
            &format!("Started `{}` (pid {})", argv.join(" "), pid.unwrap_or_default()),
        )
        .await;

        let (port_tx, port_rx) = watch::channel(None);
        let readers = self.start_pumps(job, &mut child, Some(port_tx));
        let health = self.await_health(job, port_rx, pinned);
        tokio::pin!(health);

        let mut running = false;
        let exit = loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    self.terminate_child(pid, &mut child).await;
                    break RunExit::Stopped;
                }
                status = child.wait() => {
                    let code = status.ok().and_then(|s| s.code());
                    break RunExit::Exited { code, was_running: running };
                }
                result = &mut health, if !running => match result {
                    Ok(port) => {
                        running = true;
                        self.mark_running(job, port).await?;
                    }
                    Err(e) => {
                        self.terminate_child(pid, &mut child).await;
                        break RunExit::Unhealthy(e);
                    }
                }
            }
        };

        collect_tail(readers).await;
        Ok(exit)
    }

    /// Wait for the server to announce a port, then poll it until healthy.
    async fn await_health(
        &self,
        job: &PreviewJob,
        mut port_rx: watch::Receiver<Option<u16>>,
        pinned: Option<u16>,
    ) -> Result<u16, PreviewError> {
        let announced = match tokio::time::timeout(
            PORT_DETECT_TIMEOUT,
            port_rx.wait_for(Option::is_some),
        )
        .await
        {
            Ok(Ok(port)) => *port,
            Ok(Err(_)) | Err(_) => None,
        };
        let port = announced.or(pinned).ok_or_else(|| {
            PreviewError::Spawn(format!(
                "dev server did not report a listening port within {:?}",
                PORT_DETECT_TIMEOUT
            ))
        })?;

        if pinned != Some(port) {
            self.store.set_preview_port(&job.preview_id, Some(port)).await?;
            if !self.store.reserve_port(port, &job.preview_id).await? {
                debug!(preview_id = %job.preview_id, port, "Announced port already reserved");
            }
        }
        self.health.probe(&HealthProber::local_url(port)).await?;
        Ok(port)
    }

    async fn mark_running(&self, job: &PreviewJob, port: u16) -> Result<(), PreviewError> {
        let preview = self.get_preview(&job.preview_id).await?;
        if preview.urls.is_empty() {
            self.store
                .set_preview_urls(&job.preview_id, &[HealthProber::local_url(port)])
                .await?;
        }
        self.store.touch_preview_health(&job.preview_id).await?;
        if self
            .transition(&job.preview_id, PreviewStatus::Running, false, None)
            .await?
        {
            info!(preview_id = %job.preview_id, port, "Preview running");
            self.system_log(job, &format!("Healthy on port {}", port)).await;
        }
        Ok(())
    }

    async fn stopped(&self, job: &PreviewJob) -> Result<(), PreviewError> {
        if self
            .transition(&job.preview_id, PreviewStatus::Stopped, false, None)
            .await?
        {
            info!(preview_id = %job.preview_id, "Preview stopped");
        }
        Ok(())
    }

    async fn fail(&self, job: &PreviewJob, message: &str) {
        warn!(preview_id = %job.preview_id, "Preview failed: {}", message);
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment("preview.failures");

        match self
            .transition(&job.preview_id, PreviewStatus::Failed, false, Some(message))
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => warn!(preview_id = %job.preview_id, "Failed to record failure: {}", e),
        }
        self.system_log(job, &format!("Failed: {}", message)).await;
        let text = format!("The preview for {} failed: {}", job.source(), message);
        notify(self.feedback.as_ref(), &job.execution_id, &text).await;
    }

    /// SIGTERM the group, SIGKILL after the grace period.
    async fn terminate_child(&self, pid: Option<u32>, child: &mut Child) {
        if !pid.is_some_and(signal::terminate_group) {
            let _ = child.start_kill();
        }
        let grace = self.config.stop_grace();
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!(pid = ?pid, "Dev server ignored SIGTERM for {:?}, killing", grace);
            if let Some(pid) = pid {
                signal::kill_group(pid);
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    async fn system_log(&self, job: &PreviewJob, content: &str) {
        self.preview_log(&job.preview_id, &job.execution_id, LogStream::System, content)
            .await;
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn start_pumps(
        &self,
        job: &PreviewJob,
        child: &mut Child,
        port_tx: Option<watch::Sender<Option<u16>>>,
    ) -> Vec<JoinHandle<Vec<String>>> {
        let context = Arc::new(PumpContext {
            preview_id: job.preview_id.clone(),
            execution_id: job.execution_id.clone(),
            source: job.source(),
            port_tx,
            urls: Mutex::new(Vec::new()),
        });
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(self.clone().pump(
                context.clone(),
                stdout,
                LogStream::Stdout,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(self.clone().pump(
                context,
                stderr,
                LogStream::Stderr,
            )));
        }
        readers
    }

    /// Read to EOF and return the last few lines.
    async fn pump<R>(
        self,
        context: Arc<PumpContext>,
        mut reader: R,
        stream: LogStream,
    ) -> Vec<String>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = LineBuffer::new(MAX_BUFFER_BYTES, MAX_LINE_LENGTH);
        let mut tail = VecDeque::with_capacity(TAIL_LINES);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        self.handle_line(&context, stream, &line, &mut tail).await;
                    }
                }
                Err(e) => {
                    warn!(
                        preview_id = %context.preview_id,
                        "Error reading {}: {}",
                        stream.as_str(),
                        e
                    );
                    break;
                }
            }
        }
        if let Some(line) = buffer.flush() {
            self.handle_line(&context, stream, &line, &mut tail).await;
        }
        tail.into()
    }

    async fn handle_line(
        &self,
        context: &PumpContext,
        stream: LogStream,
        raw: &str,
        tail: &mut VecDeque<String>,
    ) {
        let line = strip_ansi(raw);
        if line.trim().is_empty() {
            return;
        }
        self.preview_log(&context.preview_id, &context.execution_id, stream, &line)
            .await;
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());

        let Some(port_tx) = &context.port_tx else { return };
        if let Some(port) = detect_port(&line) {
            port_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(port);
                    true
                } else {
                    false
                }
            });
        }
        let found = detect_urls(&line);
        if !found.is_empty() {
            let urls = {
                let mut urls = context.urls.lock().unwrap_or_else(|e| e.into_inner());
                let before = urls.len();
                for url in found {
                    if !urls.contains(&url) {
                        urls.push(url);
                    }
                }
                (urls.len() > before).then(|| urls.clone())
            };
            if let Some(urls) = urls {
                if let Err(e) = self.store.set_preview_urls(&context.preview_id, &urls).await {
                    warn!(preview_id = %context.preview_id, "Failed to record URLs: {}", e);
                }
            }
        }
        if is_error_line(&line) {
            self.errors.push(&context.execution_id, &context.source, &line);
        }
    }
}

fn spawn_command(argv: &[String], job: &PreviewJob, strip_port: bool) -> std::io::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&job.dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if strip_port {
        command.env_remove("PORT");
    }
    #[cfg(unix)]
    command.process_group(0);
    command.spawn()
}

async fn collect_tail(readers: Vec<JoinHandle<Vec<String>>>) -> Vec<String> {
    let mut tail = Vec::new();
    for reader in readers {
        match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
            Ok(Ok(lines)) => tail.extend(lines),
            Ok(Err(e)) => warn!("Preview output reader panicked: {}", e),
            Err(_) => debug!("Preview output reader still open after exit"),
        }
    }
    tail
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}
