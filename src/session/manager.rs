// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Streaming agent session manager.
//!
//! Drives one message-stream session per execution. Each message is logged,
//! published and counted; every `heartbeat_every` messages the execution's
//! heartbeat is refreshed. A result reporting a context overflow triggers a
//! single compact-and-retry: `/compact` is sent to the same session and the
//! original prompt resubmitted. If that recovery fails, the original failure
//! is what gets reported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{EventBus, ExecutionEvent};
use crate::feedback::{notify, FeedbackSink};
use crate::process::ExecutionExit;
use crate::store::Store;
use crate::types::{ExecutionStatus, LogStream};

use super::stream::AgentStream;
use super::types::{AgentMessage, ResultMessage, StreamRequest};

/// Directive that asks the agent to summarize its conversation.
pub const COMPACT_DIRECTIVE: &str = "/compact";

/// How long `abort` waits for the session task to wind down.
const ABORT_WAIT: Duration = Duration::from_secs(10);

struct LiveSession {
    generation: u64,
    cancel: CancellationToken,
    done: CancellationToken,
    started_at: Instant,
}

/// Everything one session run needs, shared with spawned subtasks.
#[derive(Clone)]
struct RunContext {
    execution_id: String,
    working_dir: PathBuf,
    cancel: CancellationToken,
    messages: Arc<AtomicU64>,
}

/// What a single stream produced.
#[derive(Debug, Default)]
struct DriveOutcome {
    result: Option<ResultMessage>,
    session_id: Option<String>,
}

/// Runs SDK-style agent sessions.
#[derive(Clone)]
pub struct SessionManager {
    config: SessionConfig,
    stream: Arc<dyn AgentStream>,
    store: Store,
    events: EventBus,
    feedback: Arc<dyn FeedbackSink>,
    sessions: Arc<RwLock<HashMap<String, LiveSession>>>,
    generation: Arc<AtomicU64>,
    exit_tx: Option<mpsc::UnboundedSender<ExecutionExit>>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        stream: Arc<dyn AgentStream>,
        store: Store,
        events: EventBus,
        feedback: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            config,
            stream,
            store,
            events,
            feedback,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            exit_tx: None,
        }
    }

    /// Send an [`ExecutionExit`] to `tx` whenever a session finishes.
    pub fn with_exit_notifier(mut self, tx: mpsc::UnboundedSender<ExecutionExit>) -> Self {
        self.exit_tx = Some(tx);
        self
    }

    /// Start a fresh session for an execution, replacing any live one.
    #[cfg_attr(
        feature = "telemetry",
        instrument(skip(self, prompt, working_dir), fields(execution_id = %execution_id))
    )]
    pub async fn start_execution(
        &self,
        execution_id: &str,
        prompt: &str,
        working_dir: &Path,
    ) -> Result<(), SessionError> {
        self.launch(execution_id, prompt, working_dir, None).await
    }

    /// Continue an idle execution's session with a follow-up message.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, prompt)))]
    pub async fn send_message(&self, execution_id: &str, prompt: &str) -> Result<(), SessionError> {
        if self.is_alive(execution_id).await {
            return Err(SessionError::Busy(execution_id.to_string()));
        }
        let execution = self.store.get_execution(execution_id).await?;
        let session_id = execution
            .session_id
            .ok_or_else(|| SessionError::NoResumableSession(execution_id.to_string()))?;
        let working_dir = execution
            .working_dir
            .ok_or_else(|| SessionError::NoResumableSession(execution_id.to_string()))?;
        self.launch(execution_id, prompt, &working_dir, Some(session_id))
            .await
    }

    /// Cancel the live session through its stream's abort handle.
    pub async fn abort(&self, execution_id: &str) -> Result<(), SessionError> {
        let (cancel, done) = {
            let sessions = self.sessions.read().await;
            let live = sessions
                .get(execution_id)
                .ok_or_else(|| SessionError::NoSession(execution_id.to_string()))?;
            (live.cancel.clone(), live.done.clone())
        };
        info!(execution_id, "Aborting agent session");
        cancel.cancel();
        if tokio::time::timeout(ABORT_WAIT, done.cancelled()).await.is_err() {
            warn!(execution_id, "Session did not wind down within {:?}", ABORT_WAIT);
        }
        Ok(())
    }

    pub async fn abort_all(&self) {
        for id in self.live_ids().await {
            let _ = self.abort(&id).await;
        }
    }

    pub async fn live_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn is_alive(&self, execution_id: &str) -> bool {
        self.sessions.read().await.contains_key(execution_id)
    }

    pub async fn uptime(&self, execution_id: &str) -> Option<Duration> {
        self.sessions
            .read()
            .await
            .get(execution_id)
            .map(|s| s.started_at.elapsed())
    }

    // ========================================================================
    // Session task
    // ========================================================================

    async fn launch(
        &self,
        execution_id: &str,
        prompt: &str,
        working_dir: &Path,
        resume: Option<String>,
    ) -> Result<(), SessionError> {
        if self.is_alive(execution_id).await {
            info!(execution_id, "Replacing live session");
            self.abort(execution_id).await?;
        }

        // The store goes first: a live entry without a running row would
        // leave the execution busy forever.
        self.store
            .update_execution_status(execution_id, ExecutionStatus::Running, None)
            .await?;
        self.store.update_execution_phase(execution_id, "running").await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        self.sessions.write().await.insert(
            execution_id.to_string(),
            LiveSession {
                generation,
                cancel: cancel.clone(),
                done: done.clone(),
                started_at: Instant::now(),
            },
        );

        let ctx = RunContext {
            execution_id: execution_id.to_string(),
            working_dir: working_dir.to_path_buf(),
            cancel,
            messages: Arc::new(AtomicU64::new(0)),
        };
        let manager = self.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let outcome = manager.run(&ctx, &prompt, resume).await;
            manager.finish(&ctx, generation, outcome).await;
            done.cancel();
        });
        Ok(())
    }

    async fn run(
        &self,
        ctx: &RunContext,
        prompt: &str,
        resume: Option<String>,
    ) -> Result<DriveOutcome, SessionError> {
        let outcome = self.drive(ctx, prompt, resume).await?;
        match &outcome.result {
            Some(result) if result.is_context_overflow() => {
                Ok(self.compact_and_retry(ctx, prompt, outcome).await)
            }
            _ => Ok(outcome),
        }
    }

    /// Consume one stream to its end.
    async fn drive(
        &self,
        ctx: &RunContext,
        prompt: &str,
        resume: Option<String>,
    ) -> Result<DriveOutcome, SessionError> {
        let mut outcome = DriveOutcome {
            result: None,
            session_id: resume.clone(),
        };
        let mut stream = self
            .stream
            .open(StreamRequest {
                prompt: prompt.to_string(),
                working_dir: ctx.working_dir.clone(),
                resume_session_id: resume,
                cancel: ctx.cancel.clone(),
            })
            .await?;

        loop {
            let item = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(SessionError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            let message = item?;
            self.record_message(ctx, &message).await;

            match message {
                AgentMessage::Init { session_id, .. } => {
                    let stored = self.store.set_session_id(&ctx.execution_id, &session_id).await;
                    if let Err(e) = stored {
                        let id = ctx.execution_id.as_str();
                        warn!(execution_id = id, "Failed to store session id: {}", e);
                    }
                    outcome.session_id = Some(session_id);
                }
                AgentMessage::Result(result) => {
                    if let Some(session_id) = &result.session_id {
                        outcome.session_id = Some(session_id.clone());
                    }
                    outcome.result = Some(result);
                }
                AgentMessage::Content { .. } => {}
            }
        }
        Ok(outcome)
    }

    /// Compact the conversation and resubmit `prompt` once.
    async fn compact_and_retry(
        &self,
        ctx: &RunContext,
        prompt: &str,
        original: DriveOutcome,
    ) -> DriveOutcome {
        let id = ctx.execution_id.as_str();
        let Some(session_id) = original.session_id.clone() else {
            warn!(execution_id = id, "Context overflow without a session id; not retrying");
            return original;
        };

        info!(execution_id = id, "Context limit reached, compacting session");
        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.increment("session.compactions");
        self.log_system(id, "Context limit reached; compacting conversation and retrying")
            .await;
        if let Err(e) = self.store.update_execution_phase(id, "compacting").await {
            warn!(execution_id = id, "Failed to record compacting phase: {}", e);
        }
        notify(
            self.feedback.as_ref(),
            id,
            "The conversation exceeded the model's context window. Compacting and retrying your last message.",
        )
        .await;

        let compacted = match self.compact(ctx, session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(execution_id = id, "{}", e);
                self.log_system(id, &format!("Compaction failed: {}", e)).await;
                return original;
            }
        };

        if let Err(e) = self.store.update_execution_phase(id, "running").await {
            warn!(execution_id = id, "Failed to record running phase: {}", e);
        }
        let resume = compacted.session_id.or(original.session_id.clone());
        match self.drive(ctx, prompt, resume).await {
            Ok(retried) if retried.result.as_ref().is_some_and(|r| !r.is_error) => retried,
            Ok(retried) => {
                warn!(execution_id = id, "Retry after compaction did not succeed");
                self.log_system(
                    id,
                    &format!(
                        "Retry after compaction failed: {}",
                        retried
                            .result
                            .as_ref()
                            .map(ResultMessage::error_text)
                            .unwrap_or_else(|| "no result".to_string())
                    ),
                )
                .await;
                original
            }
            Err(e) => {
                warn!(execution_id = id, "Retry after compaction failed: {}", e);
                original
            }
        }
    }

    /// Run `/compact` on the session, polling until it finishes or times out.
    async fn compact(
        &self,
        ctx: &RunContext,
        session_id: String,
    ) -> Result<DriveOutcome, SessionError> {
        let compact_ctx = RunContext {
            cancel: ctx.cancel.child_token(),
            ..ctx.clone()
        };
        let manager = self.clone();
        let task_ctx = compact_ctx.clone();
        let handle = tokio::spawn(async move {
            manager
                .drive(&task_ctx, COMPACT_DIRECTIVE, Some(session_id))
                .await
        });

        let deadline = Instant::now() + self.config.compact_timeout();
        while !handle.is_finished() {
            if ctx.cancel.is_cancelled() {
                compact_ctx.cancel.cancel();
                return Err(SessionError::Cancelled);
            }
            if Instant::now() >= deadline {
                compact_ctx.cancel.cancel();
                handle.abort();
                return Err(SessionError::CompactFailed(format!(
                    "timed out after {:?}",
                    self.config.compact_timeout()
                )));
            }
            tokio::time::sleep(self.config.compact_poll()).await;
        }

        let outcome = handle
            .await
            .map_err(|e| SessionError::CompactFailed(e.to_string()))??;
        match &outcome.result {
            Some(result) if result.is_error => {
                Err(SessionError::CompactFailed(result.error_text()))
            }
            _ => Ok(outcome),
        }
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        generation: u64,
        outcome: Result<DriveOutcome, SessionError>,
    ) {
        let id = ctx.execution_id.as_str();
        let current = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(id) {
                Some(live) if live.generation == generation => {
                    sessions.remove(id);
                    true
                }
                Some(_) => false,
                None => true,
            }
        };
        if !current {
            debug!(execution_id = id, "Superseded session finished");
            return;
        }

        let (status, error, cancelled) = match outcome {
            Ok(DriveOutcome {
                result: Some(result),
                ..
            }) if !result.is_error => {
                if let Err(e) = self.store.record_completion(id, &result.metrics()).await {
                    warn!(execution_id = id, "Failed to record completion metrics: {}", e);
                }
                self.events.publish(ExecutionEvent::Completed {
                    execution_id: id.to_string(),
                    metrics: result.metrics(),
                });
                (ExecutionStatus::Completed, None, false)
            }
            Ok(DriveOutcome {
                result: Some(result),
                ..
            }) => (ExecutionStatus::Failed, Some(result.error_text()), false),
            Ok(DriveOutcome { result: None, .. }) => (
                ExecutionStatus::Failed,
                Some("Agent stream ended without a result".to_string()),
                false,
            ),
            Err(SessionError::Cancelled) => (ExecutionStatus::Cancelled, None, true),
            Err(e) => (ExecutionStatus::Failed, Some(e.to_string()), false),
        };

        info!(execution_id = id, status = %status, "Agent session finished");
        if let Some(error) = &error {
            self.log_system(id, &format!("Session failed: {}", error)).await;
            self.events.publish(ExecutionEvent::Failed {
                execution_id: id.to_string(),
                error: error.clone(),
            });
        }
        if let Err(e) = self
            .store
            .record_heartbeat(id, ctx.messages.load(Ordering::SeqCst))
            .await
        {
            debug!(execution_id = id, "Final heartbeat not recorded: {}", e);
        }
        if let Err(e) = self
            .store
            .update_execution_status(id, status, error.as_deref())
            .await
        {
            warn!(execution_id = id, "Failed to record session status: {}", e);
        }

        if let Some(tx) = &self.exit_tx {
            let _ = tx.send(ExecutionExit {
                execution_id: id.to_string(),
                exit_code: None,
                success: status == ExecutionStatus::Completed,
                cancelled,
            });
        }
    }

    async fn record_message(&self, ctx: &RunContext, message: &AgentMessage) {
        let id = ctx.execution_id.as_str();
        let payload = message.payload();
        let stream = message.log_stream();
        let content = match &payload {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };

        match self.store.append_execution_log(id, stream, &content).await {
            Ok(log_id) => {
                self.events.publish(ExecutionEvent::Log {
                    execution_id: id.to_string(),
                    log_id,
                    stream,
                    content,
                });
            }
            Err(e) => warn!(execution_id = id, "Failed to persist message: {}", e),
        }
        self.events.publish(ExecutionEvent::Message {
            execution_id: id.to_string(),
            kind: message.kind().to_string(),
            payload,
        });

        let count = ctx.messages.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.config.heartbeat_every.max(1);
        if count % every == 0 {
            if let Err(e) = self.store.record_heartbeat(id, count).await {
                warn!(execution_id = id, "Failed to record heartbeat: {}", e);
            }
            self.events.publish(ExecutionEvent::Heartbeat {
                execution_id: id.to_string(),
                message_count: count,
            });
        }
    }

    async fn log_system(&self, execution_id: &str, content: &str) {
        if let Err(e) = self
            .store
            .append_execution_log(execution_id, LogStream::System, content)
            .await
        {
            warn!(execution_id, "Failed to persist system log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::feedback::tests::RecordingSink;
    use crate::session::stream::{receiver_stream, MessageStream};
    use crate::types::AgentKind;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies to each prompt with a canned script of messages.
    #[derive(Default)]
    struct ScriptedStream {
        scripts: Mutex<HashMap<String, Vec<Vec<AgentMessage>>>>,
        requests: Mutex<Vec<(String, Option<String>)>>,
        hang: bool,
    }

    impl ScriptedStream {
        fn reply(self, prompt: &str, messages: Vec<AgentMessage>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .entry(prompt.to_string())
                .or_default()
                .push(messages);
            self
        }
    }

    #[async_trait]
    impl AgentStream for ScriptedStream {
        async fn open(&self, request: StreamRequest) -> Result<MessageStream, SessionError> {
            self.requests
                .lock()
                .unwrap()
                .push((request.prompt.clone(), request.resume_session_id.clone()));
            let messages = {
                let mut scripts = self.scripts.lock().unwrap();
                match scripts.get_mut(&request.prompt) {
                    Some(queue) if !queue.is_empty() => queue.remove(0),
                    _ => Vec::new(),
                }
            };
            let (tx, rx) = mpsc::channel(64);
            let hang = self.hang;
            let cancel = request.cancel.clone();
            tokio::spawn(async move {
                for message in messages {
                    let _ = tx.send(Ok(message)).await;
                }
                if hang {
                    cancel.cancelled().await;
                    let _ = tx.send(Err(SessionError::Cancelled)).await;
                }
            });
            Ok(receiver_stream(rx))
        }
    }

    fn init(session_id: &str) -> AgentMessage {
        AgentMessage::Init {
            session_id: session_id.to_string(),
            payload: serde_json::json!({"type": "system", "subtype": "init"}),
        }
    }

    fn text(body: &str) -> AgentMessage {
        AgentMessage::Content {
            kind: "assistant".to_string(),
            payload: serde_json::json!({"text": body}),
        }
    }

    fn result(is_error: bool, text: &str) -> AgentMessage {
        AgentMessage::Result(ResultMessage {
            is_error,
            result: Some(text.to_string()),
            num_turns: Some(2),
            total_cost_usd: Some(0.5),
            duration_ms: Some(1000),
            ..Default::default()
        })
    }

    async fn fixture(
        stream: ScriptedStream,
        heartbeat_every: u64,
    ) -> (
        SessionManager,
        Store,
        Arc<ScriptedStream>,
        Arc<RecordingSink>,
        mpsc::UnboundedReceiver<ExecutionExit>,
    ) {
        let store = Store::open_in_memory().unwrap();
        store.create_execution("E1", AgentKind::Claude, "p").await.unwrap();
        let stream = Arc::new(stream);
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            heartbeat_every,
            compact_timeout_secs: 5,
            compact_poll_ms: 10,
        };
        let events = EventBus::new();
        let manager =
            SessionManager::new(config, stream.clone(), store.clone(), events, sink.clone())
                .with_exit_notifier(tx);
        (manager, store, stream, sink, rx)
    }

    #[tokio::test]
    async fn test_successful_session_records_metrics() {
        let script = ScriptedStream::default().reply(
            "build it",
            vec![init("s-1"), text("a"), text("b"), result(false, "done")],
        );
        let (manager, store, _stream, _sink, mut rx) = fixture(script, 2).await;

        manager
            .start_execution("E1", "build it", Path::new("."))
            .await
            .unwrap();
        let exit = rx.recv().await.unwrap();
        assert!(exit.success);

        let exec = store.get_execution("E1").await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.session_id.as_deref(), Some("s-1"));
        assert_eq!(exec.turn_count, Some(2));
        assert_eq!(exec.message_count, 4);
        assert!(exec.heartbeat_at.is_some());

        let logs = store.list_execution_logs("E1", None, 100).await.unwrap();
        assert_eq!(logs[0].stream, LogStream::System);
        assert!(!manager.is_alive("E1").await);
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_no_live_session() {
        let script = ScriptedStream::default().reply("go", vec![result(false, "done")]);
        let (manager, _store, stream, _sink, mut rx) = fixture(script, 10).await;

        let err = manager
            .start_execution("missing", "go", Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Store(StoreError::ExecutionNotFound(_))), "{:?}", err);
        assert!(!manager.is_alive("missing").await);
        assert!(manager.live_ids().await.is_empty());
        assert!(stream.requests.lock().unwrap().is_empty());

        manager.start_execution("E1", "go", Path::new(".")).await.unwrap();
        assert!(rx.recv().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_context_overflow_compacts_and_retries() {
        let script = ScriptedStream::default()
            .reply("big task", vec![init("s-1"), result(true, "Prompt is too long")])
            .reply(COMPACT_DIRECTIVE, vec![result(false, "compacted")])
            .reply("big task", vec![text("ok"), result(false, "done")]);
        let (manager, store, stream, sink, mut rx) = fixture(script, 10).await;

        manager
            .start_execution("E1", "big task", Path::new("."))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().success);

        let requests = stream.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![
                ("big task".to_string(), None),
                (COMPACT_DIRECTIVE.to_string(), Some("s-1".to_string())),
                ("big task".to_string(), Some("s-1".to_string())),
            ]
        );
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        let exec = store.get_execution("E1").await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_compaction_surfaces_original_error() {
        let script = ScriptedStream::default()
            .reply("big task", vec![init("s-1"), result(true, "Prompt is too long")])
            .reply(COMPACT_DIRECTIVE, vec![result(true, "compaction broke")]);
        let (manager, store, stream, _sink, mut rx) = fixture(script, 10).await;

        manager
            .start_execution("E1", "big task", Path::new("."))
            .await
            .unwrap();
        assert!(!rx.recv().await.unwrap().success);

        // No resubmission after a failed compaction.
        assert_eq!(stream.requests.lock().unwrap().len(), 2);
        let exec = store.get_execution("E1").await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.error.as_deref(), Some("Prompt is too long"));
    }

    #[tokio::test]
    async fn test_send_message_resumes_stored_session() {
        let script = ScriptedStream::default()
            .reply("first", vec![init("s-7"), result(false, "ok")])
            .reply("follow up", vec![result(false, "ok again")]);
        let (manager, store, stream, _sink, mut rx) = fixture(script, 10).await;

        assert!(matches!(
            manager.send_message("E1", "follow up").await.unwrap_err(),
            SessionError::NoResumableSession(_)
        ));

        let dir = std::env::current_dir().unwrap();
        store.set_working_dir("E1", &dir).await.unwrap();
        manager.start_execution("E1", "first", &dir).await.unwrap();
        rx.recv().await.unwrap();

        manager.send_message("E1", "follow up").await.unwrap();
        assert!(rx.recv().await.unwrap().success);
        let requests = stream.requests.lock().unwrap().clone();
        assert_eq!(requests[1], ("follow up".to_string(), Some("s-7".to_string())));
    }

    #[tokio::test]
    async fn test_abort_cancels_session() {
        let script = ScriptedStream {
            hang: true,
            ..Default::default()
        }
        .reply("long", vec![init("s-1"), text("working")]);
        let (manager, store, _stream, _sink, mut rx) = fixture(script, 10).await;

        manager
            .start_execution("E1", "long", Path::new("."))
            .await
            .unwrap();
        assert!(manager.is_alive("E1").await);
        assert!(matches!(
            manager.send_message("E1", "more").await.unwrap_err(),
            SessionError::Busy(_)
        ));

        manager.abort("E1").await.unwrap();
        let exit = rx.recv().await.unwrap();
        assert!(exit.cancelled);
        assert_eq!(
            store.get_execution("E1").await.unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert!(matches!(
            manager.abort("E1").await.unwrap_err(),
            SessionError::NoSession(_)
        ));
    }
}
