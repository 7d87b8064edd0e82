// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Human-readable feedback sent back to a running agent.
//!
//! The engine hands control back to the agent by posting text to a local
//! message endpoint keyed by execution id: compaction notices, unexpected
//! exits and preview build errors. Preview errors go through an
//! [`ErrorBatcher`] so a burst of failing log lines becomes one message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FeedbackError;

/// Request timeout for feedback posts.
const FEEDBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Lines kept per batch; later lines are counted but not included.
const MAX_BATCH_LINES: usize = 40;

/// Delivers feedback text to an execution's agent.
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn send(&self, execution_id: &str, text: &str) -> Result<(), FeedbackError>;
}

#[derive(Serialize)]
struct FeedbackBody<'a> {
    message: &'a str,
}

/// Posts feedback as JSON to `<base_url>/<executionId>/message`.
///
/// A base URL containing `{execution_id}` is used as a template instead.
#[derive(Clone)]
pub struct HttpFeedback {
    client: Client,
    base_url: Option<String>,
}

impl HttpFeedback {
    pub fn new(base_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(FEEDBACK_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build feedback client ({}), using defaults", e);
                Client::new()
            });
        Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Endpoint for `execution_id`, if an endpoint is configured.
    pub fn url_for(&self, execution_id: &str) -> Option<String> {
        let base = self.base_url.as_deref()?;
        if base.contains("{execution_id}") {
            Some(base.replace("{execution_id}", execution_id))
        } else {
            Some(format!("{}/{}/message", base, execution_id))
        }
    }
}

#[async_trait]
impl FeedbackSink for HttpFeedback {
    async fn send(&self, execution_id: &str, text: &str) -> Result<(), FeedbackError> {
        let url = self.url_for(execution_id).ok_or(FeedbackError::NotConfigured)?;
        debug!(execution_id, "Posting {} bytes of feedback to {}", text.len(), url);

        let response = self
            .client
            .post(&url)
            .json(&FeedbackBody { message: text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedbackError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Send feedback, logging rather than propagating failures.
pub async fn notify(sink: &dyn FeedbackSink, execution_id: &str, text: &str) {
    match sink.send(execution_id, text).await {
        Ok(()) => info!(execution_id, "Sent feedback to agent"),
        Err(FeedbackError::NotConfigured) => {
            debug!(execution_id, "No feedback endpoint; dropping: {}", text)
        }
        Err(e) => warn!(execution_id, "Failed to send feedback: {}", e),
    }
}

#[derive(Default)]
struct PendingBatch {
    /// Ties the batch to the timer that was armed when it opened.
    generation: u64,
    source: String,
    lines: Vec<String>,
    overflow: usize,
}

/// Collects error lines per execution and flushes them as one message after
/// a fixed window measured from the first line.
#[derive(Clone)]
pub struct ErrorBatcher {
    sink: Arc<dyn FeedbackSink>,
    window: Duration,
    pending: Arc<Mutex<HashMap<String, PendingBatch>>>,
    generations: Arc<AtomicU64>,
}

impl ErrorBatcher {
    pub fn new(sink: Arc<dyn FeedbackSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue an error line. `source` names what produced it, e.g. the preview's ref.
    pub fn push(&self, execution_id: &str, source: &str, line: &str) {
        let opened = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let opened = !pending.contains_key(execution_id);
            let batch = pending.entry(execution_id.to_string()).or_default();
            if opened {
                batch.generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                batch.source = source.to_string();
            }
            let line = line.trim();
            // Consecutive repeats collapse into one line.
            if batch.lines.last().map(String::as_str) != Some(line) {
                if batch.lines.len() < MAX_BATCH_LINES {
                    batch.lines.push(line.to_string());
                } else {
                    batch.overflow += 1;
                }
            }
            opened.then_some(batch.generation)
        };

        if let Some(generation) = opened {
            let batcher = self.clone();
            let execution_id = execution_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(batcher.window).await;
                // A discarded batch may have been replaced by a newer one with its own timer.
                batcher.send_batch(&execution_id, Some(generation)).await;
            });
        }
    }

    /// Send whatever is queued for `execution_id` now.
    pub async fn flush(&self, execution_id: &str) {
        self.send_batch(execution_id, None).await;
    }

    async fn send_batch(&self, execution_id: &str, generation: Option<u64>) {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let superseded = matches!(
                (pending.get(execution_id), generation),
                (Some(batch), Some(generation)) if batch.generation != generation
            );
            if superseded {
                None
            } else {
                pending.remove(execution_id)
            }
        };
        if let Some(batch) = batch.filter(|b| !b.lines.is_empty()) {
            let text = format_errors(&batch.source, &batch.lines, batch.overflow);
            notify(self.sink.as_ref(), execution_id, &text).await;
        }
    }

    /// Drop anything queued for `execution_id` without sending.
    pub fn discard(&self, execution_id: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(execution_id);
    }

    pub fn pending_count(&self, execution_id: &str) -> usize {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.get(execution_id).map(|b| b.lines.len()).unwrap_or(0)
    }
}

/// Flatten error lines into a single message for the agent.
pub fn format_errors(source: &str, lines: &[String], overflow: usize) -> String {
    let mut text = format!(
        "The preview for {} reported {} error line{}:\n\n```\n",
        source,
        lines.len() + overflow,
        if lines.len() + overflow == 1 { "" } else { "s" }
    );
    for line in lines {
        text.push_str(line);
        text.push('\n');
    }
    if overflow > 0 {
        text.push_str(&format!("... ({} more)\n", overflow));
    }
    text.push_str("```\n\nPlease fix these errors.");
    text
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every message it is asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingSink(pub Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl FeedbackSink for RecordingSink {
        async fn send(&self, execution_id: &str, text: &str) -> Result<(), FeedbackError> {
            self.0
                .lock()
                .unwrap()
                .push((execution_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[test]
    fn test_url_for() {
        let feedback = HttpFeedback::new(Some("http://127.0.0.1:3000/api/executions/".into()));
        assert_eq!(
            feedback.url_for("E1").as_deref(),
            Some("http://127.0.0.1:3000/api/executions/E1/message")
        );
        let templated = HttpFeedback::new(Some("http://h/x/{execution_id}/reply".into()));
        assert_eq!(templated.url_for("E1").as_deref(), Some("http://h/x/E1/reply"));
        assert!(HttpFeedback::new(None).url_for("E1").is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_send_errors() {
        let err = HttpFeedback::new(None).send("E1", "hi").await.unwrap_err();
        assert!(matches!(err, FeedbackError::NotConfigured));
    }

    #[test]
    fn test_format_errors() {
        let text = format_errors("app", &["error TS2304: x".to_string()], 0);
        assert!(text.contains("1 error line:"));
        assert!(text.contains("error TS2304"));
        let text = format_errors("app", &["a".to_string()], 3);
        assert!(text.contains("4 error lines"));
        assert!(text.contains("(3 more)"));
    }

    #[tokio::test]
    async fn test_batcher_sends_one_message_per_window() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = ErrorBatcher::new(sink.clone(), Duration::from_millis(50));

        batcher.push("E1", "app", "Error: first");
        batcher.push("E1", "app", "Error: first");
        batcher.push("E1", "app", "Error: second");
        batcher.push("E2", "lib", "Error: other");
        assert_eq!(batcher.pending_count("E1"), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let sent = sink.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let e1 = sent.iter().find(|(id, _)| id == "E1").unwrap();
        assert!(e1.1.contains("Error: first"));
        assert!(e1.1.contains("Error: second"));
        assert_eq!(batcher.pending_count("E1"), 0);
    }

    #[tokio::test]
    async fn test_discard_drops_batch() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = ErrorBatcher::new(sink.clone(), Duration::from_millis(20));
        batcher.push("E1", "app", "Error: x");
        batcher.discard("E1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timer_of_discarded_batch_leaves_next_batch_alone() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = ErrorBatcher::new(sink.clone(), Duration::from_millis(300));
        batcher.push("E1", "app", "Error: stale");
        tokio::time::sleep(Duration::from_millis(150)).await;
        batcher.discard("E1");
        batcher.push("E1", "app", "Error: fresh");

        // The first timer has fired by now; the fresh batch is still waiting.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(batcher.pending_count("E1"), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let sent = sink.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Error: fresh"));
        assert!(!sent[0].1.contains("Error: stale"));
    }
}
