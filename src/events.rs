// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-execution event topics.
//!
//! Each execution gets its own `broadcast` channel, created lazily by the
//! first subscriber or publisher. Events for one execution are delivered in
//! the order they were published; there is no ordering across executions.
//! Topics without receivers are dropped by [`EventBus::prune`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{CompletionMetrics, LogStream, PreviewStatus};

/// Buffered events per topic before slow receivers start lagging.
const TOPIC_CAPACITY: usize = 1024;

/// Something that happened to an execution.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A persisted output line.
    Log {
        execution_id: String,
        log_id: i64,
        stream: LogStream,
        content: String,
    },
    /// A structured message from an SDK session.
    Message {
        execution_id: String,
        kind: String,
        payload: serde_json::Value,
    },
    ProcessExited {
        execution_id: String,
        exit_code: Option<i32>,
        success: bool,
    },
    Completed {
        execution_id: String,
        metrics: CompletionMetrics,
    },
    Failed {
        execution_id: String,
        error: String,
    },
    PreviewStatus {
        execution_id: String,
        preview_id: String,
        status: PreviewStatus,
        port: Option<u16>,
        error: Option<String>,
    },
    /// A dev-server output line.
    PreviewLog {
        execution_id: String,
        preview_id: String,
        stream: LogStream,
        content: String,
    },
    Heartbeat {
        execution_id: String,
        message_count: u64,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Log { execution_id, .. }
            | Self::Message { execution_id, .. }
            | Self::ProcessExited { execution_id, .. }
            | Self::Completed { execution_id, .. }
            | Self::Failed { execution_id, .. }
            | Self::PreviewStatus { execution_id, .. }
            | Self::PreviewLog { execution_id, .. }
            | Self::Heartbeat { execution_id, .. } => execution_id,
        }
    }

    /// Whether no further events are expected for this run of the agent.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Typed publish/subscribe hub keyed by execution id. Cheap to clone.
#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<ExecutionEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published for `execution_id` from now on.
    ///
    /// Dropping the receiver ends the subscription.
    pub fn subscribe(&self, execution_id: &str) -> broadcast::Receiver<ExecutionEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(execution_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe()
    }

    /// Publish to the event's execution topic. Returns the number of
    /// receivers that saw it.
    pub fn publish(&self, event: ExecutionEvent) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        match topics.get(event.execution_id()) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => {
                trace!(execution_id = %event.execution_id(), "No subscribers for event");
                0
            }
        }
    }

    pub fn subscriber_count(&self, execution_id: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .get(execution_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop topics that no longer have receivers. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let before = topics.len();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        before - topics.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(id: &str, error: &str) -> ExecutionEvent {
        ExecutionEvent::Failed {
            execution_id: id.to_string(),
            error: error.to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_order_per_execution() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("E1");

        for i in 0..3 {
            bus.publish(ExecutionEvent::Heartbeat {
                execution_id: "E1".to_string(),
                message_count: i,
            });
        }
        bus.publish(failed("E2", "elsewhere"));
        bus.publish(failed("E1", "boom"));

        for expected in 0..3 {
            match rx.recv().await.unwrap() {
                ExecutionEvent::Heartbeat { message_count, .. } => {
                    assert_eq!(message_count, expected)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        let last = rx.recv().await.unwrap();
        assert!(last.is_final());
        assert_eq!(last.execution_id(), "E1");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(failed("E1", "x")), 0);
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn test_prune_drops_dead_topics() {
        let bus = EventBus::new();
        let rx = bus.subscribe("E1");
        let _keep = bus.subscribe("E2");
        assert_eq!(bus.subscriber_count("E1"), 1);

        drop(rx);
        assert_eq!(bus.prune(), 1);
        assert_eq!(bus.topic_count(), 1);
        assert_eq!(bus.subscriber_count("E2"), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(failed("E1", "boom")).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["execution_id"], "E1");
    }
}
