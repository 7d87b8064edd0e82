// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages exchanged with a streaming agent session.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::{CompletionMetrics, LogStream};

/// Error texts that mean the conversation no longer fits the model.
const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "prompt is too long",
    "context length",
    "context_length_exceeded",
    "context window",
    "maximum context",
    "too many tokens",
    "input is too long",
];

/// What to open a session with.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub prompt: String,
    pub working_dir: PathBuf,
    /// Continue this session instead of starting a new one.
    pub resume_session_id: Option<String>,
    /// Cancelling this aborts the stream.
    pub cancel: CancellationToken,
}

/// One typed message from the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// `system/init`, carrying the id used to resume later.
    Init { session_id: String, payload: Value },
    /// Any intermediate message (assistant text, tool use, tool results).
    Content { kind: String, payload: Value },
    /// The terminal message of a turn.
    Result(ResultMessage),
}

impl AgentMessage {
    /// Short label used for events and logging.
    pub fn kind(&self) -> &str {
        match self {
            Self::Init { .. } => "system",
            Self::Content { kind, .. } => kind,
            Self::Result(_) => "result",
        }
    }

    /// How the message is classified when persisted as a log line.
    pub fn log_stream(&self) -> LogStream {
        match self {
            Self::Init { .. } => LogStream::System,
            Self::Content { kind, .. } if kind == "system" => LogStream::System,
            Self::Content { kind, .. } if kind == "stderr" || kind == "error" => LogStream::Stderr,
            Self::Content { .. } => LogStream::Stdout,
            Self::Result(result) if result.is_error => LogStream::Stderr,
            Self::Result(_) => LogStream::Stdout,
        }
    }

    /// JSON form of the message for logs and events.
    pub fn payload(&self) -> Value {
        match self {
            Self::Init { payload, .. } | Self::Content { payload, .. } => payload.clone(),
            Self::Result(result) => serde_json::to_value(result).unwrap_or(Value::Null),
        }
    }
}

/// Terminal `result` message with usage metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ResultMessage {
    pub fn metrics(&self) -> CompletionMetrics {
        CompletionMetrics {
            turn_count: self.num_turns,
            cost_usd: self.total_cost_usd,
            duration_ms: self.duration_ms,
        }
    }

    /// Best description of a failed result.
    pub fn error_text(&self) -> String {
        match (&self.result, &self.subtype) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(subtype)) => subtype.clone(),
            _ => "agent reported an error".to_string(),
        }
    }

    /// Whether this failure means the context window overflowed.
    pub fn is_context_overflow(&self) -> bool {
        self.is_error && is_context_overflow(&self.error_text())
    }
}

/// Whether `text` reports that the prompt or context exceeded the model's limit.
pub fn is_context_overflow(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    CONTEXT_OVERFLOW_MARKERS.iter().any(|m| lower.contains(m))
}

/// Parse one line of newline-delimited stream JSON.
///
/// Non-JSON lines become `Content { kind: "stdout" }` so nothing is lost.
pub fn parse_stream_line(line: &str) -> Option<AgentMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            return Some(AgentMessage::Content {
                kind: "stdout".to_string(),
                payload: Value::String(line.to_string()),
            })
        }
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let subtype = value.get("subtype").and_then(Value::as_str);

    match (kind.as_str(), subtype) {
        ("system", Some("init")) => {
            let session_id = value.get("session_id").and_then(Value::as_str)?;
            Some(AgentMessage::Init {
                session_id: session_id.to_string(),
                payload: value.clone(),
            })
        }
        ("result", _) => {
            let mut result: ResultMessage =
                serde_json::from_value(value.clone()).unwrap_or_default();
            if result.subtype.as_deref().is_some_and(|s| s.starts_with("error")) {
                result.is_error = true;
            }
            Some(AgentMessage::Result(result))
        }
        _ => Some(AgentMessage::Content {
            kind,
            payload: value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init() {
        let line = r#"{"type":"system","subtype":"init","session_id":"s-1","cwd":"/w"}"#;
        let msg = parse_stream_line(line).unwrap();
        match &msg {
            AgentMessage::Init { session_id, .. } => assert_eq!(session_id, "s-1"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(msg.log_stream(), LogStream::System);
    }

    #[test]
    fn test_parse_result() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"num_turns":4,
            "total_cost_usd":0.12,"duration_ms":9000,"result":"Done","session_id":"s-1"}"#
            .replace('\n', "");
        let AgentMessage::Result(result) = parse_stream_line(&line).unwrap() else {
            panic!("expected result");
        };
        assert!(!result.is_error);
        assert_eq!(
            result.metrics(),
            CompletionMetrics {
                turn_count: Some(4),
                cost_usd: Some(0.12),
                duration_ms: Some(9000),
            }
        );
    }

    #[test]
    fn test_error_subtype_marks_error() {
        let AgentMessage::Result(result) =
            parse_stream_line(r#"{"type":"result","subtype":"error_max_turns"}"#).unwrap()
        else {
            panic!("expected result");
        };
        assert!(result.is_error);
        assert_eq!(result.error_text(), "error_max_turns");
        assert!(!result.is_context_overflow());
    }

    #[test]
    fn test_context_overflow_detection() {
        assert!(is_context_overflow("Prompt is too long: 210000 tokens > 200000 maximum"));
        assert!(is_context_overflow("This model's maximum context length is 128000 tokens"));
        assert!(!is_context_overflow("rate limited"));

        let result = ResultMessage {
            is_error: true,
            result: Some("Prompt is too long".to_string()),
            ..Default::default()
        };
        assert!(result.is_context_overflow());
    }

    #[test]
    fn test_plain_text_and_content() {
        assert!(parse_stream_line("   ").is_none());
        let msg = parse_stream_line("not json").unwrap();
        assert_eq!(msg.kind(), "stdout");
        let msg = parse_stream_line(r#"{"type":"assistant","message":{}}"#).unwrap();
        assert_eq!(msg.kind(), "assistant");
        assert_eq!(msg.log_stream(), LogStream::Stdout);
    }
}
