// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent message streams.
//!
//! [`AgentStream`] is the seam between the session manager and whatever
//! produces typed agent messages. [`ClaudeCliStream`] runs the Claude CLI in
//! `stream-json` mode and parses its stdout line by line.

use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AgentCommandConfig;
use crate::error::SessionError;
use crate::process::signal;

use super::types::{parse_stream_line, AgentMessage, StreamRequest};

/// A finite stream of agent messages for one prompt.
pub type MessageStream = BoxStream<'static, Result<AgentMessage, SessionError>>;

/// Opens message-stream sessions.
#[async_trait]
pub trait AgentStream: Send + Sync {
    /// Start (or resume) a session and stream its messages until the
    /// terminal result. Cancelling `request.cancel` ends the stream.
    async fn open(&self, request: StreamRequest) -> Result<MessageStream, SessionError>;
}

/// Turn a channel receiver into a [`MessageStream`].
pub fn receiver_stream(
    rx: mpsc::Receiver<Result<AgentMessage, SessionError>>,
) -> MessageStream {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Runs the Claude CLI with `--output-format stream-json`.
pub struct ClaudeCliStream {
    config: AgentCommandConfig,
}

impl ClaudeCliStream {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }

    /// Arguments for one invocation.
    pub fn build_args(&self, request: &StreamRequest) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        match &self.config.prompt_flag {
            Some(flag) => {
                args.push(flag.clone());
                args.push(request.prompt.clone());
            }
            None => args.push(request.prompt.clone()),
        }
        args
    }
}

#[async_trait]
impl AgentStream for ClaudeCliStream {
    async fn open(&self, request: StreamRequest) -> Result<MessageStream, SessionError> {
        let args = self.build_args(&request);
        debug!(
            command = %self.config.command,
            resume = ?request.resume_session_id,
            "Opening agent stream"
        );

        let mut command = Command::new(&self.config.command);
        command
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| SessionError::Stream(format!("{}: {}", self.config.command, e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::Stream("agent stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::channel(256);
        let cancel = request.cancel.clone();

        if let Some(stderr) = stderr {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = AgentMessage::Content {
                        kind: "stderr".to_string(),
                        payload: serde_json::Value::String(line),
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
            });
        }

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut saw_result = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Some(pid) = child.id() {
                            signal::kill_group(pid);
                        }
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        let _ = tx.send(Err(SessionError::Cancelled)).await;
                        return;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(message) = parse_stream_line(&line) {
                                saw_result |= matches!(message, AgentMessage::Result(_));
                                if tx.send(Ok(message)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Error reading agent stream: {}", e);
                            break;
                        }
                    }
                }
            }

            match child.wait().await {
                Ok(status) if !status.success() && !saw_result => {
                    let _ = tx
                        .send(Err(SessionError::Stream(format!(
                            "agent exited with {} before reporting a result",
                            status
                        ))))
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx.send(Err(SessionError::Io(e))).await;
                }
            }
        });

        Ok(receiver_stream(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn request(prompt: &str, resume: Option<&str>) -> StreamRequest {
        StreamRequest {
            prompt: prompt.to_string(),
            working_dir: PathBuf::from("."),
            resume_session_id: resume.map(str::to_string),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_build_args_with_resume() {
        let defaults = AgentCommandConfig::defaults();
        let claude = ClaudeCliStream::new(defaults[&crate::types::AgentKind::Claude].clone());
        let args = claude.build_args(&request("fix it", Some("s-1")));
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "s-1");
        assert_eq!(args.last().map(String::as_str), Some("fix it"));
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_parses_cli_output() {
        // `sh -c <script>`: the prompt is the script.
        let config = AgentCommandConfig {
            command: "sh".to_string(),
            args: Vec::new(),
            prompt_flag: Some("-c".to_string()),
            continue_args: Vec::new(),
            sdk: true,
        };
        let script = r#"echo '{"type":"system","subtype":"init","session_id":"s-9"}'
echo '{"type":"assistant","message":{"content":"hi"}}'
echo '{"type":"result","subtype":"success","is_error":false,"num_turns":1}'"#;
        let stream = ClaudeCliStream::new(config)
            .open(request(script, None))
            .await
            .unwrap();
        let messages: Vec<_> = stream.collect().await;
        let messages: Vec<AgentMessage> = messages.into_iter().map(Result::unwrap).collect();
        assert_eq!(messages.len(), 3);
        assert!(matches!(
            &messages[0],
            AgentMessage::Init { session_id, .. } if session_id == "s-9"
        ));
        assert!(matches!(&messages[2], AgentMessage::Result(r) if !r.is_error));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let config = AgentCommandConfig {
            command: "sh".to_string(),
            args: Vec::new(),
            prompt_flag: Some("-c".to_string()),
            continue_args: Vec::new(),
            sdk: true,
        };
        let req = request("sleep 30", None);
        let cancel = req.cancel.clone();
        let mut stream = ClaudeCliStream::new(config).open(req).await.unwrap();
        cancel.cancel();
        let item = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(matches!(item, Some(Err(SessionError::Cancelled))));
    }
}
