// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message-stream agent sessions with compact-and-retry recovery.

mod manager;
mod stream;
mod types;

pub use manager::{SessionManager, COMPACT_DIRECTIVE};
pub use stream::{receiver_stream, AgentStream, ClaudeCliStream, MessageStream};
pub use types::{is_context_overflow, parse_stream_line, AgentMessage, ResultMessage, StreamRequest};
