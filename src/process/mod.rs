// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subprocess supervision for agent CLIs.

mod line_buffer;
pub mod signal;
mod supervisor;

pub use line_buffer::{truncate_line, LineBuffer, TRUNCATION_MARKER};
pub use supervisor::{ExecutionExit, ProcessSupervisor};
