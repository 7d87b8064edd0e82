// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Preview dev servers started from an execution's mutated code.

pub mod detect;
mod health;
pub mod patterns;
mod ports;
mod runner;
mod supervisor;

pub use detect::{detect_project, resolve_command, Framework, PackageManager, ProjectInfo};
pub use health::HealthProber;
pub use ports::{is_port_free, PortAllocator};
pub use supervisor::{PreviewOptions, PreviewSupervisor};
