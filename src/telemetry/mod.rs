// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry, tracing, and metrics infrastructure.
//!
//! - **Tracing**: structured logging via `tracing`, with `#[instrument]` on
//!   public async entry points when the `telemetry` feature is enabled.
//! - **Metrics**: named operation timings and counters in [`GLOBAL_METRICS`].
//!   Every version-control call lands here as `git.<operation>`.
//!
//! ```rust,ignore
//! use workbench::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```

mod init;
pub mod metrics;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{
    Metrics, MetricsSnapshot, OperationMetrics, OperationSnapshot, GLOBAL_METRICS,
};
