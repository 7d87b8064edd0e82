// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workbench main entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use workbench::config::{self, CliOptions};
use workbench::engine::{Engine, StartRequest};
use workbench::events::ExecutionEvent;
use workbench::telemetry::{init_telemetry, TelemetryConfig};
use workbench::types::{AgentKind, ExecutionStatus};
use workbench::workspace::RefPermissions;

/// Workbench - isolated workspaces and supervision for coding agents.
#[derive(Parser)]
#[command(name = "workbench")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON or YAML)
    #[arg(short, long, global = true, env = "WORKBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Workspace root holding refs/ and .execution/
    #[arg(short, long, global = true, env = "WORKBENCH_ROOT")]
    workspace: Option<PathBuf>,

    /// Feedback endpoint base URL
    #[arg(long, global = true)]
    feedback_url: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine's background tasks until Ctrl-C
    Serve,

    /// Write a default configuration file into the workspace root
    Init,

    /// Create an empty reference repository
    InitRef {
        /// Reference id
        id: String,
    },

    /// Start an execution and follow its output until it finishes
    Run {
        /// Agent kind (claude, codex, gemini, ...)
        #[arg(short, long, default_value = "claude")]
        agent: AgentKind,

        /// References the agent may read
        #[arg(long = "read", value_name = "ID")]
        read: Vec<String>,

        /// References the agent may modify
        #[arg(long = "mutate", value_name = "ID")]
        mutate: Vec<String>,

        /// References the agent creates
        #[arg(long = "create", value_name = "ID")]
        create: Vec<String>,

        /// Do not start preview dev servers
        #[arg(long)]
        no_preview: bool,

        /// Prompt for the agent
        prompt: String,
    },

    /// Print the resource and audit reports as JSON
    Status {
        /// Include change records of this execution
        execution: Option<String>,
    },

    /// Remove an execution's worktrees and directory
    Cleanup {
        /// Execution id
        execution: String,

        /// Keep the exec-<id> branches
        #[arg(long)]
        keep_branches: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(&TelemetryConfig::from_verbosity(cli.verbose))
        .context("failed to initialize logging")?;

    let cwd = std::env::current_dir()?;
    let options = CliOptions {
        workspace_root: cli.workspace.clone(),
        feedback_url: cli.feedback_url.clone(),
        ..Default::default()
    };

    if matches!(cli.command, Commands::Init) {
        let root = cli.workspace.unwrap_or(cwd);
        let path = config::init_config(&root)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config = config::load_config(cli.config.as_deref(), &cwd, options)?;
    let engine = Arc::new(Engine::new(config)?);

    match cli.command {
        Commands::Serve => serve(engine).await,
        Commands::Init => Ok(()),
        Commands::InitRef { id } => {
            let path = engine.refs().initialize_repo(&id).await?;
            println!("Initialized {} at {}", id, path.display());
            Ok(())
        }
        Commands::Run {
            agent,
            read,
            mutate,
            create,
            no_preview,
            prompt,
        } => {
            let permissions = RefPermissions { read, mutate, create };
            run(engine, agent, permissions, prompt, !no_preview).await
        }
        Commands::Status { execution } => {
            let report = serde_json::json!({
                "resources": engine.resource_report().await?,
                "audit": engine.audit_report(execution.as_deref()).await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Cleanup {
            execution,
            keep_branches,
        } => {
            let report = engine.teardown_workspace(&execution, keep_branches).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

async fn serve(engine: Arc<Engine>) -> anyhow::Result<()> {
    engine.recover().await?;
    let cancel = CancellationToken::new();
    let handles = engine.spawn_background_tasks(cancel.clone());
    info!(root = %engine.config().workspace_root.display(), "Engine running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    cancel.cancel();
    engine.shutdown().await;
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    Ok(())
}

async fn run(
    engine: Arc<Engine>,
    agent: AgentKind,
    permissions: RefPermissions,
    prompt: String,
    start_previews: bool,
) -> anyhow::Result<()> {
    let mut request = StartRequest::new(agent, prompt, permissions);
    request.start_previews = start_previews;
    let started = engine.start_execution(request).await?;
    let id = started.execution.id.clone();
    let mut events = engine.subscribe(&id);
    println!("Execution {} in {}", id, started.manifest.directories.root.display());
    for preview in &started.previews {
        println!("Preview {} for {}/{}", preview.id, preview.ref_type, preview.ref_id);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.stop_execution(&id).await?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event);
                    if event.is_final() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    // No exit listener runs here, so integrate directly.
    let execution = engine.get_execution(&id).await?;
    if execution.status == ExecutionStatus::Completed {
        let report = engine.process_changes(&id).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    println!("Execution {} {}", id, execution.status);

    engine.shutdown().await;
    Ok(())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::Log { content, .. } => println!("{}", content),
        ExecutionEvent::PreviewStatus { preview_id, status, port, error, .. } => {
            let port = port.map(|p| format!(" on port {}", p)).unwrap_or_default();
            let error = error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default();
            println!("[preview {}] {}{}{}", preview_id, status, port, error);
        }
        ExecutionEvent::Failed { error, .. } => eprintln!("Failed: {}", error),
        ExecutionEvent::Completed { metrics, .. } => {
            if let Some(cost) = metrics.cost_usd {
                println!("Completed (${:.4})", cost);
            }
        }
        _ => {}
    }
}
