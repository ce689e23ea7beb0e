//! `fleet`: serve the HTTP gateway, run tasks from the terminal, and manage checkpoints.

mod approval;
mod config;

use crate::approval::StdinApprovalHandler;
use crate::config::FleetConfig;
use clap::{Parser, Subcommand};
use fleet_agent::AgentRegistry;
use fleet_core::{ApprovalHandler, EventStream, RunContext, RunsWorkflow, Task};
use fleet_gateway::{AppState, AuthConfig, GatewayServer, HttpApprovalHandler};
use fleet_orchestrator::{
    frame_stream, ApprovalMode, CheckpointService, EngineBuilder, FileCheckpointService,
    WorkflowEngine, DONE_FRAME,
};
use fleet_session::{FileConversationStore, FileHistoryStore, SessionManager};
use futures_util::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet", about = "Fleet: multi-agent orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one task and print its SSE frames to stdout
    Run {
        task: String,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long)]
        workflow_id: Option<String>,
    },
    /// Continue a run from a saved checkpoint
    Resume { checkpoint_id: String },
    /// Inspect and prune saved checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// List configured agents
    Agents,
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, newest first
    List {
        #[arg(long)]
        workflow_id: Option<String>,
    },
    /// Delete one checkpoint
    Delete { checkpoint_id: String },
    /// Delete every checkpoint
    Clear,
}

/// Assemble the engine, persisting stores under `data_dir` when configured.
async fn build_engine(
    config: &FleetConfig,
    approvals: Option<Arc<dyn ApprovalHandler>>,
) -> anyhow::Result<WorkflowEngine> {
    let registry = AgentRegistry::from_configs(&config.agents)?;
    info!(agents = registry.len(), "Agents registered");

    let mut builder = EngineBuilder::new(config.engine.clone(), registry);
    if config.persist {
        builder = builder
            .conversations(Arc::new(
                FileConversationStore::new(config.data_dir.join("conversations")).await?,
            ))
            .history(Arc::new(
                FileHistoryStore::new(config.data_dir.join("history")).await?,
            ));
    }
    if let Some(handler) = approvals {
        builder = builder.approval_handler(handler);
    }
    Ok(builder.build().await?)
}

fn approval_timeout(config: &FleetConfig) -> Duration {
    Duration::from_secs(config.engine.approval.timeout_secs)
}

fn stdin_approvals(config: &FleetConfig) -> Option<Arc<dyn ApprovalHandler>> {
    (config.engine.approval.mode == ApprovalMode::Required).then(|| {
        Arc::new(StdinApprovalHandler::new(approval_timeout(config))) as Arc<dyn ApprovalHandler>
    })
}

/// Write every frame to stdout; Ctrl-C cancels the run and the stream still
/// ends with its terminal event.
async fn print_frames(events: EventStream, ctx: &RunContext) -> anyhow::Result<()> {
    let mut frames = Box::pin(frame_stream(events));
    let mut stdout = std::io::stdout();
    let mut interrupted = false;
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(workflow_id = %ctx.workflow_id, "Interrupted, cancelling run");
                ctx.cancellation.cancel();
                interrupted = true;
                continue;
            }
        };
        let Some(frame) = frame else { break };
        stdout.write_all(frame.as_bytes())?;
        stdout.flush()?;
        if frame == DONE_FRAME {
            break;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn checkpoint_dir(config: &FleetConfig) -> anyhow::Result<PathBuf> {
    match (&config.engine.checkpoint.dir, config.engine.checkpoint.enabled) {
        (Some(dir), true) => Ok(dir.clone()),
        _ => anyhow::bail!(
            "Checkpoints are not persisted; set persist = true or [engine.checkpoint] dir"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            let approvals = (config.engine.approval.mode == ApprovalMode::Required)
                .then(|| Arc::new(HttpApprovalHandler::new(approval_timeout(&config))));
            let engine = build_engine(
                &config,
                approvals
                    .clone()
                    .map(|handler| handler as Arc<dyn ApprovalHandler>),
            )
            .await?;
            let sessions = Arc::new(SessionManager::new(
                Arc::new(engine.clone()),
                config.engine.session.clone(),
            ));

            let auth = AuthConfig::new(config.security.api_keys.clone());
            if auth.is_enabled() {
                info!(keys = config.security.api_keys.len(), "API key auth enabled");
            }
            let app = GatewayServer::build_with_auth(
                AppState {
                    engine: engine.clone(),
                    sessions: sessions.clone(),
                    approvals,
                },
                auth,
            );

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!("Fleet gateway listening on {addr}");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            sessions
                .shutdown(Duration::from_secs(config.server.shutdown_grace_secs))
                .await;
            engine.drain_evaluations().await;
            info!("Fleet gateway stopped");
        }
        Commands::Run {
            task,
            conversation,
            workflow_id,
        } => {
            let engine = build_engine(&config, stdin_approvals(&config)).await?;
            let mut task = Task::new(task);
            task.conversation_id = conversation;
            let ctx = match workflow_id {
                Some(id) => RunContext::with_workflow_id(id),
                None => RunContext::new(),
            };
            let events = engine.run(task, ctx.clone()).await?;
            print_frames(events, &ctx).await?;
            engine.drain_evaluations().await;
        }
        Commands::Resume { checkpoint_id } => {
            let engine = build_engine(&config, stdin_approvals(&config)).await?;
            let ctx = RunContext::new();
            let events = engine.resume(&checkpoint_id, ctx.clone()).await?;
            print_frames(events, &ctx).await?;
            engine.drain_evaluations().await;
        }
        Commands::Checkpoints { action } => {
            let service = FileCheckpointService::new(checkpoint_dir(&config)?).await?;
            match action {
                CheckpointAction::List { workflow_id } => {
                    let checkpoints = service.list(workflow_id.as_deref()).await?;
                    if checkpoints.is_empty() {
                        println!("No checkpoints saved.");
                    }
                    for cp in &checkpoints {
                        println!(
                            "{}  round={} stalls={}  {}",
                            cp.checkpoint_id,
                            cp.current_round,
                            cp.stall_count,
                            cp.timestamp.to_rfc3339()
                        );
                    }
                }
                CheckpointAction::Delete { checkpoint_id } => {
                    service.delete(&checkpoint_id).await?;
                    println!("Deleted {checkpoint_id}");
                }
                CheckpointAction::Clear => {
                    service.clear().await?;
                    println!("All checkpoints cleared");
                }
            }
        }
        Commands::Agents => {
            println!("Configured agents:");
            for agent in &config.agents {
                println!("  {} ({}): {}", agent.name, agent.role, agent.description);
            }
            println!("\nTotal: {} agent(s)", config.agents.len());
        }
    }

    Ok(())
}
