//! Pipewright - pipeline execution engine
//!
//! CLI entry point: composition root for the registries, session store,
//! event bus, provider, and orchestrator.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info};

use pipewright::cancel::cancel_pair;
use pipewright::cli::{Cli, Command, McpCommand, SessionsCommand};
use pipewright::config::Config;
use pipewright::events::{EventKind, create_event_bus};
use pipewright::llm::create_provider;
use pipewright::mcp::{McpApprovalCache, McpClientManager};
use pipewright::orchestrator::{Orchestrator, RunOptions};
use pipewright::registry::{AgentRegistry, PromptRegistry};
use pipewright::session::SessionManager;

fn setup_logging(cli_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pipewright")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level = match cli_log_level.map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some(other) => {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", other);
            tracing::Level::INFO
        }
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("pipewright.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref())?;
    let sessions = SessionManager::spawn(&config.storage.root).context("Failed to open session store")?;

    match cli.command {
        Command::Run { command, args, resume } => {
            let mut arg_map = Map::new();
            for (key, value) in args {
                arg_map.insert(key, Value::String(value));
            }
            let exit = run_command(config, sessions, &command, arg_map, resume).await?;
            std::process::exit(exit);
        }

        Command::Resume { id } => {
            let data = sessions.get(&id).await.context("Failed to read session")?;
            let args = data
                .summary
                .args
                .as_object()
                .cloned()
                .unwrap_or_default();
            let command = data.summary.command.clone();
            let exit = run_command(config, sessions, &command, args, Some(id)).await?;
            std::process::exit(exit);
        }

        Command::Sessions { action } => match action {
            SessionsCommand::List { limit } => {
                for s in sessions.list_recent(limit).await? {
                    println!(
                        "{}  {:<12} {:<9} {:>5} events  {}",
                        s.id,
                        s.command,
                        s.state.to_string(),
                        s.events,
                        s.created_at.to_rfc3339()
                    );
                }
            }
            SessionsCommand::Show { id } => {
                for event in sessions.get_events(&id).await? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            SessionsCommand::Search { query } => {
                for s in sessions.search(&query).await? {
                    println!("{}  {:<12} {}", s.id, s.command, s.state);
                }
            }
        },

        Command::Mcp { action } => {
            let manager = McpClientManager::new(
                config.mcp_servers.clone(),
                McpApprovalCache::new(&config.storage.approvals_file),
                None,
            );
            match action {
                McpCommand::Check => {
                    let mut results: Vec<_> = manager.check_all().await.into_iter().collect();
                    results.sort_by(|a, b| a.0.cmp(&b.0));
                    for (server, availability) in results {
                        println!("{:<24} {}", server, availability);
                    }
                }
                McpCommand::Revoke { server_id } => {
                    manager.revoke(&server_id).await?;
                    println!("Revoked approval for {}", server_id);
                }
            }
        }
    }

    Ok(())
}

async fn run_command(
    config: Config,
    sessions: SessionManager,
    command: &str,
    args: Map<String, Value>,
    resume: Option<String>,
) -> Result<i32> {
    let prompts = Arc::new(
        PromptRegistry::load(&config.storage.registry_root).context("Failed to load prompt registry")?,
    );
    let agents = if config.storage.agents_file.exists() {
        Arc::new(AgentRegistry::load(&config.storage.agents_file).context("Failed to load agent registry")?)
    } else {
        debug!("no agent registry document; escalation rebinding disabled");
        Arc::new(AgentRegistry::from_capabilities([]))
    };
    let provider = create_provider(&config.llm)?;
    let mcp = Arc::new(McpClientManager::new(
        config.mcp_servers.clone(),
        McpApprovalCache::new(&config.storage.approvals_file),
        None,
    ));
    let bus = create_event_bus();

    // Minimal observer: mirror stage progress to stderr so a headless run
    // is not silent. Richer observers (activity feed, TUI) subscribe the
    // same way.
    let mut feed = bus.subscribe_filtered([
        EventKind::StageStart,
        EventKind::StageComplete,
        EventKind::StageError,
        EventKind::PipelineError,
    ]);
    tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            let stage = event.stage.as_deref().unwrap_or("-");
            eprintln!("[{}] {} {}", event.timestamp.format("%H:%M:%S"), event.kind().as_str(), stage);
        }
    });

    let orchestrator = Orchestrator::new(config, prompts, agents, provider, mcp, sessions, bus);

    let (cancel_handle, cancel_token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling run...");
            cancel_handle.cancel();
        }
    });

    let result = orchestrator
        .run(
            command,
            args,
            RunOptions {
                resume,
                cancel: cancel_token,
                ..Default::default()
            },
        )
        .await?;

    println!("session {}  outcome {}", result.session_id, result.outcome);
    Ok(result.outcome.exit_code())
}
