//! Command-line interface
//!
//! Thin contracted shell around the engine: run/resume a command, inspect
//! sessions, probe MCP servers. Exit codes: 0 success, 1 partial,
//! 2 failure, 130 cancelled.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pw", about = "Pipeline execution engine for AI-assisted development workflows", version)]
pub struct Cli {
    /// Config file path (defaults to the lookup chain)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a command pipeline
    Run {
        /// Command name from the commands tree
        command: String,

        /// Command arguments as key=value pairs
        #[arg(long = "arg", value_parser = parse_key_val)]
        args: Vec<(String, String)>,

        /// Resume an interrupted session instead of starting fresh
        #[arg(long)]
        resume: Option<String>,
    },

    /// Resume an interrupted session (command and arguments come from the
    /// session itself)
    Resume {
        /// Session id
        id: String,
    },

    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsCommand,
    },

    /// External tool server utilities
    Mcp {
        #[command(subcommand)]
        action: McpCommand,
    },
}

#[derive(Subcommand)]
pub enum SessionsCommand {
    /// List recent sessions
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one session's event log
    Show { id: String },
    /// Search sessions by id, command, or arguments
    Search { query: String },
}

#[derive(Subcommand)]
pub enum McpCommand {
    /// Probe availability of every configured server
    Check,
    /// Revoke a cached approval
    Revoke { server_id: String },
}

/// Parse `key=value` CLI arguments
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid key=value argument: '{}'", s))
}
