//! SessionStore CLI - inspect session logs from the command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use sessionstore::SessionStore;

#[derive(Parser)]
#[command(name = "ss", about = "Inspect pipewright session logs", version)]
struct Cli {
    /// Store root directory
    #[arg(long, default_value = ".ai")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List recent sessions
    List {
        /// Maximum number of sessions to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one session's events
    Show {
        /// Session id
        id: String,
        /// Print raw JSON lines instead of a summary table
        #[arg(long)]
        json: bool,
    },
    /// Search sessions by id, command, or arguments
    Search { query: String },
    /// Rebuild the sidecar index from the log files
    Rebuild,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = SessionStore::open(&cli.root).context("Failed to open session store")?;

    match cli.command {
        Command::List { limit } => {
            for s in store.list_recent(limit) {
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
        Command::Show { id, json } => {
            let data = store.get(&id).context("Failed to read session")?;
            if json {
                for e in &data.events {
                    println!("{}", serde_json::to_string(&e)?);
                }
            } else {
                println!(
                    "session {}  command={}  state={}  events={}",
                    data.summary.id, data.summary.command, data.summary.state, data.summary.events
                );
                for e in &data.events {
                    let kind = e.event.get("type").and_then(|v| v.as_str()).unwrap_or("?");
                    let stage = e.event.get("stage").and_then(|v| v.as_str()).unwrap_or("-");
                    println!("{:>5}  {}  {:<20} {}", e.seq, e.timestamp.to_rfc3339(), kind, stage);
                }
            }
        }
        Command::Search { query } => {
            for s in store.search(&query) {
                println!("{}  {:<12} {}", s.id, s.command, s.state);
            }
        }
        Command::Rebuild => {
            let count = store.rebuild_index().context("Failed to rebuild index")?;
            println!("Rebuilt index for {} sessions", count);
        }
    }

    Ok(())
}
