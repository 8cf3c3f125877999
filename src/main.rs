mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mnemograph::config::MnemoConfig;

#[derive(Parser)]
#[command(name = "mnemograph", version, about = "Memory graph and hybrid search over captured text")]
struct Cli {
    /// Config file (default: ~/.mnemograph/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage owners
    Owner {
        #[command(subcommand)]
        action: OwnerAction,
    },
    /// Capture a memory and enrich it in the background
    Ingest {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        title: Option<String>,
        /// JSON file with metadata facets
        #[arg(long)]
        metadata: Option<PathBuf>,
        /// Content, or `-` to read stdin
        text: String,
    },
    /// Hybrid keyword + semantic search within one owner
    Search {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
        query: String,
    },
    /// Rebuild the relation graph of a memory's owner
    Rebuild { memory_id: String },
    /// Re-shape an owner's stored edges under the current config
    Prune {
        #[arg(long)]
        owner: String,
    },
    /// Attach a summary to a memory
    Summary { memory_id: String, text: String },
    /// Show a memory with its relations
    Inspect { memory_id: String },
    /// Show store statistics
    Stats {
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Subcommand)]
enum OwnerAction {
    /// Register an owner
    Add { id: String },
    /// List registered owners
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MnemoConfig::load_from(path)?,
        None => MnemoConfig::load()?,
    };

    // Log to stderr so stdout carries only command output.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Owner { action } => match action {
            OwnerAction::Add { id } => cli::owner::add(config, &id).await?,
            OwnerAction::List => cli::owner::list(&config)?,
        },
        Command::Ingest {
            owner,
            url,
            title,
            metadata,
            text,
        } => {
            let args = cli::ingest::IngestArgs {
                owner,
                url,
                title,
                metadata,
                text,
            };
            cli::ingest::ingest(config, args).await?;
        }
        Command::Search {
            owner,
            limit,
            json,
            query,
        } => cli::search::search(config, &owner, &query, limit, json).await?,
        Command::Rebuild { memory_id } => cli::relations::rebuild(config, &memory_id).await?,
        Command::Prune { owner } => cli::relations::prune(config, &owner).await?,
        Command::Summary { memory_id, text } => cli::summary::summary(config, &memory_id, &text).await?,
        Command::Inspect { memory_id } => cli::inspect::inspect(&config, &memory_id)?,
        Command::Stats { owner } => cli::stats::stats(config, owner.as_deref()).await?,
    }

    Ok(())
}
