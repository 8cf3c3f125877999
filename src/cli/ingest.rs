//! CLI `ingest` command: capture one memory and wait for its enrichment.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};

use mnemograph::config::MnemoConfig;
use mnemograph::memory::store::{IngestOutcome, NewMemory};
use mnemograph::memory::types::MemoryMetadata;

pub struct IngestArgs {
    pub owner: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub metadata: Option<PathBuf>,
    /// Content, or `-` for stdin.
    pub text: String,
}

pub async fn ingest(config: MnemoConfig, args: IngestArgs) -> Result<()> {
    let content = if args.text == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read content from stdin")?;
        buf
    } else {
        args.text
    };

    let metadata: MemoryMetadata = match &args.metadata {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid metadata JSON in {}", path.display()))?
        }
        None => MemoryMetadata::default(),
    };

    let engine = super::open_engine(config)?;
    let result = engine
        .ingest(
            &args.owner,
            NewMemory {
                content,
                url: args.url,
                title: args.title,
                metadata,
            },
        )
        .await;
    // Drains the queue, so the enrichment job finishes before exit.
    engine.shutdown().await;

    let receipt = result.map_err(|e| anyhow::anyhow!("ingest rejected ({}): {e}", e.reason()))?;
    match &receipt.outcome {
        IngestOutcome::Created { id } => println!("Created {id}"),
        IngestOutcome::Duplicate { id, reason } => println!("Duplicate of {id} ({reason})"),
    }
    if let Some(job_id) = &receipt.job_id {
        if let Some(status) = engine.job_status(job_id) {
            println!("Enrichment: {}", serde_json::to_string(&status.state)?);
        }
    }
    Ok(())
}
