//! CLI `inspect` command: display one memory with its embeddings and edges.

use anyhow::Result;

use mnemograph::config::MnemoConfig;
use mnemograph::memory::{relations, store};

/// Inspect a single memory by ID and display full details.
pub fn inspect(config: &MnemoConfig, id: &str) -> Result<()> {
    let conn = mnemograph::db::open_database(config.resolved_db_path())?;

    let Some(m) = store::get_memory(&conn, id)? else {
        anyhow::bail!("memory not found: {id}");
    };
    let embeddings = store::embedding_types_for(&conn, id)?;
    let edges = relations::relations_for_memory(&conn, id)?;

    println!("Memory: {}", m.id);
    println!("{}", "=".repeat(50));
    println!("  Owner:          {}", m.owner_id);
    if let Some(ref title) = m.title {
        println!("  Title:          {title}");
    }
    if let Some(ref url) = m.url {
        println!("  URL:            {url}");
    }
    println!("  Confidence:     {:.2}", m.confidence);
    println!("  Access count:   {}", m.access_count);
    println!("  Created:        {}", m.created_at);
    println!("  Updated:        {}", m.updated_at);
    println!("  Hash:           {}", m.canonical_hash);
    let kinds: Vec<&str> = embeddings.iter().map(|e| e.as_str()).collect();
    println!("  Embeddings:     {}", if kinds.is_empty() { "none".to_string() } else { kinds.join(", ") });
    if m.metadata != Default::default() {
        println!("  Metadata:       {}", serde_json::to_string_pretty(&m.metadata)?);
    }
    println!();
    println!("Content:");
    println!("  {}", m.content);

    if let Some(ref summary) = m.summary {
        println!();
        println!("Summary:");
        println!("  {summary}");
    }

    if !edges.is_empty() {
        println!();
        println!("Relations:");
        for e in &edges {
            let other = if e.source_id == m.id { &e.target_id } else { &e.source_id };
            println!("  --[{} {:.3}]-- {}", e.relation_type, e.score, other);
        }
    }

    Ok(())
}
