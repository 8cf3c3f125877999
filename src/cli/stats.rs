use anyhow::Result;

use mnemograph::config::MnemoConfig;

/// Display store statistics in the terminal.
pub async fn stats(config: MnemoConfig, owner: Option<&str>) -> Result<()> {
    let engine = super::open_engine(config)?;
    let result = engine.stats(owner).await;
    engine.shutdown().await;
    let response = result?;

    match owner {
        Some(o) => println!("Memory Statistics ({o})"),
        None => println!("Memory Statistics"),
    }
    println!("{}", "=".repeat(40));
    println!("  Owners:              {}", response.owners);
    println!("  Memories:            {}", response.memories);
    println!("  With summary:        {}", response.summarized);
    println!();

    println!("Embeddings:");
    for (kind, count) in &response.embeddings_by_type {
        println!("  {:<12} {}", kind, count);
    }
    println!("  {:<12} {}", "(fallback)", response.fallback_embeddings);
    println!();

    println!("Relations:");
    for (kind, count) in &response.relations_by_type {
        println!("  {:<12} {}", kind, count);
    }
    println!();

    println!("Database size:         {} bytes", response.db_size_bytes);
    if let Some(ref oldest) = response.oldest_memory {
        println!("Oldest memory:         {oldest}");
    }
    if let Some(ref newest) = response.newest_memory {
        println!("Newest memory:         {newest}");
    }

    Ok(())
}
