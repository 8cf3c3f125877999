use anyhow::Result;

use mnemograph::config::MnemoConfig;

/// Run a search from the terminal.
pub async fn search(config: MnemoConfig, owner: &str, query: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let engine = super::open_engine(config)?;
    let result = engine.search(owner, query, limit).await;
    engine.shutdown().await;
    let response = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    if !response.degraded.is_empty() {
        eprintln!("note: degraded search, skipped {}", response.degraded.join(", "));
    }

    if response.results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    if let Some(answer) = &response.answer {
        println!("{answer}\n");
    }

    println!("Found {} result(s)\n", response.results.len());
    for (i, hit) in response.results.iter().enumerate() {
        let fmt = |s: Option<f64>| s.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".into());
        println!(
            "  {}. {} (score: {:.3}, keyword: {}, semantic: {})",
            i + 1,
            hit.id,
            hit.score,
            fmt(hit.keyword_score),
            fmt(hit.semantic_score),
        );
        if let Some(title) = &hit.title {
            println!("     {title}");
        }
        println!("     {}", hit.preview);
        if let Some(url) = &hit.url {
            println!("     {url}");
        }
        println!();
    }

    if !response.citations.is_empty() {
        println!("Citations:");
        for c in &response.citations {
            println!("  [{}] {}", c.position, c.memory_id);
        }
    }

    Ok(())
}
