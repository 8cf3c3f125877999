use anyhow::Result;

use mnemograph::config::MnemoConfig;

/// Attach a summary and wait for its embedding.
pub async fn summary(config: MnemoConfig, memory_id: &str, text: &str) -> Result<()> {
    let engine = super::open_engine(config)?;
    let result = engine.attach_summary(memory_id, text).await;
    engine.shutdown().await;

    let job_id = result?;
    println!("Summary attached to {memory_id}");
    if let Some(status) = job_id.and_then(|id| engine.job_status(&id)) {
        println!("Enrichment: {}", serde_json::to_string(&status.state)?);
    }
    Ok(())
}
