//! CLI `rebuild` and `prune` commands for the relation graph.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use mnemograph::config::MnemoConfig;
use mnemograph::memory::relations::RebuildReport;

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} {msg} ({elapsed})")
            .expect("valid template"),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn print_report(action: &str, report: &RebuildReport) {
    println!("{action} graph for owner '{}'", report.owner_id);
    println!("  Nodes:       {}", report.nodes);
    println!("  Candidates:  {}", report.candidates);
    println!("  Edges kept:  {}", report.edges);
}

/// Rebuild the graph of the owner of `memory_id`.
pub async fn rebuild(config: MnemoConfig, memory_id: &str) -> Result<()> {
    let engine = super::open_engine(config)?;
    let pb = spinner("scoring and shaping relations");
    let result = engine.rebuild_relations(memory_id).await;
    pb.finish_and_clear();
    engine.shutdown().await;

    print_report("Rebuilt", &result?);
    Ok(())
}

/// Re-shape an owner's stored edges without re-scoring.
pub async fn prune(config: MnemoConfig, owner: &str) -> Result<()> {
    let engine = super::open_engine(config)?;
    let result = engine.prune_owner_graph(owner).await;
    engine.shutdown().await;

    print_report("Pruned", &result?);
    Ok(())
}
