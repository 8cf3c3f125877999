pub mod ingest;
pub mod inspect;
pub mod owner;
pub mod relations;
pub mod search;
pub mod stats;
pub mod summary;

use anyhow::{Context, Result};

use mnemograph::config::MnemoConfig;
use mnemograph::Engine;

/// Open the engine for a one-shot command.
pub fn open_engine(config: MnemoConfig) -> Result<Engine> {
    Engine::open(config).context("failed to open memory store")
}
