//! CLI `owner` commands.

use anyhow::Result;

use mnemograph::config::MnemoConfig;

pub async fn add(config: MnemoConfig, id: &str) -> Result<()> {
    let engine = super::open_engine(config)?;
    let created = engine.register_owner(id).await;
    engine.shutdown().await;

    if created? {
        println!("Registered owner '{}'", id.trim());
    } else {
        println!("Owner '{}' already exists", id.trim());
    }
    Ok(())
}

pub fn list(config: &MnemoConfig) -> Result<()> {
    let conn = mnemograph::db::open_database(config.resolved_db_path())?;
    let owners = mnemograph::memory::store::list_owners(&conn)?;
    if owners.is_empty() {
        println!("No owners registered. Add one with `mnemograph owner add <id>`.");
    }
    for owner in owners {
        println!("{owner}");
    }
    Ok(())
}
