//! SQLite bootstrap: sqlite-vec registration, connection pragmas, schema and
//! migrations.

pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

static SQLITE_VEC_INIT: Once = Once::new();

/// How long a writer waits on a locked database before failing the
/// statement (and the enrichment job retrying it).
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Register the sqlite-vec extension for every connection opened after this
/// call. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the store at `path`, creating parent directories, and
/// bring it to the current schema version.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    // WAL so search readers don't block on enrichment writes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    prepare(&conn)?;

    tracing::info!(
        path = %path.display(),
        sqlite_vec = %vec_version(&conn)?,
        schema = migrations::CURRENT_SCHEMA_VERSION,
        "database ready"
    );
    Ok(conn)
}

/// Open a private in-memory store at the current schema version.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    prepare(&conn)?;
    Ok(conn)
}

/// Version string of the loaded sqlite-vec extension.
pub fn vec_version(conn: &Connection) -> Result<String> {
    conn.query_row("SELECT vec_version()", [], |row| row.get(0))
        .context("sqlite-vec extension is not loaded")
}

fn prepare(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    schema::init_schema(conn).context("failed to initialize schema")?;
    migrations::run_migrations(conn).context("failed to run migrations")?;
    Ok(())
}
