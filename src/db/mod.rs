pub mod migrations;
pub mod schema;

use crate::error::{EngramError, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) a vault database at the given path, with extensions
/// loaded, schema initialized, migrations applied, and the single-writer
/// lock held.
///
/// The connection runs in WAL mode with `locking_mode = EXCLUSIVE`; the
/// write lock is probed eagerly so a second writer on the same file fails
/// here with [`EngramError::Unavailable`] instead of on its first write.
/// The lock dies with the process, so crash-then-reopen works.
pub fn open_database(path: impl AsRef<Path>, dimensions: usize, owner: &str) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path).map_err(|e| {
        EngramError::Unavailable(format!("failed to open vault at {}: {e}", path.display()))
    })?;

    // WAL for crash safety, exclusive locking for single-writer detection:
    // the lock is held for the lifetime of this connection and dies with
    // the process. Any busy/locked failure here means another writer owns
    // the file.
    let configure = || -> rusqlite::Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _lock_probe (k INTEGER); DROP TABLE _lock_probe;",
        )
    };
    if let Err(e) = configure() {
        return Err(EngramError::Unavailable(format!(
            "vault at {} is held by another writer or unreadable: {e}",
            path.display()
        )));
    }

    schema::init_schema(&conn, dimensions)?;
    migrations::run_migrations(&conn)?;

    check_dimensions(&conn, dimensions)?;
    if migrations::get_meta(&conn, "owner")?.is_none() {
        migrations::set_meta(&conn, "owner", owner)?;
    }

    // Quick integrity check after schema init
    let integrity: String = conn.pragma_query_value(None, "quick_check", |row| row.get(0))?;
    if integrity != "ok" {
        return Err(EngramError::Corrupt(format!(
            "database integrity check failed: {integrity}"
        )));
    }

    tracing::info!(path = %path.display(), dimensions, "vault database initialized");
    Ok(conn)
}

/// The embedding dimensionality is fixed at vault creation; a mismatch on
/// reopen is a different vault, not a config knob.
fn check_dimensions(conn: &Connection, dimensions: usize) -> Result<()> {
    match migrations::get_meta(conn, "embedding_dimensions")? {
        Some(stored) => {
            let stored: usize = stored.parse().unwrap_or(0);
            if stored != dimensions {
                return Err(EngramError::Unavailable(format!(
                    "vault was created with {stored} embedding dimensions, \
                     configured {dimensions}; re-embedding into a new vault is required"
                )));
            }
        }
        None => {
            migrations::set_meta(conn, "embedding_dimensions", &dimensions.to_string())?;
        }
    }
    Ok(())
}

/// Result of a full database health check.
#[derive(Debug, serde::Serialize)]
pub struct HealthReport {
    pub schema_version: u32,
    pub owner: Option<String>,
    pub embedding_dimensions: Option<String>,
    pub integrity_ok: bool,
    pub sqlite_vec_version: String,
    pub memory_count: i64,
    pub entity_count: i64,
    pub edge_count: i64,
}

/// Run a comprehensive health check on the database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version = migrations::get_schema_version(conn)?;
    let owner = migrations::get_meta(conn, "owner")?;
    let embedding_dimensions = migrations::get_meta(conn, "embedding_dimensions")?;

    let integrity: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    let integrity_ok = integrity == "ok";

    let sqlite_vec_version: String =
        conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;

    let memory_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))
        .unwrap_or(0);
    let entity_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
        .unwrap_or(0);
    let edge_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(HealthReport {
        schema_version,
        owner,
        embedding_dimensions,
        integrity_ok,
        sqlite_vec_version,
        memory_count,
        entity_count,
        edge_count,
    })
}

/// Open an in-memory database for testing.
pub fn open_memory_database(dimensions: usize) -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn, dimensions)?;
    migrations::run_migrations(&conn)?;
    migrations::set_meta(&conn, "embedding_dimensions", &dimensions.to_string())?;
    Ok(conn)
}
