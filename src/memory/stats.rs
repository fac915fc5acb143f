use std::collections::HashMap;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::error::Result;
use crate::memory::lifecycle;

/// Vault statistics snapshot.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_memories: u64,
    pub by_type: HashMap<String, u64>,
    pub by_status: HashMap<String, u64>,
    pub entities: u64,
    pub edges: u64,
    pub pending_embeddings: u64,
    pub failed_embeddings: u64,
    pub open_contradictions: u64,
    pub invariant_violations: u64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_memory: Option<String>,
}

/// Compute vault statistics. `db_path` is used for file size; pass None
/// for in-memory databases.
pub fn stats(conn: &Connection, db_path: Option<&Path>) -> Result<StatsResponse> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
    let by_type = group_counts(conn, "type", &["episodic", "semantic", "procedural", "consolidated"])?;
    let by_status = group_counts(
        conn,
        "status",
        &["active", "pending", "fulfilled", "superseded", "archived"],
    )?;

    let entities: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
    let edges: i64 = conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
    let pending_embeddings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE embed_state = 'pending'",
        [],
        |row| row.get(0),
    )?;
    let failed_embeddings: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE embed_state = 'failed'",
        [],
        |row| row.get(0),
    )?;

    let open_contradictions =
        crate::memory::consolidate::open_contradictions(conn, 1000)?.len() as u64;
    let invariant_violations = lifecycle::validate_invariants(conn)?.len() as u64;

    let (oldest, newest): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memories",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_memories: total as u64,
        by_type,
        by_status,
        entities: entities as u64,
        edges: edges as u64,
        pending_embeddings: pending_embeddings as u64,
        failed_embeddings: failed_embeddings as u64,
        open_contradictions,
        invariant_violations,
        db_size_bytes,
        oldest_memory: oldest,
        newest_memory: newest,
    })
}

fn group_counts(
    conn: &Connection,
    column: &str,
    keys: &[&str],
) -> Result<HashMap<String, u64>> {
    let mut map: HashMap<String, u64> = keys.iter().map(|k| (k.to_string(), 0)).collect();
    let sql = format!("SELECT {column}, COUNT(*) FROM memories GROUP BY {column}");
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (key, count) in rows {
        map.insert(key, count as u64);
    }
    Ok(map)
}
