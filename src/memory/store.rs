//! Write path and typed queries — the only module that touches the on-disk
//! format.
//!
//! [`insert`] runs the full write pipeline inside a transaction: memory row,
//! FTS5 sync, per-entity upserts, entity-shared edge synthesis, temporal
//! chaining, and an audit log entry. The row is discoverable by entity and
//! full-text before its embedding arrives; [`update_embedding`] registers
//! the vector later. Mutations after creation are limited to reinforcement,
//! supersession, access stamping, decay, and archival — content is never
//! edited in place.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{EngramError, Result};
use crate::memory::types::{
    EmbedState, Entity, Memory, MemoryStatus, MemoryType, Source, SourceKind,
};

/// Parameters for a new memory row.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
    pub salience: f64,
    /// (normalized, display) pairs from extraction plus caller-supplied.
    pub entities: Vec<(String, String)>,
    pub topics: Vec<String>,
    pub source: Source,
    /// Defaults to the commit instant.
    pub valid_from: Option<String>,
    pub needs_review: bool,
    /// Explicit id; normally absent (a UUID v7 is generated).
    pub id: Option<String>,
}

/// Full write path. Atomically commits the memory row, entity upserts,
/// initial entity-shared edges (capped per entity to avoid quadratic
/// blow-up on hub entities), and the temporal session chain.
pub fn insert(conn: &mut Connection, new: &NewMemory, entity_edge_cap: usize) -> Result<String> {
    if new.content.trim().is_empty() {
        return Err(EngramError::InvalidPayload("content must not be empty".into()));
    }
    if !(0.0..=1.0).contains(&new.salience) {
        return Err(EngramError::InvalidPayload(format!(
            "salience {} out of range [0, 1]",
            new.salience
        )));
    }

    let id = new
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    let now = chrono::Utc::now().to_rfc3339();
    let valid_from = new.valid_from.clone().unwrap_or_else(|| now.clone());

    let tx = conn.transaction()?;

    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        return Err(EngramError::Conflict(format!("memory id already exists: {id}")));
    }

    let rowid = insert_row(&tx, &id, new, &now, &valid_from)?;
    insert_fts(&tx, rowid, &new.content, &id)?;
    upsert_entities(&tx, &id, &new.entities, &now)?;
    insert_topics(&tx, &id, &new.topics)?;
    synthesize_entity_edges(&tx, &id, &new.entities, entity_edge_cap, &now)?;
    chain_session(&tx, &id, new.source.session.as_deref(), &now)?;

    write_audit_log(&tx, "create", &id, None)?;
    tx.commit()?;

    Ok(id)
}

fn insert_row(
    tx: &Transaction,
    id: &str,
    new: &NewMemory,
    now: &str,
    valid_from: &str,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO memories (id, content, type, status, salience, source_kind, source_ref, \
         source_session, created_at, valid_from, valid_until, last_accessed_at, \
         reinforcement_count, superseded_by, embed_state, needs_review) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, 0, NULL, 'pending', ?11)",
        params![
            id,
            new.content,
            new.memory_type.as_str(),
            new.status.as_str(),
            new.salience,
            new.source.kind.as_str(),
            new.source.reference,
            new.source.session,
            now,
            valid_from,
            new.needs_review as i64,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Sync the FTS5 index after inserting into the memories table.
fn insert_fts(tx: &Transaction, rowid: i64, content: &str, id: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO memories_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
        params![rowid, content, id],
    )?;
    Ok(())
}

fn upsert_entities(
    tx: &Transaction,
    memory_id: &str,
    entities: &[(String, String)],
    now: &str,
) -> Result<()> {
    for (norm, display) in entities {
        tx.execute(
            "INSERT INTO entities (name, display_name, entity_type, created_at, memory_count, last_seen) \
             VALUES (?1, ?2, NULL, ?3, 1, ?3) \
             ON CONFLICT(name) DO UPDATE SET memory_count = memory_count + 1, last_seen = ?3",
            params![norm, display, now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO memory_entities (memory_id, entity) VALUES (?1, ?2)",
            params![memory_id, norm],
        )?;
    }
    Ok(())
}

fn insert_topics(tx: &Transaction, memory_id: &str, topics: &[String]) -> Result<()> {
    for topic in topics {
        tx.execute(
            "INSERT OR IGNORE INTO memory_topics (memory_id, topic) VALUES (?1, ?2)",
            params![memory_id, topic],
        )?;
    }
    Ok(())
}

/// Create entity-shared edges to the most recent memories referencing each
/// shared entity, capped per entity. Edges go both ways so spreading
/// activation can reach the new memory from older seeds; weight is the
/// shared-entity Jaccard of the two entity sets.
fn synthesize_entity_edges(
    tx: &Transaction,
    memory_id: &str,
    entities: &[(String, String)],
    cap: usize,
    now: &str,
) -> Result<()> {
    if entities.is_empty() {
        return Ok(());
    }
    let my_set: Vec<String> = entities.iter().map(|(n, _)| n.clone()).collect();

    let mut neighbors: HashSet<String> = HashSet::new();
    for (norm, _) in entities {
        let mut stmt = tx.prepare(
            "SELECT me.memory_id FROM memory_entities me \
             JOIN memories m ON m.id = me.memory_id \
             WHERE me.entity = ?1 AND me.memory_id != ?2 AND m.status != 'archived' \
             ORDER BY m.created_at DESC LIMIT ?3",
        )?;
        let ids = stmt
            .query_map(params![norm, memory_id, cap as i64], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        neighbors.extend(ids);
    }

    for other_id in neighbors {
        let other_set = entity_names_for(tx, &other_id)?;
        let weight = crate::memory::jaccard(&my_set, &other_set).clamp(0.0, 1.0);
        if weight <= 0.0 {
            continue;
        }
        tx.execute(
            "INSERT OR IGNORE INTO edges (src_id, dst_id, kind, weight, created_at) \
             VALUES (?1, ?2, 'entity-shared', ?3, ?4)",
            params![memory_id, other_id, weight, now],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO edges (src_id, dst_id, kind, weight, created_at) \
             VALUES (?1, ?2, 'entity-shared', ?3, ?4)",
            params![other_id, memory_id, weight, now],
        )?;
    }
    Ok(())
}

/// Chronologically adjacent memories in the same session chain receive a
/// weak forward edge.
fn chain_session(
    tx: &Transaction,
    memory_id: &str,
    session: Option<&str>,
    now: &str,
) -> Result<()> {
    let Some(session) = session else {
        return Ok(());
    };
    let prev: Option<String> = tx
        .query_row(
            "SELECT id FROM memories WHERE source_session = ?1 AND id != ?2 \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![session, memory_id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(prev) = prev {
        tx.execute(
            "INSERT OR IGNORE INTO edges (src_id, dst_id, kind, weight, created_at) \
             VALUES (?1, ?2, 'temporal-next', 1.0, ?3)",
            params![prev, memory_id, now],
        )?;
    }
    Ok(())
}

/// Entity names referenced by a memory, inside an open transaction.
fn entity_names_for(tx: &Transaction, memory_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        tx.prepare("SELECT entity FROM memory_entities WHERE memory_id = ?1")?;
    let names = stmt
        .query_map(params![memory_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

// ── Embedding registration ───────────────────────────────────────────────────

/// Set the embedding and register it with the vector index in the same
/// transaction. Idempotent on equal vectors. Rejects dimensionality
/// mismatches against the vault's fixed dimensionality.
pub fn update_embedding(conn: &mut Connection, id: &str, embedding: &[f32]) -> Result<()> {
    let dims = vault_dimensions(conn)?;
    if embedding.len() != dims {
        return Err(EngramError::InvalidPayload(format!(
            "embedding has {} dimensions, vault is fixed at {dims}",
            embedding.len()
        )));
    }

    let tx = conn.transaction()?;
    let exists: bool = tx.query_row(
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(EngramError::NotFound(format!("memory not found: {id}")));
    }

    tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![id])?;
    tx.execute(
        "INSERT INTO memories_vec (id, embedding) VALUES (?1, ?2)",
        params![id, crate::memory::embedding_to_bytes(embedding)],
    )?;
    tx.execute(
        "UPDATE memories SET embed_state = 'ready' WHERE id = ?1",
        params![id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Mark a row permanently embedding-failed; it stays recallable by entity
/// and full-text, but not by vector similarity.
pub fn mark_embedding_failed(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE memories SET embed_state = 'failed' WHERE id = ?1",
        params![id],
    )?;
    write_audit_log(conn, "embed-failed", id, None)?;
    Ok(())
}

/// The vault's fixed embedding dimensionality from vault_meta.
pub fn vault_dimensions(conn: &Connection) -> Result<usize> {
    let dims = crate::db::migrations::get_meta(conn, "embedding_dimensions")?
        .and_then(|v| v.parse::<usize>().ok())
        .ok_or_else(|| EngramError::Corrupt("vault has no embedding_dimensions".into()))?;
    Ok(dims)
}

// ── Lifecycle mutations ──────────────────────────────────────────────────────

/// Reinforce a memory: increment the count and raise salience by a
/// log-decaying increment, clamped at 1.0. Safe to call concurrently —
/// read and write share one transaction under the single-writer lock.
pub fn reinforce(conn: &mut Connection, id: &str) -> Result<f64> {
    let tx = conn.transaction()?;

    let row: Option<(f64, i64)> = tx
        .query_row(
            "SELECT salience, reinforcement_count FROM memories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((salience, count)) = row else {
        return Err(EngramError::NotFound(format!("memory not found: {id}")));
    };

    let increment = 0.1 / (1.0 + (1.0 + count as f64).ln());
    let next = (salience + increment).min(1.0);

    tx.execute(
        "UPDATE memories SET salience = ?1, reinforcement_count = reinforcement_count + 1 \
         WHERE id = ?2",
        params![next, id],
    )?;
    write_audit_log(&tx, "reinforce", id, None)?;
    tx.commit()?;
    Ok(next)
}

/// Supersede `old_id` with `new_id` at instant `at`: the old row closes its
/// validity interval and points at the successor, and a `supersedes` edge
/// new→old is created — all atomically.
pub fn supersede(conn: &mut Connection, old_id: &str, new_id: &str, at: &str) -> Result<()> {
    let tx = conn.transaction()?;

    let old: Option<(String, Option<String>)> = tx
        .query_row(
            "SELECT status, superseded_by FROM memories WHERE id = ?1",
            params![old_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((old_status, old_successor)) = old else {
        return Err(EngramError::NotFound(format!("memory not found: {old_id}")));
    };

    // Idempotent when re-asserting the same supersession.
    if old_status == "superseded" {
        return if old_successor.as_deref() == Some(new_id) {
            Ok(())
        } else {
            Err(EngramError::Conflict(format!(
                "memory {old_id} is already superseded by {}",
                old_successor.unwrap_or_default()
            )))
        };
    }

    let successor: Option<(String, String)> = tx
        .query_row(
            "SELECT status, valid_from FROM memories WHERE id = ?1",
            params![new_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let new_valid_from = match successor {
        None => return Err(EngramError::NotFound(format!("memory not found: {new_id}"))),
        Some((status, valid_from)) => match status.as_str() {
            "active" => valid_from,
            other => {
                return Err(EngramError::InvalidPayload(format!(
                    "supersession successor must be active, {new_id} is {other}"
                )))
            }
        },
    };

    // The closed interval may not overlap the successor's validity.
    let until = if at < new_valid_from.as_str() {
        at
    } else {
        new_valid_from.as_str()
    };
    tx.execute(
        "UPDATE memories SET status = 'superseded', superseded_by = ?1, valid_until = ?2 \
         WHERE id = ?3",
        params![new_id, until, old_id],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO edges (src_id, dst_id, kind, weight, created_at) \
         VALUES (?1, ?2, 'supersedes', 1.0, ?3)",
        params![new_id, old_id, at],
    )?;
    write_audit_log(
        &tx,
        "supersede",
        old_id,
        Some(&serde_json::json!({"superseded_by": new_id, "at": at})),
    )?;
    tx.commit()?;
    Ok(())
}

/// Promote a pending commitment to fulfilled. The only allowed promotion on
/// the fulfillment axis.
pub fn fulfill(conn: &Connection, id: &str) -> Result<()> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match status.as_deref() {
        None => Err(EngramError::NotFound(format!("memory not found: {id}"))),
        Some("fulfilled") => Ok(()),
        Some("pending") => {
            conn.execute(
                "UPDATE memories SET status = 'fulfilled' WHERE id = ?1",
                params![id],
            )?;
            write_audit_log(conn, "fulfill", id, None)?;
            Ok(())
        }
        Some(other) => Err(EngramError::InvalidPayload(format!(
            "only pending memories can be fulfilled, {id} is {other}"
        ))),
    }
}

/// Batch-update last_accessed_at for recall hits.
pub fn stamp(conn: &Connection, ids: &[&str], when: &str) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut stmt =
        conn.prepare("UPDATE memories SET last_accessed_at = ?1 WHERE id = ?2")?;
    for id in ids {
        stmt.execute(params![when, id])?;
    }
    Ok(())
}

// ── Seed queries ─────────────────────────────────────────────────────────────

/// Top-k (id, cosine similarity) over non-archived memories with a present
/// embedding.
pub fn vector_search(conn: &Connection, query: &[f32], k: usize) -> Result<Vec<(String, f64)>> {
    let dims = vault_dimensions(conn)?;
    if query.len() != dims {
        return Err(EngramError::InvalidPayload(format!(
            "query vector has {} dimensions, vault is fixed at {dims}",
            query.len()
        )));
    }

    // Over-fetch so post-filtering archived rows still fills k.
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM memories_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let raw: Vec<(String, f64)> = stmt
        .query_map(
            params![crate::memory::embedding_to_bytes(query), (k * 4) as i64],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(k);
    for (id, distance) in raw {
        let archived: bool = conn
            .query_row(
                "SELECT status = 'archived' FROM memories WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(true);
        if archived {
            continue;
        }
        out.push((id, crate::memory::l2_to_cosine(distance)));
        if out.len() >= k {
            break;
        }
    }
    Ok(out)
}

/// Ids with descending count of entity matches. Archived rows excluded.
pub fn entity_seed(conn: &Connection, entities: &[String], k: usize) -> Result<Vec<(String, usize)>> {
    if entities.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=entities.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT me.memory_id, COUNT(*) AS matches FROM memory_entities me \
         JOIN memories m ON m.id = me.memory_id \
         WHERE me.entity IN ({}) AND m.status != 'archived' \
         GROUP BY me.memory_id ORDER BY matches DESC, me.memory_id LIMIT {}",
        placeholders.join(", "),
        k as i64,
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_vec: Vec<&dyn rusqlite::types::ToSql> = entities
        .iter()
        .map(|e| e as &dyn rusqlite::types::ToSql)
        .collect();
    let rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Ids with descending count of topic matches. Archived rows excluded.
pub fn topic_seed(conn: &Connection, topics: &[String], k: usize) -> Result<Vec<(String, usize)>> {
    if topics.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<String> = (1..=topics.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT mt.memory_id, COUNT(*) AS matches FROM memory_topics mt \
         JOIN memories m ON m.id = mt.memory_id \
         WHERE mt.topic IN ({}) AND m.status != 'archived' \
         GROUP BY mt.memory_id ORDER BY matches DESC, mt.memory_id LIMIT {}",
        placeholders.join(", "),
        k as i64,
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_vec: Vec<&dyn rusqlite::types::ToSql> = topics
        .iter()
        .map(|t| t as &dyn rusqlite::types::ToSql)
        .collect();
    let rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// FTS5 BM25 keyword search over non-archived memories.
pub fn fts_search(conn: &Connection, query_text: &str, k: usize) -> Result<Vec<String>> {
    let escaped = escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT f.id FROM memories_fts f \
         JOIN memories m ON m.id = f.id \
         WHERE memories_fts MATCH ?1 AND m.status != 'archived' \
         ORDER BY rank LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![escaped, k as i64], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Escape a user query for FTS5 MATCH syntax: quote each word so FTS5
/// treats them as individual terms (implicit AND becomes OR here so that
/// partial matches still seed).
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| {
            let clean = word.replace('"', "");
            format!("\"{clean}\"")
        })
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Materialize memories with the given lifecycle status, newest valid_from
/// first.
pub fn by_status(conn: &Connection, status: MemoryStatus, k: usize) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memories WHERE status = ?1 ORDER BY valid_from DESC, id LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![status.as_str(), k as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    get_by_ids(conn, &ids)
}

/// Materialize non-archived memories of the given type, newest first.
pub fn by_type(conn: &Connection, memory_type: MemoryType, k: usize) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memories WHERE type = ?1 AND status != 'archived' \
         ORDER BY valid_from DESC, id LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![memory_type.as_str(), k as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    get_by_ids(conn, &ids)
}

// ── Hydration ────────────────────────────────────────────────────────────────

/// Fetch one memory by id.
pub fn get(conn: &Connection, id: &str) -> Result<Memory> {
    get_by_ids(conn, std::slice::from_ref(&id.to_string()))?
        .into_iter()
        .next()
        .ok_or_else(|| EngramError::NotFound(format!("memory not found: {id}")))
}

/// Batched hydration preserving caller order. Unknown ids are skipped.
pub fn get_by_ids(conn: &Connection, ids: &[String]) -> Result<Vec<Memory>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let in_clause = placeholders.join(", ");
    let params_vec: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|i| i as &dyn rusqlite::types::ToSql).collect();

    let sql = format!(
        "SELECT id, content, type, status, salience, source_kind, source_ref, source_session, \
         created_at, valid_from, valid_until, last_accessed_at, reinforcement_count, \
         superseded_by, embed_state, needs_review \
         FROM memories WHERE id IN ({in_clause})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_vec.as_slice(), row_to_memory)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut by_id: HashMap<String, Memory> = rows.into_iter().map(|m| (m.id.clone(), m)).collect();

    // Batch-load entity and topic references.
    let ent_sql = format!(
        "SELECT memory_id, entity FROM memory_entities WHERE memory_id IN ({in_clause})"
    );
    let mut stmt = conn.prepare(&ent_sql)?;
    let ent_rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (mid, entity) in ent_rows {
        if let Some(m) = by_id.get_mut(&mid) {
            m.entities.push(entity);
        }
    }

    let top_sql = format!(
        "SELECT memory_id, topic FROM memory_topics WHERE memory_id IN ({in_clause})"
    );
    let mut stmt = conn.prepare(&top_sql)?;
    let top_rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (mid, topic) in top_rows {
        if let Some(m) = by_id.get_mut(&mid) {
            m.topics.push(topic);
        }
    }

    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let type_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let kind_str: String = row.get(5)?;
    let embed_str: String = row.get(14)?;
    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        memory_type: type_str.parse::<MemoryType>().unwrap_or(MemoryType::Episodic),
        status: status_str
            .parse::<MemoryStatus>()
            .unwrap_or(MemoryStatus::Active),
        salience: row.get(4)?,
        entities: Vec::new(),
        topics: Vec::new(),
        source: Source {
            kind: kind_str.parse::<SourceKind>().unwrap_or_default(),
            reference: row.get(6)?,
            session: row.get(7)?,
        },
        created_at: row.get(8)?,
        valid_from: row.get(9)?,
        valid_until: row.get(10)?,
        last_accessed_at: row.get(11)?,
        reinforcement_count: row.get::<_, i64>(12)? as u32,
        superseded_by: row.get(13)?,
        embed_state: embed_str.parse::<EmbedState>().unwrap_or(EmbedState::Pending),
        needs_review: row.get::<_, i64>(15)? != 0,
    })
}

/// Stored embedding for a memory, if present.
pub fn embedding_of(conn: &Connection, id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM memories_vec WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| crate::memory::bytes_to_embedding(&b)))
}

/// All entities, most recently seen first.
pub fn all_entities(conn: &Connection) -> Result<Vec<Entity>> {
    let mut stmt = conn.prepare(
        "SELECT name, display_name, entity_type, created_at, memory_count, last_seen \
         FROM entities ORDER BY last_seen DESC, name",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Entity {
                name: row.get(0)?,
                display_name: row.get(1)?,
                entity_type: row.get(2)?,
                created_at: row.get(3)?,
                memory_count: row.get::<_, i64>(4)? as u32,
                last_seen: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Which of the given normalized names are already known to the vault.
pub fn known_entities(conn: &Connection, names: &[String]) -> Result<HashSet<String>> {
    if names.is_empty() {
        return Ok(HashSet::new());
    }
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT name FROM entities WHERE name IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_vec: Vec<&dyn rusqlite::types::ToSql> =
        names.iter().map(|n| n as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(params_vec.as_slice(), |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(rows)
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}
