//! SQL DDL for all Engram tables.
//!
//! Defines the `memories`, `memory_entities`, `memory_topics`, `entities`,
//! `edges`, `memories_fts` (FTS5), `memories_vec` (vec0), `memory_log`, and
//! `vault_meta` tables. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization. The vec0 table is created with the vault's fixed
//! embedding dimensionality.

use rusqlite::Connection;

/// All schema DDL statements for Engram's core tables.
const SCHEMA_SQL: &str = r#"
-- Core memory storage. Bi-temporal validity lives on the row:
-- [valid_from, valid_until) with NULL valid_until meaning current truth.
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    type TEXT NOT NULL CHECK(type IN ('episodic','semantic','procedural','consolidated')),
    status TEXT NOT NULL DEFAULT 'active'
        CHECK(status IN ('active','pending','fulfilled','superseded','archived')),
    salience REAL NOT NULL DEFAULT 0.5 CHECK(salience >= 0.0 AND salience <= 1.0),
    source_kind TEXT NOT NULL DEFAULT 'system'
        CHECK(source_kind IN ('conversation','document','external','system')),
    source_ref TEXT,
    source_session TEXT,
    created_at TEXT NOT NULL,
    valid_from TEXT NOT NULL,
    valid_until TEXT,
    last_accessed_at TEXT,
    reinforcement_count INTEGER NOT NULL DEFAULT 0,
    superseded_by TEXT,
    embed_state TEXT NOT NULL DEFAULT 'pending'
        CHECK(embed_state IN ('pending','ready','failed')),
    needs_review INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_memories_valid_from ON memories(valid_from);
CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(source_session);
CREATE INDEX IF NOT EXISTS idx_memories_superseded ON memories(superseded_by);
CREATE INDEX IF NOT EXISTS idx_memories_embed_state ON memories(embed_state);

-- Full-text search (BM25), backs keyword recall and aggregation routing
-- before embeddings exist.
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    id UNINDEXED,
    content='memories',
    content_rowid='rowid'
);

-- Entity nodes. Identity is the normalized name; no UUID.
CREATE TABLE IF NOT EXISTS entities (
    name TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    entity_type TEXT,
    created_at TEXT NOT NULL,
    memory_count INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT NOT NULL
);

-- Memory ↔ entity references (normalized names).
CREATE TABLE IF NOT EXISTS memory_entities (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity TEXT NOT NULL,
    PRIMARY KEY (memory_id, entity)
);

CREATE INDEX IF NOT EXISTS idx_memory_entities_entity ON memory_entities(entity);

-- Memory ↔ topic tags (open set).
CREATE TABLE IF NOT EXISTS memory_topics (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    topic TEXT NOT NULL,
    PRIMARY KEY (memory_id, topic)
);

CREATE INDEX IF NOT EXISTS idx_memory_topics_topic ON memory_topics(topic);

-- Typed, weighted, directed edges. The composite key makes connect()
-- idempotent in the edge set.
CREATE TABLE IF NOT EXISTS edges (
    src_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    dst_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK(kind IN
        ('supports','contradicts','elaborates','supersedes','entity-shared','temporal-next','user')),
    weight REAL NOT NULL DEFAULT 1.0 CHECK(weight >= 0.0 AND weight <= 1.0),
    created_at TEXT NOT NULL,
    PRIMARY KEY (src_id, dst_id, kind)
);

CREATE INDEX IF NOT EXISTS idx_edges_src ON edges(src_id);
CREATE INDEX IF NOT EXISTS idx_edges_dst ON edges(dst_id);
CREATE INDEX IF NOT EXISTS idx_edges_kind ON edges(kind);

-- Audit log
CREATE TABLE IF NOT EXISTS memory_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation TEXT NOT NULL CHECK(operation IN
        ('create','reinforce','supersede','decay','archive','consolidate','fulfill','embed-failed','delete')),
    memory_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Vault metadata (schema version, owner, embedding dimensionality)
CREATE TABLE IF NOT EXISTS vault_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
///
/// The vec0 virtual table is created with the given dimensionality, which
/// is fixed for the lifetime of the vault.
pub fn init_schema(conn: &Connection, dimensions: usize) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // vec0 virtual table must be created separately (sqlite-vec syntax).
    let vec_sql = format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS memories_vec USING vec0(\n\
         id TEXT PRIMARY KEY,\n\
         embedding FLOAT[{dimensions}]\n\
         );"
    );
    conn.execute_batch(&vec_sql)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO vault_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
