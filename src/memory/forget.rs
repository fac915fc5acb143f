//! Soft and hard forgetting.
//!
//! Soft forget archives the row (a storage concern — the fact keeps its
//! place in supersession chains). Hard forget leaves no trace: the row,
//! its FTS entry, its vector, its entity references, and every edge
//! touching it are removed in one transaction.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{EngramError, Result};
use crate::memory::lifecycle;
use crate::memory::store::write_audit_log;

/// Result returned from a forget operation.
#[derive(Debug, Serialize)]
pub struct ForgetResult {
    pub id: String,
    /// `true` if the memory was permanently removed; `false` for archival.
    pub hard_deleted: bool,
}

/// Forget a memory by id. Soft (default) archives; hard removes.
pub fn forget(conn: &mut Connection, id: &str, hard: bool) -> Result<ForgetResult> {
    if hard {
        hard_forget(conn, id)
    } else {
        lifecycle::archive(conn, id)?;
        Ok(ForgetResult {
            id: id.to_string(),
            hard_deleted: false,
        })
    }
}

fn hard_forget(conn: &mut Connection, id: &str) -> Result<ForgetResult> {
    let tx = conn.transaction()?;

    let row: Option<(i64, String)> = tx
        .query_row(
            "SELECT rowid, content FROM memories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some((rowid, content)) = row else {
        return Err(EngramError::NotFound(format!("memory not found: {id}")));
    };

    // External-content FTS5 requires the special delete insert.
    tx.execute(
        "INSERT INTO memories_fts(memories_fts, rowid, content, id) VALUES('delete', ?1, ?2, ?3)",
        params![rowid, content, id],
    )?;
    tx.execute("DELETE FROM memories_vec WHERE id = ?1", params![id])?;

    // Successors lose their back-pointer target; clear it so the
    // supersession invariant stays intact.
    tx.execute(
        "UPDATE memories SET superseded_by = NULL, status = 'archived' \
         WHERE superseded_by = ?1",
        params![id],
    )?;

    lifecycle::release_entity_references(&tx, id)?;
    write_audit_log(
        &tx,
        "delete",
        id,
        Some(&serde_json::json!({"hard_delete": true})),
    )?;

    // Cascades memory_entities, memory_topics, and edges via FK.
    tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;

    tx.commit()?;
    Ok(ForgetResult {
        id: id.to_string(),
        hard_deleted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::{self, NewMemory};
    use crate::memory::types::{MemoryStatus, MemoryType, Source};

    fn test_db() -> Connection {
        crate::db::open_memory_database(8).unwrap()
    }

    fn insert(conn: &mut Connection, content: &str, entities: &[&str]) -> String {
        let id = store::insert(
            conn,
            &NewMemory {
                content: content.to_string(),
                memory_type: MemoryType::Episodic,
                status: MemoryStatus::Active,
                salience: 0.5,
                entities: entities
                    .iter()
                    .map(|e| (e.to_lowercase(), e.to_string()))
                    .collect(),
                topics: vec![],
                source: Source::default(),
                valid_from: None,
                needs_review: false,
                id: None,
            },
            16,
        )
        .unwrap();
        let mut v = vec![0.0f32; 8];
        v[0] = 1.0;
        store::update_embedding(conn, &id, &v).unwrap();
        id
    }

    #[test]
    fn soft_forget_archives_and_keeps_row() {
        let mut conn = test_db();
        let id = insert(&mut conn, "to be archived", &[]);

        let result = forget(&mut conn, &id, false).unwrap();
        assert!(!result.hard_deleted);

        let m = store::get(&conn, &id).unwrap();
        assert_eq!(m.status, MemoryStatus::Archived);
    }

    #[test]
    fn hard_forget_leaves_no_trace() {
        let mut conn = test_db();
        let a = insert(&mut conn, "linked fact", &["Shared"]);
        let b = insert(&mut conn, "doomed fact", &["Shared"]);

        forget(&mut conn, &b, true).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories WHERE id = ?1",
                params![b],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);

        let vec_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_vec WHERE id = ?1",
                params![b],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(vec_count, 0);

        // No edges reference the id anymore.
        let edge_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM edges WHERE src_id = ?1 OR dst_id = ?1",
                params![b],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(edge_count, 0);

        // FTS no longer matches the content.
        let fts: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories_fts WHERE memories_fts MATCH '\"doomed\"'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fts, 0);

        // The surviving memory is untouched.
        assert!(store::get(&conn, &a).is_ok());
    }

    #[test]
    fn hard_forget_clears_successor_pointers() {
        let mut conn = test_db();
        let old = insert(&mut conn, "old truth", &[]);
        let new = insert(&mut conn, "new truth", &[]);
        store::supersede(&mut conn, &old, &new, &chrono::Utc::now().to_rfc3339()).unwrap();

        forget(&mut conn, &new, true).unwrap();

        let m = store::get(&conn, &old).unwrap();
        assert!(m.superseded_by.is_none());
        // No dangling pointer violations after the delete.
        let violations = crate::memory::lifecycle::validate_invariants(&conn).unwrap();
        assert!(violations.is_empty());
    }

    #[test]
    fn forget_unknown_id_errors() {
        let mut conn = test_db();
        assert!(matches!(
            forget(&mut conn, "missing", true),
            Err(EngramError::NotFound(_))
        ));
        assert!(matches!(
            forget(&mut conn, "missing", false),
            Err(EngramError::NotFound(_))
        ));
    }
}
