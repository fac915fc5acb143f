//! Lifecycle sweep — salience decay, archival, edge garbage collection,
//! and invariant validation.
//!
//! Runs standalone or piggybacks on consolidation. Decay touches salience
//! only; archival touches status only; neither ever edits content.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::memory::{graph, store};

/// Counts from one lifecycle sweep.
#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub decayed: usize,
    pub archived: usize,
    pub edges_gced: usize,
    pub invariant_violations: usize,
}

/// Apply decay, archive cold low-salience memories, collect dangling
/// edges, and validate invariants.
pub fn sweep(conn: &mut Connection, config: &LifecycleConfig) -> Result<SweepReport> {
    let decayed = decay(conn, config)?;
    let archived = archive_cold(conn, config)?;
    let edges_gced = graph::gc_dangling_edges(conn)?;
    let violations = validate_invariants(conn)?;

    Ok(SweepReport {
        decayed,
        archived,
        edges_gced,
        invariant_violations: violations.len(),
    })
}

/// Reduce salience of memories not accessed within the decay window by the
/// configured step, clamped at 0. Superseded and archived rows are left
/// alone.
pub fn decay(conn: &Connection, config: &LifecycleConfig) -> Result<usize> {
    let cutoff = (chrono::Utc::now()
        - chrono::Duration::days(config.decay_window_days as i64))
    .to_rfc3339();

    let affected = conn.execute(
        "UPDATE memories SET salience = MAX(0.0, salience - ?1) \
         WHERE status NOT IN ('superseded','archived') \
           AND salience > 0.0 \
           AND COALESCE(last_accessed_at, created_at) < ?2",
        params![config.decay_step, cutoff],
    )?;

    if affected > 0 {
        store::write_audit_log(
            conn,
            "decay",
            "batch",
            Some(&serde_json::json!({"step": config.decay_step, "affected": affected})),
        )?;
    }
    Ok(affected)
}

/// Archive memories whose salience fell below the threshold and that have
/// not been accessed recently. Archival is a storage decision orthogonal
/// to fact status, so it covers the same status scope decay does. Entity
/// counters shrink with the reference; entities with no remaining
/// non-archived references go away.
pub fn archive_cold(conn: &mut Connection, config: &LifecycleConfig) -> Result<usize> {
    let cutoff = (chrono::Utc::now()
        - chrono::Duration::days(config.decay_window_days as i64))
    .to_rfc3339();

    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM memories WHERE status NOT IN ('superseded','archived') \
             AND salience < ?1 \
             AND COALESCE(last_accessed_at, created_at) < ?2",
        )?;
        let ids = stmt.query_map(params![config.archive_threshold, cutoff], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
        ids
    };

    for id in &ids {
        archive(conn, id)?;
    }
    Ok(ids.len())
}

/// Soft-forget one memory: status only, row stays.
pub fn archive(conn: &mut Connection, id: &str) -> Result<()> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE memories SET status = 'archived' WHERE id = ?1",
        params![id],
    )?;
    if changed == 0 {
        return Err(crate::error::EngramError::NotFound(format!(
            "memory not found: {id}"
        )));
    }
    release_entity_references(&tx, id)?;
    store::write_audit_log(&tx, "archive", id, None)?;
    tx.commit()?;
    Ok(())
}

/// An entity exists iff at least one non-archived memory references it.
pub(crate) fn release_entity_references(tx: &rusqlite::Transaction, id: &str) -> Result<()> {
    let entities: Vec<String> = {
        let mut stmt = tx.prepare("SELECT entity FROM memory_entities WHERE memory_id = ?1")?;
        let entities = stmt.query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        entities
    };
    for entity in entities {
        tx.execute(
            "UPDATE entities SET memory_count = MAX(0, memory_count - 1) WHERE name = ?1",
            params![entity],
        )?;
        tx.execute(
            "DELETE FROM entities WHERE name = ?1 AND NOT EXISTS (\
                 SELECT 1 FROM memory_entities me JOIN memories m ON m.id = me.memory_id \
                 WHERE me.entity = ?1 AND m.status != 'archived' AND m.id != ?2)",
            params![entity, id],
        )?;
    }
    Ok(())
}

/// One invariant violation, human readable.
#[derive(Debug, Serialize)]
pub struct Violation {
    pub memory_id: String,
    pub rule: String,
}

/// Validate the cross-transaction invariants. Violations are logged and
/// surfaced through stats; they never silently corrupt state.
pub fn validate_invariants(conn: &Connection) -> Result<Vec<Violation>> {
    let mut violations = Vec::new();

    // superseded ⇔ superseded_by set
    collect(
        conn,
        "SELECT id FROM memories WHERE status = 'superseded' AND superseded_by IS NULL",
        "superseded without successor pointer",
        &mut violations,
    )?;
    collect(
        conn,
        "SELECT id FROM memories WHERE status != 'superseded' AND superseded_by IS NOT NULL",
        "successor pointer without superseded status",
        &mut violations,
    )?;

    // valid_until ≤ successor.valid_from
    collect(
        conn,
        "SELECT m.id FROM memories m JOIN memories s ON s.id = m.superseded_by \
         WHERE m.valid_until IS NULL OR m.valid_until > s.valid_from",
        "validity interval overlaps successor",
        &mut violations,
    )?;

    // supersedes edge agrees with the row pointer
    collect(
        conn,
        "SELECT e.dst_id FROM edges e JOIN memories old ON old.id = e.dst_id \
         WHERE e.kind = 'supersedes' AND COALESCE(old.superseded_by, '') != e.src_id",
        "supersedes edge disagrees with row pointer",
        &mut violations,
    )?;

    // successor of a superseded memory must have been established as active.
    // A superseded successor is a continuing chain and an archived one is a
    // storage decision; pending/fulfilled successors can only come from a
    // supersession that should never have been accepted.
    collect(
        conn,
        "SELECT m.id FROM memories m JOIN memories s ON s.id = m.superseded_by \
         WHERE m.status = 'superseded' AND s.status IN ('pending','fulfilled')",
        "supersession successor is not active",
        &mut violations,
    )?;

    // consolidated ⇒ at least one outgoing supports/elaborates edge
    collect(
        conn,
        "SELECT id FROM memories WHERE type = 'consolidated' AND NOT EXISTS (\
             SELECT 1 FROM edges WHERE src_id = memories.id \
             AND kind IN ('supports','elaborates'))",
        "consolidated memory without constituent edge",
        &mut violations,
    )?;

    for v in &violations {
        tracing::warn!(memory_id = %v.memory_id, rule = %v.rule, "invariant violation");
    }
    Ok(violations)
}

fn collect(
    conn: &Connection,
    sql: &str,
    rule: &str,
    out: &mut Vec<Violation>,
) -> Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    out.extend(ids.into_iter().map(|memory_id| Violation {
        memory_id,
        rule: rule.to_string(),
    }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::memory::store::NewMemory;
    use crate::memory::types::{MemoryStatus, MemoryType, Source};

    fn test_db() -> Connection {
        crate::db::open_memory_database(8).unwrap()
    }

    fn insert(
        conn: &mut Connection,
        content: &str,
        entities: &[&str],
        salience: f64,
        days_old: i64,
    ) -> String {
        insert_with_status(conn, content, entities, salience, days_old, MemoryStatus::Active)
    }

    fn insert_with_status(
        conn: &mut Connection,
        content: &str,
        entities: &[&str],
        salience: f64,
        days_old: i64,
        status: MemoryStatus,
    ) -> String {
        let id = store::insert(
            conn,
            &NewMemory {
                content: content.to_string(),
                memory_type: MemoryType::Episodic,
                status,
                salience,
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
        let old = (chrono::Utc::now() - chrono::Duration::days(days_old)).to_rfc3339();
        conn.execute(
            "UPDATE memories SET created_at = ?1 WHERE id = ?2",
            params![old, id],
        )
        .unwrap();
        id
    }

    #[test]
    fn decay_reduces_cold_memories_only() {
        let mut conn = test_db();
        let config = VaultConfig::default().lifecycle;

        let cold = insert(&mut conn, "cold memory", &[], 0.5, 30);
        let warm = insert(&mut conn, "warm memory", &[], 0.5, 0);

        let affected = decay(&conn, &config).unwrap();
        assert_eq!(affected, 1);

        let cold_salience: f64 = conn
            .query_row(
                "SELECT salience FROM memories WHERE id = ?1",
                params![cold],
                |row| row.get(0),
            )
            .unwrap();
        assert!((cold_salience - 0.45).abs() < 1e-9);

        let warm_salience: f64 = conn
            .query_row(
                "SELECT salience FROM memories WHERE id = ?1",
                params![warm],
                |row| row.get(0),
            )
            .unwrap();
        assert!((warm_salience - 0.5).abs() < 1e-9);
    }

    #[test]
    fn decay_clamps_at_zero_and_skips_superseded() {
        let mut conn = test_db();
        let config = VaultConfig::default().lifecycle;

        let low = insert(&mut conn, "nearly gone", &[], 0.02, 30);
        let superseded = insert(&mut conn, "old truth", &[], 0.8, 30);
        let newer = insert(&mut conn, "new truth", &[], 0.8, 0);
        store::supersede(&mut conn, &superseded, &newer, &chrono::Utc::now().to_rfc3339())
            .unwrap();

        decay(&conn, &config).unwrap();

        let low_salience: f64 = conn
            .query_row(
                "SELECT salience FROM memories WHERE id = ?1",
                params![low],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(low_salience, 0.0);

        let kept: f64 = conn
            .query_row(
                "SELECT salience FROM memories WHERE id = ?1",
                params![superseded],
                |row| row.get(0),
            )
            .unwrap();
        assert!((kept - 0.8).abs() < 1e-9);
    }

    #[test]
    fn archive_cold_respects_threshold_and_cleans_entities() {
        let mut conn = test_db();
        let config = VaultConfig::default().lifecycle;

        let stale = insert(&mut conn, "forgettable", &["Ghost"], 0.05, 60);
        let confident = insert(&mut conn, "important", &["Keeper"], 0.9, 60);

        let archived = archive_cold(&mut conn, &config).unwrap();
        assert_eq!(archived, 1);

        assert_eq!(
            store::get(&conn, &stale).unwrap().status,
            MemoryStatus::Archived
        );
        assert_eq!(
            store::get(&conn, &confident).unwrap().status,
            MemoryStatus::Active
        );

        // Ghost had its only reference archived; Keeper survives.
        let ghost: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE name = 'ghost'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(ghost, 0);
        let keeper: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE name = 'keeper'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(keeper, 1);
    }

    #[test]
    fn archive_cold_covers_pending_and_fulfilled() {
        let mut conn = test_db();
        let config = VaultConfig::default().lifecycle;

        let stale_pending = insert_with_status(
            &mut conn,
            "abandoned commitment",
            &[],
            0.05,
            60,
            MemoryStatus::Pending,
        );
        let stale_fulfilled = insert_with_status(
            &mut conn,
            "long-done task",
            &[],
            0.05,
            60,
            MemoryStatus::Fulfilled,
        );
        let fresh_pending = insert_with_status(
            &mut conn,
            "live commitment",
            &[],
            0.9,
            0,
            MemoryStatus::Pending,
        );

        let archived = archive_cold(&mut conn, &config).unwrap();
        assert_eq!(archived, 2);

        assert_eq!(
            store::get(&conn, &stale_pending).unwrap().status,
            MemoryStatus::Archived
        );
        assert_eq!(
            store::get(&conn, &stale_fulfilled).unwrap().status,
            MemoryStatus::Archived
        );
        assert_eq!(
            store::get(&conn, &fresh_pending).unwrap().status,
            MemoryStatus::Pending
        );
    }

    #[test]
    fn sweep_gcs_dangling_edges() {
        let mut conn = test_db();
        let config = VaultConfig::default().lifecycle;

        let a = insert(&mut conn, "linked a", &["Shared"], 0.9, 0);
        let b = insert(&mut conn, "linked b", &["Shared"], 0.05, 60);
        // entity-shared edges exist between a and b
        let before: i64 = conn
            .query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))
            .unwrap();
        assert!(before >= 2);

        let report = sweep(&mut conn, &config).unwrap();
        assert_eq!(report.archived, 1);
        assert!(report.edges_gced >= 2);
        assert_eq!(report.invariant_violations, 0);

        let _ = (a, b);
    }

    #[test]
    fn validate_flags_broken_supersession() {
        let mut conn = test_db();
        let id = insert(&mut conn, "broken", &[], 0.5, 0);
        conn.execute(
            "UPDATE memories SET status = 'superseded' WHERE id = ?1",
            params![id],
        )
        .unwrap();

        let violations = validate_invariants(&conn).unwrap();
        assert!(violations
            .iter()
            .any(|v| v.memory_id == id && v.rule.contains("without successor")));
    }

    #[test]
    fn validate_flags_non_active_successor() {
        let mut conn = test_db();
        let old = insert(&mut conn, "old truth", &[], 0.5, 0);
        let new = insert(&mut conn, "new truth", &[], 0.5, 0);
        store::supersede(&mut conn, &old, &new, &chrono::Utc::now().to_rfc3339()).unwrap();

        // Force the successor into a state supersede() would never accept.
        conn.execute(
            "UPDATE memories SET status = 'pending' WHERE id = ?1",
            params![new],
        )
        .unwrap();

        let violations = validate_invariants(&conn).unwrap();
        assert!(violations
            .iter()
            .any(|v| v.memory_id == old && v.rule.contains("successor is not active")));
    }

    #[test]
    fn validate_flags_orphan_consolidated() {
        let mut conn = test_db();
        let id = store::insert(
            &mut conn,
            &NewMemory {
                content: "orphan summary".into(),
                memory_type: MemoryType::Consolidated,
                status: MemoryStatus::Active,
                salience: 0.5,
                entities: vec![],
                topics: vec![],
                source: Source::default(),
                valid_from: None,
                needs_review: false,
                id: None,
            },
            16,
        )
        .unwrap();

        let violations = validate_invariants(&conn).unwrap();
        assert!(violations
            .iter()
            .any(|v| v.memory_id == id && v.rule.contains("consolidated")));
    }

    #[test]
    fn healthy_vault_has_no_violations() {
        let mut conn = test_db();
        let old = insert(&mut conn, "old fact", &[], 0.5, 0);
        let new = insert(&mut conn, "new fact", &[], 0.5, 0);
        store::supersede(&mut conn, &old, &new, &chrono::Utc::now().to_rfc3339()).unwrap();

        let violations = validate_invariants(&conn).unwrap();
        assert!(violations.is_empty());
    }
}
