//! Derived operations — briefing, surface, ask, alerts, export.
//!
//! All compositions over the store, recall pipeline, and graph; the only
//! LLM dependency is the optional synthesis step in [`ask`], which
//! degrades to an extractive answer when no provider is injected.

use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;

use crate::config::VaultConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::llm::{CompleteOptions, LlmProvider};
use crate::memory::consolidate::{self, ContradictionPair};
use crate::memory::recall::{self, RecallQuery, RecalledMemory};
use crate::memory::stats::StatsResponse;
use crate::memory::types::{Edge, EdgeKind, Memory, MemoryStatus};
use crate::memory::{store, truncate_preview};

// ── Briefing ─────────────────────────────────────────────────────────────────

/// Structured context package: key facts, pending commitments, recent
/// activity, top entities, stats. No LLM involved.
#[derive(Debug, Serialize)]
pub struct Briefing {
    pub summary: String,
    pub key_facts: Vec<RecalledMemory>,
    pub active_commitments: Vec<Memory>,
    pub recent_activity: Vec<Memory>,
    pub top_entities: Vec<EntityOverview>,
    pub stats: StatsResponse,
}

#[derive(Debug, Serialize)]
pub struct EntityOverview {
    pub name: String,
    pub display_name: String,
    pub memory_count: u32,
    pub last_seen: String,
}

pub fn briefing(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    config: &VaultConfig,
    context: Option<&str>,
    limit: usize,
) -> Result<Briefing> {
    let active_commitments = store::by_status(conn, MemoryStatus::Pending, limit)?;

    let key_facts = match context {
        Some(context) if !context.trim().is_empty() => recall::recall(
            conn,
            embedder,
            &config.recall,
            &config.aggregation,
            &RecallQuery::new(context, limit),
            None,
        )?,
        _ => Vec::new(),
    };

    let recent_activity = recent_memories(conn, limit)?;
    let top_entities = top_entities(conn, limit)?;
    let stats = crate::memory::stats::stats(conn, None)?;

    let summary = format!(
        "{} memories ({} active), {} open commitments, {} entities tracked",
        stats.total_memories,
        stats.by_status.get("active").copied().unwrap_or(0),
        active_commitments.len(),
        stats.entities,
    );

    Ok(Briefing {
        summary,
        key_facts,
        active_commitments,
        recent_activity,
        top_entities,
        stats,
    })
}

fn recent_memories(conn: &Connection, limit: usize) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM memories WHERE status != 'archived' \
         ORDER BY created_at DESC, id DESC LIMIT ?1",
    )?;
    let ids = stmt
        .query_map(rusqlite::params![limit as i64], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    store::get_by_ids(conn, &ids)
}

/// Entities ranked by memory_count weighted by how recently they were
/// mentioned.
fn top_entities(conn: &Connection, limit: usize) -> Result<Vec<EntityOverview>> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut entities = store::all_entities(conn)?;
    entities.sort_by(|a, b| {
        let score = |e: &crate::memory::types::Entity| {
            e.memory_count as f64 * recall::half_life_kernel(&e.last_seen, &now, 30.0)
        };
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(entities
        .into_iter()
        .take(limit)
        .map(|e| EntityOverview {
            name: e.name,
            display_name: e.display_name,
            memory_count: e.memory_count,
            last_seen: e.last_seen,
        })
        .collect())
}

// ── Surface ──────────────────────────────────────────────────────────────────

/// One proactively surfaced memory with the reason it came up.
#[derive(Debug, Serialize)]
pub struct Surfaced {
    #[serde(flatten)]
    pub recalled: RecalledMemory,
    pub reason: String,
}

/// Like recall, but with a novelty bias: items the caller has seen
/// recently are filtered out, and the remainder is re-ranked to prefer
/// memories that have not surfaced in a while.
pub fn surface(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    config: &VaultConfig,
    context: &str,
    active_entities: &[String],
    active_topics: &[String],
    limit: usize,
) -> Result<Vec<Surfaced>> {
    let mut query = RecallQuery::new(context, limit * 3);
    query.entities = active_entities.to_vec();
    query.topics = active_topics.to_vec();
    query.spread = true;

    let now = chrono::Utc::now().to_rfc3339();
    let idle_cutoff = (chrono::Utc::now()
        - chrono::Duration::hours(config.lifecycle.surface_idle_hours as i64))
    .to_rfc3339();

    let recalled = recall::recall(
        conn,
        embedder,
        &config.recall,
        &config.aggregation,
        &query,
        None,
    )?;

    let mut candidates: Vec<(f64, Surfaced)> = Vec::new();
    for item in recalled {
        // Novelty floor: skip anything surfaced within the idle window.
        if let Some(accessed) = &item.memory.last_accessed_at {
            if accessed.as_str() >= idle_cutoff.as_str() {
                continue;
            }
        }
        let staleness = 1.0
            - recall::half_life_kernel(
                item.memory
                    .last_accessed_at
                    .as_deref()
                    .unwrap_or(&item.memory.created_at),
                &now,
                config.recall.recency_half_life_days,
            );
        let rank = item.score + 0.3 * staleness;
        let reason = surface_reason(&item);
        candidates.push((rank, Surfaced { recalled: item, reason }));
    }

    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(candidates
        .into_iter()
        .take(limit)
        .map(|(_, s)| s)
        .collect())
}

fn surface_reason(item: &RecalledMemory) -> String {
    let b = &item.breakdown;
    if b.entity >= b.vector && b.entity >= b.spread && b.entity > 0.0 {
        "mentions entities you are working with".to_string()
    } else if b.spread > b.vector && b.spread > 0.0 {
        "connected to memories in your current context".to_string()
    } else if b.vector > 0.0 {
        "similar to your current context".to_string()
    } else {
        "has not come up in a while".to_string()
    }
}

// ── Ask ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct Answer {
    pub answer: String,
    pub confidence: f64,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Serialize)]
pub struct Citation {
    pub id: String,
    pub content: String,
    pub score: f64,
}

/// Recall plus LLM synthesis with source attribution. Every citation is a
/// memory from the recall result; without an LLM the top memory is the
/// answer.
pub fn ask(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    llm: Option<&dyn LlmProvider>,
    config: &VaultConfig,
    question: &str,
    limit: usize,
) -> Result<Answer> {
    let mut query = RecallQuery::new(question, limit);
    query.spread = true;
    let recalled = recall::recall(
        conn,
        embedder,
        &config.recall,
        &config.aggregation,
        &query,
        None,
    )?;

    if recalled.is_empty() {
        return Ok(Answer {
            answer: "I don't have any memories relevant to that question.".into(),
            confidence: 0.0,
            citations: Vec::new(),
        });
    }

    let citations: Vec<Citation> = recalled
        .iter()
        .map(|r| Citation {
            id: r.memory.id.clone(),
            content: truncate_preview(&r.memory.content, 200),
            score: r.score,
        })
        .collect();

    let mean_score =
        recalled.iter().take(3).map(|r| r.score).sum::<f64>() / recalled.len().min(3) as f64;
    let base_confidence = (mean_score / (1.0 + mean_score)).clamp(0.0, 1.0);

    if let Some(llm) = llm {
        let sources: String = recalled
            .iter()
            .enumerate()
            .map(|(i, r)| format!("[{}] {}", i + 1, r.memory.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Answer the question using only the numbered memories below. Cite the \
             numbers you rely on. If the memories do not answer it, say so.\n\n\
             Memories:\n{sources}\n\nQuestion: {question}"
        );
        let opts = CompleteOptions {
            max_tokens: Some(400),
            json_mode: false,
            timeout_ms: Some(15_000),
        };
        match llm.complete(&prompt, &opts) {
            Ok(answer) if !answer.trim().is_empty() => {
                return Ok(Answer {
                    answer: answer.trim().to_string(),
                    confidence: base_confidence,
                    citations,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "ask synthesis failed, using extractive answer");
            }
        }
    }

    Ok(Answer {
        answer: recalled[0].memory.content.clone(),
        confidence: base_confidence * 0.8,
        citations,
    })
}

// ── Alerts & contradictions ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StaleCommitment,
    OpenContradiction,
}

#[derive(Debug, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub memory_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_days: Option<i64>,
}

/// Pending commitments past the configured age, plus detected-but-
/// unresolved contradiction pairs.
pub fn alerts(conn: &Connection, config: &VaultConfig, limit: usize) -> Result<Vec<Alert>> {
    let mut out = Vec::new();
    let now = chrono::Utc::now();
    let cutoff =
        (now - chrono::Duration::days(config.lifecycle.pending_alert_days as i64)).to_rfc3339();

    for m in store::by_status(conn, MemoryStatus::Pending, limit)? {
        if m.created_at.as_str() >= cutoff.as_str() {
            continue;
        }
        let age_days = chrono::DateTime::parse_from_rfc3339(&m.created_at)
            .map(|t| (now - t.with_timezone(&chrono::Utc)).num_days())
            .unwrap_or(0);
        out.push(Alert {
            kind: AlertKind::StaleCommitment,
            message: format!(
                "open for {age_days} days: {}",
                truncate_preview(&m.content, 120)
            ),
            memory_ids: vec![m.id],
            age_days: Some(age_days),
        });
    }

    for pair in consolidate::open_contradictions(conn, limit)? {
        out.push(Alert {
            kind: AlertKind::OpenContradiction,
            message: "two current memories contradict each other".into(),
            memory_ids: vec![pair.newer_id, pair.older_id],
            age_days: None,
        });
    }

    out.truncate(limit);
    Ok(out)
}

/// Currently-open contradiction pairs, hydrated with previews.
#[derive(Debug, Serialize)]
pub struct ContradictionView {
    pub newer: ContradictionMember,
    pub older: ContradictionMember,
    pub detected_at: String,
}

#[derive(Debug, Serialize)]
pub struct ContradictionMember {
    pub id: String,
    pub preview: String,
}

pub fn contradictions(conn: &Connection, limit: usize) -> Result<Vec<ContradictionView>> {
    let pairs = consolidate::open_contradictions(conn, limit)?;
    let mut out = Vec::with_capacity(pairs.len());
    for ContradictionPair {
        newer_id,
        older_id,
        detected_at,
    } in pairs
    {
        let newer = store::get(conn, &newer_id)?;
        let older = store::get(conn, &older_id)?;
        out.push(ContradictionView {
            newer: ContradictionMember {
                id: newer.id,
                preview: truncate_preview(&newer.content, 120),
            },
            older: ContradictionMember {
                id: older.id,
                preview: truncate_preview(&older.content, 120),
            },
            detected_at,
        });
    }
    Ok(out)
}

// ── Export ───────────────────────────────────────────────────────────────────

/// Full JSON dump of the vault: memories, entities, edges.
pub fn export(conn: &Connection) -> Result<serde_json::Value> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT id FROM memories ORDER BY created_at, id")?;
        let ids = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids
    };
    let memories = store::get_by_ids(conn, &ids)?;
    let entities = store::all_entities(conn)?;

    let edges: Vec<Edge> = {
        let mut stmt = conn.prepare(
            "SELECT src_id, dst_id, kind, weight, created_at FROM edges ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let kind_str: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    kind_str,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .filter_map(|(src_id, dst_id, kind, weight, created_at)| {
                kind.parse::<EdgeKind>().ok().map(|kind| Edge {
                    src_id,
                    dst_id,
                    kind,
                    weight,
                    created_at,
                })
            })
            .collect()
    };

    let meta: HashMap<String, String> = {
        let mut stmt = conn.prepare("SELECT key, value FROM vault_meta")?;
        let meta = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        meta
    };

    Ok(serde_json::json!({
        "meta": meta,
        "memories": memories,
        "entities": entities,
        "edges": edges,
    }))
}
