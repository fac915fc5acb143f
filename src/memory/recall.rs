//! Read path — query understanding, seed retrieval, spreading activation,
//! multi-signal scoring, and temporal dedup.
//!
//! Operates in phases: understand → seed (vector + entity + topic +
//! full-text, or an aggregation materialization when a configured phrase
//! routes there) → optional spread → score → dedup → truncate and stamp.
//! Missing embeddings zero the vector signal but never exclude a
//! candidate; an empty vault returns an empty list, not an error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use rusqlite::Connection;
use serde::Serialize;

use crate::config::{AggregationRule, RecallConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{EngramError, Result};
use crate::memory::types::{Memory, MemoryStatus, MemoryType};
use crate::memory::{extract, graph, jaccard, store};

/// A recall request. `at` switches candidate admission to the bi-temporal
/// validity window, so superseded (and archived) facts become reachable as
/// historical truth.
#[derive(Debug, Clone)]
pub struct RecallQuery {
    pub context: String,
    pub entities: Vec<String>,
    pub topics: Vec<String>,
    pub types: Vec<MemoryType>,
    pub limit: usize,
    pub spread: bool,
    pub spread_hops: Option<usize>,
    pub spread_decay: Option<f64>,
    pub at: Option<String>,
}

impl RecallQuery {
    pub fn new(context: impl Into<String>, limit: usize) -> Self {
        Self {
            context: context.into(),
            entities: Vec::new(),
            topics: Vec::new(),
            types: Vec::new(),
            limit,
            spread: false,
            spread_hops: None,
            spread_decay: None,
            at: None,
        }
    }
}

/// Per-signal contributions behind a final score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScoreBreakdown {
    pub vector: f64,
    pub entity: f64,
    pub topic: f64,
    pub type_bonus: f64,
    pub spread: f64,
    pub recency: f64,
    pub salience: f64,
    pub superseded_penalty: f64,
    pub age_penalty: f64,
}

/// One recalled memory with score metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RecalledMemory {
    #[serde(flatten)]
    pub memory: Memory,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    /// Ids collapsed into this result by temporal dedup.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deduped: Vec<String>,
}

/// Where an aggregation phrase routed the seed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregationTarget {
    Status(MemoryStatus),
    Type(MemoryType),
}

/// Full recall pipeline.
///
/// `cancel` is observed between phases; on cancellation the partial result
/// is discarded and [`EngramError::Cancelled`] is returned.
pub fn recall(
    conn: &Connection,
    embedder: &dyn EmbeddingProvider,
    config: &RecallConfig,
    aggregation_rules: &[AggregationRule],
    query: &RecallQuery,
    cancel: Option<&AtomicBool>,
) -> Result<Vec<RecalledMemory>> {
    if query.limit == 0 {
        return Ok(Vec::new());
    }
    let now = chrono::Utc::now().to_rfc3339();

    // ── Understand ───────────────────────────────────────────────────────
    let query_vec = match embedder.embed(&query.context) {
        Ok(mut v) => {
            crate::embedding::normalize(&mut v);
            Some(v)
        }
        Err(e) => {
            // Recall still returns from non-vector paths.
            tracing::debug!(error = %e, "query embedding unavailable, degrading to non-vector seeds");
            None
        }
    };

    let extraction = extract::extract(&query.context, &[]);
    let mut query_entities: Vec<String> =
        extraction.entities.into_iter().map(|(n, _)| n).collect();
    for e in &query.entities {
        let norm = extract::normalize_entity(e);
        if !norm.is_empty() && !query_entities.contains(&norm) {
            query_entities.push(norm);
        }
    }
    let mut query_topics = extraction.topics;
    for t in &query.topics {
        let t = t.trim().to_lowercase();
        if !t.is_empty() && !query_topics.contains(&t) {
            query_topics.push(t);
        }
    }

    let routed = route_aggregation(&query.context, aggregation_rules);
    check_cancel(cancel)?;

    // ── Seed ─────────────────────────────────────────────────────────────
    let seed_budget = query.limit * config.seed_expansion_factor.max(1);
    // id → seed activation in [0, 1]
    let mut seeds: HashMap<String, f64> = HashMap::new();

    if let Some(target) = routed {
        // Materialized listings are exact: no vector/entity union.
        let materialized = match target {
            AggregationTarget::Status(status) => store::by_status(conn, status, seed_budget)?,
            AggregationTarget::Type(t) => store::by_type(conn, t, seed_budget)?,
        };
        for m in materialized {
            seeds.insert(m.id, 1.0);
        }
    } else {
        if let Some(qv) = &query_vec {
            for (id, cos) in store::vector_search(conn, qv, seed_budget)? {
                let entry = seeds.entry(id).or_insert(0.0);
                *entry = entry.max(cos.max(0.0));
            }
        }
        let entity_total = query_entities.len().max(1) as f64;
        for (id, matches) in store::entity_seed(conn, &query_entities, seed_budget)? {
            let activation = (matches as f64 / entity_total).min(1.0);
            let entry = seeds.entry(id).or_insert(0.0);
            *entry = entry.max(activation);
        }
        for (id, _) in store::topic_seed(conn, &query_topics, seed_budget)? {
            let entry = seeds.entry(id).or_insert(0.0);
            *entry = entry.max(0.4);
        }
        for id in store::fts_search(conn, &query.context, seed_budget)? {
            let entry = seeds.entry(id).or_insert(0.0);
            *entry = entry.max(0.3);
        }
    }
    // Point-in-time queries resolve along supersession chains: every
    // version of a seeded fact is a candidate, archived or not.
    if query.at.is_some() {
        let seeded: Vec<String> = seeds.keys().cloned().collect();
        for id in seeded {
            for (member, activation) in supersession_chain(conn, &id)? {
                let entry = seeds.entry(member).or_insert(0.0);
                *entry = entry.max(activation);
            }
        }
    }
    check_cancel(cancel)?;

    // ── Spread ───────────────────────────────────────────────────────────
    let mut spread_activation: HashMap<String, f64> = HashMap::new();
    if query.spread && !seeds.is_empty() {
        let opts = graph::SpreadOptions {
            max_hops: query.spread_hops.unwrap_or(config.spread_hops),
            decay: query.spread_decay.unwrap_or(config.spread_decay),
            node_budget: config.spread_node_budget,
        };
        let seed_vec: Vec<(String, f64)> =
            seeds.iter().map(|(id, a)| (id.clone(), *a)).collect();
        spread_activation = graph::spread(conn, &seed_vec, &opts)?;
    }
    check_cancel(cancel)?;

    // ── Hydrate & admit ──────────────────────────────────────────────────
    let mut candidate_ids: Vec<String> = seeds.keys().cloned().collect();
    for id in spread_activation.keys() {
        if !seeds.contains_key(id) {
            candidate_ids.push(id.clone());
        }
    }
    let hydrated = store::get_by_ids(conn, &candidate_ids)?;

    let admitted: Vec<Memory> = hydrated
        .into_iter()
        .filter(|m| match &query.at {
            // Point-in-time: the validity window decides; archival is a
            // storage concern, not a truth concern.
            Some(at) => m.valid_at(at),
            None => m.status != MemoryStatus::Archived,
        })
        .filter(|m| query.types.is_empty() || query.types.contains(&m.memory_type))
        .collect();

    // ── Score ────────────────────────────────────────────────────────────
    let mut scored: Vec<RecalledMemory> = Vec::with_capacity(admitted.len());
    for memory in admitted {
        let breakdown = score_memory(
            conn,
            &memory,
            query_vec.as_deref(),
            &query_entities,
            &query_topics,
            spread_activation.get(&memory.id).copied().unwrap_or(0.0),
            &now,
            config,
        )?;
        let score = breakdown.vector + breakdown.entity + breakdown.topic
            + breakdown.type_bonus
            + breakdown.spread
            + breakdown.recency
            + breakdown.salience
            - breakdown.superseded_penalty
            - breakdown.age_penalty;
        scored.push(RecalledMemory {
            memory,
            score,
            breakdown,
            deduped: Vec::new(),
        });
    }

    // Tie-break order: score → salience → more recent valid_from → id.
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.memory
                    .salience
                    .partial_cmp(&a.memory.salience)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| b.memory.valid_from.cmp(&a.memory.valid_from))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
    check_cancel(cancel)?;

    // ── Dedup, truncate, stamp ───────────────────────────────────────────
    let mut results = dedup(conn, scored)?;
    results.truncate(query.limit);

    let returned: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
    store::stamp(conn, &returned, &now)?;

    Ok(results)
}

/// Every version of a fact reachable from `id` along `superseded_by`
/// pointers, in both directions, bounded against pathological chains.
fn supersession_chain(conn: &Connection, id: &str) -> Result<Vec<(String, f64)>> {
    const CHAIN_CAP: usize = 32;
    let mut seen: HashSet<String> = HashSet::from([id.to_string()]);
    let mut frontier = vec![id.to_string()];
    let mut out = Vec::new();

    while let Some(current) = frontier.pop() {
        if seen.len() > CHAIN_CAP {
            break;
        }
        // Older versions point at `current`.
        let mut stmt = conn.prepare("SELECT id FROM memories WHERE superseded_by = ?1")?;
        let older = stmt
            .query_map(rusqlite::params![current], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        // `current` may itself point at a newer version.
        let newer: Option<String> = conn
            .query_row(
                "SELECT superseded_by FROM memories WHERE id = ?1",
                rusqlite::params![current],
                |row| row.get(0),
            )
            .unwrap_or(None);

        for member in older.into_iter().chain(newer) {
            if seen.insert(member.clone()) {
                out.push((member.clone(), 0.5));
                frontier.push(member);
            }
        }
    }
    Ok(out)
}

fn check_cancel(cancel: Option<&AtomicBool>) -> Result<()> {
    if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
        return Err(EngramError::Cancelled("recall aborted".into()));
    }
    Ok(())
}

fn route_aggregation(
    context: &str,
    rules: &[AggregationRule],
) -> Option<AggregationTarget> {
    let lower = context.to_lowercase();
    for rule in rules {
        if rule.phrases.iter().any(|p| lower.contains(&p.to_lowercase())) {
            if let Some(status) = rule.target.strip_prefix("status:") {
                if let Ok(status) = status.parse::<MemoryStatus>() {
                    return Some(AggregationTarget::Status(status));
                }
            }
            if let Some(t) = rule.target.strip_prefix("type:") {
                if let Ok(t) = t.parse::<MemoryType>() {
                    return Some(AggregationTarget::Type(t));
                }
            }
            tracing::warn!(target = %rule.target, "unparsable aggregation target, ignoring rule");
        }
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn score_memory(
    conn: &Connection,
    memory: &Memory,
    query_vec: Option<&[f32]>,
    query_entities: &[String],
    query_topics: &[String],
    spread_activation: f64,
    now: &str,
    config: &RecallConfig,
) -> Result<ScoreBreakdown> {
    let w = &config.weights;

    let vector = match query_vec {
        Some(qv) => match store::embedding_of(conn, &memory.id)? {
            Some(emb) => w.vector * cosine(qv, &emb).max(0.0),
            None => 0.0, // missing embedding: still eligible, vector signal zero
        },
        None => 0.0,
    };

    let entity = w.entity * jaccard(query_entities, &memory.entities);
    let topic = w.topic * jaccard(query_topics, &memory.topics);
    let type_bonus = if memory.memory_type == MemoryType::Consolidated {
        w.type_bonus
    } else {
        0.0
    };
    let spread = w.spread * (1.0 + spread_activation).ln();

    let accessed = memory
        .last_accessed_at
        .as_deref()
        .unwrap_or(&memory.created_at);
    let recency = w.recency * half_life_kernel(accessed, now, config.recency_half_life_days);

    let salience = w.salience * memory.salience;

    let superseded_penalty = if memory.status == MemoryStatus::Superseded {
        w.superseded_penalty
    } else {
        0.0
    };

    // A longer half-life nudges stale low-salience content down without
    // suppressing signal.
    let staleness = 1.0 - half_life_kernel(&memory.created_at, now, config.age_half_life_days);
    let age_penalty = w.age_penalty * staleness * (1.0 - memory.salience);

    Ok(ScoreBreakdown {
        vector,
        entity,
        topic,
        type_bonus,
        spread,
        recency,
        salience,
        superseded_penalty,
        age_penalty,
    })
}

/// Half-life exponential over the age between two RFC 3339 instants.
/// Returns 1.0 at zero age, 0.5 at one half-life.
pub fn half_life_kernel(then: &str, now: &str, half_life_days: f64) -> f64 {
    let age_days = age_in_days(then, now);
    if age_days <= 0.0 || half_life_days <= 0.0 {
        return 1.0;
    }
    (2.0f64).powf(-age_days / half_life_days)
}

fn age_in_days(then: &str, now: &str) -> f64 {
    let parse = |s: &str| chrono::DateTime::parse_from_rfc3339(s).ok();
    match (parse(then), parse(now)) {
        (Some(a), Some(b)) => (b - a).num_seconds() as f64 / 86_400.0,
        _ => 0.0,
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Temporal dedup: group by (primary entity, topic signature), where the
/// primary entity is the candidate's most recently seen entity. Within a
/// group, superseded and archived versions collapse into the current fact
/// with the latest `valid_from`. Newer fact wins.
fn dedup(conn: &Connection, scored: Vec<RecalledMemory>) -> Result<Vec<RecalledMemory>> {
    // last_seen lookup for every entity mentioned by a candidate
    let mut entity_names: HashSet<String> = HashSet::new();
    for item in &scored {
        entity_names.extend(item.memory.entities.iter().cloned());
    }
    let names: Vec<String> = entity_names.into_iter().collect();
    let last_seen = entity_last_seen(conn, &names)?;

    let mut groups: HashMap<String, Vec<RecalledMemory>> = HashMap::new();
    let mut group_order: Vec<String> = Vec::new();

    for item in scored {
        let key = group_key(&item.memory, &last_seen);
        if !groups.contains_key(&key) {
            group_order.push(key.clone());
        }
        groups.entry(key).or_default().push(item);
    }

    let mut out: Vec<RecalledMemory> = Vec::new();
    for key in group_order {
        let members = groups.remove(&key).unwrap_or_default();
        out.extend(collapse_group(members));
    }

    // Survivors keep score order.
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.memory.valid_from.cmp(&a.memory.valid_from))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
    Ok(out)
}

fn group_key(memory: &Memory, last_seen: &HashMap<String, String>) -> String {
    if memory.entities.is_empty() {
        // No entities: nothing to collapse on, each memory is its own group.
        return format!("id:{}", memory.id);
    }
    let primary = memory
        .entities
        .iter()
        .max_by(|a, b| {
            let sa = last_seen.get(*a).map(|s| s.as_str()).unwrap_or("");
            let sb = last_seen.get(*b).map(|s| s.as_str()).unwrap_or("");
            sa.cmp(sb).then_with(|| a.cmp(b))
        })
        .cloned()
        .unwrap_or_default();

    let mut topics: Vec<&str> = memory.topics.iter().map(|t| t.as_str()).collect();
    topics.sort_unstable();
    format!("{primary}|{}", topics.join(","))
}

/// Collapse a dedup group. Stale members (superseded, archived) fold into
/// the current fact with the latest `valid_from`; distinct current facts
/// about the same entity stay separate results. When the whole group is
/// historical (point-in-time recall), the latest `valid_from` wins
/// outright.
fn collapse_group(members: Vec<RecalledMemory>) -> Vec<RecalledMemory> {
    if members.len() == 1 {
        return members;
    }

    let is_stale = |m: &RecalledMemory| {
        matches!(
            m.memory.status,
            MemoryStatus::Superseded | MemoryStatus::Archived
        )
    };
    let (stale, mut current): (Vec<_>, Vec<_>) = members.into_iter().partition(|m| is_stale(m));

    if current.is_empty() {
        // Historical group: latest valid_from wins, the rest collapse.
        let mut pool = stale;
        let winner_idx = latest_valid_from(&pool);
        let mut winner = pool.swap_remove(winner_idx);
        winner.deduped.extend(pool.into_iter().map(|m| m.memory.id));
        return vec![winner];
    }

    let winner_idx = latest_valid_from(&current);
    current[winner_idx]
        .deduped
        .extend(stale.into_iter().map(|m| m.memory.id));
    current
}

fn latest_valid_from(pool: &[RecalledMemory]) -> usize {
    pool.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.memory
                .valid_from
                .cmp(&b.memory.valid_from)
                .then_with(|| b.memory.id.cmp(&a.memory.id))
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn entity_last_seen(
    conn: &Connection,
    names: &[String],
) -> Result<HashMap<String, String>> {
    if names.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT name, last_seen FROM entities WHERE name IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_vec: Vec<&dyn rusqlite::types::ToSql> =
        names.iter().map(|n| n as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(params_vec.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::memory::store::NewMemory;
    use crate::memory::types::Source;

    /// Deterministic embedder: spike keyed off the first word's bytes.
    struct FakeEmbedder;

    impl EmbeddingProvider for FakeEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; 8];
            let word = text.split_whitespace().next().unwrap_or("");
            let seed: usize = word.bytes().map(|b| b as usize).sum();
            v[seed % 8] = 1.0;
            Ok(v)
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    /// Embedder that is always down.
    struct DownEmbedder;

    impl EmbeddingProvider for DownEmbedder {
        fn embed(&self, _: &str) -> Result<Vec<f32>> {
            Err(EngramError::RateLimited("down".into()))
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    fn test_db() -> Connection {
        crate::db::open_memory_database(8).unwrap()
    }

    fn remember(
        conn: &mut Connection,
        content: &str,
        entities: &[&str],
        status: MemoryStatus,
    ) -> String {
        let id = store::insert(
            conn,
            &NewMemory {
                content: content.to_string(),
                memory_type: MemoryType::Episodic,
                status,
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
        let mut emb = FakeEmbedder.embed(content).unwrap();
        crate::embedding::normalize(&mut emb);
        store::update_embedding(conn, &id, &emb).unwrap();
        id
    }

    fn run(conn: &Connection, query: &RecallQuery) -> Vec<RecalledMemory> {
        let config = VaultConfig::default();
        recall(
            conn,
            &FakeEmbedder,
            &config.recall,
            &config.aggregation,
            query,
            None,
        )
        .unwrap()
    }

    #[test]
    fn empty_vault_returns_empty_list() {
        let conn = test_db();
        let results = run(&conn, &RecallQuery::new("anything at all", 5));
        assert!(results.is_empty());
    }

    #[test]
    fn round_trip_by_content() {
        let mut conn = test_db();
        let id = remember(
            &mut conn,
            "quarterly planning happens in March",
            &[],
            MemoryStatus::Active,
        );
        let results = run(&conn, &RecallQuery::new("quarterly planning happens in March", 5));
        assert!(!results.is_empty());
        assert_eq!(results[0].memory.id, id);
        assert_eq!(results[0].memory.content, "quarterly planning happens in March");
    }

    #[test]
    fn results_respect_limit_and_are_unique() {
        let mut conn = test_db();
        for i in 0..12 {
            remember(
                &mut conn,
                &format!("observation number {i} about planning"),
                &[],
                MemoryStatus::Active,
            );
        }
        let results = run(&conn, &RecallQuery::new("observation about planning", 4));
        assert!(results.len() <= 4);
        let ids: HashSet<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
        assert_eq!(ids.len(), results.len());
    }

    #[test]
    fn archived_memories_never_surface() {
        let mut conn = test_db();
        let id = remember(&mut conn, "archived observation", &[], MemoryStatus::Active);
        conn.execute(
            "UPDATE memories SET status = 'archived' WHERE id = ?1",
            rusqlite::params![id],
        )
        .unwrap();

        let results = run(&conn, &RecallQuery::new("archived observation", 5));
        assert!(results.iter().all(|r| r.memory.id != id));
    }

    #[test]
    fn aggregation_phrase_routes_to_pending_materialization() {
        let mut conn = test_db();
        let mut pending_ids: HashSet<String> = HashSet::new();
        for i in 0..5 {
            pending_ids.insert(remember(
                &mut conn,
                &format!("commitment item {i}"),
                &[],
                MemoryStatus::Pending,
            ));
        }
        for i in 0..20 {
            remember(
                &mut conn,
                &format!("active noise item {i}"),
                &[],
                MemoryStatus::Active,
            );
        }

        let results = run(&conn, &RecallQuery::new("What are all the pending commitments?", 10));
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| pending_ids.contains(&r.memory.id)));
    }

    #[test]
    fn spread_surfaces_linked_memories() {
        let mut conn = test_db();
        let a = remember(
            &mut conn,
            "Atlas v3 is the next release",
            &["Atlas"],
            MemoryStatus::Active,
        );
        let b = remember(
            &mut conn,
            "Priya will leave if ML investment does not increase",
            &["Priya", "ML"],
            MemoryStatus::Active,
        );
        let c = remember(
            &mut conn,
            "Priya leads ML work on Atlas",
            &["Priya", "Atlas", "ML"],
            MemoryStatus::Active,
        );

        let mut query = RecallQuery::new("Atlas v3 status", 10);
        query.spread = true;
        query.spread_hops = Some(2);
        let with_spread = run(&conn, &query);
        let ids: Vec<&str> = with_spread.iter().map(|r| r.memory.id.as_str()).collect();
        assert!(ids.contains(&a.as_str()));
        assert!(ids.contains(&c.as_str()));
        assert!(ids.contains(&b.as_str()), "B should surface via the Priya/Atlas/ML path");

        let without = run(&conn, &RecallQuery::new("Atlas v3 status", 10));
        let ids: Vec<&str> = without.iter().map(|r| r.memory.id.as_str()).collect();
        assert!(!ids.contains(&b.as_str()), "B must not surface without spread");
    }

    #[test]
    fn spread_with_isolated_candidate_returns_it_once() {
        let mut conn = test_db();
        let id = remember(&mut conn, "isolated island fact", &[], MemoryStatus::Active);

        let mut query = RecallQuery::new("isolated island fact", 5);
        query.spread = true;
        let results = run(&conn, &query);
        let hits: Vec<&RecalledMemory> =
            results.iter().filter(|r| r.memory.id == id).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn temporal_dedup_prefers_newer_active_fact() {
        let mut conn = test_db();
        let old = remember(
            &mut conn,
            "Alex works at Corp A",
            &["Alex"],
            MemoryStatus::Active,
        );
        let new = remember(
            &mut conn,
            "Alex moved to Corp B",
            &["Alex"],
            MemoryStatus::Active,
        );
        store::supersede(&mut conn, &old, &new, &chrono::Utc::now().to_rfc3339()).unwrap();

        let results = run(&conn, &RecallQuery::new("Where does Alex work?", 3));
        assert!(!results.is_empty());
        assert_eq!(results[0].memory.id, new);
        assert!(results.iter().all(|r| r.memory.id != old));
        // the old fact collapsed into the survivor
        assert!(results[0].deduped.contains(&old));
    }

    #[test]
    fn point_in_time_recall_returns_historical_truth() {
        let mut conn = test_db();
        let t0 = "2026-01-01T00:00:00+00:00";
        let t1 = "2026-03-01T00:00:00+00:00";

        let x = store::insert(
            &mut conn,
            &NewMemory {
                content: "project uses framework X".into(),
                memory_type: MemoryType::Semantic,
                status: MemoryStatus::Active,
                salience: 0.5,
                entities: vec![("framework x".into(), "Framework X".into())],
                topics: vec![],
                source: Source::default(),
                valid_from: Some(t0.into()),
                needs_review: false,
                id: None,
            },
            16,
        )
        .unwrap();
        let y = store::insert(
            &mut conn,
            &NewMemory {
                content: "project uses framework Y".into(),
                memory_type: MemoryType::Semantic,
                status: MemoryStatus::Active,
                salience: 0.5,
                entities: vec![("framework y".into(), "Framework Y".into())],
                topics: vec![],
                source: Source::default(),
                valid_from: Some(t1.into()),
                needs_review: false,
                id: None,
            },
            16,
        )
        .unwrap();
        store::supersede(&mut conn, &x, &y, t1).unwrap();

        let mut mid = RecallQuery::new("framework", 3);
        mid.at = Some("2026-02-01T00:00:00+00:00".into());
        let results = run(&conn, &mid);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory.id, x);

        let mut later = RecallQuery::new("framework", 3);
        later.at = Some("2026-04-01T00:00:00+00:00".into());
        let results = run(&conn, &later);
        let ids: Vec<&str> = results.iter().map(|r| r.memory.id.as_str()).collect();
        assert_eq!(ids, vec![y.as_str()]);

        // every returned memory satisfies the validity window
        for r in &results {
            assert!(r.memory.valid_at("2026-04-01T00:00:00+00:00"));
        }
    }

    #[test]
    fn down_embedder_degrades_to_entity_and_fts() {
        let mut conn = test_db();
        let id = remember(
            &mut conn,
            "Priya presented the roadmap",
            &["Priya"],
            MemoryStatus::Active,
        );

        let config = VaultConfig::default();
        let results = recall(
            &conn,
            &DownEmbedder,
            &config.recall,
            &config.aggregation,
            &RecallQuery::new("Priya roadmap", 5),
            None,
        )
        .unwrap();
        assert!(results.iter().any(|r| r.memory.id == id));
        assert_eq!(results[0].breakdown.vector, 0.0);
    }

    #[test]
    fn type_filter_is_enforced() {
        let mut conn = test_db();
        remember(&mut conn, "episodic planning note", &[], MemoryStatus::Active);

        let mut query = RecallQuery::new("planning note", 5);
        query.types = vec![MemoryType::Procedural];
        let results = run(&conn, &query);
        assert!(results.is_empty());
    }

    #[test]
    fn cancellation_aborts_with_error() {
        let mut conn = test_db();
        remember(&mut conn, "some content", &[], MemoryStatus::Active);

        let config = VaultConfig::default();
        let cancel = AtomicBool::new(true);
        let err = recall(
            &conn,
            &FakeEmbedder,
            &config.recall,
            &config.aggregation,
            &RecallQuery::new("some content", 5),
            Some(&cancel),
        )
        .unwrap_err();
        assert!(matches!(err, EngramError::Cancelled(_)));
    }

    #[test]
    fn recall_stamps_returned_memories() {
        let mut conn = test_db();
        let id = remember(&mut conn, "stampable fact", &[], MemoryStatus::Active);

        run(&conn, &RecallQuery::new("stampable fact", 5));

        let last: Option<String> = conn
            .query_row(
                "SELECT last_accessed_at FROM memories WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(last.is_some());
    }

    #[test]
    fn half_life_kernel_shape() {
        let now = "2026-01-31T00:00:00+00:00";
        let then = "2026-01-01T00:00:00+00:00";
        let k = half_life_kernel(then, now, 30.0);
        assert!((k - 0.5).abs() < 0.01);
        assert!((half_life_kernel(now, now, 30.0) - 1.0).abs() < 1e-9);
    }
}
