//! Typed edge graph: creation, bounded traversal, and spreading activation.
//!
//! Edges are synthesized by the write path (entity-shared, temporal-next),
//! by consolidation (supports, elaborates, contradicts, supersedes), and by
//! callers (user). Traversal is by id lookup over the adjacency store — no
//! in-memory cycles.

use std::collections::{HashMap, HashSet, VecDeque};

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{EngramError, Result};
use crate::memory::types::{Edge, EdgeKind};

/// One hit from a bounded BFS over the edge graph.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborHit {
    pub id: String,
    /// Hop count from the origin (1 = direct neighbor).
    pub hop: usize,
    /// Edge kinds traversed to reach this memory.
    pub via: Vec<EdgeKind>,
}

/// Spreading activation bounds.
#[derive(Debug, Clone)]
pub struct SpreadOptions {
    pub max_hops: usize,
    /// Per-hop decay in (0, 1).
    pub decay: f64,
    /// Total node-visit budget.
    pub node_budget: usize,
}

impl Default for SpreadOptions {
    fn default() -> Self {
        Self {
            max_hops: 2,
            decay: 0.6,
            node_budget: 4096,
        }
    }
}

/// Store a directed edge between two memories. Idempotent in the edge set.
///
/// `supersedes` edges are not created here — they come from the explicit
/// supersession transition so the edge and the row pointer always agree.
pub fn connect(
    conn: &Connection,
    src_id: &str,
    dst_id: &str,
    kind: EdgeKind,
    weight: f64,
) -> Result<()> {
    if kind == EdgeKind::Supersedes {
        return Err(EngramError::InvalidPayload(
            "supersedes edges are created by the supersede transition".into(),
        ));
    }
    if !(0.0..=1.0).contains(&weight) {
        return Err(EngramError::InvalidPayload(format!(
            "edge weight {weight} out of range [0, 1]"
        )));
    }
    if src_id == dst_id {
        return Err(EngramError::InvalidPayload("self-edges are not allowed".into()));
    }
    for id in [src_id, dst_id] {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(EngramError::NotFound(format!("memory not found: {id}")));
        }
    }

    conn.execute(
        "INSERT OR IGNORE INTO edges (src_id, dst_id, kind, weight, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            src_id,
            dst_id,
            kind.as_str(),
            weight,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Outbound edges of a memory, optionally filtered by kind.
pub fn edges_from(
    conn: &Connection,
    src_id: &str,
    kinds: Option<&[EdgeKind]>,
) -> Result<Vec<Edge>> {
    let mut stmt = conn.prepare(
        "SELECT src_id, dst_id, kind, weight, created_at FROM edges WHERE src_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![src_id], |row| {
            let kind_str: String = row.get(2)?;
            Ok((
                Edge {
                    src_id: row.get(0)?,
                    dst_id: row.get(1)?,
                    kind: EdgeKind::Supports, // patched below
                    weight: row.get(3)?,
                    created_at: row.get(4)?,
                },
                kind_str,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (mut edge, kind_str) in rows {
        let Ok(kind) = kind_str.parse::<EdgeKind>() else {
            continue;
        };
        edge.kind = kind;
        if kinds.map_or(true, |ks| ks.contains(&kind)) {
            out.push(edge);
        }
    }
    Ok(out)
}

/// Bounded BFS from a memory. Returns direct and transitive neighbors up to
/// `depth` hops, capped at an edge-visit budget so hub nodes cannot blow up
/// the traversal.
pub fn neighbors(
    conn: &Connection,
    origin: &str,
    depth: usize,
    kinds: Option<&[EdgeKind]>,
    edge_budget: usize,
) -> Result<Vec<NeighborHit>> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM memories WHERE id = ?1",
        params![origin],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(EngramError::NotFound(format!("memory not found: {origin}")));
    }

    let mut visited: HashSet<String> = HashSet::from([origin.to_string()]);
    let mut queue: VecDeque<(String, usize, Vec<EdgeKind>)> =
        VecDeque::from([(origin.to_string(), 0, Vec::new())]);
    let mut hits: Vec<NeighborHit> = Vec::new();
    let mut edges_seen = 0usize;

    while let Some((id, hop, via)) = queue.pop_front() {
        if hop >= depth {
            continue;
        }
        for edge in edges_from(conn, &id, kinds)? {
            edges_seen += 1;
            if edges_seen > edge_budget {
                tracing::debug!(origin, edge_budget, "neighbors traversal hit edge budget");
                return Ok(hits);
            }
            if visited.insert(edge.dst_id.clone()) {
                let mut path = via.clone();
                path.push(edge.kind);
                hits.push(NeighborHit {
                    id: edge.dst_id.clone(),
                    hop: hop + 1,
                    via: path.clone(),
                });
                queue.push_back((edge.dst_id, hop + 1, path));
            }
        }
    }

    Ok(hits)
}

/// Spreading activation from a seed set.
///
/// Each seed starts at its seed activation and propagates along outbound
/// edges: contribution = activation × hop-decay × kind weight × edge
/// weight. Contradiction edges do not conduct; superseded and archived
/// targets are inadmissible. Output maps memory id → activation
/// accumulated from spread alone (seeds excluded).
pub fn spread(
    conn: &Connection,
    seeds: &[(String, f64)],
    opts: &SpreadOptions,
) -> Result<HashMap<String, f64>> {
    let seed_ids: HashSet<&str> = seeds.iter().map(|(id, _)| id.as_str()).collect();
    let mut activation: HashMap<String, f64> = HashMap::new();
    let mut frontier: Vec<(String, f64)> = seeds.to_vec();
    let mut visits = 0usize;

    for _hop in 0..opts.max_hops {
        let mut next: HashMap<String, f64> = HashMap::new();
        for (id, level) in &frontier {
            visits += 1;
            if visits > opts.node_budget {
                tracing::debug!(budget = opts.node_budget, "spread hit node budget");
                return Ok(activation);
            }
            for edge in edges_from(conn, id, None)? {
                let kind_weight = edge.kind.spread_weight();
                if kind_weight <= 0.0 {
                    continue;
                }
                if !admissible(conn, &edge.dst_id)? {
                    continue;
                }
                let contribution = level * opts.decay * kind_weight * edge.weight;
                if contribution <= f64::EPSILON {
                    continue;
                }
                *next.entry(edge.dst_id.clone()).or_insert(0.0) += contribution;
            }
        }
        if next.is_empty() {
            break;
        }
        for (id, level) in &next {
            if !seed_ids.contains(id.as_str()) {
                *activation.entry(id.clone()).or_insert(0.0) += level;
            }
        }
        frontier = next.into_iter().collect();
    }

    Ok(activation)
}

/// Spread targets must be current: superseded and archived memories do not
/// receive activation.
fn admissible(conn: &Connection, id: &str) -> Result<bool> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM memories WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(matches!(
        status.as_deref(),
        Some("active") | Some("pending") | Some("fulfilled")
    ))
}

/// Remove non-supersedes edges with an archived endpoint. Supersedes edges
/// stay: the supersession chain is a truth concern, not a storage concern.
pub fn gc_dangling_edges(conn: &Connection) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM edges WHERE kind != 'supersedes' AND (\
             src_id IN (SELECT id FROM memories WHERE status = 'archived') \
             OR dst_id IN (SELECT id FROM memories WHERE status = 'archived'))",
        [],
    )?;
    Ok(removed)
}
