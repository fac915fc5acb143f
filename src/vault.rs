//! The vault — one object per owner + DB file, exposing the public surface
//! consumed by the HTTP adapter (and any other front end).
//!
//! A vault is constructed with its providers injected, which is what makes
//! in-memory fakes possible in tests. The write path returns as soon as
//! the row is durable; embedding happens on the background queue and
//! `flush` joins on its drain signal. `open`/`close` are idempotent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::config::VaultConfig;
use crate::embedding::queue::EmbedQueue;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngramError, Result};
use crate::llm::LlmProvider;
use crate::memory::consolidate::ConsolidateReport;
use crate::memory::graph::NeighborHit;
use crate::memory::ops::{Alert, Answer, Briefing, ContradictionView, Surfaced};
use crate::memory::recall::{RecallQuery, RecalledMemory};
use crate::memory::stats::StatsResponse;
use crate::memory::types::{EdgeKind, Entity, Memory, MemoryStatus, MemoryType, Source};
use crate::memory::{consolidate, extract, forget, graph, ops, recall, stats, store};

/// Caller-supplied fields for `remember`; anything absent is derived by
/// auto-extraction.
#[derive(Debug, Clone, Default)]
pub struct RememberOptions {
    pub memory_type: Option<MemoryType>,
    pub entities: Vec<String>,
    pub topics: Vec<String>,
    pub salience: Option<f64>,
    pub status: Option<MemoryStatus>,
    pub source: Option<Source>,
}

/// A memory vault bound to one owner and one storage location.
pub struct Vault {
    conn: Arc<Mutex<Connection>>,
    config: VaultConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Option<Arc<dyn LlmProvider>>,
    queue: EmbedQueue,
    db_path: Option<PathBuf>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("config", &self.config)
            .field("db_path", &self.db_path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Vault {
    /// Open (or create) the vault at the configured path. Fails with
    /// [`EngramError::Unavailable`] when another writer holds the file.
    /// Rows left `pending` by a crash are re-queued for embedding.
    pub fn open(
        config: VaultConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        let dims = config.embedding.dimensions;
        if embedder.dimensions() != dims {
            return Err(EngramError::InvalidPayload(format!(
                "embedder produces {} dimensions, vault configured for {dims}",
                embedder.dimensions()
            )));
        }

        let path = config.resolved_db_path();
        let conn = crate::db::open_database(&path, dims, &config.vault.owner)?;
        Self::finish_open(conn, config, embedder, llm, Some(path))
    }

    /// Open an in-memory vault (tests, throwaway sessions).
    pub fn open_in_memory(
        config: VaultConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Result<Self> {
        if embedder.dimensions() != config.embedding.dimensions {
            return Err(EngramError::InvalidPayload(format!(
                "embedder produces {} dimensions, vault configured for {}",
                embedder.dimensions(),
                config.embedding.dimensions
            )));
        }
        let conn = crate::db::open_memory_database(config.embedding.dimensions)?;
        Self::finish_open(conn, config, embedder, llm, None)
    }

    fn finish_open(
        conn: Connection,
        config: VaultConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Option<Arc<dyn LlmProvider>>,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let conn = Arc::new(Mutex::new(conn));
        let queue = EmbedQueue::start(
            Arc::clone(&conn),
            Arc::clone(&embedder),
            config.embedding.clone(),
        );

        let vault = Self {
            conn,
            config,
            embedder,
            llm,
            queue,
            db_path,
            closed: AtomicBool::new(false),
        };
        vault.requeue_pending()?;
        Ok(vault)
    }

    /// Re-queue rows whose embedding never arrived (crash between commit
    /// and index population).
    fn requeue_pending(&self) -> Result<()> {
        let pending: Vec<(String, String)> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT id, content FROM memories WHERE embed_state = 'pending'")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "re-queueing unembedded rows");
        }
        for (id, content) in pending {
            self.queue.enqueue(id, content);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(EngramError::Unavailable("vault is closed".into()));
        }
        Ok(())
    }

    // ── Write path ───────────────────────────────────────────────────────

    /// Ingest one observation. Returns once the row is durable; the
    /// embedding is queued. Extraction failures never fail the write.
    pub fn remember(&self, content: &str, opts: RememberOptions) -> Result<String> {
        self.ensure_open()?;

        let extraction = match &self.llm {
            Some(llm) => extract::extract_with_llm(content, &[], llm.as_ref(), 5_000),
            None => extract::extract(content, &[]),
        };

        let mut entities = extraction.entities;
        for name in &opts.entities {
            let norm = extract::normalize_entity(name);
            if !norm.is_empty() && !entities.iter().any(|(n, _)| *n == norm) {
                entities.push((norm, name.clone()));
            }
        }
        let mut topics = extraction.topics;
        for topic in &opts.topics {
            let t = topic.trim().to_lowercase();
            if !t.is_empty() && !topics.contains(&t) {
                topics.push(t);
            }
        }

        let memory_type = opts.memory_type.unwrap_or(extraction.memory_type);
        let status = opts.status.unwrap_or(extraction.status);

        let mut salience = opts.salience.unwrap_or(extraction.salience);
        if !(0.0..=1.0).contains(&salience) {
            return Err(EngramError::InvalidPayload(format!(
                "salience {salience} out of range [0, 1]"
            )));
        }

        let id = {
            let mut conn = self.conn.lock().unwrap();

            // Declarative content about people the vault already knows is
            // worth a little more.
            if opts.salience.is_none() && memory_type == MemoryType::Semantic {
                let names: Vec<String> = entities.iter().map(|(n, _)| n.clone()).collect();
                if !store::known_entities(&conn, &names)?.is_empty() {
                    salience = (salience + 0.1).min(1.0);
                }
            }

            store::insert(
                &mut conn,
                &store::NewMemory {
                    content: content.to_string(),
                    memory_type,
                    status,
                    salience,
                    entities,
                    topics,
                    source: opts.source.unwrap_or_default(),
                    valid_from: None,
                    needs_review: extraction.needs_review,
                    id: None,
                },
                self.config.graph.entity_edge_cap,
            )?
        };

        self.queue.enqueue(id.clone(), content.to_string());
        tracing::debug!(id = %id, "memory accepted");
        Ok(id)
    }

    /// Reinforce an existing memory (salience up, count up).
    pub fn reinforce(&self, id: &str) -> Result<f64> {
        self.ensure_open()?;
        let mut conn = self.conn.lock().unwrap();
        store::reinforce(&mut conn, id)
    }

    /// Promote a pending commitment to fulfilled.
    pub fn fulfill(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        store::fulfill(&conn, id)
    }

    /// Forget a memory: soft (archive) by default, hard removes every trace.
    pub fn forget(&self, id: &str, hard: bool) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.conn.lock().unwrap();
        forget::forget(&mut conn, id, hard)?;
        Ok(())
    }

    /// Assert an edge between two memories. `supersedes` routes through the
    /// explicit supersession transition so edge and pointer stay in sync.
    pub fn connect(&self, src_id: &str, dst_id: &str, kind: EdgeKind, weight: f64) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.conn.lock().unwrap();
        if kind == EdgeKind::Supersedes {
            let at = chrono::Utc::now().to_rfc3339();
            store::supersede(&mut conn, dst_id, src_id, &at)
        } else {
            graph::connect(&conn, src_id, dst_id, kind, weight)
        }
    }

    // ── Read path ────────────────────────────────────────────────────────

    /// Multi-signal recall. See [`RecallQuery`] for the knobs.
    pub fn recall(&self, query: &RecallQuery) -> Result<Vec<RecalledMemory>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        recall::recall(
            &conn,
            self.embedder.as_ref(),
            &self.config.recall,
            &self.config.aggregation,
            query,
            None,
        )
    }

    /// Fetch one memory by id.
    pub fn get(&self, id: &str) -> Result<Memory> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        store::get(&conn, id)
    }

    /// Bounded neighborhood of a memory in the edge graph.
    pub fn neighbors(&self, id: &str, depth: usize) -> Result<Vec<NeighborHit>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        graph::neighbors(&conn, id, depth, None, self.config.graph.edge_visit_budget)
    }

    /// Recall + LLM synthesis with source attribution.
    pub fn ask(&self, question: &str, limit: usize) -> Result<Answer> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        ops::ask(
            &conn,
            self.embedder.as_ref(),
            self.llm.as_deref(),
            &self.config,
            question,
            limit,
        )
    }

    /// Structured briefing: key facts, commitments, activity, entities.
    pub fn briefing(&self, context: Option<&str>, limit: usize) -> Result<Briefing> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        ops::briefing(&conn, self.embedder.as_ref(), &self.config, context, limit)
    }

    /// Proactive recall with a novelty bias.
    pub fn surface(
        &self,
        context: &str,
        active_entities: &[String],
        active_topics: &[String],
        limit: usize,
    ) -> Result<Vec<Surfaced>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        ops::surface(
            &conn,
            self.embedder.as_ref(),
            &self.config,
            context,
            active_entities,
            active_topics,
            limit,
        )
    }

    /// Stale commitments and open contradictions.
    pub fn alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        ops::alerts(&conn, &self.config, limit)
    }

    /// Currently-open contradiction pairs.
    pub fn contradictions(&self, limit: usize) -> Result<Vec<ContradictionView>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        ops::contradictions(&conn, limit)
    }

    /// All entities, most recently seen first.
    pub fn entities(&self) -> Result<Vec<Entity>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        store::all_entities(&conn)
    }

    /// Vault statistics.
    pub fn stats(&self) -> Result<StatsResponse> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        stats::stats(&conn, self.db_path.as_deref())
    }

    /// Full JSON dump for backup.
    pub fn export(&self) -> Result<serde_json::Value> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        ops::export(&conn)
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Run one consolidation cycle within the wall-clock budget.
    pub fn consolidate(&self, budget_ms: Option<u64>) -> Result<ConsolidateReport> {
        self.ensure_open()?;
        let mut conn = self.conn.lock().unwrap();
        consolidate::run(
            &mut conn,
            self.embedder.as_ref(),
            self.llm.as_deref(),
            &self.config.consolidation,
            &self.config.lifecycle,
            budget_ms,
            None,
        )
    }

    /// Await the embedding queue drain.
    pub fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.queue.flush(Some(Duration::from_secs(30)))
    }

    /// Drain and shut down. Idempotent; the vault rejects work afterwards.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.queue.flush(Some(Duration::from_secs(10))) {
            tracing::warn!(error = %e, "embedding queue did not drain before close");
        }
        self.queue.shutdown();
        tracing::info!("vault closed");
    }

    /// The configuration this vault was opened with.
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.close();
    }
}
