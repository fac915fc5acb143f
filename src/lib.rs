//! Engram — a local-first long-term memory engine for AI agents.
//!
//! Observations are ingested as typed, bi-temporally tracked records in an
//! embedded SQLite store, organized into an entity/edge knowledge graph,
//! and served back through a recall pipeline that combines dense-vector
//! similarity, entity and topic matching, graph spreading activation,
//! temporal weighting, and dedup by supersession.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for vector search
//! - **Providers**: embedding and LLM capabilities are constructor-injected
//!   ([`embedding::EmbeddingProvider`], [`llm::LlmProvider`])
//! - **Write path**: rule-based extraction → durable row → background
//!   embedding queue → edge synthesis
//! - **Read path**: seed retrieval → spreading activation → multi-signal
//!   scoring → temporal dedup
//!
//! # Modules
//!
//! - [`config`] — the `VaultConfig` aggregate, TOML + env overrides
//! - [`db`] — SQLite initialization, schema, migrations, health checks
//! - [`embedding`] — provider trait and the batched embedding queue
//! - [`memory`] — the engine: store, extract, graph, recall, consolidate,
//!   lifecycle, derived ops
//! - [`vault`] — the public per-vault surface
//! - [`server`] — the `/v1` HTTP JSON adapter

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod memory;
pub mod server;
pub mod vault;

pub use config::VaultConfig;
pub use error::{EngramError, Result};
pub use vault::{RememberOptions, Vault};
