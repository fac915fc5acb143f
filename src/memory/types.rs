//! Core memory type definitions.
//!
//! Defines [`MemoryType`] (the four content classes), [`MemoryStatus`]
//! (fact lifecycle), [`Source`] (provenance), [`Memory`] (a full record),
//! [`Entity`] (graph node), and [`Edge`]/[`EdgeKind`] (typed graph edges).

use serde::{Deserialize, Serialize};

/// The four content classes a memory can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Event-like observations: things that happened.
    Episodic,
    /// Declarative facts, preferences, role statements.
    Semantic,
    /// Imperative, recipe-like content: how to do things.
    Procedural,
    /// Synthesized summary produced by consolidation.
    Consolidated,
}

impl MemoryType {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Consolidated => "consolidated",
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "procedural" => Ok(Self::Procedural),
            "consolidated" => Ok(Self::Consolidated),
            _ => Err(format!("unknown memory type: {s}")),
        }
    }
}

/// Lifecycle of the fact a memory records — not of its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    /// Current truth.
    Active,
    /// Open commitment awaiting fulfillment.
    Pending,
    /// A commitment that was completed. Only reachable from `Pending`.
    Fulfilled,
    /// Replaced by a newer fact; `superseded_by` points at the successor.
    Superseded,
    /// Soft-forgotten. Excluded from recall seeds.
    Archived,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Superseded => "superseded",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "pending" => Ok(Self::Pending),
            "fulfilled" => Ok(Self::Fulfilled),
            "superseded" => Ok(Self::Superseded),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("unknown memory status: {s}")),
        }
    }
}

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Conversation,
    Document,
    External,
    #[default]
    System,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Document => "document",
            Self::External => "external",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation" => Ok(Self::Conversation),
            "document" => Ok(Self::Document),
            "external" => Ok(Self::External),
            "system" => Ok(Self::System),
            _ => Err(format!("unknown source kind: {s}")),
        }
    }
}

/// Provenance: kind plus optional free-form reference and session chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    /// Agent id, external ref, document path — whatever the caller supplies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Session id; chronologically adjacent memories in the same session
    /// receive a weak temporal-next edge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

/// Embedding pipeline state for a memory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedState {
    /// Row committed, vector not yet computed.
    Pending,
    /// Vector present in the index.
    Ready,
    /// Embedding permanently failed; recallable by entity/full-text only.
    Failed,
}

impl EmbedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for EmbedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown embed state: {s}")),
        }
    }
}

/// A memory record, matching the `memories` table schema.
///
/// Content is never mutated after creation; corrections arrive as new
/// memories that supersede. The bi-temporal interval `[valid_from,
/// valid_until)` is half-open; `valid_until = None` means current truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// UUID v7 (time-sortable) primary key.
    pub id: String,
    /// The full text content of the memory.
    pub content: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
    /// Confidence-weighted importance in `[0.0, 1.0]`.
    pub salience: f64,
    /// Normalized entity names referenced by this memory.
    pub entities: Vec<String>,
    pub topics: Vec<String>,
    pub source: Source,
    /// ISO 8601 instant storage accepted the record.
    pub created_at: String,
    pub valid_from: String,
    /// `None` = fact is current truth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<String>,
    pub reinforcement_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
    pub embed_state: EmbedState,
    /// Set when extraction or synthesis degraded to a best-effort result.
    pub needs_review: bool,
}

impl Memory {
    /// Whether this memory's validity interval covers instant `at`
    /// (RFC 3339 comparison; `valid_until = None` is ∞).
    pub fn valid_at(&self, at: &str) -> bool {
        self.valid_from.as_str() <= at
            && self.valid_until.as_deref().map_or(true, |until| at < until)
    }
}

/// An entity node. Identity is the normalized name; no UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Case/diacritic-folded, trimmed name.
    pub name: String,
    /// Original surface form, preserved for display.
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    pub created_at: String,
    pub memory_count: u32,
    pub last_seen: String,
}

/// Typed edge kinds. Directed; antiparallel pairs with different kinds
/// are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Supports,
    Contradicts,
    Elaborates,
    Supersedes,
    EntityShared,
    TemporalNext,
    User,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::Elaborates => "elaborates",
            Self::Supersedes => "supersedes",
            Self::EntityShared => "entity-shared",
            Self::TemporalNext => "temporal-next",
            Self::User => "user",
        }
    }

    /// Per-kind propagation weight for spreading activation.
    /// Contradiction edges do not conduct.
    pub fn spread_weight(&self) -> f64 {
        match self {
            Self::Supports | Self::Elaborates => 1.0,
            Self::Supersedes | Self::User => 0.8,
            Self::EntityShared => 0.7,
            Self::TemporalNext => 0.4,
            Self::Contradicts => 0.0,
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supports" => Ok(Self::Supports),
            "contradicts" => Ok(Self::Contradicts),
            "elaborates" => Ok(Self::Elaborates),
            "supersedes" => Ok(Self::Supersedes),
            "entity-shared" => Ok(Self::EntityShared),
            "temporal-next" => Ok(Self::TemporalNext),
            "user" => Ok(Self::User),
            _ => Err(format!("unknown edge kind: {s}")),
        }
    }
}

/// A directed, weighted, typed edge between two memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src_id: String,
    pub dst_id: String,
    pub kind: EdgeKind,
    pub weight: f64,
    pub created_at: String,
}
