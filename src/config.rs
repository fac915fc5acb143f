use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VaultConfig {
    pub vault: VaultSection,
    pub server: ServerConfig,
    pub embedding: EmbeddingConfig,
    pub recall: RecallConfig,
    pub graph: GraphConfig,
    pub consolidation: ConsolidationConfig,
    pub lifecycle: LifecycleConfig,
    /// Phrase patterns that route the recall seed phase to a status or type
    /// materialization instead of vector search.
    pub aggregation: Vec<AggregationRule>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VaultSection {
    /// Ownership tag stamped into vault_meta at creation.
    pub owner: String,
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Optional bearer token; normally supplied via ENGRAM_TOKEN.
    pub bearer_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Fixed at first open; changing it means a new vault.
    pub dimensions: usize,
    /// Flush a pending batch at this many items.
    pub batch_size: usize,
    /// ...or when the oldest queued item reaches this age.
    pub batch_linger_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecallConfig {
    pub default_limit: usize,
    pub seed_expansion_factor: usize,
    pub weights: RecallWeights,
    pub spread_hops: usize,
    pub spread_decay: f64,
    pub spread_node_budget: usize,
    pub recency_half_life_days: f64,
    pub age_half_life_days: f64,
}

/// Multi-signal scoring weights. Tunable per vault.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecallWeights {
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

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    /// In-neighborhood cap for entity-shared edges per entity on insert.
    pub entity_edge_cap: usize,
    /// Edge-visit budget for bounded BFS in neighbors().
    pub edge_visit_budget: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub merge_threshold: f64,
    pub min_cluster_size: usize,
    pub budget_ms: u64,
    /// Combined memory count at which same-squash entity names merge.
    pub alias_cooccurrence: u32,
    /// Per-entity cap on pairwise contradiction checks per run.
    pub contradiction_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub archive_threshold: f64,
    pub decay_step: f64,
    pub decay_window_days: u64,
    /// Pending commitments older than this show up in alerts().
    pub pending_alert_days: u64,
    /// surface() skips items accessed within this window (novelty floor).
    pub surface_idle_hours: u64,
}

/// One aggregation routing rule: any phrase match routes the seed phase.
#[derive(Debug, Deserialize, Clone)]
pub struct AggregationRule {
    pub phrases: Vec<String>,
    /// "status:<status>" or "type:<type>".
    pub target: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            vault: VaultSection::default(),
            server: ServerConfig::default(),
            embedding: EmbeddingConfig::default(),
            recall: RecallConfig::default(),
            graph: GraphConfig::default(),
            consolidation: ConsolidationConfig::default(),
            lifecycle: LifecycleConfig::default(),
            aggregation: default_aggregation_rules(),
        }
    }
}

impl Default for VaultSection {
    fn default() -> Self {
        let db_path = default_engram_dir()
            .join("vault.db")
            .to_string_lossy()
            .into_owned();
        Self {
            owner: "default".into(),
            db_path,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8737,
            log_level: "info".into(),
            bearer_token: None,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: 384,
            batch_size: 16,
            batch_linger_ms: 250,
            retry_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            seed_expansion_factor: 4,
            weights: RecallWeights::default(),
            spread_hops: 2,
            spread_decay: 0.6,
            spread_node_budget: 4096,
            recency_half_life_days: 30.0,
            age_half_life_days: 180.0,
        }
    }
}

impl Default for RecallWeights {
    fn default() -> Self {
        Self {
            vector: 1.0,
            entity: 0.35,
            topic: 0.15,
            type_bonus: 0.25,
            spread: 0.20,
            recency: 0.10,
            salience: 0.15,
            superseded_penalty: 0.5,
            age_penalty: 0.1,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            entity_edge_cap: 16,
            edge_visit_budget: 4096,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.85,
            min_cluster_size: 3,
            budget_ms: 30_000,
            alias_cooccurrence: 2,
            contradiction_window: 32,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            archive_threshold: 0.08,
            decay_step: 0.05,
            decay_window_days: 14,
            pending_alert_days: 7,
            surface_idle_hours: 24,
        }
    }
}

/// Built-in aggregation phrases: commitment listings route to status
/// materialization, decision listings route to the semantic type.
fn default_aggregation_rules() -> Vec<AggregationRule> {
    vec![
        AggregationRule {
            phrases: vec![
                "pending".into(),
                "commitment".into(),
                "commitments".into(),
                "promised".into(),
            ],
            target: "status:pending".into(),
        },
        AggregationRule {
            phrases: vec!["all decisions".into(), "list of decisions".into()],
            target: "type:semantic".into(),
        },
    ]
}

/// Returns `~/.engram/`
pub fn default_engram_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".engram")
}

/// Returns the default config file path: `~/.engram/config.toml`
pub fn default_config_path() -> PathBuf {
    default_engram_dir().join("config.toml")
}

impl VaultConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            VaultConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (ENGRAM_DB, ENGRAM_OWNER, ENGRAM_LOG_LEVEL, ENGRAM_TOKEN).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("ENGRAM_DB") {
            self.vault.db_path = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_OWNER") {
            self.vault.owner = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("ENGRAM_TOKEN") {
            self.server.bearer_token = Some(val);
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.vault.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = VaultConfig::default();
        assert_eq!(config.vault.owner, "default");
        assert_eq!(config.embedding.dimensions, 384);
        assert_eq!(config.recall.seed_expansion_factor, 4);
        assert!((config.recall.weights.vector - 1.0).abs() < f64::EPSILON);
        assert!((config.consolidation.merge_threshold - 0.85).abs() < f64::EPSILON);
        assert!((config.lifecycle.archive_threshold - 0.08).abs() < f64::EPSILON);
        assert!(config.vault.db_path.ends_with("vault.db"));
        assert!(!config.aggregation.is_empty());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[vault]
owner = "alex"
db_path = "/tmp/test-vault.db"

[recall]
default_limit = 5

[recall.weights]
vector = 0.8

[consolidation]
merge_threshold = 0.9
"#;
        let config: VaultConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.vault.owner, "alex");
        assert_eq!(config.vault.db_path, "/tmp/test-vault.db");
        assert_eq!(config.recall.default_limit, 5);
        assert!((config.recall.weights.vector - 0.8).abs() < f64::EPSILON);
        assert!((config.consolidation.merge_threshold - 0.9).abs() < f64::EPSILON);
        // defaults still apply for unset fields
        assert_eq!(config.recall.spread_hops, 2);
        assert!((config.recall.weights.entity - 0.35).abs() < f64::EPSILON);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = VaultConfig::default();
        std::env::set_var("ENGRAM_DB", "/tmp/override.db");
        std::env::set_var("ENGRAM_OWNER", "env-owner");
        std::env::set_var("ENGRAM_TOKEN", "secret");

        config.apply_env_overrides();

        assert_eq!(config.vault.db_path, "/tmp/override.db");
        assert_eq!(config.vault.owner, "env-owner");
        assert_eq!(config.server.bearer_token.as_deref(), Some("secret"));

        std::env::remove_var("ENGRAM_DB");
        std::env::remove_var("ENGRAM_OWNER");
        std::env::remove_var("ENGRAM_TOKEN");
    }

    #[test]
    fn aggregation_rules_parse_targets() {
        let rules = default_aggregation_rules();
        assert!(rules.iter().any(|r| r.target == "status:pending"));
        assert!(rules
            .iter()
            .any(|r| r.phrases.iter().any(|p| p == "commitments")));
    }
}
