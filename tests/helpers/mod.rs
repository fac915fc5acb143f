#![allow(dead_code)]

use std::sync::Arc;

use engram::config::VaultConfig;
use engram::embedding::HashedEmbedder;
use engram::vault::Vault;

/// Embedding width used across integration tests.
pub const TEST_DIMS: usize = 32;

/// Config tuned for fast tests: small vectors, tiny batch linger.
pub fn test_config() -> VaultConfig {
    let mut config = VaultConfig::default();
    config.embedding.dimensions = TEST_DIMS;
    config.embedding.batch_linger_ms = 10;
    config.embedding.retry_backoff_ms = 1;
    config
}

/// Open a fresh in-memory vault with the deterministic hash embedder.
pub fn open_vault() -> Vault {
    Vault::open_in_memory(
        test_config(),
        Arc::new(HashedEmbedder::new(TEST_DIMS)),
        None,
    )
    .unwrap()
}

/// Open an on-disk vault at the given path.
pub fn open_vault_at(path: &std::path::Path) -> engram::Result<Vault> {
    let mut config = test_config();
    config.vault.db_path = path.to_string_lossy().into_owned();
    Vault::open(config, Arc::new(HashedEmbedder::new(TEST_DIMS)), None)
}
