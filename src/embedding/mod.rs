pub mod queue;

use crate::error::Result;

/// Trait for embedding text into vectors.
///
/// Implementations produce vectors of exactly `dimensions()` entries; the
/// store L2-normalizes on write, so providers may skip normalization. All
/// methods are synchronous — callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings. Implementations may override for
    /// batched inference.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Number of dimensions this provider produces. Fixed per vault.
    fn dimensions(&self) -> usize;
}

/// Deterministic bag-of-tokens fallback provider.
///
/// Hashes each whitespace token into a bucket (FNV-1a) and L2-normalizes
/// the histogram. No semantics beyond keyword overlap — it keeps a vault
/// serviceable when no real model is configured, and gives tests diverse,
/// reproducible vectors.
pub struct HashedEmbedder {
    dims: usize,
}

impl HashedEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dims: dimensions }
    }
}

impl EmbeddingProvider for HashedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            v[(hash % self.dims as u64) as usize] += 1.0;
        }
        normalize(&mut v);
        Ok(v)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
