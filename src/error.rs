//! Typed error taxonomy for all vault operations.
//!
//! Callers see one of a small set of error kinds with a short message; the
//! HTTP surface maps each kind to a status code. Store and transaction
//! errors are surfaced unchanged via [`EngramError::Storage`].

use thiserror::Error;

/// Top-level error type for all Engram operations.
#[derive(Error, Debug)]
pub enum EngramError {
    /// Malformed input: empty content, wrong embedding dimensionality,
    /// out-of-range salience or weight.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Duplicate memory id or competing migration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Embedder or LLM still unavailable after the retry budget.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Soft timeout exceeded; the caller may retry.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Caller-initiated abort. Already-persisted work remains.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Invariant violation detected; writes halt until a repair pass runs.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// Storage open failed, disk full, or the vault is held by another writer.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Underlying store or transaction error, surfaced unchanged.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem error while opening or exporting a vault.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, EngramError>;

impl EngramError {
    /// Short machine-readable kind tag, used by the wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Conflict(_) => "conflict",
            Self::NotFound(_) => "not_found",
            Self::RateLimited(_) => "rate_limited",
            Self::TimedOut(_) => "timed_out",
            Self::Cancelled(_) => "cancelled",
            Self::Corrupt(_) => "corrupt",
            Self::Unavailable(_) => "unavailable",
            Self::Storage(_) | Self::Io(_) => "storage",
        }
    }
}
