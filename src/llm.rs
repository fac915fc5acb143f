//! Injected LLM completion capability.
//!
//! The engine states what it asks the LLM for, not what it returns; every
//! call site degrades to a rule-based path when the provider is absent or
//! fails.

use crate::error::Result;

/// Options for a single completion call.
#[derive(Debug, Clone, Default)]
pub struct CompleteOptions {
    pub max_tokens: Option<u32>,
    /// Ask the provider for a bare JSON object response.
    pub json_mode: bool,
    /// Soft per-call timeout; providers must honor it.
    pub timeout_ms: Option<u64>,
}

/// Trait for LLM text completion.
///
/// All methods are synchronous — callers in async contexts should use
/// `tokio::task::spawn_blocking`. Failures must be recoverable: the engine
/// treats every error as "skip the LLM step".
pub trait LlmProvider: Send + Sync {
    fn complete(&self, prompt: &str, opts: &CompleteOptions) -> Result<String>;
}
