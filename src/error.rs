use thiserror::Error;

use crate::engine::{BlockId, FillId, HistoryId};

#[derive(Debug, Error)]
pub enum GenError {
    #[error(
        "Rate limit exceeded for '{key}': {current_count}/{max_requests} requests in {time_window_ms}ms, retry in {remaining_ms}ms"
    )]
    RateLimited {
        key: String,
        current_count: usize,
        max_requests: usize,
        time_window_ms: u64,
        remaining_ms: u64,
    },

    #[error("generation cancelled")]
    Cancelled,

    #[error("generation failed in {provider}: {message}")]
    Generation { provider: String, message: String },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

/// Failures reported by the host engine capability interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("block {0} is not valid")]
    InvalidBlock(BlockId),

    #[error("block {0} has no fill")]
    NoFill(BlockId),

    #[error("fill {0} does not exist")]
    UnknownFill(FillId),

    #[error("history {0} does not exist")]
    UnknownHistory(HistoryId),
}

/// Rate-limit persistence failures. Never leave the store module as a
/// `GenError`: callers log them and fall back to memory.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tracker store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker record is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl GenError {
    /// Shorthand for a provider-side failure.
    pub fn generation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generation {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Returns true for transient errors that may succeed when the whole
    /// pipeline is invoked again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Generation { .. } => true,
            Self::Cancelled => false,
            Self::Engine(_) => false,
            Self::Config(_) => false,
            Self::Other(_) => false,
        }
    }

    /// How long a caller should wait before retrying, when known.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { remaining_ms, .. } => Some(*remaining_ms),
            _ => None,
        }
    }

    /// Produce a message safe to show to an end user.
    /// Engine internals and provider error bodies stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { remaining_ms, .. } => {
                let secs = remaining_ms.div_ceil(1000).max(1);
                format!("too many requests, try again in {secs}s")
            }
            Self::Cancelled => "generation was cancelled".to_string(),
            Self::Generation { provider, .. } => format!("generation failed for {provider}"),
            Self::Engine(_) => "the selected element can no longer be edited".to_string(),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Other(msg) => msg.clone(),
        }
    }
}
