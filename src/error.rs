//! Error types for multi-lora.

use thiserror::Error;

/// Result type alias for multi-lora operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for multi-lora.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid sampling configuration, rejected at session creation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cache pool cannot satisfy an allocation.
    #[error("KV cache exhausted: {0}")]
    CacheExhausted(String),

    /// A cache slot was released twice. Indicates a scheduler bug.
    #[error("cache slot {0} released twice")]
    DoubleRelease(u64),

    /// A released cache slot was used again.
    #[error("cache slot {0} used after release")]
    SlotReleased(u64),

    /// Session key has no active session.
    #[error("no active session for key {0}")]
    SessionNotFound(String),

    /// Model forward failure. Aborts the current step.
    #[error("backend error: {0}")]
    Backend(String),

    /// Adapter id not present in the registry.
    #[error("adapter {0:?} not found")]
    AdapterNotFound(String),

    /// Model or adapter loading failed.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Tokenization error.
    #[error("tokenization error: {0}")]
    Tokenization(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is resource pressure that a later step may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CacheExhausted(_))
    }
}
