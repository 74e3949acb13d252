//! Error types for expert dispatch.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Expert error: {0}")]
    Expert(#[from] ExpertError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Knowledge storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Embedding service errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid embedding response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Expected {expected} embeddings but got {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Expert name must not be empty")]
    EmptyName,

    #[error("Invalid entrypoint '{key}': expected 'module:ClassName'")]
    InvalidEntrypoint { key: String },

    #[error("Unknown entrypoint '{key}'")]
    UnknownEntrypoint { key: String },

    #[error("Entrypoint '{key}' could not build a worker: {reason}")]
    FactoryFailed { key: String, reason: String },

    #[error("Expert {name} not found")]
    NotFound { name: String },
}

/// Errors raised by an individual expert.
#[derive(Debug, thiserror::Error)]
pub enum ExpertError {
    #[error("Expert {name} failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("Expert {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Expert {name} panicked: {reason}")]
    Panicked { name: String, reason: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Per-step dispatch errors. Each kind maps to exactly one fallback in the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Analysis failed: {0}")]
    Analysis(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Storage failed: {0}")]
    Storage(String),

    #[error("Unexpected failure: {0}")]
    Unexpected(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
