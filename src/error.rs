use crate::embedding::{EmbeddingError, VectorIndexError};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for segvec
#[derive(Error, Debug)]
pub enum SegvecError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Embedding vector does not fit the index it is meant for
    #[error("Dimension mismatch: index expects {expected}, embedding has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding provider failure
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// ANN index failure (create, add, search, save, load)
    #[error("Vector index error: {0}")]
    VectorIndex(#[from] VectorIndexError),

    /// Two entities were handed the same vector id
    #[error("Vector id {faiss_index} already used in index {key}")]
    IdConflict { key: String, faiss_index: i64 },

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Blocking task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(String),

    /// Operation stopped by a cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SegvecError {
    /// Errors that must stop a batch instead of being counted per entity.
    ///
    /// A dimension mismatch or a broken configuration fails every entity the
    /// same way, so continuing only produces noise.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SegvecError::Config(_)
                | SegvecError::ConfigValidation { .. }
                | SegvecError::InvalidConfigValue { .. }
                | SegvecError::DimensionMismatch { .. }
                | SegvecError::Embedding(EmbeddingError::InitializationError(_))
                | SegvecError::Embedding(EmbeddingError::DimensionMismatch { .. })
                | SegvecError::VectorIndex(VectorIndexError::InvalidDimension { .. })
        )
    }

    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        SegvecError::Io {
            source,
            context: context.into(),
        }
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for segvec operations
pub type Result<T> = std::result::Result<T, SegvecError>;
