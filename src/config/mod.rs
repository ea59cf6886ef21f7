//! Configuration management for segvec
//!
//! Loads the TOML configuration, applies `SEGVEC_` environment overrides and
//! validates the result before anything touches the store.

use crate::error::{Result, SegvecError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub vectorization: VectorizationConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimension: usize,
}

/// HNSW index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Vector dimension (must match the embedding dimension)
    pub vector_dim: usize,
    /// HNSW construction parameter (higher = better recall, slower build)
    pub hnsw_ef_construction: usize,
    /// HNSW search parameter, raised to `k` when smaller
    pub hnsw_ef_search: usize,
    /// HNSW M parameter (number of connections per layer)
    pub hnsw_m: usize,
    /// Capacity hint for a single index
    pub max_elements: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            vector_dim: 384,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
            hnsw_m: 16,
            max_elements: 100_000,
        }
    }
}

/// Bulk vectorization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizationConfig {
    /// Upper bound on concurrent in-flight vectorizations
    pub max_parallel: usize,
    /// Characters of the segment summary copied into the metadata row
    pub content_summary_limit: usize,
}

impl Default for VectorizationConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            content_summary_limit: 1000,
        }
    }
}

/// Similarity search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Minimum number of neighbours requested from the index
    pub min_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { min_top_k: 100 }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SegvecError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| SegvecError::io(e, format!("Failed to read config file: {:?}", path)))?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| SegvecError::io(e, format!("Failed to write config file: {:?}", path)))?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: SEGVEC_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("SEGVEC_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => {
                self.storage.data_dir = PathBuf::from(value);
            }
            "EMBEDDING__MODEL" => {
                self.embedding.model = value.to_string();
            }
            "EMBEDDING__DIMENSION" => {
                let dim = parse_usize(path, value)?;
                self.embedding.dimension = dim;
                self.indexing.vector_dim = dim;
            }
            "VECTORIZATION__MAX_PARALLEL" => {
                self.vectorization.max_parallel = parse_usize(path, value)?;
            }
            "SEARCH__MIN_TOP_K" => {
                self.search.min_top_k = parse_usize(path, value)?;
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Directory holding persisted index files
    pub fn index_dir(&self) -> Result<PathBuf> {
        Ok(expand_path(&self.storage.data_dir)?.join("indexes"))
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SegvecError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("segvec").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| SegvecError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".segvec"))
    }
}

fn parse_usize(path: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| SegvecError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}' as an unsigned integer", value),
    })
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| SegvecError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| SegvecError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.segvec"),
            },
            embedding: EmbeddingConfig {
                model: "all-MiniLM-L6-v2".to_string(),
                dimension: 384,
            },
            indexing: IndexingConfig::default(),
            vectorization: VectorizationConfig::default(),
            search: SearchConfig::default(),
        }
    }
}
