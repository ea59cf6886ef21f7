use crate::config::Config;
use crate::embedding::model_dimension;
use crate::error::{Result, SegvecError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_indexing(config, &mut errors);
        Self::validate_vectorization(config, &mut errors);
        Self::validate_search(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SegvecError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }

        if let Some(dim) = model_dimension(&config.embedding.model) {
            if dim != config.embedding.dimension {
                errors.push(ValidationError::new(
                    "embedding.dimension",
                    format!(
                        "Model {} produces {}-dimensional vectors, configured {}",
                        config.embedding.model, dim, config.embedding.dimension
                    ),
                ));
            }
        }

        // A mismatch here would fail every single add at runtime
        if config.embedding.dimension != config.indexing.vector_dim {
            errors.push(ValidationError::new(
                "indexing.vector_dim",
                format!(
                    "Index dimension {} does not match embedding dimension {}",
                    config.indexing.vector_dim, config.embedding.dimension
                ),
            ));
        }
    }

    fn validate_indexing(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.indexing.vector_dim == 0 {
            errors.push(ValidationError::new(
                "indexing.vector_dim",
                "Vector dimension must be greater than 0",
            ));
        }

        if config.indexing.hnsw_ef_construction == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }

        if config.indexing.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }

        if config.indexing.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "indexing.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }

        if config.indexing.max_elements == 0 {
            errors.push(ValidationError::new(
                "indexing.max_elements",
                "Index capacity must be greater than 0",
            ));
        }
    }

    fn validate_vectorization(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.vectorization.max_parallel == 0 {
            errors.push(ValidationError::new(
                "vectorization.max_parallel",
                "At least one vectorization must be allowed in flight",
            ));
        }
    }

    fn validate_search(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.search.min_top_k == 0 {
            errors.push(ValidationError::new(
                "search.min_top_k",
                "min_top_k must be greater than 0",
            ));
        }
    }
}
