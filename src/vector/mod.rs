//! Semantic vector engine for conversation segments
//!
//! [`VectorService`] owns all process-scoped state: the loaded index
//! registry, the id allocator counters and the set of dirty indexes. It is
//! cheap to clone; clones share that state.
//!
//! Lock order when more than one is taken: registry slot, then allocation
//! lock, then the index lock. The dirty set is only ever locked on its own.

mod allocator;
mod bulk;
mod maintenance;
mod persist;
mod registry;
mod search;
mod vectorizer;

pub use allocator::{AllocationGuard, IdAllocator};
pub use bulk::VectorizeSummary;
pub use maintenance::{CleanupReport, GroupStats, RebuildReport, ServiceStatus, VectorStats};
pub use persist::FlushReport;
pub use registry::{IndexHandle, IndexRegistry};
pub use search::{RankedPage, SearchHit};
pub use vectorizer::{build_index_content, VectorizeOutcome};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, SegvecError};
use crate::storage::{Database, IndexKey, StorageManager};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct VectorService {
    db: Database,
    provider: Arc<dyn EmbeddingProvider>,
    registry: Arc<IndexRegistry>,
    allocator: Arc<IdAllocator>,
    dirty: Arc<Mutex<HashSet<IndexKey>>>,
    config: Arc<Config>,
    index_dir: Arc<PathBuf>,
}

impl VectorService {
    /// Build a service over an opened store
    ///
    /// Fails if the provider's dimension does not match the configured index
    /// dimension, or if the batch concurrency is zero.
    pub fn new(
        storage: &StorageManager,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Result<Self> {
        let expected = config.indexing.vector_dim;
        if provider.dimension() != expected {
            return Err(SegvecError::DimensionMismatch {
                expected,
                actual: provider.dimension(),
            });
        }

        if config.vectorization.max_parallel == 0 {
            return Err(SegvecError::InvalidConfigValue {
                path: "vectorization.max_parallel".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let db = storage.database.clone();
        let index_dir = storage.index_dir();

        tracing::debug!(
            "Vector service using {} ({}d), indexes in {}",
            provider.model_name(),
            expected,
            index_dir.display()
        );

        Ok(Self {
            registry: Arc::new(IndexRegistry::new(db.clone(), config.indexing.clone())),
            allocator: Arc::new(IdAllocator::new(db.clone())),
            dirty: Arc::new(Mutex::new(HashSet::new())),
            config: Arc::new(config.clone()),
            index_dir: Arc::new(index_dir),
            provider,
            db,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn allocator(&self) -> &IdAllocator {
        &self.allocator
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }
}
