/// HNSW vector index with explicit ids and on-disk persistence
use crate::config::IndexingConfig;
use hnsw_rs::api::AnnT;
use hnsw_rs::hnswio::HnswIo;
use hnsw_rs::prelude::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maximum number of layers hnsw_rs accepts
const MAX_LAYERS: usize = 16;

/// Suffixes hnsw_rs appends to a dump basename
pub const GRAPH_SUFFIX: &str = ".hnsw.graph";
pub const DATA_SUFFIX: &str = ".hnsw.data";

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt index file {path}: {reason}")]
    CorruptIndexFile { path: String, reason: String },
}

/// One neighbour returned by a search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    /// Vector id (the `faiss_index` of the owning metadata row)
    pub id: i64,
    /// Euclidean distance to the query, smaller is more similar
    pub distance: f32,
}

/// HNSW vector index wrapper
///
/// Vectors are added under caller-chosen ids and compared with L2 distance.
/// The wrapper is not synchronised: callers serialise mutation (and, to be
/// safe, search) behind their own lock.
pub struct VectorIndex {
    index: Hnsw<'static, f32, DistL2>,
    dimension: usize,
    count: usize,
}

impl VectorIndex {
    /// Create a new, empty index
    pub fn new(config: &IndexingConfig) -> Self {
        let index = Hnsw::<f32, DistL2>::new(
            config.hnsw_m,
            config.max_elements,
            MAX_LAYERS,
            config.hnsw_ef_construction,
            DistL2 {},
        );

        Self {
            index,
            dimension: config.vector_dim,
            count: 0,
        }
    }

    /// Reload an index previously written by [`VectorIndex::save`]
    ///
    /// `basename` is the file stem inside `dir`; both the graph and the data
    /// file must be present.
    pub fn load(dir: &Path, basename: &str, dimension: usize) -> Result<Self, VectorIndexError> {
        let (graph, data) = dump_files(dir, basename);
        for file in [&graph, &data] {
            if !file.is_file() {
                return Err(VectorIndexError::IndexNotFound(file.display().to_string()));
            }
        }

        // The reloader must outlive the graph it produces. Loaded indexes live
        // until shutdown, so the reloader is leaked rather than tracked.
        let reloader: &'static mut HnswIo = Box::leak(Box::new(HnswIo::new(dir, basename)));
        let index: Hnsw<'static, f32, DistL2> =
            reloader
                .load_hnsw::<f32, DistL2>()
                .map_err(|e| VectorIndexError::CorruptIndexFile {
                    path: graph.display().to_string(),
                    reason: e.to_string(),
                })?;

        let count = index.get_nb_point();
        tracing::debug!("Reloaded HNSW index {} with {} vectors", basename, count);

        Ok(Self {
            index,
            dimension,
            count,
        })
    }

    /// Write the index to `dir`, returning the basename actually used
    pub fn save(&self, dir: &Path, basename: &str) -> Result<String, VectorIndexError> {
        if self.is_empty() {
            return Err(VectorIndexError::SerializationError(
                "Refusing to dump an empty index".to_string(),
            ));
        }

        std::fs::create_dir_all(dir)?;

        let written = self
            .index
            .file_dump(dir, basename)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;

        Ok(written)
    }

    /// Add a vector under an explicit id
    pub fn add_with_id(&mut self, id: i64, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let data_id = usize::try_from(id)
            .map_err(|_| VectorIndexError::InsertError(format!("Negative vector id {}", id)))?;

        self.index.insert((vector, data_id));
        self.count += 1;

        Ok(())
    }

    /// Search for the `k` nearest neighbours
    ///
    /// Results are sorted by ascending distance.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> Result<Vec<SearchResult>, VectorIndexError> {
        if query.len() != self.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let neighbours = self.index.search(query, k, ef_search.max(k));

        let mut results: Vec<SearchResult> = neighbours
            .into_iter()
            .filter_map(|neighbour| {
                i64::try_from(neighbour.d_id)
                    .ok()
                    .filter(|id| *id >= 0)
                    .map(|id| SearchResult {
                        id,
                        distance: neighbour.distance,
                    })
            })
            .collect();

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        Ok(results)
    }

    /// Get the number of vectors in the index
    pub fn len(&self) -> usize {
        self.count
    }

    /// Check if index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get vector dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Paths of the graph and data files for a dump basename
pub fn dump_files(dir: &Path, basename: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}{}", basename, GRAPH_SUFFIX)),
        dir.join(format!("{}{}", basename, DATA_SUFFIX)),
    )
}

/// Strip the hnsw_rs dump suffix from a file name, if it has one
pub fn dump_basename(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(GRAPH_SUFFIX)
        .or_else(|| file_name.strip_suffix(DATA_SUFFIX))
}
