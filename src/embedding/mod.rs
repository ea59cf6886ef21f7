/// Embedding generation and the ANN index binding
///
/// - EmbeddingProvider trait for abstraction over embedding backends
/// - FastEmbedProvider for local embedding
/// - HNSW (L2 distance, explicit ids) for vector similarity search
mod provider;
mod vector_index;

pub use provider::{model_dimension, EmbeddingError, EmbeddingProvider, FastEmbedProvider};
pub use vector_index::{
    dump_basename, dump_files, SearchResult, VectorIndex, VectorIndexError, DATA_SUFFIX,
    GRAPH_SUFFIX,
};
