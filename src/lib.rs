//! segvec - semantic vector search over chat conversation segments
//!
//! Conversation segments are embedded into per-group HNSW indexes persisted
//! on disk. A SQLite store keeps a metadata row for every vector so search
//! hits can be joined back to segments and their messages, ranked by L2
//! distance and paginated.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod signals;
pub mod storage;
pub mod vector;

pub use error::{Result, SegvecError};
pub use vector::VectorService;
