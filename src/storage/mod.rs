//! Storage layer for segvec
//!
//! The SQLite metadata store plus the directory holding persisted index files.

pub mod database;
pub mod models;
pub mod queries;

use crate::error::{Result, SegvecError};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use database::{Database, DbPool, DbStats};
pub use models::{
    ConversationSegment, IndexFileRecord, IndexKey, Message, NewMessage, NewSegment,
    NewVectorEntry, VectorIndexEntry, VectorKind,
};

/// Storage manager that owns the data directory layout
pub struct StorageManager {
    pub database: Database,
    base_path: PathBuf,
}

impl StorageManager {
    /// Create a new storage manager
    pub fn new(base_path: PathBuf) -> Result<Self> {
        let index_dir = base_path.join("indexes");
        std::fs::create_dir_all(&index_dir).map_err(|e| {
            SegvecError::io(
                e,
                format!("Failed to create index directory: {}", index_dir.display()),
            )
        })?;

        let database = Database::new(&base_path.join("segvec.sqlite"))?;

        Ok(Self {
            database,
            base_path,
        })
    }

    /// Directory holding persisted index files
    pub fn index_dir(&self) -> PathBuf {
        self.base_path.join("indexes")
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Calculate directory size recursively
pub(crate) fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0u64;

    if path.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|e| {
            SegvecError::io(
                e,
                format!("Failed to read directory for size calculation: {}", path.display()),
            )
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                SegvecError::io(e, "Failed to read directory entry for size calculation")
            })?;
            let path = entry.path();

            if path.is_dir() {
                size += dir_size(&path)?;
            } else {
                size += entry
                    .metadata()
                    .map_err(|e| {
                        SegvecError::io(e, format!("Failed to get file metadata: {}", path.display()))
                    })?
                    .len();
            }
        }
    }

    Ok(size)
}

/// Combined storage statistics
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub db: DbStats,
    pub index_dir_size: u64,
}

impl StorageStats {
    /// Row counts plus the bytes under the index directory; blocking
    pub fn collect(database: &Database, index_dir: &Path) -> Result<Self> {
        Ok(Self {
            db: database.stats()?,
            index_dir_size: dir_size(index_dir)?,
        })
    }

    /// Format size as human-readable string
    pub fn format_size(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
