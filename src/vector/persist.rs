//! Dirty tracking and writing indexes to disk

use super::VectorService;
use crate::embedding::dump_files;
use crate::error::{Result, SegvecError};
use crate::storage::{queries, IndexFileRecord, IndexKey};
use serde::Serialize;
use tracing::{debug, error, info};

/// Outcome of [`VectorService::flush_all`]
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlushReport {
    pub flushed: Vec<String>,
    pub failed: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl VectorService {
    pub fn mark_dirty(&self, key: IndexKey) {
        self.dirty.lock().insert(key);
    }

    pub fn is_dirty(&self, key: IndexKey) -> bool {
        self.dirty.lock().contains(&key)
    }

    pub fn dirty_keys(&self) -> Vec<IndexKey> {
        self.dirty.lock().iter().copied().collect()
    }

    /// Write the index for `key` if it has unsaved changes
    ///
    /// Returns the updated file record, or `None` when there was nothing to
    /// write. A failed write leaves the key dirty.
    pub async fn flush(&self, key: IndexKey) -> Result<Option<IndexFileRecord>> {
        // Test-and-clear in one step; a mutation landing after this re-marks the key
        if !self.dirty.lock().remove(&key) {
            return Ok(None);
        }

        match self.write_index(key).await {
            Ok(record) => Ok(record),
            Err(e) => {
                self.mark_dirty(key);
                Err(e)
            }
        }
    }

    /// Flush every dirty index, continuing past failures
    pub async fn flush_all(&self) -> FlushReport {
        let mut report = FlushReport::default();

        for key in self.dirty_keys() {
            match self.flush(key).await {
                Ok(_) => report.flushed.push(key.to_string()),
                Err(e) => {
                    error!("Failed to flush index {}: {}", key, e);
                    report.failed.push(key.to_string());
                }
            }
        }

        if !report.flushed.is_empty() {
            info!("Flushed {} index(es)", report.flushed.len());
        }
        report
    }

    async fn write_index(&self, key: IndexKey) -> Result<Option<IndexFileRecord>> {
        let handle = match self.registry.get_loaded(key) {
            Some(handle) if !handle.is_empty() => handle,
            _ => {
                debug!("Index {} has nothing in memory to write", key);
                return Ok(None);
            }
        };

        let dir = self.index_dir.to_path_buf();
        let dimension = handle.dimension();

        let (written, file_size) = tokio::task::spawn_blocking(move || {
            let written = handle.save(&dir, &key.file_stem())?;
            let (graph, data) = dump_files(&dir, &written);
            let mut size = 0u64;
            for file in [graph, data] {
                size += std::fs::metadata(&file)
                    .map_err(|e| SegvecError::io(e, format!("Failed to stat {}", file.display())))?
                    .len();
            }
            Ok::<_, SegvecError>((dir.join(&written), size))
        })
        .await
        .map_err(|e| SegvecError::Task(e.to_string()))??;

        let file_path = written.to_string_lossy().into_owned();
        let record = self
            .db
            .call(move |conn| {
                // Count from the store, not from the in-memory index
                let vector_count = queries::count_vector_entries(conn, key)?;
                queries::upsert_index_file(conn, key, &file_path, dimension, vector_count, file_size)
            })
            .await?;

        info!(
            "Saved index {} ({} vectors, {} bytes) to {}",
            key, record.vector_count, record.file_size, record.file_path
        );
        Ok(Some(record))
    }
}
