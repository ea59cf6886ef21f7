//! Health, status, statistics and cleanup

use super::bulk::VectorizeSummary;
use super::persist::FlushReport;
use super::VectorService;
use crate::embedding::{dump_basename, VectorIndex};
use crate::error::{Result, SegvecError};
use crate::storage::{queries, StorageStats, VectorKind};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Snapshot of the engine and its files
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub healthy: bool,
    /// Valid index file records per kind
    pub index_files: Vec<(VectorKind, usize)>,
    /// Sum of `vector_count` over valid records
    pub total_vectors: i64,
    /// Sum of `file_size` over valid records
    pub total_file_size: i64,
    /// Files present in the index directory
    pub files_on_disk: usize,
    pub storage: StorageStats,
    pub loaded_indexes: usize,
    pub dirty_indexes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group_id: i64,
    pub segments: i64,
    pub vectorized: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorStats {
    pub total_segments: i64,
    pub vectorized_segments: i64,
    pub pending_segments: i64,
    pub entries_by_kind: Vec<(VectorKind, i64)>,
    pub top_groups: Vec<GroupStats>,
}

/// Outcome of [`VectorService::rebuild`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    /// Groups whose batch completed
    pub summaries: Vec<VectorizeSummary>,
    /// Groups whose batch errored, with the error text
    pub failed: Vec<(i64, String)>,
    pub cancelled: bool,
}

impl RebuildReport {
    pub fn succeeded(&self) -> usize {
        self.summaries.len()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub invalid_records: usize,
    pub orphan_entries: usize,
    pub orphan_files: usize,
}

impl VectorService {
    /// Probe that the ANN library can build an index and take a vector
    ///
    /// Nothing is persisted.
    pub async fn is_healthy(&self) -> bool {
        let config = self.config.indexing.clone();
        let probe = tokio::task::spawn_blocking(move || {
            let mut index = VectorIndex::new(&config);
            let zero = vec![0.0f32; config.vector_dim];
            index.add_with_id(0, &zero)
        })
        .await;

        match probe {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Health check failed: {}", e);
                false
            }
            Err(e) => {
                warn!("Health check panicked: {}", e);
                false
            }
        }
    }

    pub async fn status(&self) -> Result<ServiceStatus> {
        let healthy = self.is_healthy().await;
        let records = self.db.call(queries::list_valid_index_files).await?;

        let index_files = VectorKind::ALL
            .iter()
            .map(|kind| {
                let count = records.iter().filter(|r| r.index_type == *kind).count();
                (*kind, count)
            })
            .collect();

        let db = self.db.clone();
        let dir = self.index_dir.to_path_buf();
        let (files_on_disk, storage) = tokio::task::spawn_blocking(move || {
            Ok::<_, SegvecError>((count_files(&dir)?, StorageStats::collect(&db, &dir)?))
        })
        .await
        .map_err(|e| SegvecError::Task(e.to_string()))??;

        Ok(ServiceStatus {
            healthy,
            index_files,
            total_vectors: records.iter().map(|r| r.vector_count).sum(),
            total_file_size: records.iter().map(|r| r.file_size).sum(),
            files_on_disk,
            storage,
            loaded_indexes: self.registry.loaded_keys().len(),
            dirty_indexes: self.dirty_keys().len(),
        })
    }

    pub async fn stats(&self) -> Result<VectorStats> {
        self.db
            .call(|conn| {
                let (total, vectorized) = queries::segment_counts(conn)?;
                let entries_by_kind = queries::count_vector_entries_by_kind(conn)?;
                let top_groups = queries::top_segment_groups(conn, 10)?
                    .into_iter()
                    .map(|(group_id, segments, vectorized)| GroupStats {
                        group_id,
                        segments,
                        vectorized,
                    })
                    .collect();

                Ok(VectorStats {
                    total_segments: total,
                    vectorized_segments: vectorized,
                    pending_segments: total - vectorized,
                    entries_by_kind,
                    top_groups,
                })
            })
            .await
    }

    /// Remove invalid file records, metadata rows without an entity and
    /// index files no valid record points at
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let (invalid_records, orphan_entries, records) = self
            .db
            .call(|conn| {
                let invalid = queries::delete_invalid_index_files(conn)?;
                let orphans = queries::delete_orphan_vector_entries(conn)?;
                let records = queries::list_valid_index_files(conn)?;
                Ok((invalid, orphans, records))
            })
            .await?;

        let referenced: HashSet<String> = records
            .iter()
            .filter_map(|r| {
                Path::new(&r.file_path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect();

        let dir = self.index_dir.to_path_buf();
        let orphan_files = tokio::task::spawn_blocking(move || remove_unreferenced(&dir, &referenced))
            .await
            .map_err(|e| SegvecError::Task(e.to_string()))??;

        let report = CleanupReport {
            invalid_records,
            orphan_entries,
            orphan_files,
        };
        info!(
            "Cleanup removed {} invalid record(s), {} orphan vector row(s), {} orphan file(s)",
            report.invalid_records, report.orphan_entries, report.orphan_files
        );
        Ok(report)
    }

    /// Vectorize the pending segments of every group that has segments
    ///
    /// A group that errors is recorded and the next one runs. Fatal errors
    /// would fail every group alike and stop the rebuild.
    pub async fn rebuild(&self, cancel: &CancellationToken) -> Result<RebuildReport> {
        let groups = self.db.call(queries::segment_groups).await?;
        info!("Rebuilding vectors for {} group(s)", groups.len());

        let mut report = RebuildReport::default();
        for group_id in groups {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.vectorize_group_with_cancel(group_id, cancel).await {
                Ok(summary) => {
                    report.cancelled |= summary.cancelled;
                    report.summaries.push(summary);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Rebuild of group {} failed: {}", group_id, e);
                    report.failed.push((group_id, e.to_string()));
                }
            }
        }

        info!(
            "Rebuild finished: {} group(s) succeeded, {} failed",
            report.succeeded(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Flush dirty indexes and release every loaded index
    pub async fn shutdown(&self) -> FlushReport {
        let report = self.flush_all().await;
        let released = self.registry.clear();
        info!("Released {} loaded index(es)", released);
        report
    }
}

fn count_files(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SegvecError::io(e, format!("Failed to read {}", dir.display())))?;

    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| SegvecError::io(e, "Failed to read directory entry"))?;
        if entry.path().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

fn remove_unreferenced(dir: &Path, referenced: &HashSet<String>) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SegvecError::io(e, format!("Failed to read {}", dir.display())))?;

    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| SegvecError::io(e, "Failed to read directory entry"))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();

        let Some(basename) = dump_basename(&name) else {
            continue;
        };
        if referenced.contains(basename) || !path.is_file() {
            continue;
        }

        std::fs::remove_file(&path)
            .map_err(|e| SegvecError::io(e, format!("Failed to remove {}", path.display())))?;
        info!("Removed orphan index file {}", path.display());
        removed += 1;
    }
    Ok(removed)
}
