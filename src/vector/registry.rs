//! Loaded ANN indexes, one per (group, kind)

use crate::config::IndexingConfig;
use crate::embedding::{SearchResult, VectorIndex, VectorIndexError};
use crate::error::{Result, SegvecError};
use crate::storage::{queries, Database, IndexFileRecord, IndexKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// A loaded index behind its exclusive lock
///
/// Adds, searches and dumps are serialised; hnsw_rs is not relied on for
/// concurrent read/write safety. Size and dimension are readable without
/// the lock so async callers never wait on a long dump or search.
pub struct IndexHandle {
    key: IndexKey,
    dimension: usize,
    len: AtomicUsize,
    index: Mutex<VectorIndex>,
}

impl IndexHandle {
    fn new(key: IndexKey, index: VectorIndex) -> Self {
        Self {
            key,
            dimension: index.dimension(),
            len: AtomicUsize::new(index.len()),
            index: Mutex::new(index),
        }
    }

    pub fn key(&self) -> IndexKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Blocking; call from the blocking pool
    pub(crate) fn add(&self, id: i64, vector: &[f32]) -> std::result::Result<(), VectorIndexError> {
        let mut index = self.index.lock();
        index.add_with_id(id, vector)?;
        self.len.store(index.len(), Ordering::Release);
        Ok(())
    }

    /// Blocking; call from the blocking pool
    pub(crate) fn search(
        &self,
        query: &[f32],
        k: usize,
        ef_search: usize,
    ) -> std::result::Result<Vec<SearchResult>, VectorIndexError> {
        self.index.lock().search(query, k, ef_search)
    }

    /// Blocking; call from the blocking pool
    pub(crate) fn save(
        &self,
        dir: &Path,
        basename: &str,
    ) -> std::result::Result<String, VectorIndexError> {
        self.index.lock().save(dir, basename)
    }
}

type Slot = Arc<OnceCell<Arc<IndexHandle>>>;

/// Process-lifetime cache of loaded indexes
///
/// The map lock only covers lookup-or-insert of a slot. Loading happens inside
/// the slot's `OnceCell`, so concurrent callers for one key wait for a single
/// load while other keys proceed.
pub struct IndexRegistry {
    slots: Mutex<HashMap<IndexKey, Slot>>,
    db: Database,
    config: IndexingConfig,
}

impl IndexRegistry {
    pub fn new(db: Database, config: IndexingConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            db,
            config,
        }
    }

    /// Return the loaded index for `key`, loading or creating it on first use
    pub async fn get_or_create(&self, key: IndexKey) -> Result<Arc<IndexHandle>> {
        let slot = {
            let mut slots = self.slots.lock();
            slots.entry(key).or_default().clone()
        };

        let handle = slot.get_or_try_init(|| self.load_or_create(key)).await?;
        Ok(handle.clone())
    }

    /// The index for `key` if it is already in memory
    pub fn get_loaded(&self, key: IndexKey) -> Option<Arc<IndexHandle>> {
        self.slots.lock().get(&key).and_then(|slot| slot.get().cloned())
    }

    pub fn loaded_keys(&self) -> Vec<IndexKey> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(key, _)| *key)
            .collect()
    }

    /// Drop every cached index, returning how many were loaded
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let loaded = slots.values().filter(|slot| slot.initialized()).count();
        slots.clear();
        loaded
    }

    async fn load_or_create(&self, key: IndexKey) -> Result<Arc<IndexHandle>> {
        let (record, entries) = self
            .db
            .call(move |conn| {
                Ok((
                    queries::find_valid_index_file(conn, key)?,
                    queries::count_vector_entries(conn, key)?,
                ))
            })
            .await?;

        let mut loaded = None;
        if let Some(record) = &record {
            match self.load_record(record).await {
                Ok(index) => loaded = Some(index),
                Err(e) => {
                    warn!(
                        "Index file {} for {} is unusable, starting empty: {}",
                        record.file_path, key, e
                    );
                    let id = record.id;
                    self.db
                        .call(move |conn| queries::invalidate_index_file(conn, id))
                        .await?;
                }
            }
        }

        let in_index = loaded.as_ref().map_or(0, VectorIndex::len);
        if (in_index as i64) < entries {
            // Metadata points at vectors the index lost; drop it all so the
            // group's segments become pending again
            warn!(
                "Index {} holds {} of {} recorded vectors, resetting for backfill",
                key, in_index, entries
            );
            if loaded.take().is_some() {
                if let Some(record) = &record {
                    let id = record.id;
                    self.db
                        .call(move |conn| queries::invalidate_index_file(conn, id))
                        .await?;
                }
            }
            let purged = self
                .db
                .call(move |conn| queries::reset_index_entries(conn, key))
                .await?;
            info!("Purged {} vector row(s) of {}", purged, key);
        }

        match loaded {
            Some(index) => {
                info!("Loaded index {} with {} vectors", key, index.len());
                Ok(Arc::new(IndexHandle::new(key, index)))
            }
            None => {
                info!("Created new index {}", key);
                Ok(Arc::new(IndexHandle::new(key, VectorIndex::new(&self.config))))
            }
        }
    }

    async fn load_record(&self, record: &IndexFileRecord) -> Result<VectorIndex> {
        let dimension = self.config.vector_dim;
        if record.dimension != dimension as i64 {
            return Err(SegvecError::DimensionMismatch {
                expected: dimension,
                actual: record.dimension as usize,
            });
        }

        let path = PathBuf::from(&record.file_path);
        let (dir, basename) = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) => (dir.to_path_buf(), name.to_string_lossy().into_owned()),
            _ => {
                return Err(VectorIndexError::CorruptIndexFile {
                    path: record.file_path.clone(),
                    reason: "not a file path".to_string(),
                }
                .into())
            }
        };

        // A malformed dump can panic inside hnsw_rs; the join error covers it
        let loaded =
            tokio::task::spawn_blocking(move || VectorIndex::load(&dir, &basename, dimension))
                .await;

        match loaded {
            Ok(result) => Ok(result?),
            Err(e) => Err(VectorIndexError::CorruptIndexFile {
                path: record.file_path.clone(),
                reason: e.to_string(),
            }
            .into()),
        }
    }
}
