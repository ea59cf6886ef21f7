//! Per-(group, kind) vector id allocation
//!
//! Counters live in memory and are seeded once from the highest id the store
//! has seen for the key, purged rows included. A crash between allocation and
//! persistence can leave a gap in the id space; ids are never reused.

use crate::error::Result;
use crate::storage::{queries, Database, IndexKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Last id handed out for a key, `None` until seeded
type Counter = Arc<tokio::sync::Mutex<Option<i64>>>;

pub struct IdAllocator {
    db: Database,
    counters: Mutex<HashMap<IndexKey, Counter>>,
}

impl IdAllocator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Take the allocation lock for `key`
    ///
    /// The lock is held for as long as the returned guard lives, so the id and
    /// the metadata insert that records it happen atomically with respect to
    /// other allocations for the same key.
    pub async fn lock(&self, key: IndexKey) -> Result<AllocationGuard> {
        let counter = {
            let mut counters = self.counters.lock();
            counters.entry(key).or_default().clone()
        };

        let mut last = counter.lock_owned().await;
        if last.is_none() {
            let max = self
                .db
                .call(move |conn| queries::max_faiss_index(conn, key))
                .await?;
            let seed = max.unwrap_or(-1);
            debug!("Seeded id allocator for {} at {}", key, seed);
            *last = Some(seed);
        }

        Ok(AllocationGuard { key, last })
    }

    /// Forget every counter; the next allocation per key re-seeds from the store
    pub fn reset(&self) {
        self.counters.lock().clear();
    }
}

/// Exclusive allocation rights for one key
pub struct AllocationGuard {
    key: IndexKey,
    last: OwnedMutexGuard<Option<i64>>,
}

impl AllocationGuard {
    pub fn key(&self) -> IndexKey {
        self.key
    }

    /// Allocate the next id
    pub fn next_id(&mut self) -> i64 {
        let id = self.last.unwrap_or(-1) + 1;
        *self.last = Some(id);
        id
    }

    /// Return `id` to the pool if it is the most recent allocation
    pub fn rollback(&mut self, id: i64) {
        if *self.last == Some(id) {
            *self.last = Some(id - 1);
        }
    }
}
