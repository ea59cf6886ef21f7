//! Bounded-parallel vectorization of a whole group

use super::vectorizer::VectorizeOutcome;
use super::VectorService;
use crate::error::{Result, SegvecError};
use crate::storage::{queries, IndexKey};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Result of vectorizing one group
#[derive(Debug, Default, Clone, Serialize)]
pub struct VectorizeSummary {
    pub group_id: i64,
    /// Segments pending when the batch started
    pub total: usize,
    pub vectorized: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Stopped early by the cancellation token
    pub cancelled: bool,
    /// Whether the index was written to disk afterwards
    pub flushed: bool,
    pub duration_ms: u64,
}

type TaskResult = std::result::Result<(i64, Result<VectorizeOutcome>), JoinError>;

impl VectorService {
    /// Vectorize every pending segment of a group
    pub async fn vectorize_group(&self, group_id: i64) -> Result<VectorizeSummary> {
        self.vectorize_group_with_cancel(group_id, &CancellationToken::new())
            .await
    }

    /// Vectorize every pending segment of a group until `cancel` fires
    ///
    /// At most `vectorization.max_parallel` segments are in flight. Per-segment
    /// failures are counted; only fatal errors (configuration, dimension)
    /// abort the batch. Work finished before cancellation stays committed and
    /// is flushed.
    pub async fn vectorize_group_with_cancel(
        &self,
        group_id: i64,
        cancel: &CancellationToken,
    ) -> Result<VectorizeSummary> {
        let start = std::time::Instant::now();
        let key = IndexKey::segments(group_id);

        // Reconcile the index with its metadata before picking pending work
        self.registry.get_or_create(key).await?;

        let pending = self
            .db
            .call(move |conn| queries::pending_segment_ids(conn, group_id))
            .await?;

        info!(
            "Vectorizing {} pending segment(s) in group {}",
            pending.len(),
            group_id
        );

        let mut summary = VectorizeSummary {
            group_id,
            total: pending.len(),
            ..Default::default()
        };
        let mut fatal: Option<SegvecError> = None;

        let semaphore = Arc::new(Semaphore::new(self.config.vectorization.max_parallel));
        let mut tasks = JoinSet::new();

        for segment_id in pending {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(|e| SegvecError::Task(e.to_string()))?
                }
            };

            while let Some(done) = tasks.try_join_next() {
                record(&mut summary, &mut fatal, done);
            }
            if fatal.is_some() {
                break;
            }

            let service = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (segment_id, service.vectorize_segment_by_id(segment_id).await)
            });
        }

        while let Some(done) = tasks.join_next().await {
            record(&mut summary, &mut fatal, done);
        }

        if self.is_dirty(key) {
            match self.flush(key).await {
                Ok(_) => summary.flushed = true,
                Err(e) => error!("Failed to flush index {} after batch: {}", key, e),
            }
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;

        if let Some(e) = fatal {
            error!("Vectorization of group {} aborted: {}", group_id, e);
            return Err(e);
        }

        if summary.cancelled {
            warn!(
                "Vectorization of group {} cancelled after {} segment(s)",
                group_id, summary.vectorized
            );
        }

        info!(
            "Group {} done: {} vectorized, {} skipped, {} failed, {}ms",
            group_id, summary.vectorized, summary.skipped, summary.failed, summary.duration_ms
        );

        Ok(summary)
    }
}

fn record(summary: &mut VectorizeSummary, fatal: &mut Option<SegvecError>, done: TaskResult) {
    match done {
        Ok((_, Ok(VectorizeOutcome::Vectorized { .. }))) => summary.vectorized += 1,
        Ok((_, Ok(_))) => summary.skipped += 1,
        Ok((segment_id, Err(e))) => {
            summary.failed += 1;
            if e.is_fatal() && fatal.is_none() {
                *fatal = Some(e);
            } else {
                warn!("Segment {} not vectorized: {}", segment_id, e);
            }
        }
        Err(e) => {
            summary.failed += 1;
            error!("Vectorization task did not complete: {}", e);
        }
    }
}
