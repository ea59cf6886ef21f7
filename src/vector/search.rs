//! Similarity search over a group's segment index

use super::vectorizer::non_empty;
use super::VectorService;
use crate::embedding::SearchResult;
use crate::error::{Result, SegvecError};
use crate::storage::{queries, IndexKey, Message};
use rusqlite::Connection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NO_TOPIC: &str = "(no topic keywords)";

/// One search result
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub segment_id: i64,
    pub faiss_index: i64,
    /// L2 distance to the query, smaller is closer
    pub distance: f32,
    /// The segment's first message, with its content replaced by the topic
    pub message: Message,
}

/// A page of ranked results
#[derive(Debug, Clone, Default, Serialize)]
pub struct RankedPage {
    pub items: Vec<SearchHit>,
    /// Number of resolvable hits before pagination
    pub total_count: usize,
}

impl VectorService {
    /// Search a group's conversation segments
    pub async fn search(
        &self,
        group_id: i64,
        query: &str,
        skip: usize,
        take: usize,
    ) -> Result<RankedPage> {
        self.search_with_cancel(group_id, query, skip, take, &CancellationToken::new())
            .await
    }

    pub async fn search_with_cancel(
        &self,
        group_id: i64,
        query: &str,
        skip: usize,
        take: usize,
        cancel: &CancellationToken,
    ) -> Result<RankedPage> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SegvecError::Cancelled),
            page = self.run_search(group_id, query, skip, take) => page,
        }
    }

    async fn run_search(
        &self,
        group_id: i64,
        query: &str,
        skip: usize,
        take: usize,
    ) -> Result<RankedPage> {
        let key = IndexKey::segments(group_id);
        let handle = self.registry.get_or_create(key).await?;

        if handle.is_empty() {
            debug!("Index {} is empty, nothing to search", key);
            return Ok(RankedPage::default());
        }

        let embedding = self.embed(query.to_string()).await?;

        let k = skip
            .saturating_add(take)
            .max(self.config.search.min_top_k);
        let ef_search = self.config.indexing.hnsw_ef_search.max(k);

        let neighbours = tokio::task::spawn_blocking(move || handle.search(&embedding, k, ef_search))
            .await
            .map_err(|e| SegvecError::Task(e.to_string()))??;

        let mut hits = self
            .db
            .call(move |conn| {
                let mut hits = Vec::with_capacity(neighbours.len());
                for neighbour in neighbours.into_iter().filter(|n| n.id >= 0) {
                    match resolve_hit(conn, key, neighbour) {
                        Ok(Some(hit)) => hits.push(hit),
                        Ok(None) => debug!("Dropping stale vector {} in {}", neighbour.id, key),
                        Err(e) => warn!("Failed to resolve vector {} in {}: {}", neighbour.id, key, e),
                    }
                }
                Ok(hits)
            })
            .await?;

        // Stable sort keeps index order for equal distances
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        let total_count = hits.len();
        let items = hits.into_iter().skip(skip).take(take).collect();

        Ok(RankedPage { items, total_count })
    }
}

/// Follow vector id -> metadata row -> segment -> first message
fn resolve_hit(conn: &Connection, key: IndexKey, neighbour: SearchResult) -> Result<Option<SearchHit>> {
    let Some(entry) = queries::find_vector_entry_by_faiss(conn, key, neighbour.id)? else {
        return Ok(None);
    };
    let Some(segment) = queries::get_segment(conn, entry.entity_id)? else {
        return Ok(None);
    };
    let Some(mut message) = queries::first_message_of_segment(conn, segment.id)? else {
        return Ok(None);
    };

    message.content = non_empty(segment.topic_keywords.as_deref())
        .or_else(|| non_empty(segment.content_summary.as_deref()))
        .unwrap_or(NO_TOPIC)
        .to_string();

    Ok(Some(SearchHit {
        segment_id: segment.id,
        faiss_index: entry.faiss_index,
        distance: neighbour.distance,
        message,
    }))
}
