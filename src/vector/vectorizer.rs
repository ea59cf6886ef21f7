//! Turning one conversation segment into a stored vector

use super::{IndexHandle, VectorService};
use crate::error::{Result, SegvecError};
use crate::storage::{queries, ConversationSegment, IndexKey, NewVectorEntry};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorizeOutcome {
    /// A new vector was stored under this id
    Vectorized { faiss_index: i64 },
    /// A vector already existed for the segment
    AlreadyVectorized,
    /// No segment with the requested id
    NotFound,
}

/// Render the text that gets embedded for a segment
///
/// The line order is fixed so the same segment always embeds the same way.
pub fn build_index_content(segment: &ConversationSegment) -> String {
    let mut content = String::new();

    // Writing to a String cannot fail
    let _ = writeln!(
        content,
        "Time: {} - {}",
        segment.start_time.format("%Y-%m-%d %H:%M"),
        segment.end_time.format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(content, "Participants: {}", segment.participant_count);
    let _ = writeln!(content, "Messages: {}", segment.message_count);

    if let Some(keywords) = non_empty(segment.topic_keywords.as_deref()) {
        let _ = writeln!(content, "Topic keywords: {}", keywords);
    }

    if let Some(summary) = non_empty(segment.content_summary.as_deref()) {
        let _ = writeln!(content, "Summary: {}", summary);
    }

    let duration = segment.end_time - segment.start_time;
    if duration > chrono::Duration::zero() {
        let minutes = duration.num_seconds() as f64 / 60.0;
        let _ = writeln!(content, "Duration: {:.1} minutes", minutes);
    }

    let kind = match segment.participant_count {
        n if n <= 1 => "single speaker",
        n if n <= 3 => "small group",
        _ => "group discussion",
    };
    let _ = writeln!(content, "Conversation type: {}", kind);

    content.push_str("Conversation:\n");
    content.push_str(&segment.full_content);
    content.push('\n');

    content
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// First `limit` characters of `text`
pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

impl VectorService {
    /// Vectorize a segment that was read from the store
    ///
    /// Re-vectorizing is a no-op. On failure the segment is left with
    /// `is_vectorized = false` and the error is returned to the caller.
    pub async fn vectorize(&self, segment: &ConversationSegment) -> Result<VectorizeOutcome> {
        let key = IndexKey::segments(segment.group_id);
        let entity_id = segment.id;

        // Loading first lets the registry drop rows an unusable index lost
        let handle = self.registry.get_or_create(key).await?;

        let existing = self
            .db
            .call(move |conn| queries::find_vector_entry_by_entity(conn, key, entity_id))
            .await?;

        if let Some(entry) = existing {
            debug!(
                "Segment {} already has vector {} in {}",
                entity_id, entry.faiss_index, key
            );
            if !segment.is_vectorized {
                self.db
                    .call(move |conn| queries::set_segment_vectorized(conn, entity_id, true))
                    .await?;
            }
            return Ok(VectorizeOutcome::AlreadyVectorized);
        }

        match self.store_vector(&handle, segment).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Failed to vectorize segment {} in {}: {}", entity_id, key, e);
                let reset = self
                    .db
                    .call(move |conn| queries::set_segment_vectorized(conn, entity_id, false))
                    .await;
                if let Err(reset_err) = reset {
                    warn!(
                        "Could not reset vectorized flag of segment {}: {}",
                        entity_id, reset_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Load a segment by id and vectorize it
    pub async fn vectorize_segment_by_id(&self, segment_id: i64) -> Result<VectorizeOutcome> {
        let segment = self
            .db
            .call(move |conn| queries::get_segment(conn, segment_id))
            .await?;

        match segment {
            Some(segment) => self.vectorize(&segment).await,
            None => {
                warn!("Segment {} not found, nothing to vectorize", segment_id);
                Ok(VectorizeOutcome::NotFound)
            }
        }
    }

    async fn store_vector(
        &self,
        handle: &Arc<IndexHandle>,
        segment: &ConversationSegment,
    ) -> Result<VectorizeOutcome> {
        let key = handle.key();
        let entity_id = segment.id;
        let content = build_index_content(segment);
        let embedding = self.embed(content).await?;

        let content_summary = non_empty(segment.content_summary.as_deref())
            .map(|s| truncate_chars(s, self.config.vectorization.content_summary_limit));

        let mut allocation = self.allocator.lock(key).await?;
        let faiss_index = allocation.next_id();

        // Write-ahead: the metadata row exists before the vector does
        let entry = NewVectorEntry {
            key,
            entity_id,
            faiss_index,
            content_summary,
        };
        let inserted = self
            .db
            .call(move |conn| {
                if queries::find_vector_entry_by_entity(conn, key, entity_id)?.is_some() {
                    return Ok(None);
                }
                queries::insert_vector_entry(conn, &entry).map(Some)
            })
            .await;

        let row_id = match inserted {
            Ok(Some(row_id)) => row_id,
            Ok(None) => {
                allocation.rollback(faiss_index);
                debug!("Segment {} was vectorized concurrently", entity_id);
                return Ok(VectorizeOutcome::AlreadyVectorized);
            }
            // A taken id stays consumed so the next allocation moves past it
            Err(e @ SegvecError::IdConflict { .. }) => return Err(e),
            Err(e) => {
                allocation.rollback(faiss_index);
                return Err(e);
            }
        };

        let added = {
            let handle = handle.clone();
            tokio::task::spawn_blocking(move || handle.add(faiss_index, &embedding)).await
        };
        let added = match added {
            Ok(result) => result.map_err(SegvecError::from),
            Err(e) => Err(SegvecError::Task(e.to_string())),
        };

        if let Err(e) = added {
            allocation.rollback(faiss_index);
            let removed = self
                .db
                .call(move |conn| queries::delete_vector_entry(conn, row_id))
                .await;
            if let Err(remove_err) = removed {
                warn!(
                    "Vector row {} for segment {} left without a vector: {}",
                    row_id, entity_id, remove_err
                );
            }
            return Err(e);
        }
        drop(allocation);

        self.mark_dirty(key);

        self.db
            .call(move |conn| queries::set_segment_vectorized(conn, entity_id, true))
            .await?;

        debug!("Segment {} stored as vector {} in {}", entity_id, faiss_index, key);
        Ok(VectorizeOutcome::Vectorized { faiss_index })
    }

    /// Embed on the blocking pool and check the dimension
    pub(crate) async fn embed(&self, text: String) -> Result<Vec<f32>> {
        let provider = self.provider.clone();
        let embedding = tokio::task::spawn_blocking(move || provider.embed(&text))
            .await
            .map_err(|e| SegvecError::Task(e.to_string()))??;

        let expected = self.config.indexing.vector_dim;
        if embedding.len() != expected {
            return Err(SegvecError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }

        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn segment() -> ConversationSegment {
        let start_time = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        ConversationSegment {
            id: 1,
            group_id: 10,
            start_time,
            end_time: start_time + chrono::Duration::seconds(450),
            first_message_id: 1,
            last_message_id: 6,
            message_count: 6,
            participant_count: 3,
            topic_keywords: Some("deploy, rollback".to_string()),
            content_summary: Some("Release went sideways".to_string()),
            full_content: "alice: deploying now\nbob: rollback!".to_string(),
            created_at: start_time,
            is_vectorized: false,
        }
    }

    #[test]
    fn test_content_layout() {
        let content = build_index_content(&segment());
        let expected = "Time: 2024-03-01 09:30 - 2024-03-01 09:37\n\
            Participants: 3\n\
            Messages: 6\n\
            Topic keywords: deploy, rollback\n\
            Summary: Release went sideways\n\
            Duration: 7.5 minutes\n\
            Conversation type: small group\n\
            Conversation:\n\
            alice: deploying now\n\
            bob: rollback!\n";
        assert_eq!(content, expected);
    }

    #[test]
    fn test_content_skips_empty_optional_lines() {
        let mut seg = segment();
        seg.topic_keywords = Some("   ".to_string());
        seg.content_summary = None;
        seg.end_time = seg.start_time;
        seg.participant_count = 1;

        let content = build_index_content(&seg);
        assert!(!content.contains("Topic keywords"));
        assert!(!content.contains("Summary"));
        assert!(!content.contains("Duration"));
        assert!(content.contains("Conversation type: single speaker"));
    }

    #[test]
    fn test_conversation_type_for_large_groups() {
        let mut seg = segment();
        seg.participant_count = 4;
        assert!(build_index_content(&seg).contains("Conversation type: group discussion"));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 3), "");
    }
}
