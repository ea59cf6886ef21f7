//! Shared fixtures for integration tests
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use segvec::config::Config;
use segvec::embedding::{EmbeddingError, EmbeddingProvider};
use segvec::storage::{queries, NewMessage, NewSegment, StorageManager};
use segvec::VectorService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const DIM: usize = 16;

/// Text containing this marker fails to embed
pub const FAIL_MARKER: &str = "poisonpill";

/// Words that light up one axis each; everything else is ignored
const VOCABULARY: &[(&str, usize)] = &[
    ("alpha", 0),
    ("beta", 1),
    ("gamma", 2),
    ("cats", 3),
    ("kittens", 3),
    ("rockets", 4),
    ("orbit", 4),
    ("launch", 4),
    ("pasta", 5),
    ("recipe", 5),
    ("cooking", 5),
];

/// Deterministic bag-of-words embedder over a fixed vocabulary
#[derive(Default)]
pub struct KeywordProvider {
    pub calls: AtomicUsize,
}

impl EmbeddingProvider for KeywordProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut vector = vec![0.0f32; DIM];
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            let word = word.to_lowercase();
            if word == FAIL_MARKER {
                return Err(EmbeddingError::GenerationError(
                    "provider unavailable".to_string(),
                ));
            }
            if let Some((_, axis)) = VOCABULARY.iter().find(|(w, _)| *w == word) {
                vector[*axis] += 1.0;
            }
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "keyword-test"
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.model = "keyword-test".to_string();
    config.embedding.dimension = DIM;
    config.indexing.vector_dim = DIM;
    config.indexing.max_elements = 1_000;
    config
}

pub struct TestEnv {
    pub temp: TempDir,
    pub storage: StorageManager,
    pub provider: Arc<KeywordProvider>,
    pub service: VectorService,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let storage = StorageManager::new(temp.path().to_path_buf()).unwrap();
        let provider = Arc::new(KeywordProvider::default());
        let service = VectorService::new(&storage, provider.clone(), &test_config()).unwrap();
        Self {
            temp,
            storage,
            provider,
            service,
        }
    }

    /// A fresh service over the same files, as after a process restart
    pub fn restart(&self) -> VectorService {
        VectorService::new(&self.storage, self.provider.clone(), &test_config()).unwrap()
    }

    /// Store a segment with one linked message per dialogue line
    pub fn add_segment(&self, group_id: i64, start: i64, keywords: Option<&str>, dialogue: &str) -> i64 {
        let conn = self.storage.database.get_conn().unwrap();
        let start_time = Utc.timestamp_opt(start, 0).unwrap();
        let lines: Vec<&str> = dialogue.lines().collect();

        let segment_id = queries::insert_segment(
            &conn,
            &NewSegment {
                group_id,
                start_time,
                end_time: start_time + chrono::Duration::minutes(lines.len() as i64),
                first_message_id: start,
                last_message_id: start + lines.len() as i64 - 1,
                message_count: lines.len() as i64,
                participant_count: 2,
                topic_keywords: keywords.map(str::to_string),
                content_summary: None,
                full_content: dialogue.to_string(),
            },
        )
        .unwrap();

        for (i, line) in lines.iter().enumerate() {
            let message_row = queries::insert_message(
                &conn,
                &NewMessage {
                    group_id,
                    message_id: start + i as i64,
                    from_user_id: 1 + (i as i64 % 2),
                    reply_to_user_id: None,
                    reply_to_message_id: None,
                    content: line.to_string(),
                    date_time: start_time + chrono::Duration::minutes(i as i64),
                },
            )
            .unwrap();
            queries::link_segment_message(&conn, segment_id, message_row, i as i64).unwrap();
        }

        segment_id
    }

    pub fn is_vectorized(&self, segment_id: i64) -> bool {
        let conn = self.storage.database.get_conn().unwrap();
        queries::get_segment(&conn, segment_id)
            .unwrap()
            .unwrap()
            .is_vectorized
    }

    /// All vector ids of a group's segment index, sorted
    pub fn faiss_ids(&self, group_id: i64) -> Vec<i64> {
        let conn = self.storage.database.get_conn().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT faiss_index FROM vector_indexes
                 WHERE group_id = ?1 AND vector_type = 'ConversationSegment'
                 ORDER BY faiss_index",
            )
            .unwrap();
        stmt.query_map([group_id], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<i64>>>()
            .unwrap()
    }
}
