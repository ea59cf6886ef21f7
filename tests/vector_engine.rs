mod common;

use common::{test_config, KeywordProvider, TestEnv, FAIL_MARKER};
use segvec::embedding::{dump_files, EmbeddingError, EmbeddingProvider};
use segvec::storage::{queries, IndexKey, VectorKind};
use segvec::vector::VectorizeOutcome;
use segvec::{SegvecError, VectorService};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Dialogue whose embedding drifts from "alpha" towards "beta" as `step` grows
fn graded_dialogue(step: usize) -> String {
    format!(
        "ann: {}\nbob: {}",
        "alpha ".repeat(5 - step),
        "beta ".repeat(step)
    )
}

#[tokio::test]
async fn test_end_to_end_vectorize_then_search() {
    let env = TestEnv::new();
    let group = -100200;

    let t1 = env.add_segment(group, 1_000, None, "ann: my cats\nbob: kittens everywhere");
    let t2 = env.add_segment(
        group,
        2_000,
        Some("space, launch"),
        "ann: rockets tonight\nbob: launch into orbit",
    );
    let t3 = env.add_segment(group, 3_000, None, "ann: pasta recipe\nbob: cooking now");

    let summary = env.service.vectorize_group(group).await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.vectorized, 3);
    assert_eq!(summary.failed, 0);
    assert!(summary.flushed);

    assert_eq!(env.faiss_ids(group), vec![0, 1, 2]);
    for id in [t1, t2, t3] {
        assert!(env.is_vectorized(id));
    }

    let key = IndexKey::segments(group);
    assert!(!env.service.is_dirty(key));

    let record = {
        let conn = env.storage.database.get_conn().unwrap();
        queries::find_valid_index_file(&conn, key).unwrap().unwrap()
    };
    assert_eq!(record.vector_count, 3);
    assert!(record.file_size > 0);
    assert!(record.file_path.ends_with(&key.file_stem()));

    let page = env
        .service
        .search(group, "rockets in orbit", 0, 10)
        .await
        .unwrap();
    assert_eq!(page.total_count, 3);
    assert_eq!(page.items[0].segment_id, t2);
    assert_eq!(page.items[0].message.content, "space, launch");
    assert_eq!(page.items[0].message.message_id, 2_000);

    let t1_hit = page.items.iter().find(|hit| hit.segment_id == t1).unwrap();
    assert_eq!(t1_hit.message.content, "(no topic keywords)");
}

#[tokio::test]
async fn test_search_ranks_by_distance_and_paginates() {
    let env = TestEnv::new();
    let group = 1;

    // Insert in reverse so index order differs from rank order
    let mut ids = Vec::new();
    for step in (0..=5).rev() {
        let id = env.add_segment(group, 1_000 + step as i64 * 100, None, &graded_dialogue(step));
        ids.push((step, id));
    }
    ids.sort();
    let expected: Vec<i64> = ids.into_iter().map(|(_, id)| id).collect();

    env.service.vectorize_group(group).await.unwrap();

    let full = env.service.search(group, "alpha", 0, 10).await.unwrap();
    assert_eq!(full.total_count, 6);

    let ranked: Vec<i64> = full.items.iter().map(|hit| hit.segment_id).collect();
    assert_eq!(ranked, expected);
    assert!(full
        .items
        .windows(2)
        .all(|pair| pair[0].distance <= pair[1].distance));

    let mut paged = Vec::new();
    for skip in [0, 2, 4] {
        let page = env.service.search(group, "alpha", skip, 2).await.unwrap();
        assert_eq!(page.total_count, 6);
        assert!(page.items.len() <= 2);
        paged.extend(page.items.into_iter().map(|hit| hit.segment_id));
    }
    assert_eq!(paged, expected);

    let tail = env.service.search(group, "alpha", 5, 10).await.unwrap();
    assert_eq!(tail.items.len(), 1);
    assert_eq!(tail.items[0].segment_id, expected[5]);

    let beyond = env.service.search(group, "alpha", 50, 10).await.unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total_count, 6);
}

#[tokio::test]
async fn test_search_on_empty_group_returns_empty_page() {
    let env = TestEnv::new();

    let page = env.service.search(77, "anything", 0, 10).await.unwrap();
    assert!(page.items.is_empty());
    assert_eq!(page.total_count, 0);

    // Nothing to search, so nothing was embedded or written
    assert_eq!(env.provider.calls.load(Ordering::SeqCst), 0);
    assert!(!env.service.is_dirty(IndexKey::segments(77)));
}

#[tokio::test]
async fn test_vectorize_is_idempotent() {
    let env = TestEnv::new();
    let id = env.add_segment(5, 1_000, None, "ann: cats");

    let first = env.service.vectorize_segment_by_id(id).await.unwrap();
    assert_eq!(first, VectorizeOutcome::Vectorized { faiss_index: 0 });

    let second = env.service.vectorize_segment_by_id(id).await.unwrap();
    assert_eq!(second, VectorizeOutcome::AlreadyVectorized);

    assert_eq!(env.faiss_ids(5), vec![0]);
    assert_eq!(env.provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_vectorize_missing_segment_is_noop() {
    let env = TestEnv::new();
    let outcome = env.service.vectorize_segment_by_id(4242).await.unwrap();
    assert_eq!(outcome, VectorizeOutcome::NotFound);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_vectorization_allocates_unique_dense_ids() {
    let env = TestEnv::new();
    let group = 2;

    let ids: Vec<i64> = (0..20)
        .map(|i| env.add_segment(group, 1_000 + i, None, "ann: cats and kittens"))
        .collect();

    let mut tasks = tokio::task::JoinSet::new();
    for id in ids.iter().copied() {
        let service = env.service.clone();
        tasks.spawn(async move { service.vectorize_segment_by_id(id).await });
    }
    // The same segment twice in parallel must still get one vector
    for _ in 0..2 {
        let service = env.service.clone();
        let id = ids[0];
        tasks.spawn(async move { service.vectorize_segment_by_id(id).await });
    }

    let mut vectorized = HashSet::new();
    while let Some(result) = tasks.join_next().await {
        if let VectorizeOutcome::Vectorized { faiss_index } = result.unwrap().unwrap() {
            assert!(vectorized.insert(faiss_index), "id {} handed out twice", faiss_index);
        }
    }

    assert_eq!(vectorized.len(), 20);
    assert_eq!(env.faiss_ids(group), (0..20).collect::<Vec<i64>>());
    assert_eq!(
        env.service
            .registry()
            .get_loaded(IndexKey::segments(group))
            .unwrap()
            .len(),
        20
    );
}

#[tokio::test]
async fn test_id_sequence_recovers_after_restart() {
    let env = TestEnv::new();
    let group = 3;

    for i in 0..3 {
        env.add_segment(group, 1_000 + i, None, "ann: pasta recipe");
    }
    env.service.vectorize_group(group).await.unwrap();
    env.service.shutdown().await;

    let restarted = env.restart();
    let late = env.add_segment(group, 5_000, None, "bob: rockets");

    let outcome = restarted.vectorize_segment_by_id(late).await.unwrap();
    assert_eq!(outcome, VectorizeOutcome::Vectorized { faiss_index: 3 });

    // The index came back from disk with the earlier vectors
    let page = restarted.search(group, "pasta", 0, 10).await.unwrap();
    assert_eq!(page.total_count, 4);
}

#[tokio::test]
async fn test_allocator_reset_reseeds_from_store() {
    let env = TestEnv::new();
    let group = 4;

    for i in 0..2 {
        let id = env.add_segment(group, 1_000 + i, None, "ann: cats");
        env.service.vectorize_segment_by_id(id).await.unwrap();
    }

    env.service.allocator().reset();

    let mut guard = env
        .service
        .allocator()
        .lock(IndexKey::segments(group))
        .await
        .unwrap();
    assert_eq!(guard.next_id(), 2);
}

#[tokio::test]
async fn test_corrupt_index_file_is_invalidated_and_replaced() {
    let env = TestEnv::new();
    let group = 9;
    let key = IndexKey::segments(group);
    let index_dir = env.service.index_dir().to_path_buf();

    let (graph, data) = dump_files(&index_dir, &key.file_stem());
    std::fs::write(&graph, b"this is not an hnsw graph").unwrap();
    std::fs::write(&data, b"nor is this hnsw data").unwrap();

    let file_path = index_dir.join(key.file_stem()).to_string_lossy().into_owned();
    {
        let conn = env.storage.database.get_conn().unwrap();
        queries::upsert_index_file(&conn, key, &file_path, common::DIM, 12, 50).unwrap();
    }

    let handle = env.service.registry().get_or_create(key).await.unwrap();
    assert!(handle.is_empty());

    {
        let conn = env.storage.database.get_conn().unwrap();
        assert!(queries::find_valid_index_file(&conn, key).unwrap().is_none());
        let invalid: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM faiss_index_files WHERE group_id = ?1 AND is_valid = 0",
                [group],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(invalid, 1);
    }

    // The fresh index is fully usable and gets a new valid record
    env.add_segment(group, 1_000, None, "ann: kittens");
    let summary = env.service.vectorize_group(group).await.unwrap();
    assert_eq!(summary.vectorized, 1);
    assert!(summary.flushed);

    let conn = env.storage.database.get_conn().unwrap();
    let record = queries::find_valid_index_file(&conn, key).unwrap().unwrap();
    assert_eq!(record.vector_count, 1);
}

#[tokio::test]
async fn test_lost_index_is_backfilled_without_reusing_ids() {
    let env = TestEnv::new();
    let group = 14;
    let key = IndexKey::segments(group);

    let first = env.add_segment(group, 1_000, None, "ann: cats");
    let second = env.add_segment(group, 2_000, None, "ann: rockets");
    env.service.vectorize_group(group).await.unwrap();
    env.service.shutdown().await;
    assert_eq!(env.faiss_ids(group), vec![0, 1]);

    let (graph, data) = dump_files(env.service.index_dir(), &key.file_stem());
    std::fs::write(&graph, b"truncated").unwrap();
    std::fs::write(&data, b"truncated").unwrap();

    let restarted = env.restart();
    let summary = restarted.vectorize_group(group).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.vectorized, 2);
    assert!(env.is_vectorized(first) && env.is_vectorized(second));

    // Ids of the lost vectors stay retired
    assert_eq!(env.faiss_ids(group), vec![2, 3]);

    let page = restarted.search(group, "cats rockets", 0, 10).await.unwrap();
    assert_eq!(page.total_count, 2);
}

#[tokio::test]
async fn test_unflushed_vectors_are_backfilled_after_restart() {
    let env = TestEnv::new();
    let group = 15;

    env.add_segment(group, 1_000, None, "ann: cats");
    env.add_segment(group, 2_000, None, "ann: kittens");
    env.service.vectorize_group(group).await.unwrap();

    // Stored but never written to disk, as if the process died
    let late = env.add_segment(group, 3_000, None, "ann: pasta");
    env.service.vectorize_segment_by_id(late).await.unwrap();
    assert!(env.service.is_dirty(IndexKey::segments(group)));

    let restarted = env.restart();
    assert_eq!(
        restarted.vectorize_segment_by_id(late).await.unwrap(),
        VectorizeOutcome::Vectorized { faiss_index: 3 }
    );

    let summary = restarted.vectorize_group(group).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.vectorized, 2);
    assert_eq!(env.faiss_ids(group), vec![3, 4, 5]);

    let page = restarted.search(group, "cats pasta", 0, 10).await.unwrap();
    assert_eq!(page.total_count, 3);
}

#[tokio::test]
async fn test_search_skips_vectors_whose_segment_is_gone() {
    let env = TestEnv::new();
    let group = 16;

    let kept = env.add_segment(group, 1_000, None, "ann: cats");
    let gone = env.add_segment(group, 2_000, None, "ann: kittens");
    env.service.vectorize_group(group).await.unwrap();

    {
        let conn = env.storage.database.get_conn().unwrap();
        conn.execute("DELETE FROM conversation_segments WHERE id = ?1", [gone])
            .unwrap();
    }

    let page = env.service.search(group, "cats", 0, 10).await.unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].segment_id, kept);
}

#[tokio::test]
async fn test_rebuild_continues_past_a_failing_group() {
    let env = TestEnv::new();

    env.add_segment(20, 1_000, None, "ann: cats");
    let healthy = env.add_segment(21, 1_000, None, "ann: rockets");

    // A record the store cannot decode makes group 20 error on load
    {
        let conn = env.storage.database.get_conn().unwrap();
        conn.execute(
            "INSERT INTO faiss_index_files
                (group_id, index_type, file_path, dimension, created_at, updated_at)
             VALUES (20, 'ConversationSegment', '/nowhere', 'sixteen', 0, 0)",
            [],
        )
        .unwrap();
    }

    let report = env.service.rebuild(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.summaries[0].group_id, 21);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 20);
    assert!(!report.cancelled);
    assert!(env.is_vectorized(healthy));
}

#[tokio::test]
async fn test_group_batch_isolates_failures() {
    let env = TestEnv::new();
    let group = 6;

    let mut good = Vec::new();
    let mut bad = Vec::new();
    for i in 0..5 {
        if i % 2 == 1 {
            bad.push(env.add_segment(group, 1_000 + i, None, &format!("ann: {}", FAIL_MARKER)));
        } else {
            good.push(env.add_segment(group, 1_000 + i, None, "ann: cats"));
        }
    }

    let summary = env.service.vectorize_group(group).await.unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.vectorized, 3);
    assert_eq!(summary.failed, 2);
    assert!(summary.flushed);

    for id in good {
        assert!(env.is_vectorized(id));
    }
    for id in bad {
        assert!(!env.is_vectorized(id));
    }

    // Failed embeddings never reached the allocator
    assert_eq!(env.faiss_ids(group), vec![0, 1, 2]);
}

#[tokio::test]
async fn test_cancelled_batch_leaves_segments_pending() {
    let env = TestEnv::new();
    let group = 8;
    let id = env.add_segment(group, 1_000, None, "ann: cats");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = env
        .service
        .vectorize_group_with_cancel(group, &cancel)
        .await
        .unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.vectorized, 0);
    assert!(!env.is_vectorized(id));

    let search = env
        .service
        .search_with_cancel(group, "cats", 0, 10, &cancel)
        .await;
    assert!(matches!(search, Err(SegvecError::Cancelled)));
}

struct WrongDimensionProvider;

impl EmbeddingProvider for WrongDimensionProvider {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(vec![0.0; 3])
    }

    fn dimension(&self) -> usize {
        3
    }

    fn model_name(&self) -> &str {
        "wrong"
    }
}

#[tokio::test]
async fn test_dimension_mismatch_is_fatal_at_construction() {
    let env = TestEnv::new();
    let result = VectorService::new(&env.storage, Arc::new(WrongDimensionProvider), &test_config());
    assert!(matches!(
        result,
        Err(SegvecError::DimensionMismatch {
            expected: common::DIM,
            actual: 3
        })
    ));
}

#[tokio::test]
async fn test_zero_parallelism_is_rejected_at_construction() {
    let env = TestEnv::new();
    let mut config = test_config();
    config.vectorization.max_parallel = 0;

    let result = VectorService::new(&env.storage, env.provider.clone(), &config);
    assert!(matches!(
        result,
        Err(SegvecError::InvalidConfigValue { ref path, .. }) if path == "vectorization.max_parallel"
    ));
}

#[tokio::test]
async fn test_flush_without_changes_is_noop() {
    let env = TestEnv::new();
    let key = IndexKey::segments(1);

    assert!(env.service.flush(key).await.unwrap().is_none());

    let report = env.service.flush_all().await;
    assert!(report.flushed.is_empty());
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_health_status_and_stats() {
    let env = TestEnv::new();
    assert!(env.service.is_healthy().await);

    env.add_segment(10, 1_000, None, "ann: cats");
    env.add_segment(10, 2_000, None, "ann: rockets");
    env.add_segment(11, 1_000, None, "ann: pasta");
    env.service.vectorize_group(10).await.unwrap();

    let status = env.service.status().await.unwrap();
    assert!(status.healthy);
    assert!(status
        .index_files
        .contains(&(VectorKind::ConversationSegment, 1)));
    assert!(status.index_files.contains(&(VectorKind::Message, 0)));
    assert_eq!(status.total_vectors, 2);
    assert_eq!(status.files_on_disk, 2);
    assert_eq!(status.storage.db.segment_count, 3);
    assert_eq!(status.storage.db.vector_entry_count, 2);
    assert_eq!(status.storage.db.index_file_count, 1);
    assert!(status.storage.index_dir_size > 0);

    let stats = env.service.stats().await.unwrap();
    assert_eq!(stats.total_segments, 3);
    assert_eq!(stats.vectorized_segments, 2);
    assert_eq!(stats.pending_segments, 1);
    assert_eq!(stats.top_groups[0].group_id, 10);
    assert_eq!(
        stats.entries_by_kind,
        vec![(VectorKind::ConversationSegment, 2)]
    );
}

#[tokio::test]
async fn test_cleanup_removes_dead_records_rows_and_files() {
    let env = TestEnv::new();
    let group = 12;

    let kept = env.add_segment(group, 1_000, None, "ann: cats");
    let doomed = env.add_segment(group, 2_000, None, "ann: kittens");
    env.service.vectorize_group(group).await.unwrap();

    let index_dir = env.service.index_dir().to_path_buf();
    let stray = IndexKey::segments(50);
    let (stray_graph, _) = dump_files(&index_dir, &stray.file_stem());
    std::fs::write(&stray_graph, b"stale").unwrap();
    std::fs::write(index_dir.join("notes.txt"), b"keep me").unwrap();

    {
        let conn = env.storage.database.get_conn().unwrap();
        let record = queries::upsert_index_file(&conn, stray, "/gone/50", common::DIM, 1, 1).unwrap();
        queries::invalidate_index_file(&conn, record.id).unwrap();
        conn.execute("DELETE FROM conversation_segments WHERE id = ?1", [doomed])
            .unwrap();
    }

    let report = env.service.cleanup().await.unwrap();
    assert_eq!(report.invalid_records, 1);
    assert_eq!(report.orphan_entries, 1);
    assert_eq!(report.orphan_files, 1);

    assert!(!stray_graph.exists());
    assert!(index_dir.join("notes.txt").exists());

    let key = IndexKey::segments(group);
    let (graph, data) = dump_files(&index_dir, &key.file_stem());
    assert!(graph.exists() && data.exists());

    // The orphaned vector is still in the index but no longer resolves
    let page = env.service.search(group, "cats kittens", 0, 10).await.unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.items[0].segment_id, kept);
}

#[tokio::test]
async fn test_shutdown_flushes_and_releases() {
    let env = TestEnv::new();
    let id = env.add_segment(13, 1_000, None, "ann: cats");
    env.service.vectorize_segment_by_id(id).await.unwrap();

    let key = IndexKey::segments(13);
    assert!(env.service.is_dirty(key));

    let report = env.service.shutdown().await;
    assert_eq!(report.flushed, vec![key.to_string()]);
    assert!(env.service.registry().loaded_keys().is_empty());

    let conn = env.storage.database.get_conn().unwrap();
    assert!(queries::find_valid_index_file(&conn, key).unwrap().is_some());
}

#[test]
fn test_keyword_provider_is_deterministic() {
    let provider = KeywordProvider::default();
    let a = provider.embed("Cats and kittens").unwrap();
    let b = provider.embed("cats, KITTENS!").unwrap();
    assert_eq!(a, b);
    assert!(provider.embed(FAIL_MARKER).is_err());
}
