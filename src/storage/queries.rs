//! Typed queries over the metadata store
//!
//! Every function takes a plain connection so it can run inside
//! [`Database::call`](super::Database::call) or a test's pooled connection.

use super::models::{
    ConversationSegment, IndexFileRecord, IndexKey, Message, NewMessage, NewSegment,
    NewVectorEntry, VectorIndexEntry, VectorKind,
};
use crate::error::{Result, SegvecError};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Vector metadata
// ---------------------------------------------------------------------------

pub fn find_vector_entry_by_entity(
    conn: &Connection,
    key: IndexKey,
    entity_id: i64,
) -> Result<Option<VectorIndexEntry>> {
    let sql = format!(
        "SELECT {} FROM vector_indexes
         WHERE group_id = ?1 AND vector_type = ?2 AND entity_id = ?3",
        VectorIndexEntry::COLUMNS
    );

    Ok(conn
        .query_row(&sql, params![key.group_id, key.kind, entity_id], |row| {
            VectorIndexEntry::from_row(row)
        })
        .optional()?)
}

pub fn find_vector_entry_by_faiss(
    conn: &Connection,
    key: IndexKey,
    faiss_index: i64,
) -> Result<Option<VectorIndexEntry>> {
    let sql = format!(
        "SELECT {} FROM vector_indexes
         WHERE group_id = ?1 AND vector_type = ?2 AND faiss_index = ?3",
        VectorIndexEntry::COLUMNS
    );

    Ok(conn
        .query_row(&sql, params![key.group_id, key.kind, faiss_index], |row| {
            VectorIndexEntry::from_row(row)
        })
        .optional()?)
}

/// Highest vector id ever handed out for `key`, or `None` for a new partition
///
/// Covers ids of rows purged by [`reset_index_entries`] through the stored
/// high-water mark.
pub fn max_faiss_index(conn: &Connection, key: IndexKey) -> Result<Option<i64>> {
    Ok(conn.query_row(
        "SELECT MAX(id) FROM (
            SELECT MAX(faiss_index) AS id FROM vector_indexes
             WHERE group_id = ?1 AND vector_type = ?2
            UNION ALL
            SELECT high_water FROM vector_id_watermarks
             WHERE group_id = ?1 AND vector_type = ?2
         )",
        params![key.group_id, key.kind],
        |row| row.get(0),
    )?)
}

pub fn count_vector_entries(conn: &Connection, key: IndexKey) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM vector_indexes WHERE group_id = ?1 AND vector_type = ?2",
        params![key.group_id, key.kind],
        |row| row.get(0),
    )?)
}

/// Insert a metadata row; a reused vector id surfaces as [`SegvecError::IdConflict`]
pub fn insert_vector_entry(conn: &Connection, entry: &NewVectorEntry) -> Result<i64> {
    let ts = now();
    let result = conn.execute(
        "INSERT INTO vector_indexes
            (group_id, vector_type, entity_id, faiss_index, content_summary, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            entry.key.group_id,
            entry.key.kind,
            entry.entity_id,
            entry.faiss_index,
            entry.content_summary,
            ts
        ],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(SegvecError::IdConflict {
                key: entry.key.to_string(),
                faiss_index: entry.faiss_index,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Drop every metadata row of `key` so its entities can be vectorized again
///
/// The highest id is kept as a watermark first, and segments of the group go
/// back to pending. Returns the number of rows removed.
pub fn reset_index_entries(conn: &Connection, key: IndexKey) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;

    if let Some(high_water) = max_faiss_index(&tx, key)? {
        tx.execute(
            "INSERT INTO vector_id_watermarks (group_id, vector_type, high_water, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (group_id, vector_type) DO UPDATE SET
                high_water = MAX(high_water, excluded.high_water),
                updated_at = excluded.updated_at",
            params![key.group_id, key.kind, high_water, now()],
        )?;
    }

    let removed = tx.execute(
        "DELETE FROM vector_indexes WHERE group_id = ?1 AND vector_type = ?2",
        params![key.group_id, key.kind],
    )?;

    if key.kind == VectorKind::ConversationSegment {
        tx.execute(
            "UPDATE conversation_segments SET is_vectorized = 0 WHERE group_id = ?1",
            params![key.group_id],
        )?;
    }

    tx.commit()?;
    Ok(removed)
}

pub fn delete_vector_entry(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM vector_indexes WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn count_vector_entries_by_kind(conn: &Connection) -> Result<Vec<(VectorKind, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT vector_type, COUNT(*) FROM vector_indexes GROUP BY vector_type ORDER BY vector_type",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Remove metadata rows whose owning entity no longer exists
pub fn delete_orphan_vector_entries(conn: &Connection) -> Result<usize> {
    let segments = conn.execute(
        "DELETE FROM vector_indexes
         WHERE vector_type = ?1
           AND entity_id NOT IN (SELECT id FROM conversation_segments)",
        params![VectorKind::ConversationSegment],
    )?;
    let messages = conn.execute(
        "DELETE FROM vector_indexes
         WHERE vector_type = ?1
           AND entity_id NOT IN (SELECT id FROM messages)",
        params![VectorKind::Message],
    )?;
    Ok(segments + messages)
}

// ---------------------------------------------------------------------------
// Index file records
// ---------------------------------------------------------------------------

pub fn find_valid_index_file(conn: &Connection, key: IndexKey) -> Result<Option<IndexFileRecord>> {
    let sql = format!(
        "SELECT {} FROM faiss_index_files
         WHERE group_id = ?1 AND index_type = ?2 AND is_valid = 1",
        IndexFileRecord::COLUMNS
    );

    Ok(conn
        .query_row(&sql, params![key.group_id, key.kind], |row| {
            IndexFileRecord::from_row(row)
        })
        .optional()?)
}

pub fn invalidate_index_file(conn: &Connection, id: i64) -> Result<()> {
    conn.execute(
        "UPDATE faiss_index_files SET is_valid = 0, updated_at = ?2 WHERE id = ?1",
        params![id, now()],
    )?;
    Ok(())
}

/// Update the valid record for `key` in place, or insert one
pub fn upsert_index_file(
    conn: &Connection,
    key: IndexKey,
    file_path: &str,
    dimension: usize,
    vector_count: i64,
    file_size: u64,
) -> Result<IndexFileRecord> {
    let ts = now();
    let updated = conn.execute(
        "UPDATE faiss_index_files
         SET file_path = ?3, dimension = ?4, vector_count = ?5, file_size = ?6, updated_at = ?7
         WHERE group_id = ?1 AND index_type = ?2 AND is_valid = 1",
        params![
            key.group_id,
            key.kind,
            file_path,
            dimension as i64,
            vector_count,
            file_size as i64,
            ts
        ],
    )?;

    if updated == 0 {
        conn.execute(
            "INSERT INTO faiss_index_files
                (group_id, index_type, file_path, dimension, vector_count, file_size,
                 created_at, updated_at, is_valid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 1)",
            params![
                key.group_id,
                key.kind,
                file_path,
                dimension as i64,
                vector_count,
                file_size as i64,
                ts
            ],
        )?;
    }

    find_valid_index_file(conn, key)?.ok_or_else(|| {
        SegvecError::Other(anyhow::anyhow!("Index file record for {} vanished", key))
    })
}

pub fn list_valid_index_files(conn: &Connection) -> Result<Vec<IndexFileRecord>> {
    let sql = format!(
        "SELECT {} FROM faiss_index_files WHERE is_valid = 1 ORDER BY group_id, index_type",
        IndexFileRecord::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], IndexFileRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn delete_invalid_index_files(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM faiss_index_files WHERE is_valid = 0", [])?)
}

// ---------------------------------------------------------------------------
// Domain entities
// ---------------------------------------------------------------------------

pub fn get_segment(conn: &Connection, id: i64) -> Result<Option<ConversationSegment>> {
    let sql = format!(
        "SELECT {} FROM conversation_segments WHERE id = ?1",
        ConversationSegment::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![id], ConversationSegment::from_row)
        .optional()?)
}

/// Ids of a group's segments still waiting for a vector, oldest first
pub fn pending_segment_ids(conn: &Connection, group_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM conversation_segments
         WHERE group_id = ?1 AND is_vectorized = 0
         ORDER BY start_time, id",
    )?;
    let ids = stmt
        .query_map(params![group_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

pub fn set_segment_vectorized(conn: &Connection, id: i64, vectorized: bool) -> Result<()> {
    conn.execute(
        "UPDATE conversation_segments SET is_vectorized = ?2 WHERE id = ?1",
        params![id, vectorized],
    )?;
    Ok(())
}

/// Earliest message of a segment, used to present a search hit
pub fn first_message_of_segment(conn: &Connection, segment_id: i64) -> Result<Option<Message>> {
    let sql = format!(
        "SELECT {} FROM messages m
         JOIN conversation_segment_messages csm ON csm.message_data_id = m.id
         WHERE csm.conversation_segment_id = ?1
         ORDER BY m.date_time, csm.sequence_order
         LIMIT 1",
        Message::COLUMNS
            .split(", ")
            .map(|c| format!("m.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(conn
        .query_row(&sql, params![segment_id], Message::from_row)
        .optional()?)
}

pub fn insert_message(conn: &Connection, message: &NewMessage) -> Result<i64> {
    conn.execute(
        "INSERT INTO messages
            (group_id, message_id, from_user_id, reply_to_user_id, reply_to_message_id,
             content, date_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.group_id,
            message.message_id,
            message.from_user_id,
            message.reply_to_user_id,
            message.reply_to_message_id,
            message.content,
            message.date_time.timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_segment(conn: &Connection, segment: &NewSegment) -> Result<i64> {
    conn.execute(
        "INSERT INTO conversation_segments
            (group_id, start_time, end_time, first_message_id, last_message_id, message_count,
             participant_count, topic_keywords, content_summary, full_content, created_at,
             is_vectorized)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
        params![
            segment.group_id,
            segment.start_time.timestamp(),
            segment.end_time.timestamp(),
            segment.first_message_id,
            segment.last_message_id,
            segment.message_count,
            segment.participant_count,
            segment.topic_keywords,
            segment.content_summary,
            segment.full_content,
            now()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn link_segment_message(
    conn: &Connection,
    segment_id: i64,
    message_row_id: i64,
    sequence_order: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO conversation_segment_messages
            (conversation_segment_id, message_data_id, sequence_order)
         VALUES (?1, ?2, ?3)",
        params![segment_id, message_row_id, sequence_order],
    )?;
    Ok(())
}

/// Groups that have at least one segment
pub fn segment_groups(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT group_id FROM conversation_segments ORDER BY group_id")?;
    let groups = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(groups)
}

/// Segment totals: (all, vectorized)
pub fn segment_counts(conn: &Connection) -> Result<(i64, i64)> {
    Ok(conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_vectorized), 0) FROM conversation_segments",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?)
}

/// Groups with the most segments: (group_id, segments, vectorized)
pub fn top_segment_groups(conn: &Connection, limit: usize) -> Result<Vec<(i64, i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, COUNT(*), COALESCE(SUM(is_vectorized), 0)
         FROM conversation_segments
         GROUP BY group_id
         ORDER BY COUNT(*) DESC, group_id
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
