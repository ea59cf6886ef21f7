//! Row types for the metadata store

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of entity a vector was produced from
///
/// Each kind has its own index and its own id space per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VectorKind {
    ConversationSegment,
    Message,
}

impl VectorKind {
    pub const ALL: [VectorKind; 2] = [VectorKind::ConversationSegment, VectorKind::Message];

    pub fn as_str(&self) -> &'static str {
        match self {
            VectorKind::ConversationSegment => "ConversationSegment",
            VectorKind::Message => "Message",
        }
    }
}

impl fmt::Display for VectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ConversationSegment" => Ok(VectorKind::ConversationSegment),
            "Message" => Ok(VectorKind::Message),
            other => Err(format!("Unknown vector kind: {}", other)),
        }
    }
}

impl ToSql for VectorKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for VectorKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// Identity of one ANN index: a group's vectors of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IndexKey {
    pub group_id: i64,
    pub kind: VectorKind,
}

impl IndexKey {
    pub fn new(group_id: i64, kind: VectorKind) -> Self {
        Self { group_id, kind }
    }

    pub fn segments(group_id: i64) -> Self {
        Self::new(group_id, VectorKind::ConversationSegment)
    }

    /// File stem of the persisted index
    pub fn file_stem(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.group_id, self.kind)
    }
}

pub(crate) fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// A chat message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub group_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub reply_to_user_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub content: String,
    pub date_time: DateTime<Utc>,
}

impl Message {
    pub(crate) const COLUMNS: &'static str = "id, group_id, message_id, from_user_id, \
        reply_to_user_id, reply_to_message_id, content, date_time";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            message_id: row.get(2)?,
            from_user_id: row.get(3)?,
            reply_to_user_id: row.get(4)?,
            reply_to_message_id: row.get(5)?,
            content: row.get(6)?,
            date_time: timestamp(row.get(7)?),
        })
    }
}

/// Fields of a message about to be stored
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub group_id: i64,
    pub message_id: i64,
    pub from_user_id: i64,
    pub reply_to_user_id: Option<i64>,
    pub reply_to_message_id: Option<i64>,
    pub content: String,
    pub date_time: DateTime<Utc>,
}

/// A run of consecutive messages treated as one conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSegment {
    pub id: i64,
    pub group_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub message_count: i64,
    pub participant_count: i64,
    pub topic_keywords: Option<String>,
    pub content_summary: Option<String>,
    pub full_content: String,
    pub created_at: DateTime<Utc>,
    pub is_vectorized: bool,
}

impl ConversationSegment {
    pub(crate) const COLUMNS: &'static str = "id, group_id, start_time, end_time, \
        first_message_id, last_message_id, message_count, participant_count, topic_keywords, \
        content_summary, full_content, created_at, is_vectorized";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            start_time: timestamp(row.get(2)?),
            end_time: timestamp(row.get(3)?),
            first_message_id: row.get(4)?,
            last_message_id: row.get(5)?,
            message_count: row.get(6)?,
            participant_count: row.get(7)?,
            topic_keywords: row.get(8)?,
            content_summary: row.get(9)?,
            full_content: row.get(10)?,
            created_at: timestamp(row.get(11)?),
            is_vectorized: row.get(12)?,
        })
    }
}

/// Fields of a segment produced by the segmentation step
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub group_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub message_count: i64,
    pub participant_count: i64,
    pub topic_keywords: Option<String>,
    pub content_summary: Option<String>,
    pub full_content: String,
}

/// Metadata shadow of one vector stored in an ANN index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorIndexEntry {
    pub id: i64,
    pub group_id: i64,
    pub vector_type: VectorKind,
    pub entity_id: i64,
    /// Id of the vector inside its ANN index
    pub faiss_index: i64,
    pub content_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VectorIndexEntry {
    pub(crate) const COLUMNS: &'static str =
        "id, group_id, vector_type, entity_id, faiss_index, content_summary, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            vector_type: row.get(2)?,
            entity_id: row.get(3)?,
            faiss_index: row.get(4)?,
            content_summary: row.get(5)?,
            created_at: timestamp(row.get(6)?),
            updated_at: timestamp(row.get(7)?),
        })
    }
}

/// Fields of a vector metadata row about to be inserted
#[derive(Debug, Clone)]
pub struct NewVectorEntry {
    pub key: IndexKey,
    pub entity_id: i64,
    pub faiss_index: i64,
    pub content_summary: Option<String>,
}

/// Bookkeeping for one persisted index file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexFileRecord {
    pub id: i64,
    pub group_id: i64,
    pub index_type: VectorKind,
    pub file_path: String,
    pub dimension: i64,
    pub vector_count: i64,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_valid: bool,
}

impl IndexFileRecord {
    pub(crate) const COLUMNS: &'static str = "id, group_id, index_type, file_path, dimension, \
        vector_count, file_size, created_at, updated_at, is_valid";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            group_id: row.get(1)?,
            index_type: row.get(2)?,
            file_path: row.get(3)?,
            dimension: row.get(4)?,
            vector_count: row.get(5)?,
            file_size: row.get(6)?,
            created_at: timestamp(row.get(7)?),
            updated_at: timestamp(row.get(8)?),
            is_valid: row.get(9)?,
        })
    }

    pub fn key(&self) -> IndexKey {
        IndexKey::new(self.group_id, self.index_type)
    }
}
