//! SQLite database management with migrations
//!
//! Holds the chat entities, the vector metadata shadow and the index file
//! bookkeeping. Async callers go through [`Database::call`], which runs the
//! closure on the blocking pool.

use crate::error::{Result, SegvecError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database manager with migration support
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create a new database connection
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SegvecError::io(e, format!("Failed to create database directory: {:?}", parent))
            })?;
        }

        // Per-connection pragmas; foreign_keys and busy_timeout are not persistent
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder()
            .max_size(16)
            .build(manager)
            .map_err(|e| SegvecError::Pool(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };

        db.migrate()?;

        Ok(db)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| SegvecError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Run `f` with a pooled connection on the blocking thread pool
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| SegvecError::Pool(format!("Failed to get connection: {}", e)))?;
            f(&conn)
        })
        .await
        .map_err(|e| SegvecError::Task(e.to_string()))?
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying migration {}", version);

                conn.execute_batch(migration)?;

                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.get_conn()?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(DbStats {
            message_count: count("SELECT COUNT(*) FROM messages")?,
            segment_count: count("SELECT COUNT(*) FROM conversation_segments")?,
            vector_entry_count: count("SELECT COUNT(*) FROM vector_indexes")?,
            index_file_count: count("SELECT COUNT(*) FROM faiss_index_files WHERE is_valid = 1")?,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub message_count: usize,
    pub segment_count: usize,
    pub vector_entry_count: usize,
    pub index_file_count: usize,
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    -- Chat messages
    CREATE TABLE messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        message_id INTEGER NOT NULL,
        from_user_id INTEGER NOT NULL,
        reply_to_user_id INTEGER,
        reply_to_message_id INTEGER,
        content TEXT NOT NULL,
        date_time INTEGER NOT NULL
    );

    CREATE INDEX idx_messages_group_time ON messages(group_id, date_time);

    -- Conversation segments produced by segmentation
    CREATE TABLE conversation_segments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        first_message_id INTEGER NOT NULL,
        last_message_id INTEGER NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        participant_count INTEGER NOT NULL DEFAULT 0,
        topic_keywords TEXT,
        content_summary TEXT,
        full_content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        is_vectorized BOOLEAN NOT NULL DEFAULT 0
    );

    CREATE INDEX idx_segments_group_pending ON conversation_segments(group_id, is_vectorized, start_time);

    -- Segment membership
    CREATE TABLE conversation_segment_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_segment_id INTEGER NOT NULL,
        message_data_id INTEGER NOT NULL,
        sequence_order INTEGER NOT NULL,
        FOREIGN KEY (conversation_segment_id) REFERENCES conversation_segments(id) ON DELETE CASCADE,
        FOREIGN KEY (message_data_id) REFERENCES messages(id) ON DELETE CASCADE
    );

    CREATE INDEX idx_segment_messages_segment ON conversation_segment_messages(conversation_segment_id);

    -- Metadata shadow of every vector in an ANN index
    CREATE TABLE vector_indexes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        vector_type TEXT NOT NULL,
        entity_id INTEGER NOT NULL,
        faiss_index INTEGER NOT NULL,
        content_summary TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (group_id, vector_type, entity_id),
        UNIQUE (group_id, vector_type, faiss_index)
    );

    -- Persisted index files
    CREATE TABLE faiss_index_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        index_type TEXT NOT NULL,
        file_path TEXT NOT NULL,
        dimension INTEGER NOT NULL,
        vector_count INTEGER NOT NULL DEFAULT 0,
        file_size INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        is_valid BOOLEAN NOT NULL DEFAULT 1
    );

    CREATE UNIQUE INDEX idx_index_files_one_valid
        ON faiss_index_files(group_id, index_type) WHERE is_valid = 1;
    "#,
    // Migration 2: vector id high-water marks that survive purged rows
    r#"
    CREATE TABLE vector_id_watermarks (
        group_id INTEGER NOT NULL,
        vector_type TEXT NOT NULL,
        high_water INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (group_id, vector_type)
    );
    "#,
];
