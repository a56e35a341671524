//! Row storage for sessions and their collaborative state.
//!
//! The core only needs a key-value row store with prefix scans. Rows are
//! JSON-encoded; keys that belong to a session start with `"{session_id}:"`
//! so one prefix scan loads everything of one kind for that session.

mod http;
mod memory;
mod sled_store;

pub use http::{HttpRowStore, RowBody, RowList};
pub use memory::MemoryRowStore;
pub use sled_store::{SledRowStore, StorageStats};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

use crate::comments::Comment;
use crate::conflict::Conflict;
use crate::document::Operation;
use crate::presence::PresenceRecord;
use crate::session::Session;
use crate::{SessionId, UserId};

pub const TABLE_SESSIONS: &str = "sessions";
pub const TABLE_OPERATIONS: &str = "operations";
pub const TABLE_SNAPSHOTS: &str = "snapshots";
pub const TABLE_CONFLICTS: &str = "conflicts";
pub const TABLE_COMMENTS: &str = "comments";
pub const TABLE_PRESENCE: &str = "presence";

/// Every table a row store must accept
pub const TABLES: [&str; 6] = [
    TABLE_SESSIONS,
    TABLE_OPERATIONS,
    TABLE_SNAPSHOTS,
    TABLE_CONFLICTS,
    TABLE_COMMENTS,
    TABLE_PRESENCE,
];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn check_table(table: &str) -> StoreResult<()> {
    if TABLES.contains(&table) {
        Ok(())
    } else {
        Err(StoreError::UnknownTable(table.to_string()))
    }
}

/// Key-value rows grouped in tables
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn upsert(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()>;

    async fn select(&self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Rows whose key starts with `prefix`, in key order
    async fn select_prefix(&self, table: &str, prefix: &str)
        -> StoreResult<Vec<(String, Vec<u8>)>>;

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()>;
}

/// Configuration for the sled row store
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// `STORAGE_PATH`, or the default path
    pub fn from_env() -> Self {
        match std::env::var("STORAGE_PATH") {
            Ok(path) => Self::new(path),
            Err(_) => Self::default(),
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }
}

/// Saved document content with the log position it was taken at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub session_id: SessionId,
    pub content: String,
    /// Sequenced operations included
    pub seq: u64,
    pub version: u64,
    /// SHA-256 of `content`, hex encoded
    pub checksum: String,
    pub saved_by: UserId,
    pub saved_at: i64,
}

impl DocumentSnapshot {
    pub fn new(
        session_id: impl Into<String>,
        content: impl Into<String>,
        seq: u64,
        version: u64,
        saved_by: impl Into<String>,
    ) -> Self {
        let content = content.into();
        Self {
            session_id: session_id.into(),
            checksum: content_checksum(&content),
            content,
            seq,
            version,
            saved_by: saved_by.into(),
            saved_at: crate::now_ms(),
        }
    }

    /// Whether `content` still matches the recorded checksum
    pub fn verify(&self) -> bool {
        content_checksum(&self.content) == self.checksum
    }
}

/// Hex SHA-256 of document content
pub fn content_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

fn operation_key(session_id: &str, seq: u64) -> String {
    format!("{}:{:020}", session_id, seq)
}

fn session_prefix(session_id: &str) -> String {
    format!("{}:", session_id)
}

/// Typed access to the collaboration tables
#[derive(Clone)]
pub struct SessionStore {
    rows: Arc<dyn RowStore>,
}

impl SessionStore {
    pub fn new(rows: Arc<dyn RowStore>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &Arc<dyn RowStore> {
        &self.rows
    }

    async fn put<T: Serialize + Sync>(&self, table: &str, key: &str, row: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(row)?;
        self.rows.upsert(table, key, bytes).await
    }

    async fn get<T: DeserializeOwned>(&self, table: &str, key: &str) -> StoreResult<Option<T>> {
        match self.rows.select(table, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn scan<T: DeserializeOwned>(&self, table: &str, prefix: &str) -> StoreResult<Vec<T>> {
        self.rows
            .select_prefix(table, prefix)
            .await?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(StoreError::from))
            .collect()
    }

    pub async fn save_session(&self, session: &Session) -> StoreResult<()> {
        self.put(TABLE_SESSIONS, &session.id, session).await
    }

    pub async fn load_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.get(TABLE_SESSIONS, session_id).await
    }

    /// Store sequenced operations, the first of them at position `start`
    pub async fn append_operations(
        &self,
        session_id: &str,
        start: u64,
        operations: &[Operation],
    ) -> StoreResult<()> {
        for (offset, op) in operations.iter().enumerate() {
            let key = operation_key(session_id, start + offset as u64);
            self.put(TABLE_OPERATIONS, &key, op).await?;
        }
        Ok(())
    }

    /// The sequenced log, in order
    pub async fn load_operations(&self, session_id: &str) -> StoreResult<Vec<Operation>> {
        self.scan(TABLE_OPERATIONS, &session_prefix(session_id)).await
    }

    pub async fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> StoreResult<()> {
        self.put(TABLE_SNAPSHOTS, &snapshot.session_id, snapshot)
            .await
    }

    pub async fn load_snapshot(&self, session_id: &str) -> StoreResult<Option<DocumentSnapshot>> {
        self.get(TABLE_SNAPSHOTS, session_id).await
    }

    pub async fn save_conflict(&self, conflict: &Conflict) -> StoreResult<()> {
        let key = format!("{}:{}", conflict.session_id, conflict.id);
        self.put(TABLE_CONFLICTS, &key, conflict).await
    }

    pub async fn load_conflicts(&self, session_id: &str) -> StoreResult<Vec<Conflict>> {
        self.scan(TABLE_CONFLICTS, &session_prefix(session_id)).await
    }

    pub async fn save_comment(&self, comment: &Comment) -> StoreResult<()> {
        let key = format!("{}:{}", comment.session_id, comment.id);
        self.put(TABLE_COMMENTS, &key, comment).await
    }

    pub async fn load_comments(&self, session_id: &str) -> StoreResult<Vec<Comment>> {
        self.scan(TABLE_COMMENTS, &session_prefix(session_id)).await
    }

    pub async fn save_presence(&self, record: &PresenceRecord) -> StoreResult<()> {
        let key = format!("{}:{}", record.session_id, record.user_id);
        self.put(TABLE_PRESENCE, &key, record).await
    }

    pub async fn delete_presence(&self, session_id: &str, user_id: &str) -> StoreResult<()> {
        self.rows
            .delete(TABLE_PRESENCE, &format!("{}:{}", session_id, user_id))
            .await
    }

    pub async fn load_presence(&self, session_id: &str) -> StoreResult<Vec<PresenceRecord>> {
        self.scan(TABLE_PRESENCE, &session_prefix(session_id)).await
    }
}
