//! Sled-backed row store.
//!
//! Each table is its own sled tree; row keys are stored as UTF-8 bytes, so
//! sled's byte ordering gives the key order `select_prefix` promises.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use super::{check_table, RowStore, StorageConfig, StoreError, StoreResult, TABLES};

#[derive(Clone)]
pub struct SledRowStore {
    db: Arc<Db>,
    config: StorageConfig,
}

impl SledRowStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StoreResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        for table in TABLES {
            db.open_tree(table)?;
        }

        Ok(Self {
            db: Arc::new(db),
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn tree(&self, table: &str) -> StoreResult<Tree> {
        check_table(table)?;
        Ok(self.db.open_tree(table)?)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        let rows = TABLES
            .iter()
            .filter_map(|table| self.db.open_tree(table).ok())
            .map(|tree| tree.len())
            .sum();
        StorageStats {
            table_count: TABLES.len(),
            row_count: rows,
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub table_count: usize,
    pub row_count: usize,
    pub total_size_bytes: u64,
}

#[async_trait]
impl RowStore for SledRowStore {
    async fn upsert(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        self.tree(table)?.insert(key.as_bytes(), value)?;
        Ok(())
    }

    async fn select(&self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree(table)?.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    async fn select_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut rows = Vec::new();
        for item in self.tree(table)?.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Corruption(format!("Non UTF-8 key in {}: {}", table, e)))?;
            rows.push((key, value.to_vec()));
        }
        Ok(rows)
    }

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        self.tree(table)?.remove(key.as_bytes())?;
        Ok(())
    }
}

impl Drop for SledRowStore {
    fn drop(&mut self) {
        // Only the last clone flushes
        if Arc::strong_count(&self.db) == 1 {
            if let Err(e) = self.db.flush() {
                warn!("Failed to flush row store on drop: {}", e);
            }
        }
    }
}
