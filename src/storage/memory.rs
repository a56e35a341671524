//! In-memory row store for tests and single-process setups.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{check_table, RowStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
    fail_writes: AtomicBool,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until turned off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of rows in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map(|t| t.len()).unwrap_or(0)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("writes are disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn upsert(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        check_table(table)?;
        self.check_writable()?;
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn select(&self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        check_table(table)?;
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    async fn select_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        check_table(table)?;
        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        check_table(table)?;
        self.check_writable()?;
        if let Some(rows) = self.tables.write().get_mut(table) {
            rows.remove(key);
        }
        Ok(())
    }
}
