//! Row store client for the relay's `/api/rows` endpoints.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{check_table, RowStore, StoreError, StoreResult};

/// One row on the wire; `value` is base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBody {
    pub key: String,
    pub value: String,
}

impl RowBody {
    pub fn encode(key: impl Into<String>, value: &[u8]) -> Self {
        Self {
            key: key.into(),
            value: STANDARD.encode(value),
        }
    }

    pub fn decode(&self) -> StoreResult<Vec<u8>> {
        STANDARD
            .decode(&self.value)
            .map_err(|e| {
                StoreError::Corruption(format!("Invalid base64 in row {}: {}", self.key, e))
            })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowList {
    pub rows: Vec<RowBody>,
}

#[derive(Clone)]
pub struct HttpRowStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRowStore {
    pub fn new(base_url: &str) -> StoreResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StoreError::InitFailed(format!("Invalid base url {}: {}", base_url, e)))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
        })
    }

    fn url(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InitFailed(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(["api", "rows"])
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl RowStore for HttpRowStore {
    async fn upsert(&self, table: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
        check_table(table)?;
        self.client
            .put(self.url(&[table, key])?)
            .json(&RowBody::encode(key, &value))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn select(&self, table: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        check_table(table)?;
        let response = self.client.get(self.url(&[table, key])?).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let row: RowBody = response.error_for_status()?.json().await?;
        Ok(Some(row.decode()?))
    }

    async fn select_prefix(
        &self,
        table: &str,
        prefix: &str,
    ) -> StoreResult<Vec<(String, Vec<u8>)>> {
        check_table(table)?;
        let list: RowList = self
            .client
            .get(self.url(&[table])?)
            .query(&[("prefix", prefix)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        list.rows
            .into_iter()
            .map(|row| row.decode().map(|value| (row.key, value)))
            .collect()
    }

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        check_table(table)?;
        let response = self.client.delete(self.url(&[table, key])?).send().await?;
        if response.status() != StatusCode::NOT_FOUND {
            response.error_for_status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_body_base64() {
        let row = RowBody::encode("sess-1:c1", b"{\"a\":1}");
        assert_eq!(row.decode().unwrap(), b"{\"a\":1}".to_vec());

        let broken = RowBody {
            key: "k".to_string(),
            value: "not base64!".to_string(),
        };
        assert!(matches!(broken.decode(), Err(StoreError::Corruption(_))));
    }

    #[test]
    fn test_row_urls() {
        let store = HttpRowStore::new("http://localhost:5000/").unwrap();
        let url = store.url(&["comments", "sess 1:c1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:5000/api/rows/comments/sess%201:c1"
        );

        let url = store.url(&["operations"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:5000/api/rows/operations");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpRowStore::new("not a url"),
            Err(StoreError::InitFailed(_))
        ));
    }
}
