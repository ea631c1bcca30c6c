//! JSON-file-backed shared store.
//!
//! Cells live in a single JSON object keyed by normalized A1 address:
//!
//! ```json
//! { "Prompts!B5": "Summarize ...", "Prompts!C5": "__CLAIMED__\n2026-01-01T00:00:00.000000Z" }
//! ```
//!
//! The file is loaded once on [`JsonFileStore::open`]. Every write updates the
//! in-memory copy and rewrites the file atomically (temp file, then rename),
//! all under one async mutex, so reads always observe completed writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::address::{CellAddress, CellRange};
use crate::store::{shape_block, SharedStore, StoreError};

/// Shared store persisted as a JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cells: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Opens `path`, creating an empty store if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file cannot be read and
    /// [`StoreError::Serialization`] if it is not a JSON object of strings.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cells = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => normalize_keys(serde_json::from_str(&content)?)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(io_error(&path, source)),
        };
        tracing::debug!(path = %path.display(), cells = cells.len(), "opened JSON file store");
        Ok(Self {
            path,
            cells: Mutex::new(cells),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, cells: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(cells)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Re-keys a loaded map by canonical address text so `C5` and `c5` collide.
fn normalize_keys(raw: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, StoreError> {
    raw.into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| {
            let address: CellAddress = key
                .parse()
                .map_err(|_| StoreError::InvalidAddress(key.clone()))?;
            Ok((address.to_string(), value))
        })
        .collect()
}

#[async_trait]
impl SharedStore for JsonFileStore {
    async fn read_cell(&self, address: &CellAddress) -> Result<String, StoreError> {
        let cells = self.cells.lock().await;
        Ok(cells.get(&address.to_string()).cloned().unwrap_or_default())
    }

    async fn write_cell(&self, address: &CellAddress, value: &str) -> Result<(), StoreError> {
        let mut cells = self.cells.lock().await;
        let key = address.to_string();
        let previous = if value.is_empty() {
            cells.remove(&key)
        } else {
            cells.insert(key.clone(), value.to_string())
        };
        if let Err(e) = self.persist(&cells).await {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => cells.insert(key, old),
                None => cells.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError> {
        let cells = self.cells.lock().await;
        let rows = (range.start_row..=range.end_row)
            .map(|row| {
                (range.start_column..=range.end_column)
                    .map(|column| {
                        let key =
                            CellAddress::from_indices(range.sheet.clone(), column, row).to_string();
                        cells.get(&key).cloned().unwrap_or_default()
                    })
                    .collect()
            })
            .collect();
        Ok(shape_block(rows, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> CellAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("cells.json")).await.unwrap();
        assert_eq!(store.read_cell(&addr("A1")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.json");
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.write_cell(&addr("Prompts!C5"), "done").await.unwrap();
            store.write_cell(&addr("Prompts!C6"), "tmp").await.unwrap();
            store.write_cell(&addr("Prompts!C6"), "").await.unwrap();
        }
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.read_cell(&addr("Prompts!C5")).await.unwrap(), "done");
        assert_eq!(reopened.read_cell(&addr("Prompts!C6")).await.unwrap(), "");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn keys_are_normalized_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.json");
        std::fs::write(&path, r#"{"b5": "prompt", "c5": ""}"#).unwrap();
        let store = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(store.read_cell(&addr("B5")).await.unwrap(), "prompt");
        let block = store.read_range(&"B5:C5".parse().unwrap()).await.unwrap();
        assert_eq!(block, vec![vec!["prompt".to_string(), String::new()]]);
    }

    #[tokio::test]
    async fn invalid_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
