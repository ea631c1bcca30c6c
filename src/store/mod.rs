//! Shared-store client trait and adapters.
//!
//! # Architecture
//!
//! The shared store is the only truly shared mutable resource in the system.
//! It is a dumb cell store: it reads and writes addressed cells and blocks of
//! cells, nothing more. It offers no transactions and no compare-and-swap;
//! all mutual exclusion is built above it by the
//! [`ClaimManager`](crate::claim::ClaimManager).
//!
//! The claim protocol is only sound if a read issued after a write observes
//! that write. Every adapter in this module provides read-after-write
//! consistency.
//!
//! # Adapters
//!
//! - [`InMemoryStore`](memory::InMemoryStore) -- `DashMap`-backed cells with a
//!   write history and fault injection for tests.
//! - [`JsonFileStore`](file::JsonFileStore) -- cells persisted in a JSON file,
//!   rewritten atomically after every write.
//! - [`RetryingStore`](retrying::RetryingStore) -- wraps any store and retries
//!   rate-limited calls with a [`RetryPolicy`](crate::retry::RetryPolicy).

pub mod file;
pub mod memory;
pub mod retrying;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::address::{CellAddress, CellRange};

pub use file::JsonFileStore;
pub use memory::InMemoryStore;
pub use retrying::RetryingStore;

/// Errors raised by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend asked the caller to slow down.
    #[error("store rate limited{}", .retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited {
        /// Backend-suggested pause, if any.
        retry_after: Option<Duration>,
    },

    /// The backend rejected an address.
    #[error("invalid store address: {0}")]
    InvalidAddress(String),

    /// Local I/O failure.
    #[error("store I/O error on '{path}': {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Stored data could not be decoded or encoded.
    #[error("store data error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("store backend error: {message}")]
    Backend {
        /// Human-readable description.
        message: String,
    },
}

impl StoreError {
    /// Returns `true` for errors worth retrying after a pause.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Cell-level access to the shared table.
///
/// Empty cells read as the empty string; writing the empty string clears a
/// cell. Implementations must be `Send + Sync` and provide read-after-write
/// consistency.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Reads one cell.
    async fn read_cell(&self, address: &CellAddress) -> Result<String, StoreError>;

    /// Writes one cell.
    async fn write_cell(&self, address: &CellAddress, value: &str) -> Result<(), StoreError>;

    /// Reads a block of cells, row-major, padded with empty strings to the
    /// full `height x width` shape of `range`.
    async fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError>;
}

#[async_trait]
impl<S: SharedStore + ?Sized> SharedStore for Arc<S> {
    async fn read_cell(&self, address: &CellAddress) -> Result<String, StoreError> {
        (**self).read_cell(address).await
    }

    async fn write_cell(&self, address: &CellAddress, value: &str) -> Result<(), StoreError> {
        (**self).write_cell(address, value).await
    }

    async fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError> {
        (**self).read_range(range).await
    }
}

/// Pads or trims a row-major block to exactly `range`'s shape.
pub(crate) fn shape_block(mut rows: Vec<Vec<String>>, range: &CellRange) -> Vec<Vec<String>> {
    rows.resize_with(range.height(), Vec::new);
    for row in &mut rows {
        row.resize_with(range.width(), String::new);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_block_pads_and_trims() {
        let range: CellRange = "A1:B3".parse().unwrap();
        let shaped = shape_block(vec![vec!["x".into(), "y".into(), "z".into()]], &range);
        assert_eq!(
            shaped,
            vec![
                vec!["x".to_string(), "y".to_string()],
                vec![String::new(), String::new()],
                vec![String::new(), String::new()],
            ]
        );
    }

    #[test]
    fn rate_limited_display_includes_hint() {
        let err = StoreError::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(err.to_string(), "store rate limited (retry after 1500ms)");
        assert!(err.is_rate_limited());
        assert_eq!(
            StoreError::RateLimited { retry_after: None }.to_string(),
            "store rate limited"
        );
    }
}
