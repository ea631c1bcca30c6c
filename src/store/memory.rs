//! In-memory shared store.
//!
//! [`InMemoryStore`] keeps cells in a `DashMap<CellAddress, String>`. Empty
//! cells are simply absent. Besides serving as a reference adapter it keeps a
//! write history and call counters, and can inject failures, which the
//! claim-protocol and scheduler tests rely on.
//!
//! # Examples
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use sheetrelay::store::{InMemoryStore, SharedStore};
//!
//! let store = InMemoryStore::new();
//! let cell = "Prompts!C5".parse().unwrap();
//! store.write_cell(&cell, "answer").await.unwrap();
//! assert_eq!(store.read_cell(&cell).await.unwrap(), "answer");
//! store.write_cell(&cell, "").await.unwrap();
//! assert!(store.is_empty());
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::address::{AddressError, CellAddress, CellRange};
use crate::store::{shape_block, SharedStore, StoreError};

/// Which calls an injected fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// `read_cell` and `read_range`.
    Reads,
    /// `write_cell`.
    Writes,
}

/// Kind of injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Answer with [`StoreError::RateLimited`].
    RateLimited,
    /// Answer with [`StoreError::Backend`].
    Backend,
    /// Accept a write but store a different value (writes only).
    CorruptWrite,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    target: FaultTarget,
    kind: FaultKind,
}

/// Thread-safe in-memory cell store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    cells: DashMap<CellAddress, String>,
    history: Mutex<Vec<(CellAddress, String)>>,
    faults: Mutex<VecDeque<Fault>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `(address, value)` pairs.
    ///
    /// # Errors
    ///
    /// Returns the first address that fails to parse.
    pub fn with_cells<'a>(
        cells: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, AddressError> {
        let store = Self::new();
        for (address, value) in cells {
            let address: CellAddress = address.parse()?;
            store.set(&address, value);
        }
        Ok(store)
    }

    /// Synchronously sets a cell without touching counters or history.
    pub fn set(&self, address: &CellAddress, value: &str) {
        if value.is_empty() {
            self.cells.remove(address);
        } else {
            self.cells.insert(address.clone(), value.to_string());
        }
    }

    /// Synchronously reads a cell without touching counters.
    pub fn get(&self, address: &CellAddress) -> String {
        self.cells
            .get(address)
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// Number of non-empty cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Returns `true` if every cell is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Every successful `write_cell`, in order.
    pub fn history(&self) -> Vec<(CellAddress, String)> {
        self.history.lock().clone()
    }

    /// Number of `read_cell` and `read_range` calls served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_cell` calls served.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Queues `count` faults of `kind` for the next matching calls.
    pub fn inject(&self, target: FaultTarget, kind: FaultKind, count: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(Fault { target, kind });
        }
    }

    fn take_fault(&self, target: FaultTarget) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let position = faults.iter().position(|f| f.target == target)?;
        faults.remove(position).map(|f| f.kind)
    }

    fn fault_error(kind: FaultKind) -> StoreError {
        match kind {
            FaultKind::RateLimited => StoreError::RateLimited { retry_after: None },
            FaultKind::Backend | FaultKind::CorruptWrite => StoreError::Backend {
                message: "injected fault".to_string(),
            },
        }
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn read_cell(&self, address: &CellAddress) -> Result<String, StoreError> {
        if let Some(kind) = self.take_fault(FaultTarget::Reads) {
            return Err(Self::fault_error(kind));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(address))
    }

    async fn write_cell(&self, address: &CellAddress, value: &str) -> Result<(), StoreError> {
        let stored = match self.take_fault(FaultTarget::Writes) {
            Some(FaultKind::CorruptWrite) => format!("{value}#corrupted"),
            Some(kind) => return Err(Self::fault_error(kind)),
            None => value.to_string(),
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.set(address, &stored);
        self.history.lock().push((address.clone(), stored));
        Ok(())
    }

    async fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError> {
        if let Some(kind) = self.take_fault(FaultTarget::Reads) {
            return Err(Self::fault_error(kind));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let rows = (range.start_row..=range.end_row)
            .map(|row| {
                (range.start_column..=range.end_column)
                    .map(|column| {
                        self.get(&CellAddress::from_indices(range.sheet.clone(), column, row))
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
    async fn empty_cells_read_as_empty_string() {
        let store = InMemoryStore::new();
        assert_eq!(store.read_cell(&addr("A1")).await.unwrap(), "");
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn range_reads_are_row_major_and_sheet_scoped() {
        let store = InMemoryStore::with_cells([("S!A1", "a"), ("S!B2", "b"), ("A1", "other")]).unwrap();
        let block = store.read_range(&"S!A1:B2".parse().unwrap()).await.unwrap();
        assert_eq!(
            block,
            vec![
                vec!["a".to_string(), String::new()],
                vec![String::new(), "b".to_string()]
            ]
        );
    }

    #[tokio::test]
    async fn writes_are_recorded_in_history() {
        let store = InMemoryStore::new();
        store.write_cell(&addr("C5"), "x").await.unwrap();
        store.write_cell(&addr("C5"), "").await.unwrap();
        assert_eq!(
            store.history(),
            vec![(addr("C5"), "x".to_string()), (addr("C5"), String::new())]
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn injected_faults_fire_once_per_count() {
        let store = InMemoryStore::new();
        store.inject(FaultTarget::Writes, FaultKind::RateLimited, 2);
        assert!(store.write_cell(&addr("A1"), "v").await.unwrap_err().is_rate_limited());
        assert!(store.write_cell(&addr("A1"), "v").await.is_err());
        store.write_cell(&addr("A1"), "v").await.unwrap();
        assert_eq!(store.get(&addr("A1")), "v");
        // Read faults are independent of write faults.
        store.inject(FaultTarget::Reads, FaultKind::Backend, 1);
        store.write_cell(&addr("A2"), "w").await.unwrap();
        assert!(store.read_cell(&addr("A2")).await.is_err());
        assert_eq!(store.read_cell(&addr("A2")).await.unwrap(), "w");
    }

    #[tokio::test]
    async fn corrupt_write_stores_a_different_value() {
        let store = InMemoryStore::new();
        store.inject(FaultTarget::Writes, FaultKind::CorruptWrite, 1);
        store.write_cell(&addr("A1"), "v").await.unwrap();
        assert_ne!(store.get(&addr("A1")), "v");
    }
}
