//! sheetrelay: a row-claiming task orchestrator.
//!
//! sheetrelay reads prompts from a shared table, claims rows through
//! timestamped markers written into their answer cells, dispatches them to a
//! bounded pool of external worker sessions, and writes verified results
//! back. Rows are organized into groups that run strictly one after another.
//!
//! # Overview
//!
//! ```text
//! Orchestrator ─▶ DiscoveryEngine ─▶ ClaimManager ─▶ SharedStore
//!      │
//!      └────────▶ WorkerPool ─▶ Messenger ─▶ WorkerDriver ─▶ session
//! ```
//!
//! # Module Organization
//!
//! - [`address`] - A1 cell and range notation
//! - [`store`] - The [`SharedStore`] trait and its adapters
//! - [`claim`] - Claim markers, timeout policy, and the [`ClaimManager`]
//! - [`group`] / [`task`] - Groups, tasks, and the task lifecycle
//! - [`discovery`] - Finding claimable work and checking completion
//! - [`worker`] - Worker drivers and the slot pool
//! - [`messaging`] - Serialized, retried, time-boxed dispatch
//! - [`scheduler`] - The group state machine and run report
//! - [`config`] / [`retry`] / [`error`] - Configuration, backoff, errors
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> sheetrelay::Result<()> {
//! use std::sync::Arc;
//! use sheetrelay::{DriverRegistry, InMemoryStore, Orchestrator, RunConfig, ScriptedDriver};
//!
//! let config = RunConfig::from_toml(r#"
//! [[group]]
//! number = 1
//! source_columns = ["A"]
//! answer_columns = ["B"]
//! worker_types = ["echo"]
//! first_row = 1
//! last_row = 2
//! "#)?;
//! let store = Arc::new(InMemoryStore::with_cells([("A1", "ping"), ("A2", "pong")])?);
//! let mut registry = DriverRegistry::new();
//! registry.register("echo", Arc::new(ScriptedDriver::new()));
//!
//! let report = Orchestrator::from_config(&config, store.clone(), registry)?.run().await?;
//! assert!(report.is_success());
//! assert_eq!(store.get(&"B1".parse()?), "echo: ping");
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod claim;
pub mod config;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod group;
pub mod messaging;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;

// Re-exports for ergonomic access
pub use address::{AddressError, CellAddress, CellRange};
pub use claim::{ClaimManager, ClaimState, ClaimTicket, Clock, ManualClock, SystemClock, TimeoutPolicy};
pub use config::{ConfigError, FailurePolicy, GroupKind, RunConfig};
pub use discovery::{DiscoveryEngine, GroupProgress, TaskLedger};
pub use error::{RelayError, Result};
pub use group::TaskGroup;
pub use messaging::Messenger;
pub use retry::RetryPolicy;
pub use scheduler::{FailureRecord, Orchestrator, RunReport, SchedulerState};
pub use store::{InMemoryStore, JsonFileStore, RetryingStore, SharedStore, StoreError};
pub use task::{Task, TaskId, TaskMode, TaskStatus};
pub use worker::{
    DriverError, DriverRegistry, ProcessDriver, ScriptedDriver, ScriptedReply, WorkerDriver,
    WorkerPool,
};
