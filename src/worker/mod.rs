//! Worker sessions: the driver trait, its registry, and the slot pool.
//!
//! A worker session is an external, long-lived process that answers prompts
//! (one browser window driving one chat backend, for instance). The engine
//! never talks to a session directly; it goes through a [`WorkerDriver`]
//! registered for the session's worker type.
//!
//! Reference drivers:
//!
//! - [`ProcessDriver`] -- one child process per session, newline-delimited
//!   JSON over stdin/stdout.
//! - [`ScriptedDriver`] -- canned replies for tests and dry runs.

pub mod pool;
pub mod process;
pub mod scripted;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{RelayError, Result};
use crate::task::{Task, TaskMode};

pub use pool::{SlotLease, SlotOutcome, SlotState, WorkerPool};
pub use process::ProcessDriver;
pub use scripted::{ScriptedDriver, ScriptedReply};

/// What a driver needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Worker type the session serves.
    pub worker_type: String,
    /// Pool slot the session will occupy.
    pub slot: usize,
}

/// Opaque reference to a running session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    /// Unique session id.
    pub id: Uuid,
    /// Worker type the session serves.
    pub worker_type: String,
    /// Pool slot the session occupies.
    pub slot: usize,
}

impl SessionHandle {
    /// A fresh handle for `config`.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_type: config.worker_type.clone(),
            slot: config.slot,
        }
    }
}

/// One prompt sent to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Task the prompt belongs to.
    pub task_id: String,
    /// Prompt text.
    pub prompt: String,
    /// Timeout class, so the session can pick a matching strategy.
    pub mode: TaskMode,
}

impl From<&Task> for WorkerRequest {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.to_string(),
            prompt: task.prompt.clone(),
            mode: task.mode,
        }
    }
}

/// A session's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Whether the session produced a result.
    pub success: bool,
    /// The result text, or the reason it could not be produced.
    #[serde(default)]
    pub payload: String,
}

/// Driver-level failures, classified by what the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The session exists but is not accepting messages yet; retry later.
    #[error("session not listening: {0}")]
    NotListening(String),
    /// The session or its host is gone.
    #[error("session closed: {0}")]
    Closed(String),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The session answered with something unintelligible.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Starts, probes, drives, and stops sessions of one worker type.
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    /// Starts a new session.
    async fn start(&self, config: &SessionConfig) -> std::result::Result<SessionHandle, DriverError>;

    /// Checks that the session is alive and accepting prompts.
    async fn probe_ready(&self, handle: &SessionHandle) -> bool;

    /// Sends one prompt and waits for the answer.
    async fn execute(
        &self,
        handle: &SessionHandle,
        request: &WorkerRequest,
        timeout: Duration,
    ) -> std::result::Result<WorkerResponse, DriverError>;

    /// Stops the session. Stopping an unknown or already stopped session is
    /// a no-op.
    async fn stop(&self, handle: &SessionHandle);
}

/// Drivers keyed by worker type.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn WorkerDriver>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("worker_types", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a [`ProcessDriver`] for every `[[worker]]` entry.
    pub fn from_config(config: &RunConfig) -> Self {
        let mut registry = Self::new();
        for worker in &config.workers {
            registry.register(
                worker.worker_type.clone(),
                Arc::new(ProcessDriver::new(worker.clone())),
            );
        }
        registry
    }

    /// Registers `driver` for `worker_type`, replacing any previous one.
    pub fn register(&mut self, worker_type: impl Into<String>, driver: Arc<dyn WorkerDriver>) -> &mut Self {
        self.drivers.insert(worker_type.into(), driver);
        self
    }

    /// Looks up the driver for `worker_type`.
    pub fn get(&self, worker_type: &str) -> Result<Arc<dyn WorkerDriver>> {
        self.drivers
            .get(worker_type)
            .cloned()
            .ok_or_else(|| RelayError::UnknownWorkerType(worker_type.to_string()))
    }

    /// Returns `true` if a driver is registered for `worker_type`.
    pub fn contains(&self, worker_type: &str) -> bool {
        self.drivers.contains_key(worker_type)
    }

    /// Registered worker types, sorted.
    pub fn worker_types(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}
