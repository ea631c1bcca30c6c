//! Fixed-size pool of worker slots.
//!
//! # Architecture
//!
//! Each slot sits behind its own `tokio::sync::Mutex`. [`WorkerPool::acquire`]
//! locks the slot and hands the owned guard out inside a [`SlotLease`], so a
//! slot can never be leased to two callers at once; a second caller simply
//! waits for the lease to come back.
//!
//! Sessions are created lazily. A slot that already runs a session of the
//! requested worker type is reused after a fresh readiness probe; anything
//! else is torn down and replaced. Session creation polls
//! [`WorkerDriver::probe_ready`] at a fixed interval and recreates the session
//! a bounded number of times before giving up with
//! [`RelayError::StaleWorker`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::PoolSettings;
use crate::error::{RelayError, Result};
use crate::task::TaskId;
use crate::worker::{DriverRegistry, SessionConfig, SessionHandle, WorkerDriver};

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No work assigned; a session may still be running for reuse.
    Idle,
    /// A session is being created.
    Starting,
    /// A session answered its readiness probe.
    Ready,
    /// Leased to a task.
    Busy,
    /// The session is unusable and will be replaced on next use.
    Stale,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// How a lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The session is fine and may be reused.
    Healthy,
    /// The session must be stopped.
    Stale,
}

/// One slot and the session it holds.
pub struct WorkerSlot {
    index: usize,
    session: Option<(SessionHandle, Arc<dyn WorkerDriver>)>,
    assigned_task: Option<TaskId>,
    state: SlotState,
}

impl fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("index", &self.index)
            .field("session", &self.session.as_ref().map(|(h, _)| h))
            .field("assigned_task", &self.assigned_task)
            .field("state", &self.state)
            .finish()
    }
}

impl WorkerSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            session: None,
            assigned_task: None,
            state: SlotState::Idle,
        }
    }

    /// Slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current state.
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Worker type of the running session, if any.
    pub fn worker_type(&self) -> Option<&str> {
        self.session.as_ref().map(|(h, _)| h.worker_type.as_str())
    }

    /// Task the slot is leased to, if any.
    pub fn assigned_task(&self) -> Option<&TaskId> {
        self.assigned_task.as_ref()
    }

    async fn teardown(&mut self) {
        if let Some((handle, driver)) = self.session.take() {
            tracing::debug!(slot = self.index, session = %handle.id, "stopping session");
            driver.stop(&handle).await;
        }
    }
}

/// Exclusive access to one slot and its ready session.
pub struct SlotLease {
    guard: OwnedMutexGuard<WorkerSlot>,
    handle: SessionHandle,
    driver: Arc<dyn WorkerDriver>,
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotLease")
            .field("slot", &self.guard.index)
            .field("handle", &self.handle)
            .finish()
    }
}

impl SlotLease {
    /// Index of the leased slot.
    pub fn index(&self) -> usize {
        self.guard.index
    }

    /// The session to send prompts to.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// The driver that owns the session.
    pub fn driver(&self) -> &Arc<dyn WorkerDriver> {
        &self.driver
    }
}

/// Fixed set of slots shared by every dispatch of a run.
pub struct WorkerPool {
    slots: Vec<Arc<Mutex<WorkerSlot>>>,
    registry: DriverRegistry,
    settings: PoolSettings,
    close_immediately: bool,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("slots", &self.slots.len())
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .field("close_immediately", &self.close_immediately)
            .finish()
    }
}

impl WorkerPool {
    /// Creates `slot_count` empty slots (at least one).
    pub fn new(slot_count: usize, registry: DriverRegistry, settings: PoolSettings) -> Self {
        Self {
            slots: (0..slot_count.max(1))
                .map(|i| Arc::new(Mutex::new(WorkerSlot::new(i))))
                .collect(),
            registry,
            settings,
            close_immediately: false,
        }
    }

    /// Stops every session as soon as its lease is released.
    pub fn close_immediately(mut self, yes: bool) -> Self {
        self.close_immediately = yes;
        self
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The driver registry.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Current state of slot `index`, waiting for any outstanding lease.
    pub async fn slot_state(&self, index: usize) -> SlotState {
        self.slots[index % self.slots.len()].lock().await.state
    }

    /// Leases slot `preferred_index` (modulo the slot count) with a ready
    /// session of `worker_type`.
    ///
    /// # Errors
    ///
    /// [`RelayError::UnknownWorkerType`] if no driver is registered, and
    /// [`RelayError::StaleWorker`] if no ready session could be created.
    pub async fn acquire(
        &self,
        worker_type: &str,
        preferred_index: usize,
        task_id: &TaskId,
    ) -> Result<SlotLease> {
        let driver = self.registry.get(worker_type)?;
        let index = preferred_index % self.slots.len();
        let mut slot = self.slots[index].clone().lock_owned().await;

        let reusable = matches!(slot.state, SlotState::Idle | SlotState::Ready)
            && slot.worker_type() == Some(worker_type);
        let mut handle = None;
        if reusable {
            if let Some((existing, driver)) = &slot.session {
                if driver.probe_ready(existing).await {
                    tracing::debug!(slot = index, session = %existing.id, "reusing session");
                    handle = Some(existing.clone());
                } else {
                    tracing::warn!(slot = index, session = %existing.id, "session failed capability probe");
                }
            }
        }

        let handle = match handle {
            Some(handle) => handle,
            None => {
                slot.teardown().await;
                self.create_session(&mut slot, &driver, worker_type).await?
            }
        };

        slot.state = SlotState::Busy;
        slot.assigned_task = Some(task_id.clone());
        Ok(SlotLease {
            guard: slot,
            handle,
            driver,
        })
    }

    async fn create_session(
        &self,
        slot: &mut WorkerSlot,
        driver: &Arc<dyn WorkerDriver>,
        worker_type: &str,
    ) -> Result<SessionHandle> {
        let config = SessionConfig {
            worker_type: worker_type.to_string(),
            slot: slot.index,
        };
        let interval = Duration::from_millis(self.settings.probe_interval_ms);
        let mut last_error = String::from("session never became ready");

        for creation in 0..self.settings.slot_creation_attempts.max(1) {
            slot.state = SlotState::Starting;
            let handle = match driver.start(&config).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!(slot = slot.index, creation, error = %e, "session start failed");
                    last_error = e.to_string();
                    continue;
                }
            };
            for probe in 0..self.settings.probe_attempts.max(1) {
                if driver.probe_ready(&handle).await {
                    tracing::info!(slot = slot.index, %worker_type, session = %handle.id, probe, "session ready");
                    slot.state = SlotState::Ready;
                    slot.session = Some((handle.clone(), driver.clone()));
                    return Ok(handle);
                }
                tokio::time::sleep(interval).await;
            }
            tracing::warn!(slot = slot.index, creation, "session did not become ready, recreating");
            driver.stop(&handle).await;
        }

        slot.state = SlotState::Stale;
        Err(RelayError::StaleWorker {
            slot: slot.index,
            message: last_error,
        })
    }

    /// Returns a lease to the pool.
    ///
    /// Stale outcomes, and every outcome when `close_immediately` is set,
    /// stop the session right away.
    pub async fn release(&self, lease: SlotLease, outcome: SlotOutcome) {
        let SlotLease { mut guard, .. } = lease;
        guard.assigned_task = None;
        match outcome {
            SlotOutcome::Stale => {
                tracing::warn!(slot = guard.index, "marking slot stale");
                guard.teardown().await;
                guard.state = SlotState::Stale;
            }
            SlotOutcome::Healthy if self.close_immediately => {
                guard.teardown().await;
                guard.state = SlotState::Idle;
            }
            SlotOutcome::Healthy => guard.state = SlotState::Idle,
        }
    }

    /// Marks slot `index` stale so its session is replaced on next use.
    ///
    /// Waits for any outstanding lease on the slot; do not call it while
    /// holding that slot's lease.
    pub async fn mark_stale(&self, index: usize) {
        let mut slot = self.slots[index % self.slots.len()].lock().await;
        slot.state = SlotState::Stale;
    }

    /// Stops every session and resets all slots to idle.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            let mut slot = slot.lock().await;
            slot.teardown().await;
            slot.assigned_task = None;
            slot.state = SlotState::Idle;
        }
        tracing::debug!(slots = self.slots.len(), "worker pool shut down");
    }
}
