//! Error types for the orchestration engine.
//!
//! [`RelayError`] is the single error type surfaced by the claim manager,
//! worker pool, messaging layer, and scheduler. Transient classes
//! ([`ClaimConflict`](RelayError::ClaimConflict), retried
//! [`StaleWorker`](RelayError::StaleWorker) failures) are absorbed below the
//! scheduler; the rest reach it and fail the task they belong to.

use std::time::Duration;

use crate::address::AddressError;
use crate::claim::ClaimState;
use crate::config::ConfigError;
use crate::store::StoreError;
use crate::task::TaskStatus;

/// Convenience alias used throughout the crate.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Errors that can occur while claiming, dispatching, or recording a task.
///
/// # Examples
///
/// ```
/// use sheetrelay::error::RelayError;
///
/// let err = RelayError::NonRecoverable {
///     slot: Some(1),
///     message: "session window closed".to_string(),
/// };
/// assert_eq!(err.error_class(), "non_recoverable");
/// assert!(err.to_string().contains("window closed"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Another claimant holds the marker, or the cell is already terminal.
    #[error("task {task_id} is not claimable (cell is {state})")]
    ClaimConflict {
        /// The contested task.
        task_id: String,
        /// What the double-check read observed.
        state: ClaimState,
    },

    /// The worker session behind a slot stopped answering.
    #[error("worker in slot {slot} is stale: {message}")]
    StaleWorker {
        /// Slot index.
        slot: usize,
        /// Last transport error or probe failure.
        message: String,
    },

    /// The value read back after a result write does not match.
    #[error("write verification failed for task {task_id} at {address}")]
    WriteVerificationFailure {
        /// The task whose result was written.
        task_id: String,
        /// The answer cell.
        address: String,
    },

    /// The worker session or its host went away; retrying is pointless.
    #[error("non-recoverable worker failure{}: {message}", .slot.map(|s| format!(" in slot {s}")).unwrap_or_default())]
    NonRecoverable {
        /// Slot index, when the failure is tied to one.
        slot: Option<usize>,
        /// Human-readable cause.
        message: String,
    },

    /// The dispatch exceeded its hard timeout.
    #[error("task {task_id} timed out after {}s", .timeout.as_secs())]
    DispatchTimeout {
        /// The dispatched task.
        task_id: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The worker answered but reported that it could not produce a result.
    #[error("worker rejected task {task_id}: {message}")]
    WorkerRejected {
        /// The dispatched task.
        task_id: String,
        /// Worker-supplied reason.
        message: String,
    },

    /// A task status change outside the lifecycle table.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task being transitioned.
        task_id: String,
        /// Current status.
        from: TaskStatus,
        /// Rejected target status.
        to: TaskStatus,
    },

    /// No driver is registered for a worker type.
    #[error("no worker driver registered for type '{0}'")]
    UnknownWorkerType(String),

    /// Shared-store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Address parsing failure.
    #[error(transparent)]
    Address(#[from] AddressError),
}

impl RelayError {
    /// Short machine-friendly class name, used in run reports and log fields.
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::ClaimConflict { .. } => "claim_conflict",
            Self::StaleWorker { .. } => "stale_worker",
            Self::WriteVerificationFailure { .. } => "write_verification_failure",
            Self::NonRecoverable { .. } => "non_recoverable",
            Self::DispatchTimeout { .. } => "timeout",
            Self::WorkerRejected { .. } => "worker_rejected",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownWorkerType(_) => "unknown_worker_type",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::Address(_) => "address",
        }
    }

    /// Returns `true` for errors that leave the slot's session unusable.
    ///
    /// The scheduler marks the slot stale so the pool recreates it on next
    /// use.
    pub fn poisons_slot(&self) -> bool {
        matches!(
            self,
            Self::StaleWorker { .. } | Self::NonRecoverable { .. } | Self::DispatchTimeout { .. }
        )
    }

    /// Returns `true` for errors that end the task for this run.
    ///
    /// Claim conflicts only mean another claimant got there first; the task
    /// is skipped, not failed.
    pub fn is_terminal_for_task(&self) -> bool {
        !matches!(self, Self::ClaimConflict { .. })
    }

    /// Returns `true` if the error is a hard timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DispatchTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_carry_context() {
        let err = RelayError::ClaimConflict {
            task_id: "g1:C5".to_string(),
            state: ClaimState::Claimed,
        };
        assert_eq!(err.to_string(), "task g1:C5 is not claimable (cell is claimed)");

        let err = RelayError::NonRecoverable {
            slot: None,
            message: "gone".to_string(),
        };
        assert_eq!(err.to_string(), "non-recoverable worker failure: gone");

        let err = RelayError::DispatchTimeout {
            task_id: "g2:D9".to_string(),
            timeout: Duration::from_secs(540),
        };
        assert_eq!(err.to_string(), "task g2:D9 timed out after 540s");
    }

    #[test]
    fn slot_poisoning_classes() {
        assert!(RelayError::StaleWorker {
            slot: 0,
            message: "x".into()
        }
        .poisons_slot());
        assert!(RelayError::DispatchTimeout {
            task_id: "t".into(),
            timeout: Duration::from_secs(1)
        }
        .poisons_slot());
        assert!(!RelayError::WorkerRejected {
            task_id: "t".into(),
            message: "no".into()
        }
        .poisons_slot());
        assert!(!RelayError::WriteVerificationFailure {
            task_id: "t".into(),
            address: "C5".into()
        }
        .poisons_slot());
    }

    #[test]
    fn claim_conflicts_do_not_fail_the_task() {
        let conflict = RelayError::ClaimConflict {
            task_id: "g1:C5".into(),
            state: ClaimState::Terminal,
        };
        assert!(!conflict.is_terminal_for_task());
        assert!(RelayError::WorkerRejected {
            task_id: "t".into(),
            message: "no".into()
        }
        .is_terminal_for_task());
    }
}
