//! Tasks: one unit of work bound to one answer cell.
//!
//! A [`Task`] is created transiently by the discovery engine when it scans a
//! row whose source is non-empty and whose answer cell is claimable. It is
//! dropped once its terminal outcome has been recorded.
//!
//! # State Machine
//!
//! ```text
//! Discovered -> Claimed
//! Claimed    -> Dispatched, Failed
//! Dispatched -> Executing, Failed, TimedOut
//! Executing  -> Completed, Failed, TimedOut
//! Completed, Failed, TimedOut -> (terminal, no transitions)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::CellAddress;
use crate::error::RelayError;

/// Lifecycle status of a task inside one orchestrator run.
///
/// # Examples
///
/// ```
/// use sheetrelay::task::TaskStatus;
///
/// assert!(TaskStatus::Claimed.can_transition_to(&TaskStatus::Dispatched));
/// assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::Claimed));
/// assert!(!TaskStatus::Executing.can_transition_to(&TaskStatus::Executing));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Found claimable by a discovery scan.
    Discovered,
    /// Marker written and verified.
    Claimed,
    /// Slot acquired, request handed to the messaging layer.
    Dispatched,
    /// The worker accepted the request and is producing a result.
    Executing,
    /// Result written and verified (terminal).
    Completed,
    /// Failed for any reason other than a timeout (terminal).
    Failed,
    /// The dispatch hit its hard timeout (terminal).
    TimedOut,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovered => write!(f, "discovered"),
            Self::Claimed => write!(f, "claimed"),
            Self::Dispatched => write!(f, "dispatched"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

impl TaskStatus {
    /// Returns `true` for `Completed`, `Failed`, and `TimedOut`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    /// Returns `true` if moving from this status to `next` is allowed.
    ///
    /// Self-transitions and transitions out of terminal states are rejected.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
            return false;
        }

        match self {
            Self::Discovered => matches!(next, Self::Claimed),
            Self::Claimed => matches!(next, Self::Dispatched | Self::Failed),
            Self::Dispatched => matches!(next, Self::Executing | Self::Failed | Self::TimedOut),
            Self::Executing => matches!(next, Self::Completed | Self::Failed | Self::TimedOut),
            Self::Completed | Self::Failed | Self::TimedOut => false,
        }
    }

    /// Validates a transition, returning [`RelayError::InvalidTransition`]
    /// when it is not in the table.
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), RelayError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(RelayError::InvalidTransition {
                task_id: task_id.to_string(),
                from: *self,
                to: *next,
            })
        }
    }
}

/// Execution mode. Extended ("deep research") tasks get longer timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Regular prompt.
    #[default]
    Normal,
    /// Long-running research prompt.
    Extended,
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Extended => write!(f, "extended"),
        }
    }
}

/// Stable task identifier: group number plus answer address.
///
/// ```
/// use sheetrelay::task::TaskId;
///
/// let id = TaskId::new(2, &"Prompts!C5".parse().unwrap());
/// assert_eq!(id.as_str(), "g2:Prompts!C5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Derives the id for the task writing to `answer` in `group_number`.
    pub fn new(group_number: u32, answer: &CellAddress) -> Self {
        Self(format!("g{group_number}:{answer}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Derived identifier.
    pub id: TaskId,
    /// Owning group.
    pub group_number: u32,
    /// Row in the shared store.
    pub row: u32,
    /// Where the result (and the claim marker) goes.
    pub answer_address: CellAddress,
    /// Input cells, concatenated into the prompt.
    pub source_addresses: Vec<CellAddress>,
    /// Optional cell for a completion note.
    pub log_address: Option<CellAddress>,
    /// Which backend variant runs this task.
    pub worker_type: String,
    /// Timeout class.
    pub mode: TaskMode,
    /// Prompt text assembled from the source cells at discovery time.
    pub prompt: String,
    /// Position among the sub-tasks of a fan-out row (0 for normal rows).
    pub variant: usize,
    status: TaskStatus,
}

impl Task {
    /// Creates a task in the `Discovered` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_number: u32,
        answer_address: CellAddress,
        source_addresses: Vec<CellAddress>,
        log_address: Option<CellAddress>,
        worker_type: impl Into<String>,
        mode: TaskMode,
        prompt: impl Into<String>,
        variant: usize,
    ) -> Self {
        Self {
            id: TaskId::new(group_number, &answer_address),
            group_number,
            row: answer_address.row,
            answer_address,
            source_addresses,
            log_address,
            worker_type: worker_type.into(),
            mode,
            prompt: prompt.into(),
            variant,
            status: TaskStatus::Discovered,
        }
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Moves the task to `next`, enforcing the lifecycle table.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), RelayError> {
        self.status.validate_transition(self.id.as_str(), &next)?;
        tracing::trace!(task_id = %self.id, from = %self.status, to = %next, "task transition");
        self.status = next;
        Ok(())
    }

    /// Moves the task to the terminal failure status matching `err`.
    ///
    /// Timeouts become `TimedOut`, everything else `Failed`. Tasks already in
    /// a terminal status are left alone.
    pub fn fail_with(&mut self, err: &RelayError) {
        if self.status.is_terminal() {
            return;
        }
        let next = if err.is_timeout() && self.status != TaskStatus::Claimed {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        if self.transition(next).is_err() {
            // Discovered tasks cannot fail through the table; they were never claimed.
            self.status = TaskStatus::Failed;
        }
    }
}

/// Joins source cell values into a prompt, skipping blanks.
///
/// ```
/// use sheetrelay::task::join_sources;
///
/// let prompt = join_sources(["  intro ", "", "details"]);
/// assert_eq!(prompt, "intro\n\ndetails");
/// ```
pub fn join_sources<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    values
        .into_iter()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
