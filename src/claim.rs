//! Optimistic claim protocol over the shared store.
//!
//! # Architecture
//!
//! The shared store has no compare-and-swap, so a claim is a timestamped
//! marker written into the task's answer cell:
//!
//! ```text
//! __CLAIMED__
//! 2026-03-01T09:30:00.123456Z
//! ```
//!
//! Every answer cell is in one of three states:
//!
//! | Cell value (trimmed)                    | State       |
//! |-----------------------------------------|-------------|
//! | empty                                   | `Claimable` |
//! | sentinel-prefixed, younger than timeout | `Claimed`   |
//! | sentinel-prefixed, older than timeout   | `Claimable` |
//! | sentinel-prefixed, unparseable time     | `Claimable` |
//! | anything else                           | `Terminal`  |
//!
//! [`ClaimManager::try_claim`] re-reads the cell immediately before writing
//! and reads it back afterwards; the claim only holds if the read-back still
//! shows the exact marker text written. Two claimants that interleave their
//! writes both see the later marker, so at most one of them succeeds. The
//! protocol is best-effort: rare duplicate work is tolerated, corrupted
//! results are not.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::address::CellAddress;
use crate::config::Timeouts;
use crate::error::{RelayError, Result};
use crate::group::TaskGroup;
use crate::store::SharedStore;
use crate::task::{Task, TaskId, TaskMode};

/// Claim state of an answer cell, as seen by a fresh read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    /// Empty, or holding an expired marker.
    Claimable,
    /// Holding a fresh marker.
    Claimed,
    /// Holding a result.
    Terminal,
}

impl fmt::Display for ClaimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claimable => write!(f, "claimable"),
            Self::Claimed => write!(f, "claimed"),
            Self::Terminal => write!(f, "terminal"),
        }
    }
}

/// Finer-grained classification of a cell value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellClass {
    /// Empty after trimming.
    Empty,
    /// A marker younger than the timeout (or dated in the future).
    FreshMarker,
    /// A marker older than the timeout.
    ExpiredMarker,
    /// A marker whose timestamp does not parse.
    CorruptMarker,
    /// A result.
    Terminal,
}

impl CellClass {
    /// Collapses the class into the three-way claim state.
    pub fn claim_state(self) -> ClaimState {
        match self {
            Self::Empty | Self::ExpiredMarker | Self::CorruptMarker => ClaimState::Claimable,
            Self::FreshMarker => ClaimState::Claimed,
            Self::Terminal => ClaimState::Terminal,
        }
    }

    /// Returns `true` for any sentinel-prefixed value.
    pub fn is_marker(self) -> bool {
        matches!(self, Self::FreshMarker | Self::ExpiredMarker | Self::CorruptMarker)
    }
}

/// Formats the marker text for `sentinel` at `at`.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use sheetrelay::claim::format_marker;
///
/// let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
/// assert_eq!(format_marker("__CLAIMED__", at), "__CLAIMED__\n2026-03-01T09:30:00.000000Z");
/// ```
pub fn format_marker(sentinel: &str, at: DateTime<Utc>) -> String {
    format!("{sentinel}\n{}", at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Extracts the marker timestamp, if `value` is a marker with a valid one.
///
/// Returns `None` for non-markers and for markers whose timestamp is missing
/// or malformed.
pub fn parse_marker(value: &str, sentinel: &str) -> Option<DateTime<Utc>> {
    let rest = value.trim().strip_prefix(sentinel)?;
    DateTime::parse_from_rfc3339(rest.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Classifies a raw cell value against `now` and `timeout`.
pub fn classify(value: &str, sentinel: &str, now: DateTime<Utc>, timeout: Duration) -> CellClass {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return CellClass::Empty;
    }
    if !trimmed.starts_with(sentinel) {
        return CellClass::Terminal;
    }
    let Some(claimed_at) = parse_marker(trimmed, sentinel) else {
        return CellClass::CorruptMarker;
    };
    // Negative ages (clock skew) count as fresh.
    match (now - claimed_at).to_std() {
        Ok(age) if age > timeout => CellClass::ExpiredMarker,
        _ => CellClass::FreshMarker,
    }
}

/// How long a marker protects a task, per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Marker lifetime for normal tasks.
    pub normal: Duration,
    /// Marker lifetime for extended tasks.
    pub extended: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            normal: Duration::from_secs(10 * 60),
            extended: Duration::from_secs(40 * 60),
        }
    }
}

impl TimeoutPolicy {
    /// Marker lifetime for `mode`.
    pub fn for_mode(&self, mode: TaskMode) -> Duration {
        match mode {
            TaskMode::Normal => self.normal,
            TaskMode::Extended => self.extended,
        }
    }
}

impl From<&Timeouts> for TimeoutPolicy {
    fn from(timeouts: &Timeouts) -> Self {
        Self {
            normal: timeouts.claim_timeout(TaskMode::Normal),
            extended: timeouts.claim_timeout(TaskMode::Extended),
        }
    }
}

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations.
///
/// With a non-zero tick every call to [`now`](Clock::now) advances the clock,
/// so consecutive markers never share a timestamp.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    tick: chrono::Duration,
}

impl ManualClock {
    /// A frozen clock reading `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            tick: chrono::Duration::zero(),
        }
    }

    /// A clock reading `start` that advances by `tick` after every read.
    pub fn ticking(start: DateTime<Utc>, tick: Duration) -> Self {
        Self {
            now: Mutex::new(start),
            tick: chrono::Duration::from_std(tick).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }

    /// Sets the current time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(by) = chrono::Duration::from_std(by) {
            *self.now.lock() += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock();
        let current = *now;
        *now += self.tick;
        current
    }
}

/// Proof of a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimTicket {
    /// The claimed task.
    pub task_id: TaskId,
    /// The answer cell holding the marker.
    pub address: CellAddress,
    /// Exact marker text written.
    pub marker: String,
    /// Timestamp embedded in the marker.
    pub claimed_at: DateTime<Utc>,
}

/// Reads, classifies, claims, and releases answer cells.
#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn SharedStore>,
    sentinel: String,
    timeouts: TimeoutPolicy,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ClaimManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimManager")
            .field("sentinel", &self.sentinel)
            .field("timeouts", &self.timeouts)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl ClaimManager {
    /// Creates a manager with default timeouts and the system clock.
    pub fn new(store: Arc<dyn SharedStore>, sentinel: impl Into<String>) -> Self {
        Self {
            store,
            sentinel: sentinel.into(),
            timeouts: TimeoutPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the timeout policy.
    pub fn with_timeouts(mut self, timeouts: TimeoutPolicy) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Replaces the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// The marker sentinel.
    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }

    /// The timeout policy.
    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    /// The clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Classifies `value` for a task of `mode` at the current time.
    pub fn classify(&self, value: &str, mode: TaskMode) -> CellClass {
        let class = classify(
            value,
            &self.sentinel,
            self.clock.now(),
            self.timeouts.for_mode(mode),
        );
        if class == CellClass::CorruptMarker {
            tracing::warn!(value = %value.trim(), "claim marker has an unparseable timestamp, treating as expired");
        }
        class
    }

    /// Freshly reads the task's answer cell and classifies it.
    pub async fn status(&self, task: &Task) -> Result<ClaimState> {
        let value = self.store.read_cell(&task.answer_address).await?;
        let state = self.classify(&value, task.mode).claim_state();
        tracing::debug!(task_id = %task.id, %state, "claim status");
        Ok(state)
    }

    /// Claims `task` by writing a fresh marker into its answer cell.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ClaimConflict`] if the cell is freshly claimed or
    /// terminal before the write, or if the read-back after the write shows a
    /// different value. Store failures are propagated.
    pub async fn try_claim(&self, task: &Task) -> Result<ClaimTicket> {
        let address = &task.answer_address;
        let current = self.store.read_cell(address).await?;
        let state = self.classify(&current, task.mode).claim_state();
        if state != ClaimState::Claimable {
            tracing::debug!(task_id = %task.id, %state, "claim refused");
            return Err(RelayError::ClaimConflict {
                task_id: task.id.to_string(),
                state,
            });
        }

        let claimed_at = self.clock.now();
        let marker = format_marker(&self.sentinel, claimed_at);
        self.store.write_cell(address, &marker).await?;

        let read_back = self.store.read_cell(address).await?;
        if read_back != marker {
            let state = match self.classify(&read_back, task.mode).claim_state() {
                ClaimState::Terminal => ClaimState::Terminal,
                _ => ClaimState::Claimed,
            };
            tracing::warn!(task_id = %task.id, %state, "lost claim race on read-back");
            return Err(RelayError::ClaimConflict {
                task_id: task.id.to_string(),
                state,
            });
        }

        tracing::debug!(task_id = %task.id, %address, "claimed");
        Ok(ClaimTicket {
            task_id: task.id.clone(),
            address: address.clone(),
            marker,
            claimed_at,
        })
    }

    /// Clears the task's marker, if the cell still holds one.
    ///
    /// Terminal values are never touched. Returns whether a marker was
    /// cleared.
    pub async fn release(&self, task: &Task) -> Result<bool> {
        self.clear_marker(&task.answer_address).await
    }

    async fn clear_marker(&self, address: &CellAddress) -> Result<bool> {
        let current = self.store.read_cell(address).await?;
        if !current.trim().starts_with(self.sentinel.as_str()) {
            return Ok(false);
        }
        self.store.write_cell(address, "").await?;
        tracing::debug!(%address, "marker released");
        Ok(true)
    }

    /// Clears every expired or corrupt marker in `group`'s answer cells.
    ///
    /// Fresh markers and results are left alone. Returns the cleared cells.
    pub async fn unlock_expired(&self, group: &TaskGroup) -> Result<Vec<CellAddress>> {
        let mut cleared = Vec::new();
        for (index, range) in group.answer_ranges().into_iter().enumerate() {
            let block = self.store.read_range(&range).await?;
            for (offset, row) in block.iter().enumerate() {
                let value = row.first().map(String::as_str).unwrap_or_default();
                let class = self.classify(value, group.mode());
                if !matches!(class, CellClass::ExpiredMarker | CellClass::CorruptMarker) {
                    continue;
                }
                let address = group.answer_address(index, range.start_row + offset as u32);
                // Re-check right before clearing; the marker may have been renewed.
                let current = self.store.read_cell(&address).await?;
                if matches!(
                    self.classify(&current, group.mode()),
                    CellClass::ExpiredMarker | CellClass::CorruptMarker
                ) && self.clear_marker(&address).await?
                {
                    cleared.push(address);
                }
            }
        }
        tracing::info!(group = group.number(), cleared = cleared.len(), "unlocked expired markers");
        Ok(cleared)
    }
}
