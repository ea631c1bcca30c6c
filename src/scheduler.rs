//! Group scheduler: sequences groups, batches work, and records the run.
//!
//! # Architecture
//!
//! The [`Orchestrator`] walks groups in ascending number. Each group runs a
//! small state machine:
//!
//! ```text
//! GroupActive         -> Draining | Halted
//! Draining            -> GroupActive | VerifyingCompletion | Halted
//! VerifyingCompletion -> GroupDone | GroupActive | Halted
//! ```
//!
//! `GroupActive` discovers, claims, and dispatches batches until discovery
//! comes back empty. `Draining` polls a few more times, then
//! `VerifyingCompletion` re-scans the whole group: complete means
//! `GroupDone`; outstanding cells claimed elsewhere send it back to
//! `GroupActive`; outstanding cells that this run already failed or
//! completed mean `Halted`.
//! Under fail-fast a single task failure halts the group directly. A
//! dispatch whose session went stale is resent once on a recreated session
//! in the same slot before it counts as failed.
//!
//! `GroupDone` advances to the next group; `Halted` stops the run. Group
//! *g+1* never starts while group *g* has a non-terminal answer cell.
//!
//! Everything runs on the caller's task. A batch's dispatches are futures
//! joined with [`join_all`], their starts staggered; the apparent
//! concurrency comes from the external worker sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::claim::{Clock, ClaimManager, ClaimState, ClaimTicket, TimeoutPolicy};
use crate::config::{DrainSettings, FailurePolicy, RunConfig, Settings, Timeouts};
use crate::discovery::{DiscoveryEngine, TaskLedger};
use crate::error::{RelayError, Result};
use crate::group::TaskGroup;
use crate::messaging::Messenger;
use crate::retry::sleep_or_cancel;
use crate::store::{RetryingStore, SharedStore};
use crate::task::{Task, TaskStatus};
use crate::worker::{DriverRegistry, SlotOutcome, WorkerPool, WorkerRequest};

/// Per-group scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Discovering, claiming, and dispatching batches.
    GroupActive,
    /// No claimable work found; polling until quiet.
    Draining,
    /// Re-scanning the whole group.
    VerifyingCompletion,
    /// Every answer cell is terminal.
    GroupDone,
    /// The group stopped early; the run does not advance.
    Halted,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupActive => write!(f, "group_active"),
            Self::Draining => write!(f, "draining"),
            Self::VerifyingCompletion => write!(f, "verifying_completion"),
            Self::GroupDone => write!(f, "group_done"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

impl SchedulerState {
    /// Returns `true` for `GroupDone` and `Halted`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::GroupDone | Self::Halted)
    }

    /// Checks the transition table.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        use SchedulerState::*;
        matches!(
            (self, next),
            (GroupActive, Draining | Halted)
                | (Draining, GroupActive | VerifyingCompletion | Halted)
                | (VerifyingCompletion, GroupDone | GroupActive | Halted)
        )
    }
}

struct GroupMachine {
    group: u32,
    state: SchedulerState,
}

impl GroupMachine {
    fn new(group: u32) -> Self {
        Self {
            group,
            state: SchedulerState::GroupActive,
        }
    }

    fn advance(&mut self, next: SchedulerState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "invalid scheduler transition {} -> {}",
            self.state,
            next
        );
        tracing::info!(group = self.group, from = %self.state, to = %next, "group state");
        self.state = next;
    }
}

/// One failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    /// Task id.
    pub task_id: String,
    /// Owning group.
    pub group_number: u32,
    /// Short error class, see [`RelayError::error_class`].
    pub error_class: String,
    /// Human-readable error.
    pub message: String,
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Ids of tasks whose results were written and verified.
    pub completed: Vec<String>,
    /// Tasks that failed, in the order they were recorded.
    pub failures: Vec<FailureRecord>,
    /// Groups that reached `GroupDone`.
    pub groups_finished: Vec<u32>,
    /// Group that halted the run, if any.
    pub halted_group: Option<u32>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

impl RunReport {
    /// Returns `true` if every group finished without failures.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.halted_group.is_none() && !self.cancelled
    }
}

/// Drives groups from discovery to verified results.
pub struct Orchestrator {
    groups: Vec<TaskGroup>,
    claims: ClaimManager,
    discovery: DiscoveryEngine,
    pool: WorkerPool,
    messenger: Messenger,
    settings: Settings,
    timeouts: Timeouts,
    drain: DrainSettings,
    cancel: CancellationToken,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("groups", &self.groups.iter().map(TaskGroup::number).collect::<Vec<_>>())
            .field("pool", &self.pool)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds an orchestrator for `config` over `store`.
    ///
    /// The store is wrapped in a [`RetryingStore`] using `retry.store`.
    ///
    /// # Errors
    ///
    /// Configuration errors, and [`RelayError::UnknownWorkerType`] if a
    /// group uses a worker type missing from `registry`.
    pub fn from_config(
        config: &RunConfig,
        store: Arc<dyn SharedStore>,
        registry: DriverRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let groups = config
            .ordered_groups()
            .into_iter()
            .map(TaskGroup::from_config)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for group in &groups {
            for worker_type in group.worker_types() {
                if !registry.contains(worker_type) {
                    return Err(RelayError::UnknownWorkerType(worker_type.clone()));
                }
            }
        }

        let store: Arc<dyn SharedStore> = Arc::new(RetryingStore::new(store, config.retry.store.clone()));
        let claims = ClaimManager::new(store, config.settings.sentinel.clone())
            .with_timeouts(TimeoutPolicy::from(&config.timeouts));
        let pool = WorkerPool::new(config.settings.slot_count, registry, config.pool.clone())
            .close_immediately(config.settings.close_immediately);

        Ok(Self {
            groups,
            discovery: DiscoveryEngine::new(claims.clone()),
            claims,
            pool,
            messenger: Messenger::new(config.retry.messaging.clone()),
            settings: config.settings.clone(),
            timeouts: config.timeouts.clone(),
            drain: config.drain.clone(),
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the clock used for markers and log notes.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.claims = self.claims.with_clock(clock);
        self.discovery = DiscoveryEngine::new(self.claims.clone());
        self
    }

    /// Uses `cancel` to stop the run at the next group or batch boundary.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next group or batch boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Groups this run will process, in order.
    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    /// The claim manager.
    pub fn claims(&self) -> &ClaimManager {
        &self.claims
    }

    /// The discovery engine.
    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    /// Processes every group until all are done or one halts.
    ///
    /// # Errors
    ///
    /// Store failures outside a single task (discovery scans, completion
    /// checks) abort the run. Task-level failures are recorded in the
    /// report instead.
    pub async fn run(&self) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut ledger = TaskLedger::new();

        for group in &self.groups {
            tracing::info!(group = group.number(), rows = ?group.rows(), kind = ?group.kind(), "group started");
            let outcome = self.run_group(group, &mut ledger, &mut report).await;
            self.pool.shutdown().await;
            match outcome? {
                SchedulerState::GroupDone => {
                    tracing::info!(group = group.number(), "group done");
                    report.groups_finished.push(group.number());
                }
                state => {
                    tracing::error!(group = group.number(), %state, failures = report.failures.len(), "run halted");
                    report.halted_group = Some(group.number());
                    break;
                }
            }
        }

        tracing::info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            groups_finished = report.groups_finished.len(),
            "run finished"
        );
        Ok(report)
    }

    async fn run_group(
        &self,
        group: &TaskGroup,
        ledger: &mut TaskLedger,
        report: &mut RunReport,
    ) -> Result<SchedulerState> {
        let mut machine = GroupMachine::new(group.number());
        let mut empty_polls = 0;
        let mut drain_started = Instant::now();

        loop {
            match machine.state {
                SchedulerState::GroupActive => {
                    if self.cancel.is_cancelled() {
                        report.cancelled = true;
                        machine.advance(SchedulerState::Halted);
                        continue;
                    }
                    let batch = self
                        .discovery
                        .find_batch(group, ledger, self.settings.batch_size)
                        .await?;
                    if batch.is_empty() {
                        empty_polls = 0;
                        drain_started = Instant::now();
                        machine.advance(SchedulerState::Draining);
                        continue;
                    }
                    let failed = self.run_batch(group, batch, ledger, report).await;
                    if failed && self.settings.failure_policy == FailurePolicy::FailFast {
                        machine.advance(SchedulerState::Halted);
                    }
                }
                SchedulerState::Draining => {
                    if !sleep_or_cancel(self.drain.poll_interval(), Some(&self.cancel)).await {
                        report.cancelled = true;
                        machine.advance(SchedulerState::Halted);
                        continue;
                    }
                    if self.discovery.find_next(group, ledger).await?.is_some() {
                        machine.advance(SchedulerState::GroupActive);
                        continue;
                    }
                    empty_polls += 1;
                    if empty_polls >= self.drain.empty_attempts
                        || drain_started.elapsed() >= self.drain.timeout()
                    {
                        machine.advance(SchedulerState::VerifyingCompletion);
                    }
                }
                SchedulerState::VerifyingCompletion => {
                    let outstanding = self.discovery.outstanding(group).await?;
                    if outstanding.is_empty() {
                        machine.advance(SchedulerState::GroupDone);
                    } else if outstanding
                        .iter()
                        .all(|id| ledger.is_failed(id) || ledger.is_completed(id))
                    {
                        tracing::warn!(
                            group = group.number(),
                            outstanding = outstanding.len(),
                            failed = ledger.failed_len(),
                            "only cells this run already handled remain"
                        );
                        machine.advance(SchedulerState::Halted);
                    } else {
                        tracing::info!(
                            group = group.number(),
                            outstanding = outstanding.len(),
                            "group incomplete, waiting for other claimants"
                        );
                        if sleep_or_cancel(self.drain.verify_retry(), Some(&self.cancel)).await {
                            machine.advance(SchedulerState::GroupActive);
                        } else {
                            report.cancelled = true;
                            machine.advance(SchedulerState::Halted);
                        }
                    }
                }
                SchedulerState::GroupDone | SchedulerState::Halted => return Ok(machine.state),
            }
        }
    }

    /// Claims and dispatches one batch. Returns `true` if any task failed.
    async fn run_batch(
        &self,
        group: &TaskGroup,
        candidates: Vec<Task>,
        ledger: &mut TaskLedger,
        report: &mut RunReport,
    ) -> bool {
        let mut any_failed = false;
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut task in candidates {
            match self.claims.try_claim(&task).await {
                Ok(ticket) => match task.transition(TaskStatus::Claimed) {
                    Ok(()) => {
                        ledger.start(task.id.clone());
                        claimed.push((task, ticket));
                    }
                    Err(e) => {
                        self.clear_marker(&task).await;
                        record_failure(group, &mut task, &e, ledger, report);
                        any_failed = true;
                    }
                },
                Err(e) if !e.is_terminal_for_task() => {
                    tracing::debug!(task_id = %task.id, error = %e, "claim skipped");
                }
                Err(e) => {
                    self.clear_marker(&task).await;
                    record_failure(group, &mut task, &e, ledger, report);
                    any_failed = true;
                }
            }
        }

        let stagger = Duration::from_millis(self.settings.stagger_ms);
        let dispatches = claimed
            .into_iter()
            .enumerate()
            .map(|(position, (task, ticket))| self.dispatch(position, stagger, task, ticket));

        for (mut task, outcome) in join_all(dispatches).await {
            match outcome {
                Ok(()) => {
                    tracing::info!(task_id = %task.id, worker_type = %task.worker_type, "task completed");
                    ledger.complete(&task.id);
                    report.completed.push(task.id.to_string());
                }
                Err(e) => {
                    record_failure(group, &mut task, &e, ledger, report);
                    any_failed = true;
                }
            }
        }
        any_failed
    }

    async fn dispatch(
        &self,
        position: usize,
        stagger: Duration,
        mut task: Task,
        ticket: ClaimTicket,
    ) -> (Task, Result<()>) {
        if position > 0 {
            tokio::time::sleep(stagger.saturating_mul(position as u32)).await;
        }
        let outcome = self.execute(position, &mut task, &ticket).await;
        match &outcome {
            Ok(()) => {
                if let Err(e) = task.transition(TaskStatus::Completed) {
                    tracing::warn!(task_id = %task.id, error = %e, "unexpected status after write");
                }
            }
            Err(e) => {
                task.fail_with(e);
                self.clear_marker(&task).await;
            }
        }
        (task, outcome)
    }

    /// Runs one task on a leased slot.
    ///
    /// A send that ends stale gets one more try on a freshly created
    /// session in the same slot before the failure reaches the caller.
    async fn execute(&self, position: usize, task: &mut Task, ticket: &ClaimTicket) -> Result<()> {
        let preferred = position % self.pool.slot_count();
        let mut lease = self.pool.acquire(&task.worker_type, preferred, &task.id).await?;

        let request = WorkerRequest::from(&*task);
        let timeout = self.timeouts.dispatch_timeout(task.mode);
        let sent = match task
            .transition(TaskStatus::Dispatched)
            .and_then(|()| task.transition(TaskStatus::Executing))
        {
            Ok(()) => self.messenger.send(&lease, &request, timeout).await,
            Err(e) => Err(e),
        };

        let sent = match sent {
            Err(RelayError::StaleWorker { slot, message }) => {
                tracing::warn!(task_id = %task.id, slot, error = %message, "session stale, recreating slot");
                self.pool.release(lease, SlotOutcome::Stale).await;
                lease = self.pool.acquire(&task.worker_type, slot, &task.id).await?;
                self.messenger.send(&lease, &request, timeout).await
            }
            other => other,
        };

        let result = match sent {
            Ok(response) => self.write_result(task, ticket, response.payload.trim()).await,
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Err(e) if e.poisons_slot() => SlotOutcome::Stale,
            _ => SlotOutcome::Healthy,
        };
        self.pool.release(lease, outcome).await;
        result
    }

    /// Writes `payload` over the marker, verifies it, and adds the log note.
    async fn write_result(&self, task: &Task, ticket: &ClaimTicket, payload: &str) -> Result<()> {
        let store = self.claims.store();
        let address = &task.answer_address;

        // A result that reads as a marker would never classify as terminal.
        if payload.starts_with(self.claims.sentinel()) {
            return Err(RelayError::WorkerRejected {
                task_id: task.id.to_string(),
                message: "result starts with the claim sentinel".to_string(),
            });
        }

        let current = store.read_cell(address).await?;
        if current != ticket.marker
            && self.claims.classify(&current, task.mode).claim_state() == ClaimState::Terminal
        {
            tracing::warn!(task_id = %task.id, %address, "answer cell already holds a result, keeping it");
            return Ok(());
        }

        store.write_cell(address, payload).await?;
        let written = store.read_cell(address).await?;
        if written.trim() != payload {
            return Err(RelayError::WriteVerificationFailure {
                task_id: task.id.to_string(),
                address: address.to_string(),
            });
        }

        if let Some(log) = &task.log_address {
            let note = format!(
                "{} {}",
                task.worker_type,
                self.claims.clock().now().to_rfc3339_opts(SecondsFormat::Secs, true)
            );
            if let Err(e) = store.write_cell(log, &note).await {
                tracing::warn!(task_id = %task.id, address = %log, error = %e, "failed to write log note");
            }
        }
        Ok(())
    }

    async fn clear_marker(&self, task: &Task) {
        if let Err(e) = self.claims.release(task).await {
            tracing::warn!(task_id = %task.id, error = %e, "failed to clear claim marker");
        }
    }
}

fn record_failure(
    group: &TaskGroup,
    task: &mut Task,
    err: &RelayError,
    ledger: &mut TaskLedger,
    report: &mut RunReport,
) {
    task.fail_with(err);
    ledger.fail(&task.id);
    tracing::error!(
        task_id = %task.id,
        group = group.number(),
        error_class = err.error_class(),
        status = %task.status(),
        error = %err,
        "task failed"
    );
    report.failures.push(FailureRecord {
        task_id: task.id.to_string(),
        group_number: group.number(),
        error_class: err.error_class().to_string(),
        message: err.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::worker::{DriverError, ScriptedDriver, ScriptedReply};

    #[test]
    fn transition_table() {
        use SchedulerState::*;
        let all = [GroupActive, Draining, VerifyingCompletion, GroupDone, Halted];
        let allowed = [
            (GroupActive, Draining),
            (GroupActive, Halted),
            (Draining, GroupActive),
            (Draining, VerifyingCompletion),
            (Draining, Halted),
            (VerifyingCompletion, GroupDone),
            (VerifyingCompletion, GroupActive),
            (VerifyingCompletion, Halted),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(&to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
        assert!(GroupDone.is_terminal());
        assert!(Halted.is_terminal());
        assert!(!Draining.is_terminal());
    }

    fn config(policy: &str) -> RunConfig {
        RunConfig::from_toml(&format!(
            r#"
[settings]
failure_policy = "{policy}"

[[group]]
number = 1
source_columns = ["B"]
answer_columns = ["C"]
worker_types = ["w"]
log_column = "D"
first_row = 1
last_row = 3
"#
        ))
        .unwrap()
    }

    fn orchestrator(config: &RunConfig, store: Arc<InMemoryStore>, driver: ScriptedDriver) -> Orchestrator {
        let mut registry = DriverRegistry::new();
        registry.register("w", Arc::new(driver));
        Orchestrator::from_config(config, store, registry).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_fills_every_row_and_log() {
        let store = Arc::new(InMemoryStore::with_cells([("B1", "a"), ("B2", "b"), ("B3", "c")]).unwrap());
        let report = orchestrator(&config("fail_fast"), store.clone(), ScriptedDriver::new())
            .run()
            .await
            .unwrap();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.completed, vec!["g1:C1", "g1:C2", "g1:C3"]);
        assert_eq!(report.groups_finished, vec![1]);
        assert_eq!(store.get(&"C2".parse().unwrap()), "w: b");
        assert!(store.get(&"D2".parse().unwrap()).starts_with("w "));
    }

    #[tokio::test(start_paused = true)]
    async fn continue_group_processes_remaining_rows_then_halts() {
        let store = Arc::new(InMemoryStore::with_cells([("B1", "a"), ("B2", "b"), ("B3", "c")]).unwrap());
        let driver = ScriptedDriver::new()
            .on_prompt("a", [ScriptedReply::Error(DriverError::Closed("gone".into()))]);
        let report = orchestrator(&config("continue_group"), store.clone(), driver)
            .run()
            .await
            .unwrap();
        assert_eq!(report.completed, vec!["g1:C2", "g1:C3"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error_class, "non_recoverable");
        assert_eq!(report.halted_group, Some(1));
        assert_eq!(store.get(&"C1".parse().unwrap()), "");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_start_halts_without_claims() {
        let store = Arc::new(InMemoryStore::with_cells([("B1", "a")]).unwrap());
        let orchestrator = orchestrator(&config("fail_fast"), store.clone(), ScriptedDriver::new());
        orchestrator.cancellation_token().cancel();
        let report = orchestrator.run().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.halted_group, Some(1));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn unregistered_worker_types_are_rejected() {
        let err = Orchestrator::from_config(
            &config("fail_fast"),
            Arc::new(InMemoryStore::new()),
            DriverRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::UnknownWorkerType(t) if t == "w"));
    }
}
