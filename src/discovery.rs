//! Finding claimable work and checking group completion.
//!
//! Discovery reads a group's columns with one [`read_range`] per scan,
//! builds tasks in row-major order (fan-out sub-tasks in answer-column
//! order), drops ids the local [`TaskLedger`] already knows about, and
//! confirms each remaining candidate with a fresh
//! [`ClaimManager::status`](crate::claim::ClaimManager::status) read.
//!
//! [`read_range`]: crate::store::SharedStore::read_range

use std::collections::HashSet;

use serde::Serialize;

use crate::claim::{ClaimManager, ClaimState};
use crate::error::Result;
use crate::group::TaskGroup;
use crate::task::{Task, TaskId};

/// Orchestrator-owned record of what this run has already touched.
#[derive(Debug, Clone, Default)]
pub struct TaskLedger {
    in_flight: HashSet<TaskId>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
}

impl TaskLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `id` is in flight, completed, or failed.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.in_flight.contains(id) || self.completed.contains(id) || self.failed.contains(id)
    }

    /// Records that `id` has been claimed and is being worked on.
    pub fn start(&mut self, id: TaskId) {
        self.in_flight.insert(id);
    }

    /// Moves `id` to the completed set.
    pub fn complete(&mut self, id: &TaskId) {
        self.in_flight.remove(id);
        self.completed.insert(id.clone());
    }

    /// Moves `id` to the failed set; it will not be retried this run.
    pub fn fail(&mut self, id: &TaskId) {
        self.in_flight.remove(id);
        self.failed.insert(id.clone());
    }

    /// Returns `true` if `id` failed earlier in this run.
    pub fn is_failed(&self, id: &TaskId) -> bool {
        self.failed.contains(id)
    }

    /// Returns `true` if `id` completed earlier in this run.
    pub fn is_completed(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    /// Number of in-flight ids.
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of completed ids.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Number of failed ids.
    pub fn failed_len(&self) -> usize {
        self.failed.len()
    }
}

/// Per-group cell counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupProgress {
    /// Answer cells ready to be claimed (empty or expired marker).
    pub claimable: usize,
    /// Answer cells holding a fresh marker.
    pub claimed: usize,
    /// Answer cells holding a result.
    pub terminal: usize,
    /// Rows whose sources are all blank.
    pub blank_rows: usize,
}

impl GroupProgress {
    /// Answer cells that still need work.
    pub fn outstanding(&self) -> usize {
        self.claimable + self.claimed
    }
}

/// Scans groups for work.
#[derive(Debug, Clone)]
pub struct DiscoveryEngine {
    claims: ClaimManager,
}

impl DiscoveryEngine {
    /// Creates an engine that classifies cells through `claims`.
    pub fn new(claims: ClaimManager) -> Self {
        Self { claims }
    }

    /// The next claimable task, if any.
    pub async fn find_next(&self, group: &TaskGroup, ledger: &TaskLedger) -> Result<Option<Task>> {
        Ok(self.find_batch(group, ledger, 1).await?.into_iter().next())
    }

    /// Up to `limit` claimable tasks in row-major order.
    pub async fn find_batch(
        &self,
        group: &TaskGroup,
        ledger: &TaskLedger,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }
        let range = group.scan_range();
        let block = self.claims.store().read_range(&range).await?;

        for row in group.rows() {
            let view = group.view_row(&range, row, &block);
            if view.is_blank() {
                continue;
            }
            for (task, cached) in group.tasks_for_row(row, &view.sources).into_iter().zip(&view.answers) {
                if ledger.contains(&task.id) {
                    continue;
                }
                // Results never go back to empty; skip the fresh read.
                if self.claims.classify(cached, task.mode).claim_state() == ClaimState::Terminal {
                    continue;
                }
                if self.claims.status(&task).await? != ClaimState::Claimable {
                    continue;
                }
                found.push(task);
                if found.len() == limit {
                    tracing::debug!(group = group.number(), found = found.len(), "batch discovered");
                    return Ok(found);
                }
            }
        }
        tracing::debug!(group = group.number(), found = found.len(), "scan finished");
        Ok(found)
    }

    /// Ids of answer cells that are not yet terminal, for rows with a
    /// non-blank source.
    pub async fn outstanding(&self, group: &TaskGroup) -> Result<Vec<TaskId>> {
        let range = group.scan_range();
        let block = self.claims.store().read_range(&range).await?;
        let mut outstanding = Vec::new();
        for row in group.rows() {
            let view = group.view_row(&range, row, &block);
            if view.is_blank() {
                continue;
            }
            for (index, value) in view.answers.iter().enumerate() {
                if self.claims.classify(value, group.mode()).claim_state() != ClaimState::Terminal {
                    outstanding.push(TaskId::new(group.number(), &group.answer_address(index, row)));
                }
            }
        }
        Ok(outstanding)
    }

    /// Returns `true` if every answer cell of every non-blank row is terminal.
    pub async fn is_group_complete(&self, group: &TaskGroup) -> Result<bool> {
        let outstanding = self.outstanding(group).await?;
        tracing::debug!(group = group.number(), outstanding = outstanding.len(), "completion check");
        Ok(outstanding.is_empty())
    }

    /// Counts cells by claim state.
    pub async fn group_progress(&self, group: &TaskGroup) -> Result<GroupProgress> {
        let range = group.scan_range();
        let block = self.claims.store().read_range(&range).await?;
        let mut progress = GroupProgress::default();
        for row in group.rows() {
            let view = group.view_row(&range, row, &block);
            if view.is_blank() {
                progress.blank_rows += 1;
                continue;
            }
            for value in &view.answers {
                match self.claims.classify(value, group.mode()).claim_state() {
                    ClaimState::Claimable => progress.claimable += 1,
                    ClaimState::Claimed => progress.claimed += 1,
                    ClaimState::Terminal => progress.terminal += 1,
                }
            }
        }
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{format_marker, ManualClock};
    use crate::config::{GroupConfig, GroupKind};
    use crate::store::InMemoryStore;
    use crate::task::TaskMode;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn group(kind: GroupKind) -> TaskGroup {
        let answers: Vec<String> = match kind {
            GroupKind::Normal => vec!["C".into()],
            GroupKind::FanOut3 => vec!["C".into(), "D".into(), "E".into()],
        };
        TaskGroup::from_config(&GroupConfig {
            number: 1,
            sheet: None,
            source_columns: vec!["B".into()],
            worker_types: vec!["w".into(); answers.len()],
            answer_columns: answers,
            log_column: None,
            first_row: 5,
            last_row: 8,
            kind,
            mode: TaskMode::Normal,
        })
        .unwrap()
    }

    fn engine(store: Arc<InMemoryStore>) -> DiscoveryEngine {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        DiscoveryEngine::new(
            ClaimManager::new(store, "__CLAIMED__").with_clock(Arc::new(ManualClock::new(now))),
        )
    }

    #[tokio::test]
    async fn batch_is_row_major_and_skips_blank_and_done_rows() {
        let store = Arc::new(
            InMemoryStore::with_cells([
                ("B5", "p5"),
                ("C5", "done"),
                ("B6", "p6"),
                ("B7", "  "),
                ("B8", "p8"),
            ])
            .unwrap(),
        );
        let engine = engine(store);
        let batch = engine.find_batch(&group(GroupKind::Normal), &TaskLedger::new(), 3).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["g1:C6", "g1:C8"]);
        assert_eq!(batch[0].prompt, "p6");
    }

    #[tokio::test]
    async fn ledger_ids_are_skipped() {
        let store = Arc::new(InMemoryStore::with_cells([("B5", "p5"), ("B6", "p6")]).unwrap());
        let engine = engine(store);
        let group = group(GroupKind::Normal);
        let mut ledger = TaskLedger::new();
        let first = engine.find_next(&group, &ledger).await.unwrap().unwrap();
        ledger.start(first.id.clone());
        let second = engine.find_next(&group, &ledger).await.unwrap().unwrap();
        assert_eq!(second.id.as_str(), "g1:C6");
        ledger.start(second.id.clone());
        assert_eq!(ledger.in_flight_len(), 2);

        ledger.fail(&second.id);
        ledger.complete(&first.id);
        assert_eq!(ledger.in_flight_len(), 0);
        assert_eq!((ledger.completed_len(), ledger.failed_len()), (1, 1));
        assert!(ledger.is_completed(&first.id) && !ledger.is_failed(&first.id));
        assert!(ledger.is_failed(&second.id) && ledger.contains(&second.id));
        assert!(engine.find_next(&group, &ledger).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_markers_hide_tasks_and_block_completion() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let store = Arc::new(InMemoryStore::with_cells([("B5", "p5"), ("C5", "")]).unwrap());
        store.set(&"C5".parse().unwrap(), &format_marker("__CLAIMED__", now));
        let engine = engine(store.clone());
        let group = group(GroupKind::Normal);
        assert!(engine.find_next(&group, &TaskLedger::new()).await.unwrap().is_none());
        assert!(!engine.is_group_complete(&group).await.unwrap());

        store.set(&"C5".parse().unwrap(), "answer");
        assert!(engine.is_group_complete(&group).await.unwrap());
    }

    #[tokio::test]
    async fn fan_out_limit_cuts_mid_row() {
        let store = Arc::new(InMemoryStore::with_cells([("B5", "p5"), ("D5", "x"), ("B6", "p6")]).unwrap());
        let engine = engine(store);
        let batch = engine.find_batch(&group(GroupKind::FanOut3), &TaskLedger::new(), 3).await.unwrap();
        let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["g1:C5", "g1:E5", "g1:C6"]);
    }

    #[tokio::test]
    async fn progress_counts_every_state() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let store = Arc::new(
            InMemoryStore::with_cells([("B5", "p5"), ("C5", "done"), ("B6", "p6"), ("B8", "p8")]).unwrap(),
        );
        store.set(&"C6".parse().unwrap(), &format_marker("__CLAIMED__", now));
        let progress = engine(store).group_progress(&group(GroupKind::Normal)).await.unwrap();
        assert_eq!(
            progress,
            GroupProgress {
                claimable: 1,
                claimed: 1,
                terminal: 1,
                blank_rows: 1,
            }
        );
        assert_eq!(progress.outstanding(), 2);
    }

    #[tokio::test]
    async fn empty_group_is_complete() {
        let engine = engine(Arc::new(InMemoryStore::new()));
        assert!(engine.is_group_complete(&group(GroupKind::Normal)).await.unwrap());
    }
}
