//! Task groups: immutable row ranges with a fixed column layout.

use std::ops::RangeInclusive;

use crate::address::{column_index, CellAddress, CellRange};
use crate::config::{ConfigError, GroupConfig, GroupKind};
use crate::task::{join_sources, Task, TaskMode};

/// A validated group with resolved column indices.
///
/// Fields are private; a group never changes after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGroup {
    number: u32,
    sheet: Option<String>,
    source_columns: Vec<u32>,
    answer_columns: Vec<u32>,
    worker_types: Vec<String>,
    log_column: Option<u32>,
    first_row: u32,
    last_row: u32,
    kind: GroupKind,
    mode: TaskMode,
}

impl TaskGroup {
    /// Validates `config` and resolves its column names.
    pub fn from_config(config: &GroupConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let resolve = |name: &String| {
            column_index(name).map_err(|e| ConfigError::Validation {
                message: format!("group {}: {e}", config.number),
            })
        };
        Ok(Self {
            number: config.number,
            sheet: config.sheet.clone(),
            source_columns: config.source_columns.iter().map(resolve).collect::<Result<_, _>>()?,
            answer_columns: config.answer_columns.iter().map(resolve).collect::<Result<_, _>>()?,
            worker_types: config.worker_types.clone(),
            log_column: config.log_column.as_ref().map(resolve).transpose()?,
            first_row: config.first_row,
            last_row: config.last_row,
            kind: config.kind,
            mode: config.mode,
        })
    }

    /// Ordering key.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Sheet shared by every cell of the group.
    pub fn sheet(&self) -> Option<&str> {
        self.sheet.as_deref()
    }

    /// Column layout.
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Timeout class of every task in the group.
    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    /// Worker type per answer column.
    pub fn worker_types(&self) -> &[String] {
        &self.worker_types
    }

    /// Rows covered, inclusive.
    pub fn rows(&self) -> RangeInclusive<u32> {
        self.first_row..=self.last_row
    }

    /// Number of answer cells per row.
    pub fn answers_per_row(&self) -> usize {
        self.answer_columns.len()
    }

    fn cell(&self, column: u32, row: u32) -> CellAddress {
        CellAddress::from_indices(self.sheet.clone(), column, row)
    }

    /// Answer cell `index` (0-based among answer columns) in `row`.
    pub fn answer_address(&self, index: usize, row: u32) -> CellAddress {
        self.cell(self.answer_columns[index], row)
    }

    /// Source cells of `row`, in configured order.
    pub fn source_addresses(&self, row: u32) -> Vec<CellAddress> {
        self.source_columns.iter().map(|&c| self.cell(c, row)).collect()
    }

    /// Log cell of `row`, if the group has a log column.
    pub fn log_address(&self, row: u32) -> Option<CellAddress> {
        self.log_column.map(|c| self.cell(c, row))
    }

    /// One single-column range per answer column.
    pub fn answer_ranges(&self) -> Vec<CellRange> {
        self.answer_columns
            .iter()
            .map(|&c| CellRange::column(self.sheet.clone(), c, self.first_row, self.last_row))
            .collect()
    }

    /// The smallest block covering every source and answer cell of the group.
    pub fn scan_range(&self) -> CellRange {
        let columns = self.source_columns.iter().chain(&self.answer_columns);
        let min = columns.clone().copied().min().unwrap_or(0);
        let max = columns.copied().max().unwrap_or(0);
        CellRange::new(self.sheet.clone(), (min, self.first_row), (max, self.last_row))
    }

    /// Projects one row of a [`scan_range`](Self::scan_range) block.
    pub fn view_row<'a>(&self, range: &CellRange, row: u32, block: &'a [Vec<String>]) -> RowView<'a> {
        let cells = block
            .get((row - range.start_row) as usize)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let at = |column: u32| {
            cells
                .get((column - range.start_column) as usize)
                .map(String::as_str)
                .unwrap_or_default()
        };
        RowView {
            row,
            sources: self.source_columns.iter().map(|&c| at(c)).collect(),
            answers: self.answer_columns.iter().map(|&c| at(c)).collect(),
        }
    }

    /// Builds the tasks for `row` given its source values, one per answer
    /// column. Returns nothing for rows whose sources are all blank.
    pub fn tasks_for_row(&self, row: u32, sources: &[&str]) -> Vec<Task> {
        let prompt = join_sources(sources.iter().copied());
        if prompt.is_empty() {
            return Vec::new();
        }
        (0..self.answer_columns.len())
            .map(|variant| {
                Task::new(
                    self.number,
                    self.answer_address(variant, row),
                    self.source_addresses(row),
                    self.log_address(row),
                    self.worker_types[variant].clone(),
                    self.mode,
                    prompt.clone(),
                    variant,
                )
            })
            .collect()
    }
}

/// Source and answer values of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowView<'a> {
    /// Row number.
    pub row: u32,
    /// Source values, in configured order.
    pub sources: Vec<&'a str>,
    /// Answer values, in answer-column order.
    pub answers: Vec<&'a str>,
}

impl RowView<'_> {
    /// Returns `true` if every source value is blank.
    pub fn is_blank(&self) -> bool {
        self.sources.iter().all(|s| s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: GroupKind) -> GroupConfig {
        let answers: Vec<String> = match kind {
            GroupKind::Normal => vec!["C".into()],
            GroupKind::FanOut3 => vec!["D".into(), "E".into(), "F".into()],
        };
        GroupConfig {
            number: 2,
            sheet: Some("Prompts".into()),
            source_columns: vec!["B".into(), "A".into()],
            worker_types: answers.iter().map(|a| format!("w{a}")).collect(),
            answer_columns: answers,
            log_column: Some("H".into()),
            first_row: 5,
            last_row: 7,
            kind,
            mode: TaskMode::Normal,
        }
    }

    #[test]
    fn scan_range_covers_sources_and_answers() {
        let group = TaskGroup::from_config(&config(GroupKind::FanOut3)).unwrap();
        assert_eq!(group.scan_range().to_string(), "Prompts!A5:F7");
        assert_eq!(group.answer_ranges().len(), 3);
        assert_eq!(group.answer_address(2, 6).to_string(), "Prompts!F6");
        assert_eq!(group.log_address(6).unwrap().to_string(), "Prompts!H6");
    }

    #[test]
    fn fan_out_rows_produce_one_task_per_answer_column() {
        let group = TaskGroup::from_config(&config(GroupKind::FanOut3)).unwrap();
        let tasks = group.tasks_for_row(6, &["second", "first"]);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id.as_str(), "g2:Prompts!D6");
        assert_eq!(tasks[2].worker_type, "wF");
        assert_eq!(tasks[1].variant, 1);
        assert_eq!(tasks[0].prompt, "second\n\nfirst");
    }

    #[test]
    fn blank_rows_produce_no_tasks() {
        let group = TaskGroup::from_config(&config(GroupKind::Normal)).unwrap();
        assert!(group.tasks_for_row(5, &["  ", ""]).is_empty());
    }

    #[test]
    fn view_row_projects_block_columns() {
        let group = TaskGroup::from_config(&config(GroupKind::Normal)).unwrap();
        let range = group.scan_range();
        assert_eq!(range.to_string(), "Prompts!A5:C7");
        let block = vec![
            vec!["a5".to_string(), "b5".to_string(), "c5".to_string()],
            vec![String::new(), String::new(), String::new()],
        ];
        let view = group.view_row(&range, 5, &block);
        assert_eq!(view.sources, vec!["b5", "a5"]);
        assert_eq!(view.answers, vec!["c5"]);
        assert!(group.view_row(&range, 6, &block).is_blank());
        // Rows beyond a short block read as blank.
        assert!(group.view_row(&range, 7, &block).is_blank());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut bad = config(GroupKind::Normal);
        bad.answer_columns.push("Z".into());
        assert!(TaskGroup::from_config(&bad).is_err());
    }
}
