//! TOML run configuration.
//!
//! The configuration is loaded once at start-up and never mutated by the
//! engine. It supplies group definitions, batch sizing, the timeout table,
//! retry policies, and the claim marker sentinel.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! batch_size = 3
//! slot_count = 3
//! failure_policy = "fail_fast"
//!
//! [timeouts]
//! normal_claim_secs = 600
//! extended_claim_secs = 2400
//!
//! [[group]]
//! number = 1
//! sheet = "Prompts"
//! source_columns = ["B"]
//! answer_columns = ["C"]
//! worker_types = ["chatgpt"]
//! first_row = 5
//! last_row = 7
//!
//! [[worker]]
//! type = "chatgpt"
//! command = "chatgpt-session"
//! ```

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::column_index;
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_DRAIN_EMPTY_ATTEMPTS, DEFAULT_DRAIN_TIMEOUT_SECS,
    DEFAULT_EXTENDED_CLAIM_SECS, DEFAULT_NORMAL_CLAIM_SECS, DEFAULT_SENTINEL, DEFAULT_SLOT_COUNT,
};
use crate::retry::RetryPolicy;
use crate::task::TaskMode;

/// Errors from loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file contains invalid TOML or does not match the schema.
    #[error("failed to parse config TOML: {source}")]
    Parse {
        #[from]
        source: toml::de::Error,
    },

    /// The file parsed but contains inconsistent values.
    #[error("config validation error: {message}")]
    Validation { message: String },

    /// The file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        source: std::io::Error,
        path: String,
    },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

/// What happens to the rest of a group when one of its tasks fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop issuing batches in the group and halt the run.
    #[default]
    FailFast,
    /// Keep processing the group's other rows; failed rows stay empty.
    ContinueGroup,
}

/// Shape of a group's answer columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// One answer column, one task per row.
    #[default]
    Normal,
    /// Three answer columns, one sub-task per backend variant per row.
    #[serde(rename = "fan_out3", alias = "fan_out_3")]
    FanOut3,
}

impl GroupKind {
    /// Number of answer columns this kind requires.
    pub fn answer_width(&self) -> usize {
        match self {
            Self::Normal => 1,
            Self::FanOut3 => 3,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// General settings.
    #[serde(default)]
    pub settings: Settings,
    /// Claim and dispatch timeouts.
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Draining / verification pacing.
    #[serde(default)]
    pub drain: DrainSettings,
    /// Retry policies per layer.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Worker pool behaviour.
    #[serde(default)]
    pub pool: PoolSettings,
    /// Task groups, processed in ascending `number`.
    #[serde(default, rename = "group")]
    pub groups: Vec<GroupConfig>,
    /// Worker session commands, keyed by worker type.
    #[serde(default, rename = "worker")]
    pub workers: Vec<WorkerConfig>,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Marker prefix written into claimed answer cells.
    pub sentinel: String,
    /// Maximum tasks per batch.
    pub batch_size: usize,
    /// Number of worker slots.
    pub slot_count: usize,
    /// Delay between the starts of consecutive dispatches in a batch.
    pub stagger_ms: u64,
    /// Stop each worker session as soon as its task finishes.
    pub close_immediately: bool,
    /// Reaction to a failed task.
    pub failure_policy: FailurePolicy,
    /// Skip groups numbered below this.
    pub start_group: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            slot_count: DEFAULT_SLOT_COUNT,
            stagger_ms: 2000,
            close_immediately: false,
            failure_policy: FailurePolicy::FailFast,
            start_group: None,
        }
    }
}

/// Claim staleness and dispatch deadlines, per mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Marker age after which a normal task is reclaimable.
    pub normal_claim_secs: u64,
    /// Marker age after which an extended task is reclaimable.
    pub extended_claim_secs: u64,
    /// Hard dispatch timeout for normal tasks.
    pub normal_dispatch_secs: u64,
    /// Hard dispatch timeout for extended tasks.
    pub extended_dispatch_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            normal_claim_secs: DEFAULT_NORMAL_CLAIM_SECS,
            extended_claim_secs: DEFAULT_EXTENDED_CLAIM_SECS,
            normal_dispatch_secs: DEFAULT_NORMAL_CLAIM_SECS - 60,
            extended_dispatch_secs: DEFAULT_EXTENDED_CLAIM_SECS - 60,
        }
    }
}

impl Timeouts {
    /// Claim staleness threshold for `mode`.
    pub fn claim_timeout(&self, mode: TaskMode) -> Duration {
        match mode {
            TaskMode::Normal => Duration::from_secs(self.normal_claim_secs),
            TaskMode::Extended => Duration::from_secs(self.extended_claim_secs),
        }
    }

    /// Hard dispatch deadline for `mode`.
    pub fn dispatch_timeout(&self, mode: TaskMode) -> Duration {
        match mode {
            TaskMode::Normal => Duration::from_secs(self.normal_dispatch_secs),
            TaskMode::Extended => Duration::from_secs(self.extended_dispatch_secs),
        }
    }
}

/// Draining and verification pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainSettings {
    /// Consecutive empty discovery polls before verifying completion.
    pub empty_attempts: u32,
    /// Time spent draining before verifying completion regardless.
    pub timeout_secs: u64,
    /// Pause between draining polls.
    pub poll_interval_ms: u64,
    /// Pause before returning to active after a failed verification.
    pub verify_retry_ms: u64,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            empty_attempts: DEFAULT_DRAIN_EMPTY_ATTEMPTS,
            timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            poll_interval_ms: 2000,
            verify_retry_ms: 5000,
        }
    }
}

impl DrainSettings {
    /// `timeout_secs` as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `poll_interval_ms` as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `verify_retry_ms` as a [`Duration`].
    pub fn verify_retry(&self) -> Duration {
        Duration::from_millis(self.verify_retry_ms)
    }
}

/// Retry policies for each layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries for "session not listening yet" dispatch errors.
    pub messaging: RetryPolicy,
    /// Retries for rate-limited store calls.
    pub store: RetryPolicy,
}

/// Worker pool behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Readiness probes per session creation.
    pub probe_attempts: u32,
    /// Fixed pause between readiness probes.
    pub probe_interval_ms: u64,
    /// Session creations per acquisition before giving up.
    pub slot_creation_attempts: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            probe_attempts: 10,
            probe_interval_ms: 1000,
            slot_creation_attempts: 2,
        }
    }
}

/// One `[[group]]` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Ordering key; must be unique.
    pub number: u32,
    /// Optional sheet name applied to every column of the group.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Input columns, concatenated in order.
    pub source_columns: Vec<String>,
    /// Result columns (one, or three for fan-out groups).
    pub answer_columns: Vec<String>,
    /// Worker type per answer column.
    pub worker_types: Vec<String>,
    /// Optional column for completion notes.
    #[serde(default)]
    pub log_column: Option<String>,
    /// First row, inclusive.
    pub first_row: u32,
    /// Last row, inclusive.
    pub last_row: u32,
    /// Column layout.
    #[serde(default)]
    pub kind: GroupKind,
    /// Timeout class.
    #[serde(default)]
    pub mode: TaskMode,
}

/// One `[[worker]]` block: how to start a session for a worker type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker type referenced by groups.
    #[serde(rename = "type")]
    pub worker_type: String,
    /// Program to spawn.
    pub command: PathBuf,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RunConfig {
    /// Parses and validates a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            source,
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.settings;
        if s.sentinel.trim().is_empty() || s.sentinel.contains('\n') {
            return Err(invalid("settings.sentinel must be non-empty and single-line"));
        }
        if s.batch_size == 0 {
            return Err(invalid("settings.batch_size must be at least 1"));
        }
        if s.slot_count == 0 {
            return Err(invalid("settings.slot_count must be at least 1"));
        }
        if self.timeouts.normal_claim_secs == 0 || self.timeouts.extended_claim_secs == 0 {
            return Err(invalid("claim timeouts must be positive"));
        }
        if self.timeouts.normal_dispatch_secs == 0 || self.timeouts.extended_dispatch_secs == 0 {
            return Err(invalid("dispatch timeouts must be positive"));
        }
        if self.pool.probe_attempts == 0 || self.pool.slot_creation_attempts == 0 {
            return Err(invalid("pool probe and creation attempts must be at least 1"));
        }

        let mut seen = BTreeSet::new();
        for group in &self.groups {
            if !seen.insert(group.number) {
                return Err(invalid(format!("group {} is defined twice", group.number)));
            }
            group.validate()?;
        }

        let mut worker_types = BTreeSet::new();
        for worker in &self.workers {
            if !worker_types.insert(worker.worker_type.as_str()) {
                return Err(invalid(format!(
                    "worker type '{}' is defined twice",
                    worker.worker_type
                )));
            }
        }

        Ok(())
    }

    /// Groups sorted by number, honouring `settings.start_group`.
    pub fn ordered_groups(&self) -> Vec<&GroupConfig> {
        let start = self.settings.start_group.unwrap_or(0);
        let mut groups: Vec<&GroupConfig> =
            self.groups.iter().filter(|g| g.number >= start).collect();
        groups.sort_by_key(|g| g.number);
        groups
    }

    /// Worker types used by groups but missing a `[[worker]]` entry.
    pub fn missing_worker_types(&self) -> Vec<String> {
        let defined: BTreeSet<&str> = self.workers.iter().map(|w| w.worker_type.as_str()).collect();
        let used: BTreeSet<&str> = self
            .groups
            .iter()
            .flat_map(|g| g.worker_types.iter().map(String::as_str))
            .collect();
        used.difference(&defined).map(|s| s.to_string()).collect()
    }
}

impl GroupConfig {
    /// Validates this group in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.number;
        if self.first_row == 0 || self.first_row > self.last_row {
            return Err(invalid(format!(
                "group {n}: rows must satisfy 1 <= first_row <= last_row"
            )));
        }
        if self.source_columns.is_empty() {
            return Err(invalid(format!("group {n}: at least one source column is required")));
        }
        let width = self.kind.answer_width();
        if self.answer_columns.len() != width {
            return Err(invalid(format!(
                "group {n}: a {:?} group needs {width} answer column(s), found {}",
                self.kind,
                self.answer_columns.len()
            )));
        }
        if self.worker_types.len() != width {
            return Err(invalid(format!(
                "group {n}: expected {width} worker type(s), found {}",
                self.worker_types.len()
            )));
        }
        let columns = self
            .source_columns
            .iter()
            .chain(&self.answer_columns)
            .chain(self.log_column.iter());
        for column in columns {
            column_index(column).map_err(|e| invalid(format!("group {n}: {e}")))?;
        }
        let answers: BTreeSet<String> =
            self.answer_columns.iter().map(|c| c.to_ascii_uppercase()).collect();
        if answers.len() != self.answer_columns.len() {
            return Err(invalid(format!("group {n}: answer columns must be distinct")));
        }
        for source in &self.source_columns {
            if answers.contains(&source.to_ascii_uppercase()) {
                return Err(invalid(format!(
                    "group {n}: column {source} is both a source and an answer column"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[group]]
number = 1
source_columns = ["B"]
answer_columns = ["C"]
worker_types = ["chatgpt"]
first_row = 5
last_row = 7
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RunConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.settings.batch_size, 3);
        assert_eq!(config.settings.slot_count, 3);
        assert_eq!(config.settings.sentinel, DEFAULT_SENTINEL);
        assert_eq!(config.settings.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.timeouts.claim_timeout(TaskMode::Normal), Duration::from_secs(600));
        assert_eq!(
            config.timeouts.claim_timeout(TaskMode::Extended),
            Duration::from_secs(2400)
        );
        assert_eq!(config.drain.empty_attempts, 3);
        assert_eq!(config.drain.timeout(), Duration::from_secs(30));
        assert_eq!(config.groups[0].kind, GroupKind::Normal);
        assert_eq!(config.groups[0].mode, TaskMode::Normal);
    }

    #[test]
    fn parses_fan_out_group_and_workers() {
        let toml_str = r#"
[settings]
failure_policy = "continue_group"
start_group = 2

[retry.messaging]
max_attempts = 6
base_delay_ms = 100

[[group]]
number = 2
sheet = "Research"
source_columns = ["A", "B"]
answer_columns = ["C", "D", "E"]
worker_types = ["chatgpt", "claude", "gemini"]
log_column = "F"
first_row = 2
last_row = 40
kind = "fan_out3"
mode = "extended"

[[group]]
number = 1
source_columns = ["A"]
answer_columns = ["B"]
worker_types = ["chatgpt"]
first_row = 2
last_row = 3

[[worker]]
type = "chatgpt"
command = "/usr/local/bin/chatgpt-session"
args = ["--headless"]
"#;
        let config = RunConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.settings.failure_policy, FailurePolicy::ContinueGroup);
        assert_eq!(config.retry.messaging.max_attempts, 6);
        assert_eq!(config.retry.messaging.multiplier, 2.0);
        let ordered: Vec<u32> = config.ordered_groups().iter().map(|g| g.number).collect();
        assert_eq!(ordered, vec![2]);
        assert_eq!(config.groups[0].kind, GroupKind::FanOut3);
        assert_eq!(config.groups[0].mode, TaskMode::Extended);
        assert_eq!(
            config.missing_worker_types(),
            vec!["claude".to_string(), "gemini".to_string()]
        );
    }

    #[test]
    fn rejects_wrong_answer_width() {
        let toml_str = MINIMAL.replace(r#"answer_columns = ["C"]"#, r#"answer_columns = ["C", "D"]"#);
        let err = RunConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("answer column"), "{err}");
    }

    #[test]
    fn rejects_duplicate_groups() {
        let toml_str = format!("{MINIMAL}{MINIMAL}");
        let err = RunConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("defined twice"), "{err}");
    }

    #[test]
    fn rejects_inverted_rows_and_overlapping_columns() {
        let inverted = MINIMAL.replace("first_row = 5", "first_row = 9");
        assert!(RunConfig::from_toml(&inverted).is_err());

        let overlap = MINIMAL.replace(r#"source_columns = ["B"]"#, r#"source_columns = ["c"]"#);
        let err = RunConfig::from_toml(&overlap).unwrap_err();
        assert!(err.to_string().contains("both a source and an answer"), "{err}");
    }

    #[test]
    fn rejects_multiline_sentinel() {
        let toml_str = format!("[settings]\nsentinel = \"A\\nB\"\n{MINIMAL}");
        assert!(matches!(
            RunConfig::from_toml(&toml_str),
            Err(ConfigError::Validation { .. })
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            RunConfig::from_toml("[[group]\nnumber ="),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = RunConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
