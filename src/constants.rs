//! Default values shared by the configuration and the engine.

/// Marker prefix written into claimed answer cells.
pub const DEFAULT_SENTINEL: &str = "__CLAIMED__";

/// Tasks dispatched per batch.
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Concurrent worker slots.
pub const DEFAULT_SLOT_COUNT: usize = 3;

/// Marker age (seconds) after which a normal task is reclaimable.
pub const DEFAULT_NORMAL_CLAIM_SECS: u64 = 10 * 60;

/// Marker age (seconds) after which an extended task is reclaimable.
pub const DEFAULT_EXTENDED_CLAIM_SECS: u64 = 40 * 60;

/// Consecutive empty discovery polls before completion is verified.
pub const DEFAULT_DRAIN_EMPTY_ATTEMPTS: u32 = 3;

/// Seconds spent draining before completion is verified regardless.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
