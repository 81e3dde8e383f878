//! Named constants shared across the sandbox launcher, store, and retry
//! modules, centralized here rather than threaded as magic numbers through
//! call sites.

/// Output is capped at this many bytes per stream before truncation kicks in.
pub const SCRIPT_OUTPUT_BYTE_LIMIT: usize = 1024 * 1024;

/// Output is also capped at this many lines per stream, whichever limit is
/// hit first.
pub const SCRIPT_OUTPUT_MAX_LINES: usize = 10_000;

/// Default per-run timeout when a job does not specify one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Hard ceiling a caller cannot exceed regardless of requested timeout.
pub const MAX_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Default time-to-live for a pending retry before it is swept.
pub const DEFAULT_RETRY_TTL_MS: u64 = 10 * 60 * 1000;

/// Interval at which the retry store sweeps expired entries.
pub const RETRY_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Maximum number of shells that may exist concurrently in a single session.
pub const MAX_SHELLS: usize = 64;

/// Maximum number of scripts retained per shell (oldest evicted first).
pub const MAX_SCRIPTS_PER_SHELL: usize = 256;

/// Maximum depth of task nesting the orchestrator will parse before
/// rejecting a definition as malformed.
pub const MAX_TASK_NESTING_DEPTH: usize = 16;
