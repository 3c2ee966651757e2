//! Error taxonomy.
//!
//! Three classes of failure are distinguished:
//!
//! - [`ConfigError`] -- the request itself is wrong (unknown sample, bad binning).
//!   Raised before any work is dispatched and aborts the run.
//! - [`MergeError`] -- two partial results for the same key cannot be combined.
//!   Fatal for that key only.
//! - Per-item processing errors -- returned by [`Task::process`](crate::Task::process)
//!   as `anyhow::Error`; the scheduler logs them and skips the item.

use thiserror::Error;

/// Request-level configuration errors. Always fatal, always raised before dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown data-taking period '{0}'")]
    UnknownPeriod(String),

    #[error("unknown particle or species group '{0}'")]
    UnknownSpecies(String),

    #[error("no samples selected for request: {0}")]
    EmptyRequest(String),

    #[error("invalid binning: {0}")]
    InvalidBinning(String),

    #[error("invalid cut expression '{0}'")]
    InvalidCut(String),

    #[error("work item {job_id} for '{key}' is invalid: {reason}")]
    InvalidItem {
        job_id: usize,
        key: String,
        reason: String,
    },

    #[error("invalid manager configuration: {0}")]
    InvalidManager(String),
}

/// Failure to combine two partial results.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    #[error("binning mismatch: expected {expected}, got {found}")]
    BinningMismatch { expected: String, found: String },

    #[error("accumulator kind mismatch: cannot merge {found} into {expected}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

/// Crate-level error wrapping the taxonomy above.
#[derive(Debug, Error)]
pub enum CalibError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("merge failed for key '{key}': {source}")]
    Merge {
        key: String,
        #[source]
        source: MergeError,
    },
}
