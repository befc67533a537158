use thiserror::Error;

/// Canonical error taxonomy used across fq crates.
///
/// Classification guidance:
/// - [`FqError::InvalidConfig`]: query/stage/settings combinations rejected before any stream is opened
/// - [`FqError::Planning`]: query shape/name/type issues discovered while analyzing
/// - [`FqError::Execution`]: runtime operator evaluation or data-shape failures
/// - [`FqError::LimitExceeded`]: a resource cap with `throw` overflow mode was crossed mid-stream
/// - [`FqError::SchemaVersion`]: local table schema cannot serve the requested schema version
/// - [`FqError::Unsupported`]: valid request for a capability the source does not provide
/// - [`FqError::Cancelled`]: a stream was read after it was cancelled by its consumer
/// - [`FqError::Io`]: raw filesystem failures from std APIs (spill files, settings files)
#[derive(Debug, Error)]
pub enum FqError {
    /// Invalid or inconsistent configuration/stage state.
    ///
    /// Examples:
    /// - `from_stage == to_stage == WithMergeableState` (distributed on distributed)
    /// - unknown setting name in a `SETTINGS` clause
    /// - too many columns to read, subquery nesting too deep
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Query analysis failures.
    ///
    /// Examples:
    /// - unknown table/column
    /// - aggregate function nested inside another aggregate
    /// - UNION ALL branches with different column counts
    #[error("planning error: {0}")]
    Planning(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - expression evaluation/type mismatch at runtime
    /// - aggregate state shape mismatches while merging
    /// - spill decode failures
    #[error("execution error: {0}")]
    Execution(String),

    /// A row/byte/time/speed limit was exceeded under the `throw` policy.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Table schema version does not match the version the query was analyzed with.
    ///
    /// Raised when the storage is newer than the query; an older storage gets one resync.
    #[error("schema version mismatch: {0}")]
    SchemaVersion(String),

    /// A cancelled stream was asked for more data, or a prefetch worker went away.
    #[error("query was cancelled")]
    Cancelled,

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a feature the chosen source cannot provide.
    ///
    /// Examples:
    /// - SAMPLE / FINAL / PREWHERE against a storage without that capability
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard fq result alias.
pub type Result<T> = std::result::Result<T, FqError>;
