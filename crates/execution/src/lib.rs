//! Execution-layer primitives of the fq SELECT interpreter.
//!
//! Architecture role:
//! - pull-based [`BatchStream`] over a closed set of operators
//! - compiled expression actions, prepared sets and joins
//! - hash aggregation with two-level buckets and external spill
//! - per-stream limits, quotas and table locks
//! - the [`Pipeline`] of parallel streams the interpreter builds on
//!
//! Key modules:
//! - [`actions`]
//! - [`aggregator`]
//! - [`block`]
//! - [`expressions`]
//! - [`limits`]
//! - [`operators`]
//! - [`pipeline`]
//! - [`resources`]
//! - [`sets`]
//! - [`stream`]

pub mod actions;
pub mod aggregator;
pub mod block;
pub mod expressions;
pub mod limits;
pub mod operators;
pub mod pipeline;
pub mod resources;
pub mod scalar;
pub mod sets;
mod spill;
pub mod stream;

// Re-export only what you want at the crate root (no globs).
pub use actions::ExpressionActions;
pub use aggregator::{AggregatedData, Aggregator, AggregatorParams};
pub use block::{Block, BlockInfo};
pub use expressions::{PhysicalExpr, compile_expr};
pub use limits::{LocalLimits, SizeLimits};
pub use operators::{MergeSortParams, SetSource, TotalsHavingParams};
pub use pipeline::Pipeline;
pub use resources::{Quota, QuotaGuard, TableLock, TableLockHolder};
pub use sets::{HashJoin, PreparedSet, PreparedSets, Set};
pub use stream::{
    BatchStream, RecordBatchStream, SendableRecordBatchStream, StreamAdapter, empty_stream,
};
