//! SELECT interpreter: turns an analyzed query into a pipeline of batch streams.
//!
//! Architecture role:
//! - source selection (prepared input, subquery, table, `system.one`)
//! - stage-aware pipeline construction with a fixed step order
//! - UNION ALL over nested selects
//! - schema-version aware table lookup
//! - cluster storage running the first stage on shards
//!
//! Key modules:
//! - [`select`]
//! - [`select_with_union`]
//! - [`context`]
//! - [`table_lock`]
//! - [`cluster`]
//! - [`block_io`]

pub mod block_io;
pub mod cluster;
pub mod context;
pub mod select;
pub mod select_with_union;
pub mod table_lock;

pub use block_io::{BlockIO, QueryResult};
pub use cluster::{ClusterStorage, Shard};
pub use context::{Context, qualified_table_name};
pub use select::InterpreterSelectQuery;
pub use select_with_union::InterpreterSelectWithUnionQuery;
pub use table_lock::{LockedStorage, get_and_lock_storage};
