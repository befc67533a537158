//! Table engines and the catalog the interpreter reads from.
//!
//! Key modules:
//! - [`storage`]: the [`Storage`] trait and per-read query info
//! - [`memory`]: in-memory table engine
//! - [`catalog`]: table registry, JSON loading, `system.one`
//! - [`schema_sync`]: schema-version synchronization

pub mod catalog;
pub mod memory;
pub mod schema_sync;
pub mod storage;

pub use catalog::{Catalog, ColumnDef, SYSTEM_ONE, TableDef};
pub use memory::MemoryStorage;
pub use schema_sync::{ManualSchemaSyncer, NoopSchemaSyncer, SchemaSyncer};
pub use storage::{
    AliasColumn, SelectQueryInfo, Storage, StorageCapabilities, header_for_columns,
};
