//! Brings local table schemas up to the cluster-wide schema version.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fq_common::Result;
use tracing::debug;

use crate::catalog::Catalog;
use crate::storage::Storage;

/// Source of schema changes for managed tables.
pub trait SchemaSyncer: Send + Sync {
    /// Newest schema version this node has applied.
    fn global_version(&self) -> i64;

    /// Applies every pending schema change to `catalog`.
    fn sync_schemas(&self, catalog: &Catalog) -> Result<()>;
}

/// Syncer that never has anything to apply.
#[derive(Debug, Default)]
pub struct NoopSchemaSyncer;

impl SchemaSyncer for NoopSchemaSyncer {
    fn global_version(&self) -> i64 {
        0
    }

    fn sync_schemas(&self, _catalog: &Catalog) -> Result<()> {
        Ok(())
    }
}

/// Syncer fed by hand: changes are staged, then applied by the next sync.
#[derive(Default)]
pub struct ManualSchemaSyncer {
    global: AtomicI64,
    pending_version: AtomicI64,
    staged: Mutex<Vec<(String, Arc<dyn Storage>)>>,
    syncs: AtomicUsize,
}

impl ManualSchemaSyncer {
    pub fn new(global_version: i64) -> Self {
        Self {
            global: AtomicI64::new(global_version),
            pending_version: AtomicI64::new(global_version),
            ..Self::default()
        }
    }

    /// Stages `storage` to replace table `name` once the next sync reaches
    /// `version`.
    pub fn stage(&self, name: impl Into<String>, storage: Arc<dyn Storage>, version: i64) {
        self.staged
            .lock()
            .expect("schema syncer lock poisoned")
            .push((name.into(), storage));
        self.pending_version.fetch_max(version, Ordering::AcqRel);
    }

    /// Number of syncs run so far.
    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::Acquire)
    }
}

impl SchemaSyncer for ManualSchemaSyncer {
    fn global_version(&self) -> i64 {
        self.global.load(Ordering::Acquire)
    }

    fn sync_schemas(&self, catalog: &Catalog) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock().expect("schema syncer lock poisoned"));
        let applied = staged.len();
        for (name, storage) in staged {
            catalog.register(name, storage);
        }
        let version = self.pending_version.load(Ordering::Acquire);
        self.global.fetch_max(version, Ordering::AcqRel);
        self.syncs.fetch_add(1, Ordering::AcqRel);
        debug!(applied, global_version = version, "schemas synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow_schema::{DataType, Field, Schema};

    use crate::memory::MemoryStorage;

    #[test]
    fn staged_tables_appear_after_sync() {
        let catalog = Catalog::new();
        let syncer = ManualSchemaSyncer::new(1);
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        syncer.stage(
            "t",
            Arc::new(MemoryStorage::new("t", schema).with_schema_version(5)),
            5,
        );
        assert!(catalog.try_get("t").is_none());
        assert_eq!(syncer.global_version(), 1);

        syncer.sync_schemas(&catalog).expect("sync");
        assert_eq!(syncer.global_version(), 5);
        assert_eq!(syncer.syncs(), 1);
        let t = catalog.get("t").expect("synced table");
        assert_eq!(t.managed_schema_version(), Some(5));
    }
}
