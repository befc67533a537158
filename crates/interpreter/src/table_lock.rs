//! Table lookup aligned with the schema version a query was analyzed with.

use std::sync::Arc;
use std::time::Instant;

use fq_common::{FqError, Result};
use fq_execution::TableLockHolder;
use fq_storage::Storage;
use tracing::debug;

use crate::context::Context;

/// A table and the shared lock held on it while the query reads.
pub struct LockedStorage {
    pub storage: Arc<dyn Storage>,
    pub lock: TableLockHolder,
}

/// Looks up `name`, locks it, and when the settings carry a schema version
/// makes sure the local schema can serve it.
///
/// Versions: the table's (last alteration), the node-wide one of the schema
/// syncer, and the query's. A table newer than the query is never served; a
/// table equal to the query, or a node-wide version at least the query's, is
/// served as is; otherwise schemas are synced once and the lookup repeats,
/// this time failing on a missing table.
pub fn get_and_lock_storage(ctx: &Context, name: &str) -> Result<LockedStorage> {
    let Some(query_version) = ctx.settings().schema_version else {
        let storage = ctx.catalog().get(name)?;
        let lock = storage.table_lock().lock_for_share();
        return Ok(LockedStorage { storage, lock });
    };

    let global_version = ctx.syncer().global_version();
    let try_lock = |synced: bool| -> Result<Option<LockedStorage>> {
        let storage = if synced {
            ctx.catalog().get(name)?
        } else {
            match ctx.catalog().try_get(name) {
                Some(s) => s,
                None => return Ok(None),
            }
        };
        let Some(storage_version) = storage.managed_schema_version() else {
            return Err(FqError::InvalidConfig(format!(
                "specifying schema_version for storage {}, table {name} is not allowed",
                storage.name()
            )));
        };
        let lock = storage.table_lock().lock_for_share();
        debug!(
            table = name,
            storage_version,
            global_version,
            query_version,
            synced,
            "table schema versions"
        );
        if storage_version > query_version {
            return Err(FqError::SchemaVersion(format!(
                "table {name} schema version {storage_version} newer than query schema version {query_version}"
            )));
        }
        if synced || storage_version == query_version || global_version >= query_version {
            return Ok(Some(LockedStorage { storage, lock }));
        }
        Ok(None)
    };

    if let Some(locked) = try_lock(false)? {
        debug!(table = name, "schema version OK, no syncing required");
        return Ok(locked);
    }

    debug!(table = name, "schema version not OK, syncing schemas");
    let started = Instant::now();
    ctx.syncer().sync_schemas(ctx.catalog())?;
    debug!(
        table = name,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "table schemas synced"
    );

    try_lock(true)?.ok_or_else(|| {
        FqError::SchemaVersion(format!("table {name} is unavailable after schema sync"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow_schema::{DataType, Field, Schema};
    use fq_storage::{Catalog, ManualSchemaSyncer, MemoryStorage};

    fn table(version: Option<i64>) -> Arc<dyn Storage> {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let t = MemoryStorage::new("t", schema);
        Arc::new(match version {
            Some(v) => t.with_schema_version(v),
            None => t,
        })
    }

    fn context(
        table_version: Option<i64>,
        global: i64,
        query: Option<i64>,
    ) -> (Context, Arc<ManualSchemaSyncer>) {
        let catalog = Arc::new(Catalog::new());
        if let Some(v) = table_version {
            catalog.register("t", table(Some(v)));
        }
        let syncer = Arc::new(ManualSchemaSyncer::new(global));
        let mut ctx = Context::new(catalog).with_syncer(syncer.clone());
        ctx.settings_mut().schema_version = query;
        (ctx, syncer)
    }

    #[test]
    fn without_a_version_the_table_is_served_and_locked() {
        let (ctx, syncer) = context(Some(1), 1, None);
        let locked = get_and_lock_storage(&ctx, "t").expect("lookup");
        assert_eq!(locked.storage.table_lock().readers(), 1);
        assert_eq!(syncer.syncs(), 0);
        drop(locked);
        assert_eq!(ctx.catalog().get("t").expect("t").table_lock().readers(), 0);
    }

    #[test]
    fn newer_storage_is_a_hard_error() {
        let (ctx, syncer) = context(Some(7), 7, Some(5));
        assert!(matches!(
            get_and_lock_storage(&ctx, "t"),
            Err(FqError::SchemaVersion(_))
        ));
        assert_eq!(syncer.syncs(), 0);
    }

    #[test]
    fn equal_or_covered_versions_serve_without_sync() {
        let (ctx, syncer) = context(Some(5), 1, Some(5));
        get_and_lock_storage(&ctx, "t").expect("equal");
        let (ctx2, syncer2) = context(Some(3), 9, Some(5));
        get_and_lock_storage(&ctx2, "t").expect("global covers query");
        assert_eq!(syncer.syncs() + syncer2.syncs(), 0);
    }

    #[test]
    fn stale_storage_is_synced_once_then_served() {
        let (ctx, syncer) = context(Some(3), 3, Some(5));
        syncer.stage("t", table(Some(5)), 5);
        let locked = get_and_lock_storage(&ctx, "t").expect("after sync");
        assert_eq!(locked.storage.managed_schema_version(), Some(5));
        assert_eq!(syncer.syncs(), 1);
    }

    #[test]
    fn missing_table_fails_after_sync() {
        let (ctx, syncer) = context(None, 1, Some(5));
        assert!(matches!(
            get_and_lock_storage(&ctx, "t"),
            Err(FqError::Planning(_))
        ));
        assert_eq!(syncer.syncs(), 1);
    }

    #[test]
    fn unmanaged_storage_rejects_a_version_request() {
        let (ctx, _) = context(None, 1, Some(5));
        ctx.catalog().register("t", table(None));
        assert!(matches!(
            get_and_lock_storage(&ctx, "t"),
            Err(FqError::InvalidConfig(_))
        ));
    }
}
