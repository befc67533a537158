use std::sync::Arc;

use fq_common::{QueryId, Result, Settings};
use fq_execution::Quota;
use fq_planner::TableExpr;
use fq_storage::{Catalog, NoopSchemaSyncer, SchemaSyncer};

/// Everything a query is interpreted against.
///
/// Cloning is cheap apart from the settings; subqueries run on a clone with
/// adjusted settings.
#[derive(Clone)]
pub struct Context {
    settings: Settings,
    catalog: Arc<Catalog>,
    syncer: Arc<dyn SchemaSyncer>,
    quota: Arc<Quota>,
    query_id: QueryId,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("query_id", &self.query_id)
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

impl Context {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            settings: Settings::default(),
            catalog,
            syncer: Arc::new(NoopSchemaSyncer),
            quota: Quota::unlimited(),
            query_id: QueryId::default(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_syncer(mut self, syncer: Arc<dyn SchemaSyncer>) -> Self {
        self.syncer = syncer;
        self
    }

    pub fn with_quota(mut self, quota: Arc<Quota>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_query_id(mut self, query_id: QueryId) -> Self {
        self.query_id = query_id;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Applies a query's `SETTINGS` clause.
    pub fn apply_settings_changes(&mut self, changes: &[(String, String)]) -> Result<()> {
        self.settings
            .apply_changes(changes.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn syncer(&self) -> &Arc<dyn SchemaSyncer> {
        &self.syncer
    }

    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }
}

/// Catalog key of a table reference: `database.name`, or `name` alone.
pub fn qualified_table_name(table: &TableExpr) -> Option<String> {
    match table {
        TableExpr::Table {
            database: Some(db),
            name,
        } => Some(format!("{db}.{name}")),
        TableExpr::Table {
            database: None,
            name,
        } => Some(name.clone()),
        TableExpr::Subquery(_) => None,
    }
}
