use std::sync::Arc;

use arrow_schema::SchemaRef;
use fq_common::{FqError, Result, Settings};
use fq_execution::{BatchStream, PreparedSets, TableLock};
use fq_planner::{Expr, ProcessingStage, SelectQuery};

/// What a storage is told about the query reading it.
#[derive(Debug, Clone, Default)]
pub struct SelectQueryInfo {
    pub query: SelectQuery,
    /// Sets already built for index analysis; may be empty.
    pub sets: PreparedSets,
}

/// Optional clauses a storage evaluates itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageCapabilities {
    pub sampling: bool,
    pub final_: bool,
    pub prewhere: bool,
}

/// A column computed from other columns of the same table at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasColumn {
    pub name: String,
    pub expr: Expr,
}

/// Table engine abstraction the interpreter reads from.
///
/// Implementations are engine-specific (in-memory, cluster of shards).
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    /// Physical columns, as returned by [`Storage::read`] at `FetchColumns`.
    fn schema(&self) -> SchemaRef;

    fn alias_columns(&self) -> Vec<AliasColumn> {
        Vec::new()
    }

    /// Physical then alias column names.
    fn column_names(&self) -> Vec<String> {
        self.schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .chain(self.alias_columns().into_iter().map(|a| a.name))
            .collect()
    }

    fn capabilities(&self) -> StorageCapabilities {
        StorageCapabilities::default()
    }

    /// Reads go to other nodes rather than local data.
    fn is_remote(&self) -> bool {
        false
    }

    /// Schema version of a managed table; `None` for storages that do not
    /// track one.
    fn managed_schema_version(&self) -> Option<i64> {
        None
    }

    fn table_lock(&self) -> Arc<TableLock>;

    /// Stage the data will already be at when read, known before reading.
    fn query_processing_stage(&self, _settings: &Settings) -> ProcessingStage {
        ProcessingStage::FetchColumns
    }

    /// Header of the streams [`Storage::read`] returns for the same arguments,
    /// computed without reading.
    fn read_header(
        &self,
        columns: &[String],
        _query_info: &SelectQueryInfo,
        _settings: &Settings,
        _stage: ProcessingStage,
    ) -> Result<SchemaRef> {
        header_for_columns(&self.schema(), columns)
    }

    /// Opens up to `num_streams` streams over `columns`.
    ///
    /// May return zero streams when there is nothing to read. The returned
    /// stage tells how far the streams have processed the query.
    ///
    /// # Errors
    /// Returns [`FqError::Planning`] for unknown columns and engine-specific
    /// errors for failed reads.
    fn read(
        &self,
        columns: &[String],
        query_info: &SelectQueryInfo,
        settings: &Settings,
        stage: ProcessingStage,
        max_block_size: usize,
        num_streams: usize,
    ) -> Result<(Vec<BatchStream>, ProcessingStage)>;
}

/// Header of `columns` projected from `schema`.
pub fn header_for_columns(schema: &SchemaRef, columns: &[String]) -> Result<SchemaRef> {
    let fields = columns
        .iter()
        .map(|c| {
            schema
                .field_with_name(c)
                .cloned()
                .map_err(|_| FqError::Planning(format!("there is no column {c} in table")))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(arrow_schema::Schema::new(fields)))
}
