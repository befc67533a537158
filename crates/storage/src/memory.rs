//! Table engine keeping its rows in memory.

use std::sync::{Arc, RwLock};

use arrow::compute::{cast, filter_record_batch, prep_null_mask_filter};
use arrow::array::{Array, BooleanArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use fq_common::{FqError, Result, Settings};
use fq_execution::block::{project_by_name, split_batch};
use fq_execution::{BatchStream, TableLock, compile_expr};
use fq_planner::ProcessingStage;
use tracing::debug;

use crate::storage::{
    AliasColumn, SelectQueryInfo, Storage, StorageCapabilities, header_for_columns,
};

/// In-memory table.
///
/// Reads return one stream per group of blocks, so `num_streams` parallel
/// streams exist once the table holds at least that many blocks.
#[derive(Debug)]
pub struct MemoryStorage {
    name: String,
    schema: SchemaRef,
    batches: RwLock<Vec<RecordBatch>>,
    aliases: Vec<AliasColumn>,
    capabilities: StorageCapabilities,
    schema_version: Option<i64>,
    lock: Arc<TableLock>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>, schema: SchemaRef) -> Self {
        let name = name.into();
        Self {
            lock: TableLock::new(name.clone()),
            name,
            schema,
            batches: RwLock::new(Vec::new()),
            aliases: Vec::new(),
            capabilities: StorageCapabilities::default(),
            schema_version: None,
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<AliasColumn>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_capabilities(mut self, capabilities: StorageCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Makes the table managed, at `version`.
    pub fn with_schema_version(mut self, version: i64) -> Self {
        self.schema_version = Some(version);
        self
    }

    /// Appends rows; the batch must match the table schema.
    pub fn insert(&self, batch: RecordBatch) -> Result<()> {
        if batch.schema().fields() != self.schema.fields() {
            return Err(FqError::Planning(format!(
                "inserted block does not match the structure of table {}",
                self.name
            )));
        }
        self.batches
            .write()
            .expect("memory table lock poisoned")
            .push(batch);
        Ok(())
    }

    pub fn total_rows(&self) -> usize {
        self.batches
            .read()
            .expect("memory table lock poisoned")
            .iter()
            .map(RecordBatch::num_rows)
            .sum()
    }
}

impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn alias_columns(&self) -> Vec<AliasColumn> {
        self.aliases.clone()
    }

    fn capabilities(&self) -> StorageCapabilities {
        self.capabilities
    }

    fn managed_schema_version(&self) -> Option<i64> {
        self.schema_version
    }

    fn table_lock(&self) -> Arc<TableLock> {
        self.lock.clone()
    }

    fn read(
        &self,
        columns: &[String],
        query_info: &SelectQueryInfo,
        _settings: &Settings,
        _stage: ProcessingStage,
        max_block_size: usize,
        num_streams: usize,
    ) -> Result<(Vec<BatchStream>, ProcessingStage)> {
        let header = header_for_columns(&self.schema, columns)?;
        let query = &query_info.query;

        let prewhere = match &query.prewhere {
            Some(expr) if self.capabilities.prewhere => {
                Some(compile_expr(expr, &self.schema, &query_info.sets)?)
            }
            _ => None,
        };
        let mut sample_rows = match query.sample {
            Some(ratio) if self.capabilities.sampling => {
                Some((self.total_rows() as f64 * ratio.clamp(0.0, 1.0)).ceil() as usize)
            }
            _ => None,
        };

        let mut blocks = Vec::new();
        for batch in self.batches.read().expect("memory table lock poisoned").iter() {
            let mut batch = batch.clone();
            if let Some(remaining) = sample_rows.as_mut() {
                if *remaining == 0 {
                    break;
                }
                let take = batch.num_rows().min(*remaining);
                batch = batch.slice(0, take);
                *remaining -= take;
            }
            if let Some(expr) = &prewhere {
                let mask = expr.evaluate(&batch)?;
                let mask = cast(&mask, &DataType::Boolean)
                    .map_err(|e| FqError::Execution(format!("PREWHERE cast failed: {e}")))?;
                let mask = mask
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .ok_or_else(|| FqError::Execution("PREWHERE is not boolean".to_string()))?;
                batch = filter_record_batch(&batch, &prep_null_mask_filter(mask))
                    .map_err(|e| FqError::Execution(format!("PREWHERE filter failed: {e}")))?;
            }
            if batch.num_rows() == 0 {
                continue;
            }
            let projected = project_by_name(&batch, columns)?;
            blocks.extend(split_batch(&projected, max_block_size));
        }

        let streams_count = num_streams.max(1).min(blocks.len());
        let mut parts = vec![Vec::new(); streams_count];
        for (i, block) in blocks.into_iter().enumerate() {
            parts[i % streams_count].push(block);
        }
        debug!(
            table = %self.name,
            streams = streams_count,
            columns = columns.len(),
            "memory table read"
        );
        let streams = parts
            .into_iter()
            .map(|p| BatchStream::memory(header.clone(), p))
            .collect();
        Ok((streams, ProcessingStage::FetchColumns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow::array::Int64Array;
    use arrow_schema::{Field, Schema};
    use fq_planner::{SelectQuery, col, lit_i64};

    fn table(caps: StorageCapabilities) -> MemoryStorage {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        let t = MemoryStorage::new("t", schema.clone()).with_capabilities(caps);
        for chunk in [[1, 2, 3], [4, 5, 6], [7, 8, 9]] {
            let v = chunk.iter().map(|x| x * 10).collect::<Vec<_>>();
            t.insert(
                RecordBatch::try_new(
                    schema.clone(),
                    vec![
                        Arc::new(Int64Array::from(chunk.to_vec())),
                        Arc::new(Int64Array::from(v)),
                    ],
                )
                .expect("batch"),
            )
            .expect("insert");
        }
        t
    }

    fn read_rows(t: &MemoryStorage, info: &SelectQueryInfo, streams: usize) -> (usize, usize) {
        let (mut out, stage) = t
            .read(
                &["v".to_string()],
                info,
                &Settings::default(),
                ProcessingStage::FetchColumns,
                2,
                streams,
            )
            .expect("read");
        assert_eq!(stage, ProcessingStage::FetchColumns);
        let count = out.len();
        let rows = out
            .iter_mut()
            .flat_map(|s| s.collect().expect("collect"))
            .inspect(|b| assert_eq!(b.num_columns(), 1))
            .map(|b| b.num_rows())
            .sum();
        (count, rows)
    }

    #[test]
    fn read_projects_splits_and_spreads_over_streams() {
        let t = table(StorageCapabilities::default());
        let info = SelectQueryInfo::default();
        assert_eq!(read_rows(&t, &info, 4), (4, 9));
        assert_eq!(read_rows(&t, &info, 1), (1, 9));
    }

    #[test]
    fn empty_table_returns_no_streams() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let t = MemoryStorage::new("e", schema);
        assert_eq!(read_rows(&t, &SelectQueryInfo::default(), 4), (0, 0));
    }

    #[test]
    fn unknown_column_is_a_planning_error() {
        let t = table(StorageCapabilities::default());
        let err = t
            .read(
                &["missing".to_string()],
                &SelectQueryInfo::default(),
                &Settings::default(),
                ProcessingStage::FetchColumns,
                2,
                1,
            )
            .expect_err("unknown column");
        assert!(matches!(err, FqError::Planning(_)));
    }

    #[test]
    fn prewhere_and_sample_are_evaluated_by_a_capable_table() {
        let caps = StorageCapabilities {
            sampling: true,
            final_: false,
            prewhere: true,
        };
        let t = table(caps);
        let info = SelectQueryInfo {
            query: SelectQuery::new().column(col("v")).prewhere(col("k").gt(lit_i64(4))),
            ..SelectQueryInfo::default()
        };
        assert_eq!(read_rows(&t, &info, 1).1, 5);

        let info = SelectQueryInfo {
            query: SelectQuery::new().column(col("v")).sample(0.5),
            ..SelectQueryInfo::default()
        };
        assert_eq!(read_rows(&t, &info, 1).1, 5);
    }
}
