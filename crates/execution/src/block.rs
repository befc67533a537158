//! The unit moved between stream operators.

use std::sync::Arc;

use arrow::array::{ArrayRef, RecordBatch, RecordBatchOptions};
use arrow::compute::concat_batches;
use arrow_schema::{Field, Schema, SchemaRef};
use fq_common::{FqError, Result};

/// Side information aggregation merging needs about a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// The batch holds the single overflow row of an aggregation capped by
    /// `max_rows_to_group_by`.
    pub is_overflows: bool,
    /// Two-level aggregation bucket, `-1` for single-level output.
    pub bucket_num: i32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            is_overflows: false,
            bucket_num: -1,
        }
    }
}

/// A record batch plus its [`BlockInfo`].
#[derive(Debug, Clone)]
pub struct Block {
    pub batch: RecordBatch,
    pub info: BlockInfo,
}

impl Block {
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            info: BlockInfo::default(),
        }
    }

    pub fn with_info(batch: RecordBatch, info: BlockInfo) -> Self {
        Self { batch, info }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    /// Replaces the batch, keeping the block info.
    pub fn map_batch(self, batch: RecordBatch) -> Self {
        Self {
            batch,
            info: self.info,
        }
    }
}

/// Builds a batch that may have zero columns.
pub fn batch_with_columns(
    schema: SchemaRef,
    columns: Vec<ArrayRef>,
    num_rows: usize,
) -> Result<RecordBatch> {
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    RecordBatch::try_new_with_options(schema, columns, &options)
        .map_err(|e| FqError::Execution(format!("batch construction failed: {e}")))
}

/// Keeps the named columns in the given order.
pub fn project_by_name(batch: &RecordBatch, names: &[String]) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(names.len());
    let mut columns = Vec::with_capacity(names.len());
    for name in names {
        let idx = schema
            .index_of(name)
            .map_err(|_| FqError::Execution(format!("missing column in block: {name}")))?;
        fields.push(schema.field(idx).clone());
        columns.push(batch.column(idx).clone());
    }
    batch_with_columns(
        Arc::new(Schema::new(fields)),
        columns,
        batch.num_rows(),
    )
}

/// Schema with every field nullable; used by outputs that may carry NULL fills.
pub fn nullable_schema(schema: &SchemaRef) -> SchemaRef {
    Arc::new(Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), f.data_type().clone(), true))
            .collect::<Vec<_>>(),
    ))
}

/// Concatenates batches of one schema; an empty input yields an empty batch.
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema.clone()));
    }
    if schema.fields().is_empty() {
        let rows = batches.iter().map(|b| b.num_rows()).sum();
        return batch_with_columns(schema.clone(), vec![], rows);
    }
    concat_batches(schema, batches)
        .map_err(|e| FqError::Execution(format!("concat batches failed: {e}")))
}

/// Splits a batch into slices of at most `max_rows` rows.
pub fn split_batch(batch: &RecordBatch, max_rows: usize) -> Vec<RecordBatch> {
    let rows = batch.num_rows();
    if max_rows == 0 || rows <= max_rows {
        return vec![batch.clone()];
    }
    (0..rows)
        .step_by(max_rows)
        .map(|start| batch.slice(start, max_rows.min(rows - start)))
        .collect()
}

/// Approximate in-memory size used by byte limits and spill thresholds.
pub fn batch_bytes(batch: &RecordBatch) -> u64 {
    batch.get_array_memory_size() as u64
}
