#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::compute::cast;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use fq_common::Settings;
use fq_interpreter::{Context, InterpreterSelectQuery, QueryResult};
use fq_planner::SelectQuery;
use fq_storage::{Catalog, MemoryStorage, Storage};

pub fn kv_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

pub fn kv_batch(rows: &[(i64, i64)]) -> RecordBatch {
    RecordBatch::try_new(
        kv_schema(),
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                rows.iter().map(|(_, v)| *v).collect::<Vec<_>>(),
            )),
        ],
    )
    .expect("kv batch")
}

/// In-memory `(k, v)` table holding `rows` split into `blocks` inserts, so
/// reads can open up to `blocks` streams.
pub fn kv_table(name: &str, rows: &[(i64, i64)], blocks: usize) -> MemoryStorage {
    let table = MemoryStorage::new(name, kv_schema());
    let chunk = rows.len().div_ceil(blocks.max(1)).max(1);
    for part in rows.chunks(chunk) {
        table.insert(kv_batch(part)).expect("insert");
    }
    table
}

/// Single-block table of non-null Int64 columns.
pub fn int_table(name: &str, columns: &[(&str, Vec<i64>)]) -> MemoryStorage {
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .map(|(n, _)| Field::new(*n, DataType::Int64, false))
            .collect::<Vec<_>>(),
    ));
    let batch = RecordBatch::try_new(
        schema.clone(),
        columns
            .iter()
            .map(|(_, values)| Arc::new(Int64Array::from(values.clone())) as ArrayRef)
            .collect(),
    )
    .expect("int batch");
    let table = MemoryStorage::new(name, schema);
    table.insert(batch).expect("insert");
    table
}

/// `k = i % groups`, `v = i` for `i` in `0..n`.
pub fn grouped_rows(n: i64, groups: i64) -> Vec<(i64, i64)> {
    (0..n).map(|i| (i % groups, i)).collect()
}

pub fn context_with(tables: Vec<MemoryStorage>) -> Context {
    let catalog = Arc::new(Catalog::new());
    for table in tables {
        catalog.register(table.name().to_string(), Arc::new(table));
    }
    Context::new(catalog)
}

pub fn settings(max_threads: usize, max_block_size: usize) -> Settings {
    Settings {
        max_threads,
        max_block_size,
        ..Settings::default()
    }
}

pub fn run(query: SelectQuery, ctx: &Context) -> QueryResult {
    InterpreterSelectQuery::for_query(query, ctx.clone())
        .expect("interpreter")
        .execute()
        .expect("execute")
        .read_all()
        .expect("read")
}

pub fn column_names(schema: &SchemaRef) -> Vec<String> {
    schema.fields().iter().map(|f| f.name().clone()).collect()
}

/// Values of `name` across all batches, as i64.
pub fn int_column(batches: &[RecordBatch], name: &str) -> Vec<i64> {
    let mut out = Vec::new();
    for batch in batches {
        let idx = batch.schema().index_of(name).expect("column");
        let casted = cast(batch.column(idx), &DataType::Int64).expect("cast");
        let values = casted
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64");
        for i in 0..values.len() {
            out.push(values.value(i));
        }
    }
    out
}

/// Rows of `(a, b)` columns, sorted.
pub fn sorted_pairs(batches: &[RecordBatch], a: &str, b: &str) -> Vec<(i64, i64)> {
    let mut rows = int_column(batches, a)
        .into_iter()
        .zip(int_column(batches, b))
        .collect::<Vec<_>>();
    rows.sort_unstable();
    rows
}
