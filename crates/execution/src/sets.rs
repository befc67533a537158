//! Materialized subquery results: `IN` membership sets and JOIN hash tables.
//!
//! Objects are created empty while the plan is built, so expression compilation
//! can resolve them by name, and are filled by the creating-sets step before the
//! main pipeline reads its first row.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use arrow::array::{Array, ArrayRef, BooleanBuilder, RecordBatch, new_null_array};
use arrow::compute::{interleave, take};
use arrow_schema::{Field, Schema, SchemaRef};
use fq_common::{FqError, Result};
use fq_planner::{JoinDescriptor, JoinKind};

use crate::block::batch_with_columns;
use crate::scalar::{ScalarValue, encode_row, scalar_from_array};

/// Distinct values of a subquery's first column.
#[derive(Debug, Default)]
pub struct Set {
    values: RwLock<HashSet<ScalarValue>>,
    bytes: std::sync::atomic::AtomicU64,
    ready: AtomicBool,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_block(&self, batch: &RecordBatch) -> Result<()> {
        if batch.num_columns() == 0 {
            return Err(FqError::Execution(
                "subquery for IN returned no columns".to_string(),
            ));
        }
        let column = batch.column(0);
        let mut values = self.values.write().expect("set lock poisoned");
        for row in 0..batch.num_rows() {
            let v = scalar_from_array(column, row)?;
            if v.is_null() {
                continue;
            }
            let bytes = v.estimate_bytes() as u64;
            if values.insert(v) {
                self.bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.values.read().expect("set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Membership per row; NULL inputs yield NULL.
    pub fn contains(&self, column: &ArrayRef, negated: bool) -> Result<ArrayRef> {
        let values = self.values.read().expect("set lock poisoned");
        let mut out = BooleanBuilder::with_capacity(column.len());
        for row in 0..column.len() {
            let v = scalar_from_array(column, row)?;
            if v.is_null() {
                out.append_null();
            } else {
                out.append_value(values.contains(&v) != negated);
            }
        }
        Ok(Arc::new(out.finish()))
    }
}

#[derive(Debug, Default)]
struct JoinData {
    batches: Vec<RecordBatch>,
    index: HashMap<Vec<u8>, Vec<(usize, usize)>>,
    rows: usize,
    bytes: u64,
}

/// Right side of a hash join, keyed by the USING columns.
///
/// Tracks which right rows found a partner so that RIGHT and FULL joins can emit
/// the remaining ones once every left stream is exhausted.
#[derive(Debug)]
pub struct HashJoin {
    descriptor: JoinDescriptor,
    right_schema: SchemaRef,
    data: RwLock<JoinData>,
    used: Mutex<Vec<Vec<bool>>>,
    ready: AtomicBool,
}

impl HashJoin {
    /// `right_schema` is the header of the right-side subquery.
    pub fn new(descriptor: JoinDescriptor, right_schema: SchemaRef) -> Result<Self> {
        for key in &descriptor.keys {
            right_schema.index_of(key).map_err(|_| {
                FqError::Planning(format!("JOIN key {key} is missing on the right side"))
            })?;
        }
        for c in &descriptor.right_columns {
            right_schema.index_of(c).map_err(|_| {
                FqError::Planning(format!("JOIN column {c} is missing on the right side"))
            })?;
        }
        Ok(Self {
            descriptor,
            right_schema,
            data: RwLock::new(JoinData::default()),
            used: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> JoinKind {
        self.descriptor.kind
    }

    pub fn keys(&self) -> &[String] {
        &self.descriptor.keys
    }

    pub fn right_schema(&self) -> &SchemaRef {
        &self.right_schema
    }

    pub fn insert_block(&self, batch: &RecordBatch) -> Result<()> {
        let key_columns = key_columns(batch, &self.descriptor.keys)?;
        let mut data = self.data.write().expect("join lock poisoned");
        let batch_idx = data.batches.len();
        for row in 0..batch.num_rows() {
            let (key, encoded) = encode_row(&key_columns, row)?;
            if key.iter().any(ScalarValue::is_null) {
                continue;
            }
            data.index.entry(encoded).or_default().push((batch_idx, row));
        }
        data.rows += batch.num_rows();
        data.bytes += batch.get_array_memory_size() as u64;
        data.batches.push(batch.clone());
        self.used
            .lock()
            .expect("join lock poisoned")
            .push(vec![false; batch.num_rows()]);
        Ok(())
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn rows(&self) -> usize {
        self.data.read().expect("join lock poisoned").rows
    }

    pub fn bytes(&self) -> u64 {
        self.data.read().expect("join lock poisoned").bytes
    }

    /// Schema of a joined batch: the left input followed by the right columns.
    pub fn output_schema(&self, left: &SchemaRef) -> Result<SchemaRef> {
        let left_nullable = self.descriptor.kind.is_right_or_full();
        let right_nullable = self.descriptor.kind.is_left_or_full();
        let mut fields = left
            .fields()
            .iter()
            .map(|f| {
                Field::new(f.name(), f.data_type().clone(), f.is_nullable() || left_nullable)
            })
            .collect::<Vec<_>>();
        for c in &self.descriptor.right_columns {
            if left.index_of(c).is_ok() {
                return Err(FqError::Planning(format!(
                    "column {c} exists on both sides of JOIN"
                )));
            }
            let f = self.right_schema.field_with_name(c).map_err(|e| {
                FqError::Planning(format!("JOIN right column lookup failed: {e}"))
            })?;
            fields.push(Field::new(
                c,
                f.data_type().clone(),
                f.is_nullable() || right_nullable,
            ));
        }
        Ok(Arc::new(Schema::new(fields)))
    }

    /// Probes every left row, emitting one output row per match, plus one
    /// NULL-extended row for unmatched left rows of LEFT and FULL joins.
    pub fn join_block(&self, left: &RecordBatch, output: &SchemaRef) -> Result<RecordBatch> {
        let key_columns = key_columns(left, &self.descriptor.keys)?;
        let data = self.data.read().expect("join lock poisoned");
        let keep_unmatched = self.descriptor.kind.is_left_or_full();
        let track_used = self.descriptor.kind.is_right_or_full();
        let null_slot = data.batches.len();

        let mut left_idx = Vec::<u32>::new();
        let mut right_idx = Vec::<(usize, usize)>::new();
        let mut used = self.used.lock().expect("join lock poisoned");
        for row in 0..left.num_rows() {
            let (key, encoded) = encode_row(&key_columns, row)?;
            let matches = if key.iter().any(ScalarValue::is_null) {
                None
            } else {
                data.index.get(&encoded)
            };
            match matches {
                Some(list) => {
                    for &(b, r) in list {
                        left_idx.push(row as u32);
                        right_idx.push((b, r));
                        if track_used {
                            used[b][r] = true;
                        }
                    }
                }
                None if keep_unmatched => {
                    left_idx.push(row as u32);
                    right_idx.push((null_slot, 0));
                }
                None => {}
            }
        }
        drop(used);

        let indices = arrow::array::UInt32Array::from(left_idx);
        let mut columns = Vec::with_capacity(output.fields().len());
        for column in left.columns() {
            let taken = take(column.as_ref(), &indices, None)
                .map_err(|e| FqError::Execution(format!("join take failed: {e}")))?;
            columns.push(taken);
        }
        for c in &self.descriptor.right_columns {
            columns.push(gather_right(&data, &self.right_schema, c, &right_idx)?);
        }
        batch_with_columns(output.clone(), columns, indices.len())
    }

    /// Right rows that never matched, in the layout of `output`: key columns
    /// and right columns come from the right side, other left columns are NULL.
    pub fn non_joined_block(&self, output: &SchemaRef, max_rows: usize) -> Result<Vec<RecordBatch>> {
        if !self.descriptor.kind.is_right_or_full() {
            return Ok(Vec::new());
        }
        let data = self.data.read().expect("join lock poisoned");
        let used = self.used.lock().expect("join lock poisoned");
        let mut rows = Vec::new();
        for (b, flags) in used.iter().enumerate() {
            for (r, &matched) in flags.iter().enumerate() {
                if !matched {
                    rows.push((b, r));
                }
            }
        }
        drop(used);
        let mut out = Vec::new();
        let chunk = max_rows.max(1);
        for part in rows.chunks(chunk) {
            let mut columns = Vec::with_capacity(output.fields().len());
            for field in output.fields() {
                if self.right_schema.index_of(field.name()).is_ok()
                    && (self.descriptor.keys.contains(field.name())
                        || self.descriptor.right_columns.contains(field.name()))
                {
                    columns.push(gather_right(&data, &self.right_schema, field.name(), part)?);
                } else {
                    columns.push(new_null_array(field.data_type(), part.len()));
                }
            }
            out.push(batch_with_columns(output.clone(), columns, part.len())?);
        }
        Ok(out)
    }
}

fn key_columns(batch: &RecordBatch, keys: &[String]) -> Result<Vec<ArrayRef>> {
    keys.iter()
        .map(|k| {
            batch
                .schema()
                .index_of(k)
                .map(|i| batch.column(i).clone())
                .map_err(|_| FqError::Execution(format!("JOIN key {k} is missing in block")))
        })
        .collect()
}

/// Gathers `(batch, row)` positions of one right column; the position one past
/// the last batch is a NULL cell.
fn gather_right(
    data: &JoinData,
    right_schema: &SchemaRef,
    column: &str,
    positions: &[(usize, usize)],
) -> Result<ArrayRef> {
    let idx = right_schema
        .index_of(column)
        .map_err(|_| FqError::Execution(format!("missing right column {column}")))?;
    let dt = right_schema.field(idx).data_type();
    let null_cell = new_null_array(dt, 1);
    let mut sources: Vec<&dyn Array> = data
        .batches
        .iter()
        .map(|b| b.column(idx).as_ref())
        .collect();
    sources.push(null_cell.as_ref());
    interleave(&sources, positions)
        .map_err(|e| FqError::Execution(format!("join interleave failed: {e}")))
}

/// A prepared object by set name.
#[derive(Debug, Clone)]
pub enum PreparedSet {
    Set(Arc<Set>),
    Join(Arc<HashJoin>),
}

/// All sets and joins of one query, shared by every stream that reads them.
#[derive(Debug, Clone, Default)]
pub struct PreparedSets {
    entries: HashMap<String, PreparedSet>,
}

impl PreparedSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, set: PreparedSet) {
        self.entries.insert(name.into(), set);
    }

    pub fn get(&self, name: &str) -> Option<&PreparedSet> {
        self.entries.get(name)
    }

    pub fn set(&self, name: &str) -> Result<Arc<Set>> {
        match self.entries.get(name) {
            Some(PreparedSet::Set(s)) => Ok(s.clone()),
            _ => Err(FqError::Planning(format!("set {name} is not prepared"))),
        }
    }

    pub fn join(&self, name: &str) -> Result<Arc<HashJoin>> {
        match self.entries.get(name) {
            Some(PreparedSet::Join(j)) => Ok(j.clone()),
            _ => Err(FqError::Planning(format!("join {name} is not prepared"))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{BooleanArray, Int64Array, StringArray};
    use arrow_schema::DataType;

    fn right_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 9])),
                Arc::new(StringArray::from(vec!["one", "two", "nine"])),
            ],
        )
        .expect("batch")
    }

    fn left_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 3])),
                Arc::new(Int64Array::from(vec![10, 30])),
            ],
        )
        .expect("batch")
    }

    fn descriptor(kind: JoinKind) -> JoinDescriptor {
        JoinDescriptor {
            set_name: "r_join".to_string(),
            kind,
            keys: vec!["k".to_string()],
            right_columns: vec!["label".to_string()],
        }
    }

    #[test]
    fn set_membership_respects_negation_and_nulls() {
        let set = Set::new();
        set.insert_block(&right_batch()).expect("insert");
        let probe: ArrayRef = Arc::new(Int64Array::from(vec![Some(1), Some(5), None]));
        let out = set.contains(&probe, false).expect("contains");
        let out = out.as_any().downcast_ref::<BooleanArray>().expect("bool");
        assert!(out.value(0));
        assert!(!out.value(1));
        assert!(out.is_null(2));
        let neg = set.contains(&probe, true).expect("contains");
        let neg = neg.as_any().downcast_ref::<BooleanArray>().expect("bool");
        assert!(!neg.value(0) && neg.value(1));
    }

    #[test]
    fn left_join_extends_unmatched_rows_with_nulls() {
        let right = right_batch();
        let join = HashJoin::new(descriptor(JoinKind::Left), right.schema()).expect("join");
        join.insert_block(&right).expect("insert");
        let left = left_batch();
        let schema = join.output_schema(&left.schema()).expect("schema");
        let out = join.join_block(&left, &schema).expect("join");
        assert_eq!(out.num_rows(), 2);
        let label = out.column(2).as_any().downcast_ref::<StringArray>().expect("str");
        assert_eq!(label.value(0), "one");
        assert!(label.is_null(1));
    }

    #[test]
    fn full_join_reports_unmatched_right_rows() {
        let right = right_batch();
        let join = HashJoin::new(descriptor(JoinKind::Full), right.schema()).expect("join");
        join.insert_block(&right).expect("insert");
        let left = left_batch();
        let schema = join.output_schema(&left.schema()).expect("schema");
        join.join_block(&left, &schema).expect("join");
        let rest = join.non_joined_block(&schema, 1024).expect("non joined");
        let total: usize = rest.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        let k = rest[0].column(0).as_any().downcast_ref::<Int64Array>().expect("k");
        assert_eq!(k.values().to_vec(), vec![2, 9]);
        assert!(rest[0].column(1).is_null(0));
    }
}
