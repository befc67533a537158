//! The pull-based row-batch stream and its record-batch stream adapters.
//!
//! [`BatchStream`] is one type over a closed set of operator variants. The
//! wrapper owns what every stream has in common (header, limits, quota, table
//! locks, progress, extremes, cancellation); the variant owns the operator's own
//! state and its input streams.

use std::fmt::Write as _;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use arrow::array::{ArrayRef, new_null_array};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;
use futures::{Stream, StreamExt};

use crate::block::{Block, batch_bytes, batch_with_columns, nullable_schema};
use crate::limits::LocalLimits;
use crate::operators::StreamKind;
use crate::resources::{QuotaGuard, TableLockHolder};
use crate::scalar::{ScalarValue, scalar_from_array, scalar_gt, scalar_lt, scalars_to_array};

/// A stream of RecordBatches that also knows its output schema.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Output schema for every batch yielded by this stream.
    fn schema(&self) -> SchemaRef;
}

/// Boxed async stream handed across crate boundaries.
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Adapter that attaches a schema to any `Stream<Item = Result<RecordBatch>>`.
pub struct StreamAdapter<S> {
    schema: SchemaRef,
    inner: S,
}

impl<S> StreamAdapter<S> {
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self { schema, inner }
    }
}

impl<S> RecordBatchStream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send + Unpin + 'static,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Unpin,
{
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Create an empty stream (useful for stubs or early returns).
pub fn empty_stream(schema: SchemaRef) -> SendableRecordBatchStream {
    let inner = futures::stream::empty::<Result<RecordBatch>>();
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Column-wise min/max over every row a stream returned.
#[derive(Debug, Default)]
struct Extremes {
    min: Vec<ScalarValue>,
    max: Vec<ScalarValue>,
    seen_rows: bool,
}

impl Extremes {
    fn update(&mut self, batch: &RecordBatch) {
        if batch.num_rows() == 0 {
            return;
        }
        if !self.seen_rows {
            self.min = vec![ScalarValue::Null; batch.num_columns()];
            self.max = vec![ScalarValue::Null; batch.num_columns()];
            self.seen_rows = true;
        }
        for (idx, column) in batch.columns().iter().enumerate() {
            for row in 0..column.len() {
                // Types without a scalar form keep NULL extremes.
                let Ok(v) = scalar_from_array(column, row) else {
                    break;
                };
                if v.is_null() {
                    continue;
                }
                if self.min[idx].is_null() || scalar_lt(&v, &self.min[idx]).unwrap_or(false) {
                    self.min[idx] = v.clone();
                }
                if self.max[idx].is_null() || scalar_gt(&v, &self.max[idx]).unwrap_or(false) {
                    self.max[idx] = v;
                }
            }
        }
    }

    /// Two rows: minimums then maximums.
    fn to_batch(&self, header: &SchemaRef) -> Result<Option<RecordBatch>> {
        if !self.seen_rows {
            return Ok(None);
        }
        let schema = nullable_schema(header);
        let columns = schema
            .fields()
            .iter()
            .enumerate()
            .map(|(idx, f)| {
                let values = [self.min[idx].clone(), self.max[idx].clone()];
                scalars_to_array(&values, f.data_type())
                    .or_else(|_| Ok::<ArrayRef, FqError>(new_null_array(f.data_type(), 2)))
            })
            .collect::<Result<Vec<_>>>()?;
        batch_with_columns(schema, columns, 2).map(Some)
    }
}

/// A pull-based stream of [`Block`]s with a fixed header.
///
/// Contract of [`BatchStream::next`]:
/// - every returned batch has the schema of [`BatchStream::schema`];
/// - once `Ok(None)` was returned it keeps returning `Ok(None)`;
/// - a stream cancelled with `kill` returns [`FqError::Cancelled`] instead.
///
/// Exhaustion and cancellation cancel every owned input and release the table
/// locks and quota registration this stream holds.
pub struct BatchStream {
    kind: StreamKind,
    header: SchemaRef,
    limits: LocalLimits,
    quota: Option<QuotaGuard>,
    table_locks: Vec<TableLockHolder>,
    rows: u64,
    bytes: u64,
    started: Option<Instant>,
    extremes: Option<Extremes>,
    finished: bool,
    cancelled: bool,
    killed: bool,
    limit_exceeded_need_break: bool,
}

impl std::fmt::Debug for BatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStream")
            .field("operator", &self.kind.as_operator().name())
            .field("header", &self.header)
            .field("rows", &self.rows)
            .field("finished", &self.finished)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl BatchStream {
    pub(crate) fn from_kind(kind: StreamKind, header: SchemaRef) -> Self {
        Self {
            kind,
            header,
            limits: LocalLimits::default(),
            quota: None,
            table_locks: Vec::new(),
            rows: 0,
            bytes: 0,
            started: None,
            extremes: None,
            finished: false,
            cancelled: false,
            killed: false,
            limit_exceeded_need_break: false,
        }
    }

    /// Header of every batch; available before the first read.
    pub fn schema(&self) -> SchemaRef {
        self.header.clone()
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_operator().name()
    }

    /// Next batch, or `None` at end of stream.
    pub fn next(&mut self) -> Result<Option<Block>> {
        if self.finished {
            return Ok(None);
        }
        if self.cancelled {
            return if self.killed {
                Err(FqError::Cancelled)
            } else {
                Ok(None)
            };
        }
        if self.limit_exceeded_need_break {
            self.finish();
            return Ok(None);
        }
        let started = *self.started.get_or_insert_with(Instant::now);
        if !self.limits.check_time(started)? {
            self.finish();
            return Ok(None);
        }

        match self.kind.as_operator_mut().read()? {
            Some(block) => {
                let rows = block.num_rows() as u64;
                let bytes = batch_bytes(&block.batch);
                self.rows += rows;
                self.bytes += bytes;
                if let Some(extremes) = &mut self.extremes {
                    extremes.update(&block.batch);
                }
                if !self
                    .limits
                    .size
                    .check(self.rows, self.bytes, "limit for rows or bytes to read")?
                {
                    self.limit_exceeded_need_break = true;
                }
                if let Some(quota) = &self.quota {
                    quota.check_and_add(rows, bytes)?;
                }
                self.limits.check_speed(started, self.rows)?;
                Ok(Some(block))
            }
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    /// Reads the whole stream into batches.
    pub fn collect(&mut self) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        while let Some(block) = self.next()? {
            out.push(block.batch);
        }
        Ok(out)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.cancel(false);
    }

    /// Cancels this stream and, transitively, every stream it owns.
    ///
    /// `kill` turns later reads into [`FqError::Cancelled`] instead of end of stream.
    pub fn cancel(&mut self, kill: bool) {
        if kill {
            self.killed = true;
        }
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        let op = self.kind.as_operator_mut();
        op.on_cancel(kill);
        for child in op.children_mut() {
            child.cancel(kill);
        }
        self.table_locks.clear();
        self.quota = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Totals row: the operator's own, else the first input that has one.
    pub fn totals(&self) -> Result<Option<RecordBatch>> {
        self.kind.as_operator().totals()
    }

    /// Two-row min/max batch: this stream's own when enabled, else the first
    /// input's that has one.
    pub fn extremes(&self) -> Result<Option<RecordBatch>> {
        match &self.extremes {
            Some(extremes) => extremes.to_batch(&self.header),
            None => self.kind.as_operator().extremes(),
        }
    }

    /// Starts accumulating extremes over this stream's output.
    pub fn enable_extremes(&mut self) {
        if self.extremes.is_none() {
            self.extremes = Some(Extremes::default());
        }
    }

    pub fn set_limits(&mut self, limits: LocalLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> &LocalLimits {
        &self.limits
    }

    pub fn set_quota(&mut self, quota: QuotaGuard) {
        self.quota = Some(quota);
    }

    pub fn add_table_lock(&mut self, lock: TableLockHolder) {
        self.table_locks.push(lock);
    }

    /// Rows and bytes returned so far.
    pub fn progress(&self) -> (u64, u64) {
        (self.rows, self.bytes)
    }

    /// Sort order of the output, if the operator guarantees one.
    pub fn sort_description(&self) -> Option<Vec<SortColumn>> {
        self.kind.as_operator().sort_description()
    }

    /// Indented operator tree, one operator per line.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        let op = self.kind.as_operator();
        let detail = op.describe();
        let _ = write!(out, "{:indent$}{}", "", op.name(), indent = depth * 2);
        if !detail.is_empty() {
            let _ = write!(out, "({detail})");
        }
        if self.extremes.is_some() {
            out.push_str(" +extremes");
        }
        out.push('\n');
        for child in op.children() {
            child.explain_into(out, depth + 1);
        }
    }

    /// Exposes this stream as an async record-batch stream.
    pub fn into_record_batch_stream(self) -> SendableRecordBatchStream {
        let schema = self.schema();
        let inner = futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.next() {
                Ok(Some(block)) => Some((Ok(block.batch), Some(stream))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed();
        Box::pin(StreamAdapter::new(schema, inner))
    }
}

/// Min of the inputs' minimums and max of their maximums, over the inputs
/// that report extremes.
pub(crate) fn merged_child_extremes(children: Vec<&BatchStream>) -> Result<Option<RecordBatch>> {
    let mut reported = Vec::new();
    for child in children {
        if let Some(batch) = child.extremes()? {
            reported.push(batch);
        }
    }
    if reported.len() <= 1 {
        return Ok(reported.pop());
    }
    let header = reported[0].schema();
    let mut merged = Extremes::default();
    for batch in &reported {
        merged.update(batch);
    }
    merged.to_batch(&header)
}

/// Pulls the first input's totals, used by pass-through operators.
pub(crate) fn first_child_totals(children: Vec<&BatchStream>) -> Result<Option<RecordBatch>> {
    for child in children {
        if let Some(totals) = child.totals()? {
            return Ok(Some(totals));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use fq_common::OverflowMode;
    use futures::executor::block_on;

    use crate::limits::SizeLimits;
    use crate::resources::{Quota, TableLock};

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).expect("batch")
    }

    fn source(parts: Vec<Vec<i64>>) -> BatchStream {
        let batches = parts.into_iter().map(batch).collect::<Vec<_>>();
        BatchStream::memory(batches[0].schema(), batches)
    }

    #[test]
    fn end_of_stream_is_sticky_and_releases_resources() {
        let lock = TableLock::new("db.t");
        let quota = Quota::unlimited();
        let mut s = source(vec![vec![1, 2], vec![3]]);
        s.add_table_lock(lock.lock_for_share());
        s.set_quota(quota.register());
        assert_eq!(lock.readers(), 1);
        assert_eq!(s.collect().expect("collect").len(), 2);
        assert!(s.next().expect("next").is_none());
        assert!(s.next().expect("next").is_none());
        assert_eq!(lock.readers(), 0);
        assert_eq!(quota.active_streams(), 0);
        assert_eq!(quota.used().0, 3);
    }

    #[test]
    fn break_mode_truncates_after_the_crossing_batch() {
        let mut s = source(vec![vec![1, 2], vec![3, 4], vec![5]]);
        s.set_limits(LocalLimits {
            size: SizeLimits::new(3, 0, OverflowMode::Break),
            ..LocalLimits::default()
        });
        let rows: usize = s.collect().expect("collect").iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 4);
    }

    #[test]
    fn throw_mode_fails_mid_stream() {
        let mut s = source(vec![vec![1, 2], vec![3, 4]]);
        s.set_limits(LocalLimits {
            size: SizeLimits::new(3, 0, OverflowMode::Throw),
            ..LocalLimits::default()
        });
        assert!(s.next().expect("first").is_some());
        assert!(matches!(s.next(), Err(FqError::LimitExceeded(_))));
    }

    #[test]
    fn kill_turns_reads_into_errors() {
        let lock = TableLock::new("db.t");
        let mut s = source(vec![vec![1]]);
        s.add_table_lock(lock.lock_for_share());
        s.cancel(true);
        assert_eq!(lock.readers(), 0);
        assert!(matches!(s.next(), Err(FqError::Cancelled)));

        let mut soft = source(vec![vec![1]]);
        soft.cancel(false);
        assert!(soft.next().expect("soft").is_none());
    }

    #[test]
    fn extremes_report_min_and_max_rows() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("v", DataType::Int64, false),
            Field::new("s", DataType::Utf8, true),
        ]));
        let b = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![5, -2, 9])),
                Arc::new(StringArray::from(vec![Some("m"), None, Some("a")])),
            ],
        )
        .expect("batch");
        let mut s = BatchStream::memory(schema, vec![b]);
        s.enable_extremes();
        assert!(s.extremes().expect("extremes").is_none());
        s.collect().expect("collect");
        let ex = s.extremes().expect("extremes").expect("some");
        let v = ex.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(v.values().to_vec(), vec![-2, 9]);
        let st = ex.column(1).as_any().downcast_ref::<StringArray>().expect("utf8");
        assert_eq!((st.value(0), st.value(1)), ("a", "m"));
    }

    #[test]
    fn record_batch_stream_round_trip() {
        let s = source(vec![vec![1, 2], vec![3]]);
        let mut async_stream = s.into_record_batch_stream();
        let batches = block_on(async {
            let mut out = Vec::new();
            while let Some(b) = async_stream.next().await {
                out.push(b.expect("batch"));
            }
            out
        });
        assert_eq!(batches.len(), 2);

        let back = BatchStream::from_record_batch_stream(empty_stream(batch(vec![]).schema()));
        let mut back = back;
        assert!(back.next().expect("next").is_none());
    }
}
