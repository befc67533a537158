//! K-way merge of sorted runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use arrow::array::{Array, ArrayRef};
use arrow::compute::{SortOptions, interleave};
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, Rows, SortField};
use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;

use crate::block::{Block, batch_with_columns};
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

/// Ordered inputs of a [`SortedMerger`]; every run yields batches sorted by
/// the merge description.
pub(crate) trait RunSet {
    fn run_count(&self) -> usize;

    fn next_run_batch(&mut self, run: usize) -> Result<Option<RecordBatch>>;
}

impl RunSet for Vec<BatchStream> {
    fn run_count(&self) -> usize {
        self.len()
    }

    fn next_run_batch(&mut self, run: usize) -> Result<Option<RecordBatch>> {
        Ok(self[run].next()?.map(|b| b.batch))
    }
}

struct Cursor {
    rows: Rows,
    pos: usize,
    slot: usize,
}

/// Merges runs into blocks of at most `max_block_size` rows, stopping after
/// `limit` rows when non-zero.
pub(crate) struct SortedMerger {
    schema: SchemaRef,
    converter: RowConverter,
    sort_columns: Vec<usize>,
    cursors: Vec<Option<Cursor>>,
    slots: Vec<RecordBatch>,
    heap: BinaryHeap<Reverse<(OwnedRow, usize)>>,
    max_block_size: usize,
    limit: usize,
    emitted: usize,
    started: bool,
}

impl SortedMerger {
    pub(crate) fn new(
        schema: SchemaRef,
        description: &[SortColumn],
        max_block_size: usize,
        limit: usize,
    ) -> Result<Self> {
        let mut sort_columns = Vec::with_capacity(description.len());
        let mut fields = Vec::with_capacity(description.len());
        for column in description {
            let idx = schema.index_of(&column.name).map_err(|_| {
                FqError::Planning(format!("sort column {} is not in the block", column.name))
            })?;
            sort_columns.push(idx);
            fields.push(SortField::new_with_options(
                schema.field(idx).data_type().clone(),
                sort_options(column),
            ));
        }
        let converter = RowConverter::new(fields)
            .map_err(|e| FqError::Execution(format!("row converter failed: {e}")))?;
        Ok(Self {
            schema,
            converter,
            sort_columns,
            cursors: Vec::new(),
            slots: Vec::new(),
            heap: BinaryHeap::new(),
            max_block_size: max_block_size.max(1),
            limit,
            emitted: 0,
            started: false,
        })
    }

    fn advance(&mut self, runs: &mut dyn RunSet, run: usize) -> Result<()> {
        loop {
            match runs.next_run_batch(run)? {
                Some(batch) if batch.num_rows() == 0 => continue,
                Some(batch) => {
                    let keys = self
                        .sort_columns
                        .iter()
                        .map(|&i| batch.column(i).clone())
                        .collect::<Vec<ArrayRef>>();
                    let rows = self
                        .converter
                        .convert_columns(&keys)
                        .map_err(|e| FqError::Execution(format!("row conversion failed: {e}")))?;
                    self.heap.push(Reverse((rows.row(0).owned(), run)));
                    self.cursors[run] = Some(Cursor {
                        rows,
                        pos: 0,
                        slot: self.slots.len(),
                    });
                    self.slots.push(batch);
                    return Ok(());
                }
                None => {
                    self.cursors[run] = None;
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn next_block(&mut self, runs: &mut dyn RunSet) -> Result<Option<RecordBatch>> {
        if !self.started {
            self.started = true;
            self.cursors = (0..runs.run_count()).map(|_| None).collect();
            for run in 0..runs.run_count() {
                self.advance(runs, run)?;
            }
        }
        let mut picks = Vec::<(usize, usize)>::new();
        while picks.len() < self.max_block_size
            && (self.limit == 0 || self.emitted + picks.len() < self.limit)
        {
            let Some(Reverse((_, run))) = self.heap.pop() else {
                break;
            };
            let exhausted = match self.cursors[run].as_mut() {
                Some(cursor) => {
                    picks.push((cursor.slot, cursor.pos));
                    cursor.pos += 1;
                    if cursor.pos < cursor.rows.num_rows() {
                        self.heap
                            .push(Reverse((cursor.rows.row(cursor.pos).owned(), run)));
                        false
                    } else {
                        true
                    }
                }
                None => false,
            };
            if exhausted {
                self.advance(runs, run)?;
            }
        }
        if picks.is_empty() {
            return Ok(None);
        }
        self.emitted += picks.len();

        let mut columns = Vec::with_capacity(self.schema.fields().len());
        for col in 0..self.schema.fields().len() {
            let sources = self
                .slots
                .iter()
                .map(|b| b.column(col).as_ref())
                .collect::<Vec<&dyn Array>>();
            columns.push(
                interleave(&sources, &picks)
                    .map_err(|e| FqError::Execution(format!("merge interleave failed: {e}")))?,
            );
        }
        let out = batch_with_columns(self.schema.clone(), columns, picks.len())?;
        self.compact_slots();
        Ok(Some(out))
    }

    /// Drops batches no cursor points into any more.
    fn compact_slots(&mut self) {
        let mut slots = Vec::new();
        for cursor in self.cursors.iter_mut().flatten() {
            slots.push(self.slots[cursor.slot].clone());
            cursor.slot = slots.len() - 1;
        }
        self.slots = slots;
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.started && (self.heap.is_empty() || (self.limit != 0 && self.emitted >= self.limit))
    }
}

pub(crate) fn sort_options(column: &SortColumn) -> SortOptions {
    SortOptions {
        descending: column.descending,
        nulls_first: column.nulls_first,
    }
}

pub(crate) struct MergingSortedOp {
    inputs: Vec<BatchStream>,
    merger: SortedMerger,
    description: Vec<SortColumn>,
}

impl Operator for MergingSortedOp {
    fn name(&self) -> &'static str {
        "MergingSorted"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.merger.is_exhausted() {
            return Ok(None);
        }
        Ok(self.merger.next_block(&mut self.inputs)?.map(Block::new))
    }

    fn children(&self) -> Vec<&BatchStream> {
        self.inputs.iter().collect()
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        self.inputs.iter_mut().collect()
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        Some(self.description.clone())
    }

    fn describe(&self) -> String {
        format!("inputs={}", self.inputs.len())
    }
}

impl BatchStream {
    /// Merges inputs that are each sorted by `description` into one sorted stream.
    pub fn merging_sorted(
        inputs: Vec<BatchStream>,
        description: Vec<SortColumn>,
        max_block_size: usize,
        limit: usize,
    ) -> Result<Self> {
        let header = inputs
            .first()
            .map(BatchStream::schema)
            .ok_or_else(|| FqError::Planning("merge of zero sorted streams".to_string()))?;
        for input in &inputs {
            if input.schema().fields().len() != header.fields().len() {
                return Err(FqError::Planning(
                    "sorted streams to merge have different structure".to_string(),
                ));
            }
        }
        let merger = SortedMerger::new(header.clone(), &description, max_block_size, limit)?;
        Ok(Self::from_kind(
            StreamKind::MergingSorted(MergingSortedOp {
                inputs,
                merger,
                description,
            }),
            header,
        ))
    }
}
