use std::collections::HashMap;

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;

use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::scalar::encode_row;
use crate::stream::BatchStream;

pub(crate) struct LimitOp {
    input: Box<BatchStream>,
    limit: u64,
    offset: u64,
    /// Rows read from the input so far.
    pos: u64,
    always_read_till_end: bool,
}

impl Operator for LimitOp {
    fn name(&self) -> &'static str {
        "Limit"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        let end = self.offset.saturating_add(self.limit);
        if self.pos >= end {
            if self.always_read_till_end {
                while self.input.next()?.is_some() {}
            }
            return Ok(None);
        }

        let (block, rows) = loop {
            let Some(block) = self.input.next()? else {
                return Ok(None);
            };
            let rows = block.num_rows() as u64;
            self.pos += rows;
            if self.pos > self.offset {
                break (block, rows);
            }
        };

        // Rows read before this block; always below `end`.
        let before = self.pos - rows;
        if before >= self.offset && self.pos <= end {
            return Ok(Some(block));
        }

        let start = self.offset.saturating_sub(before);
        let stop = rows.min(end - before);
        let sliced = block
            .batch
            .slice(start as usize, stop.saturating_sub(start) as usize);
        Ok(Some(block.map_batch(sliced)))
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        self.input.sort_description()
    }

    fn describe(&self) -> String {
        let mut out = format!("limit={}", self.limit);
        if self.offset > 0 {
            out.push_str(&format!("; offset={}", self.offset));
        }
        if self.always_read_till_end {
            out.push_str("; read_till_end");
        }
        out
    }
}

pub(crate) struct LimitByOp {
    input: Box<BatchStream>,
    length: u64,
    columns: Vec<usize>,
    counts: HashMap<Vec<u8>, u64>,
}

impl Operator for LimitByOp {
    fn name(&self) -> &'static str {
        "LimitBy"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        while let Some(block) = self.input.next()? {
            let keys = self
                .columns
                .iter()
                .map(|&i| block.batch.column(i).clone())
                .collect::<Vec<_>>();
            let mut mask = Vec::with_capacity(block.num_rows());
            for row in 0..block.num_rows() {
                let (_, encoded) = encode_row(&keys, row)?;
                let count = self.counts.entry(encoded).or_insert(0);
                *count += 1;
                mask.push(*count <= self.length);
            }
            let kept = mask.iter().filter(|&&keep| keep).count();
            if kept == 0 {
                continue;
            }
            if kept == mask.len() {
                return Ok(Some(block));
            }
            let filtered = filter_record_batch(&block.batch, &BooleanArray::from(mask))
                .map_err(|e| FqError::Execution(format!("limit by filter failed: {e}")))?;
            return Ok(Some(block.map_batch(filtered)));
        }
        Ok(None)
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        self.input.sort_description()
    }

    fn describe(&self) -> String {
        format!("length={}; columns={}", self.length, self.columns.len())
    }
}

impl BatchStream {
    /// Skips `offset` rows, then returns at most `limit` rows.
    ///
    /// Once satisfied the stream ends and its input is cancelled, unless
    /// `always_read_till_end` asks it to drain the input first (so totals and
    /// extremes cover every row).
    pub fn limit(input: BatchStream, limit: u64, offset: u64, always_read_till_end: bool) -> Self {
        let header = input.schema();
        Self::from_kind(
            StreamKind::Limit(LimitOp {
                input: Box::new(input),
                limit,
                offset,
                pos: 0,
                always_read_till_end,
            }),
            header,
        )
    }

    /// Keeps at most `length` rows per distinct value of `columns`.
    pub fn limit_by(input: BatchStream, length: u64, columns: &[String]) -> Result<Self> {
        let header = input.schema();
        let columns = columns
            .iter()
            .map(|n| {
                header
                    .index_of(n)
                    .map_err(|_| FqError::Planning(format!("LIMIT BY column {n} is not in the block")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_kind(
            StreamKind::LimitBy(LimitByOp {
                input: Box::new(input),
                length,
                columns,
                counts: HashMap::new(),
            }),
            header,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::{Array, Int64Array};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    fn source(parts: Vec<Vec<i64>>) -> BatchStream {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let batches = parts
            .into_iter()
            .map(|v| {
                RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(v))])
                    .expect("batch")
            })
            .collect();
        BatchStream::memory(schema, batches)
    }

    fn values(mut s: BatchStream) -> Vec<i64> {
        s.collect()
            .expect("collect")
            .iter()
            .flat_map(|b| {
                let a = b.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
                (0..a.len()).map(|i| a.value(i)).collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn limit_offset_slices_across_blocks() {
        let parts = vec![vec![1, 2], vec![3, 4, 5], vec![6], vec![7, 8]];
        assert_eq!(values(BatchStream::limit(source(parts.clone()), 3, 1, false)), vec![2, 3, 4]);
        assert_eq!(values(BatchStream::limit(source(parts.clone()), 10, 6, false)), vec![7, 8]);
        assert_eq!(values(BatchStream::limit(source(parts.clone()), 2, 0, false)), vec![1, 2]);
        assert!(values(BatchStream::limit(source(parts.clone()), 0, 0, false)).is_empty());
        assert_eq!(
            values(BatchStream::limit(source(parts.clone()), u64::MAX, 5, false)),
            vec![6, 7, 8]
        );
        assert!(values(BatchStream::limit(source(parts), 3, u64::MAX, false)).is_empty());
    }

    #[test]
    fn satisfied_limit_cancels_or_drains_input() {
        let mut s = BatchStream::limit(source(vec![vec![1, 2], vec![3], vec![4]]), 2, 0, false);
        s.collect().expect("collect");
        assert!(s.is_finished());

        let mut input = source(vec![vec![1, 2], vec![3], vec![4]]);
        input.enable_extremes();
        let mut s = BatchStream::limit(input, 1, 0, true);
        let rows: usize = s.collect().expect("collect").iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 1);
        let extremes = s.extremes().expect("extremes").expect("some");
        let max = extremes.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(max.value(1), 4);
    }

    #[test]
    fn limit_by_keeps_n_rows_per_key() {
        let s = BatchStream::limit_by(source(vec![vec![1, 1, 2], vec![1, 2, 2, 3]]), 2, &["k".to_string()])
            .expect("limit by");
        assert_eq!(values(s), vec![1, 1, 2, 2, 3]);
    }
}
