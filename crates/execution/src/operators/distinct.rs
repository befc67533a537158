//! DISTINCT over a set of columns.
//!
//! The hash variant remembers every key seen. When the input is sorted by a
//! prefix of the distinct columns, the sorted variant only remembers keys
//! within one run of equal prefix values.

use std::collections::HashSet;

use arrow::array::{ArrayRef, BooleanArray};
use arrow::compute::filter_record_batch;
use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;

use crate::block::Block;
use crate::limits::SizeLimits;
use crate::operators::{Operator, StreamKind};
use crate::scalar::encode_row;
use crate::stream::BatchStream;

struct DistinctState {
    columns: Vec<usize>,
    limits: SizeLimits,
    limit_hint: usize,
    seen: HashSet<Vec<u8>>,
    bytes: u64,
    /// Distinct rows let through so far, across cleared sets.
    passed: usize,
    no_more_rows: bool,
}

impl DistinctState {
    fn new(header: &SchemaRef, names: &[String], limits: SizeLimits, limit_hint: usize) -> Result<Self> {
        let columns = if names.is_empty() {
            (0..header.fields().len()).collect()
        } else {
            names
                .iter()
                .map(|n| {
                    header.index_of(n).map_err(|_| {
                        FqError::Planning(format!("DISTINCT column {n} is not in the block"))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self {
            columns,
            limits,
            limit_hint,
            seen: HashSet::new(),
            bytes: 0,
            passed: 0,
            no_more_rows: false,
        })
    }

    fn insert(&mut self, key: Vec<u8>) -> bool {
        let len = key.len() as u64;
        let inserted = self.seen.insert(key);
        if inserted {
            self.bytes += len + 16;
            self.passed += 1;
        }
        inserted
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.bytes = 0;
    }

    /// `Ok(false)` once the set outgrew its limits under a break policy.
    fn check_limits(&mut self) -> Result<bool> {
        if !self
            .limits
            .check(self.seen.len() as u64, self.bytes, "DISTINCT")?
        {
            return Ok(false);
        }
        if self.limit_hint > 0 && self.passed >= self.limit_hint {
            self.no_more_rows = true;
        }
        Ok(true)
    }

    fn describe(&self) -> String {
        if self.limit_hint > 0 {
            format!("columns={}; limit={}", self.columns.len(), self.limit_hint)
        } else {
            format!("columns={}", self.columns.len())
        }
    }
}

pub(crate) struct DistinctOp {
    input: Box<BatchStream>,
    state: DistinctState,
}

impl Operator for DistinctOp {
    fn name(&self) -> &'static str {
        "Distinct"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.state.no_more_rows {
            return Ok(None);
        }
        while let Some(block) = self.input.next()? {
            let keys = key_columns(&block, &self.state.columns);
            let mut mask = Vec::with_capacity(block.num_rows());
            for row in 0..block.num_rows() {
                let (_, encoded) = encode_row(&keys, row)?;
                mask.push(self.state.insert(encoded));
            }
            if !self.state.check_limits()? {
                return Ok(None);
            }
            if let Some(block) = apply_mask(block, mask)? {
                return Ok(Some(block));
            }
            if self.state.no_more_rows {
                return Ok(None);
            }
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
        self.state.describe()
    }
}

pub(crate) struct DistinctSortedOp {
    input: Box<BatchStream>,
    state: DistinctState,
    clearing: Vec<usize>,
    prev_prefix: Option<Vec<u8>>,
}

impl Operator for DistinctSortedOp {
    fn name(&self) -> &'static str {
        "DistinctSorted"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.state.no_more_rows {
            return Ok(None);
        }
        while let Some(block) = self.input.next()? {
            let keys = key_columns(&block, &self.state.columns);
            let prefix_keys = key_columns(&block, &self.clearing);
            let mut mask = Vec::with_capacity(block.num_rows());
            for row in 0..block.num_rows() {
                let (_, prefix) = encode_row(&prefix_keys, row)?;
                if self.prev_prefix.as_ref() != Some(&prefix) {
                    self.state.clear();
                    self.prev_prefix = Some(prefix);
                }
                let (_, encoded) = encode_row(&keys, row)?;
                mask.push(self.state.insert(encoded));
            }
            if !self.state.check_limits()? {
                return Ok(None);
            }
            if let Some(block) = apply_mask(block, mask)? {
                return Ok(Some(block));
            }
            if self.state.no_more_rows {
                return Ok(None);
            }
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
        format!("{}; clearing={}", self.state.describe(), self.clearing.len())
    }
}

fn key_columns(block: &Block, columns: &[usize]) -> Vec<ArrayRef> {
    columns.iter().map(|&i| block.batch.column(i).clone()).collect()
}

fn apply_mask(block: Block, mask: Vec<bool>) -> Result<Option<Block>> {
    if !mask.iter().any(|&keep| keep) {
        return Ok(None);
    }
    if mask.iter().all(|&keep| keep) {
        return Ok(Some(block));
    }
    let filtered = filter_record_batch(&block.batch, &BooleanArray::from(mask))
        .map_err(|e| FqError::Execution(format!("distinct filter failed: {e}")))?;
    Ok(Some(block.map_batch(filtered)))
}

impl BatchStream {
    /// Keeps the first row of every distinct value of `columns` (all columns
    /// when empty). Uses the sorted variant when the input's sort order starts
    /// with some of the distinct columns. With `limit_hint` the stream ends
    /// after the block in which that many distinct rows were reached.
    pub fn distinct(
        input: BatchStream,
        columns: &[String],
        limits: SizeLimits,
        limit_hint: usize,
    ) -> Result<Self> {
        let header = input.schema();
        let state = DistinctState::new(&header, columns, limits, limit_hint)?;

        let mut clearing = Vec::new();
        if let Some(description) = input.sort_description() {
            for column in description {
                match header.index_of(&column.name) {
                    Ok(idx) if state.columns.contains(&idx) => clearing.push(idx),
                    _ => break,
                }
            }
        }
        let kind = if clearing.is_empty() {
            StreamKind::Distinct(DistinctOp {
                input: Box::new(input),
                state,
            })
        } else {
            StreamKind::DistinctSorted(DistinctSortedOp {
                input: Box::new(input),
                state,
                clearing,
                prev_prefix: None,
            })
        };
        Ok(Self::from_kind(kind, header))
    }
}

/// Encoded key of a whole row, for tests comparing row sets.
#[cfg(test)]
pub(crate) fn row_keys(batches: &[arrow::record_batch::RecordBatch]) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for b in batches {
        for row in 0..b.num_rows() {
            let (_, encoded) = encode_row(b.columns(), row)?;
            out.push(encoded);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use fq_common::OverflowMode;

    use crate::operators::MergeSortParams;

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

    fn run(mut s: BatchStream) -> Vec<RecordBatch> {
        s.collect().expect("collect")
    }

    #[test]
    fn distinct_is_idempotent() {
        let once = run(
            BatchStream::distinct(
                source(vec![vec![1, 2, 1], vec![3, 2, 3]]),
                &[],
                SizeLimits::default(),
                0,
            )
            .expect("distinct"),
        );
        let schema = once[0].schema();
        let twice = run(
            BatchStream::distinct(
                BatchStream::memory(schema, once.clone()),
                &[],
                SizeLimits::default(),
                0,
            )
            .expect("distinct"),
        );
        assert_eq!(row_keys(&once).expect("keys").len(), 3);
        assert_eq!(row_keys(&once).expect("keys"), row_keys(&twice).expect("keys"));
    }

    #[test]
    fn sorted_input_uses_the_sorted_variant() {
        let description = vec![SortColumn {
            name: "k".to_string(),
            descending: false,
            nulls_first: false,
        }];
        let sorted = BatchStream::merge_sorting(
            BatchStream::partial_sorting(source(vec![vec![2, 1, 2], vec![1, 3]]), description.clone(), 0),
            MergeSortParams {
                description,
                max_block_size: 100,
                limit: 0,
                max_bytes_before_external_sort: 0,
                tmp_path: std::env::temp_dir(),
            },
        )
        .expect("sort");
        let s = BatchStream::distinct(sorted, &[], SizeLimits::default(), 0).expect("distinct");
        assert_eq!(s.name(), "DistinctSorted");
        let out = run(s);
        let v = out[0].column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(v.values().to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn distinct_limits_break_or_throw() {
        let brk = SizeLimits::new(2, 0, OverflowMode::Break);
        let out = run(
            BatchStream::distinct(source(vec![vec![1, 2], vec![3, 4]]), &[], brk, 0)
                .expect("distinct"),
        );
        assert_eq!(out.len(), 1);

        let throw = SizeLimits::new(2, 0, OverflowMode::Throw);
        let mut s = BatchStream::distinct(source(vec![vec![1, 2, 3]]), &[], throw, 0)
            .expect("distinct");
        assert!(matches!(s.next(), Err(FqError::LimitExceeded(_))));
    }

    #[test]
    fn limit_hint_ends_after_the_block_reaching_it() {
        let out = run(
            BatchStream::distinct(source(vec![vec![1, 2, 3], vec![4]]), &[], SizeLimits::default(), 2)
                .expect("distinct"),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].num_rows(), 3);
    }
}
