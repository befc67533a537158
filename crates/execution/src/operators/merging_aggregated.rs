//! Merging of partial aggregation states produced by other aggregators.

use std::collections::{BTreeMap, VecDeque};

use arrow::record_batch::RecordBatch;
use fq_common::{FqError, Result};
use tracing::debug;

use crate::aggregator::{AggregatedData, Aggregator, AggregatorParams};
use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

/// Merges every block of one input in memory.
pub(crate) struct MergingAggregatedOp {
    input: Box<BatchStream>,
    aggregator: Aggregator,
    final_: bool,
    output: Option<VecDeque<Block>>,
}

impl Operator for MergingAggregatedOp {
    fn name(&self) -> &'static str {
        "MergingAggregated"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.output.is_none() {
            let mut data = AggregatedData::new();
            let mut blocks = 0usize;
            while let Some(block) = self.input.next()? {
                self.aggregator.merge_block(&mut data, &block)?;
                blocks += 1;
            }
            debug!(blocks, keys = data.len(), "merged aggregated blocks");
            self.output = Some(self.aggregator.convert_to_blocks(data, self.final_)?.into());
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn describe(&self) -> String {
        format!("final={}", self.final_)
    }
}

struct BucketedInput {
    stream: BatchStream,
    /// Next two-level block not merged yet.
    lookahead: Option<Block>,
    /// Buckets of a single-level input, split after reading it fully.
    split: BTreeMap<i32, Vec<RecordBatch>>,
}

impl BucketedInput {
    fn next_bucket(&self) -> Option<i32> {
        let split = self.split.keys().next().copied();
        let ahead = self.lookahead.as_ref().map(|b| b.info.bucket_num);
        match (split, ahead) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn advance(&mut self) -> Result<()> {
        self.lookahead = None;
        while let Some(block) = self.stream.next()? {
            if block.num_rows() == 0 {
                continue;
            }
            if block.info.is_overflows {
                return Err(FqError::Execution(
                    "overflow row arrived after bucketed aggregation data".to_string(),
                ));
            }
            self.lookahead = Some(block);
            break;
        }
        Ok(())
    }
}

/// Merges two-level partial states bucket by bucket, so only one bucket of
/// every input is held in memory at a time. Single-level inputs are read
/// fully and split into buckets.
pub(crate) struct MemoryEfficientOp {
    inputs: Vec<BucketedInput>,
    aggregator: Aggregator,
    final_: bool,
    started: bool,
    emitted: bool,
    output: VecDeque<Block>,
}

impl MemoryEfficientOp {
    fn start(&mut self) -> Result<()> {
        let mut overflow = AggregatedData::new();
        let mut has_overflow = false;
        for input in &mut self.inputs {
            while let Some(block) = input.stream.next()? {
                if block.info.is_overflows {
                    self.aggregator.merge_block(&mut overflow, &block)?;
                    has_overflow = true;
                    continue;
                }
                if block.num_rows() == 0 {
                    continue;
                }
                if block.info.bucket_num >= 0 {
                    input.lookahead = Some(block);
                    break;
                }
                let mut pending = Some(block);
                while let Some(block) = pending {
                    for (bucket, batch) in self.aggregator.split_by_bucket(&block.batch)? {
                        input.split.entry(bucket).or_default().push(batch);
                    }
                    pending = input.stream.next()?;
                }
                break;
            }
        }
        if has_overflow && !self.aggregator.params().keys.is_empty() {
            self.output
                .extend(self.aggregator.convert_to_blocks(overflow, self.final_)?);
        }
        Ok(())
    }

    fn merge_bucket(&mut self, bucket: i32) -> Result<()> {
        let mut data = AggregatedData::new();
        for input in &mut self.inputs {
            for batch in input.split.remove(&bucket).unwrap_or_default() {
                self.aggregator.merge_block(&mut data, &Block::new(batch))?;
            }
            while input
                .lookahead
                .as_ref()
                .is_some_and(|b| b.info.bucket_num == bucket)
            {
                if let Some(block) = input.lookahead.take() {
                    self.aggregator.merge_block(&mut data, &block)?;
                }
                input.advance()?;
            }
        }
        if data.len() == 0 {
            return Ok(());
        }
        for mut block in self.aggregator.convert_to_blocks(data, self.final_)? {
            block.info.bucket_num = bucket;
            self.output.push_back(block);
        }
        self.emitted = true;
        Ok(())
    }
}

impl Operator for MemoryEfficientOp {
    fn name(&self) -> &'static str {
        "MergingAggregatedMemoryEfficient"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if !self.started {
            self.started = true;
            self.start()?;
        }
        loop {
            if let Some(block) = self.output.pop_front() {
                return Ok(Some(block));
            }
            match self.inputs.iter().filter_map(BucketedInput::next_bucket).min() {
                Some(bucket) => self.merge_bucket(bucket)?,
                None => {
                    if self.emitted || !self.aggregator.params().keys.is_empty() {
                        return Ok(None);
                    }
                    // Aggregation without keys still returns its single row.
                    self.emitted = true;
                    self.output = self
                        .aggregator
                        .convert_to_blocks(AggregatedData::new(), self.final_)?
                        .into();
                }
            }
        }
    }

    fn children(&self) -> Vec<&BatchStream> {
        self.inputs.iter().map(|i| &i.stream).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        self.inputs.iter_mut().map(|i| &mut i.stream).collect()
    }

    fn describe(&self) -> String {
        format!("inputs={}; final={}", self.inputs.len(), self.final_)
    }

    fn on_cancel(&mut self, _kill: bool) {
        self.output.clear();
        for input in &mut self.inputs {
            input.lookahead = None;
            input.split.clear();
        }
    }
}

impl BatchStream {
    /// Merges partial aggregation states of one input; `params` come from
    /// [`AggregatorParams::for_merge`].
    pub fn merging_aggregated(
        input: BatchStream,
        params: AggregatorParams,
        final_: bool,
    ) -> Result<Self> {
        let aggregator = Aggregator::for_merge(&input.schema(), params)?;
        let header = aggregator.header(final_);
        Ok(Self::from_kind(
            StreamKind::MergingAggregated(MergingAggregatedOp {
                input: Box::new(input),
                aggregator,
                final_,
                output: None,
            }),
            header,
        ))
    }

    /// Bucket-by-bucket merge over still-parallel inputs of partial states.
    pub fn merging_aggregated_memory_efficient(
        inputs: Vec<BatchStream>,
        params: AggregatorParams,
        final_: bool,
    ) -> Result<Self> {
        let first = inputs
            .first()
            .map(BatchStream::schema)
            .ok_or_else(|| FqError::Planning("merge of zero aggregated streams".to_string()))?;
        let aggregator = Aggregator::for_merge(&first, params)?;
        let header = aggregator.header(final_);
        let inputs = inputs
            .into_iter()
            .map(|stream| BucketedInput {
                stream,
                lookahead: None,
                split: BTreeMap::new(),
            })
            .collect();
        Ok(Self::from_kind(
            StreamKind::MergingAggregatedMemoryEfficient(MemoryEfficientOp {
                inputs,
                aggregator,
                final_,
                started: false,
                emitted: false,
                output: VecDeque::new(),
            }),
            header,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use arrow::array::{Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use fq_planner::{AggFunc, AggregateDescription};

    fn source(keys: Vec<i64>) -> BatchStream {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Int64, false),
        ]));
        let values = keys.iter().map(|k| k * 10).collect::<Vec<_>>();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(keys)), Arc::new(Int64Array::from(values))],
        )
        .expect("batch");
        BatchStream::memory(schema, vec![batch])
    }

    fn params(two_level: u64) -> AggregatorParams {
        let mut p = AggregatorParams::for_merge(
            vec!["k".to_string()],
            vec![
                AggregateDescription {
                    func: AggFunc::Count,
                    argument: None,
                    column_name: "count()".to_string(),
                },
                AggregateDescription {
                    func: AggFunc::Sum,
                    argument: Some("v".to_string()),
                    column_name: "sum(v)".to_string(),
                },
            ],
            false,
        );
        p.group_by_two_level_threshold = two_level;
        p
    }

    fn merge_params() -> AggregatorParams {
        let p = params(0);
        AggregatorParams::for_merge(p.keys, p.aggregates, false)
    }

    fn groups(mut s: BatchStream) -> BTreeMap<i64, (i64, i64)> {
        let mut out = BTreeMap::new();
        for batch in s.collect().expect("collect") {
            let col = |i: usize| {
                batch
                    .column(i)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("i64")
                    .clone()
            };
            let (k, c, v) = (col(0), col(1), col(2));
            for row in 0..k.len() {
                assert!(out.insert(k.value(row), (c.value(row), v.value(row))).is_none());
            }
        }
        out
    }

    fn inputs() -> Vec<Vec<i64>> {
        vec![vec![1, 2, 3, 1], vec![2, 2, 4], vec![5, 1]]
    }

    #[test]
    fn parallel_two_level_equals_single_aggregation() {
        let single = groups(
            BatchStream::aggregating(
                BatchStream::concat(inputs().into_iter().map(source).collect()).expect("concat"),
                params(0),
                true,
            )
            .expect("agg"),
        );
        let parallel = groups(
            BatchStream::parallel_aggregating(
                inputs().into_iter().map(source).collect(),
                vec![],
                params(1),
                true,
            )
            .expect("parallel"),
        );
        assert_eq!(single, parallel);
        assert_eq!(single.get(&2), Some(&(3, 60)));
    }

    #[test]
    fn both_merge_strategies_agree() {
        let partials = |two_level: u64| {
            inputs()
                .into_iter()
                .map(|keys| BatchStream::aggregating(source(keys), params(two_level), false).expect("partial"))
                .collect::<Vec<_>>()
        };
        let in_memory = groups(
            BatchStream::merging_aggregated(
                BatchStream::union(partials(0)).expect("union"),
                merge_params(),
                true,
            )
            .expect("merge"),
        );
        let bucketed = BatchStream::merging_aggregated_memory_efficient(partials(1), merge_params(), true)
            .expect("memory efficient");
        let mut mixed_inputs = partials(1);
        mixed_inputs.extend(partials(0));
        let mixed = groups(
            BatchStream::merging_aggregated_memory_efficient(mixed_inputs, merge_params(), true)
                .expect("mixed"),
        );
        assert_eq!(in_memory, groups(bucketed));
        assert_eq!(in_memory.get(&1), Some(&(3, 30)));
        assert_eq!(mixed.get(&1), Some(&(6, 60)));
    }

    #[test]
    fn memory_efficient_merge_without_keys_returns_one_row() {
        let mut p = merge_params();
        p.keys.clear();
        let mut partial_params = params(0);
        partial_params.keys.clear();
        let empty = BatchStream::aggregating(BatchStream::null(source(vec![]).schema()), partial_params, false)
            .expect("partial");
        let mut s = BatchStream::merging_aggregated_memory_efficient(vec![empty], p, true).expect("merge");
        let out = s.collect().expect("collect");
        assert_eq!(out.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
    }
}
