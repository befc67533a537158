use std::collections::VecDeque;
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use fq_common::{FqError, Result};
use tracing::debug;

use crate::aggregator::{AggregatedData, Aggregator, AggregatorParams};
use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

/// Reads `input` to the end (or until a break-mode GROUP BY cap is hit).
fn aggregate_input(
    input: &mut BatchStream,
    aggregator: &Aggregator,
    data: &mut AggregatedData,
) -> Result<()> {
    while let Some(block) = input.next()? {
        if !aggregator.execute_on_block(data, &block.batch)? {
            break;
        }
    }
    Ok(())
}

fn describe_params(params: &AggregatorParams, final_: bool) -> String {
    let aggregates = params
        .aggregates
        .iter()
        .map(|a| a.column_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "keys=[{}]; aggregates=[{aggregates}]; final={final_}",
        params.keys.join(", ")
    )
}

pub(crate) struct AggregatingOp {
    input: Box<BatchStream>,
    aggregator: Aggregator,
    final_: bool,
    output: Option<VecDeque<Block>>,
}

impl Operator for AggregatingOp {
    fn name(&self) -> &'static str {
        "Aggregating"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.output.is_none() {
            let started = Instant::now();
            let mut data = AggregatedData::new();
            aggregate_input(&mut self.input, &self.aggregator, &mut data)?;
            debug!(
                rows = data.rows(),
                keys = data.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "aggregated"
            );
            let blocks = self.aggregator.convert_to_blocks(data, self.final_)?;
            self.output = Some(blocks.into());
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        Ok(None)
    }

    fn describe(&self) -> String {
        describe_params(self.aggregator.params(), self.final_)
    }
}

/// Aggregates every input into its own table, then merges the tables.
pub(crate) struct ParallelAggregatingOp {
    inputs: Vec<BatchStream>,
    aggregators: Vec<Aggregator>,
    side_inputs: usize,
    final_: bool,
    output: Option<VecDeque<Block>>,
}

impl Operator for ParallelAggregatingOp {
    fn name(&self) -> &'static str {
        "ParallelAggregating"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.output.is_none() {
            let started = Instant::now();
            let mut merged = AggregatedData::new();
            for (input, aggregator) in self.inputs.iter_mut().zip(&self.aggregators) {
                let mut data = AggregatedData::new();
                aggregate_input(input, aggregator, &mut data)?;
                aggregator.merge_data(&mut merged, data)?;
            }
            debug!(
                inputs = self.inputs.len(),
                rows = merged.rows(),
                keys = merged.len(),
                two_level = merged.is_two_level(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "aggregated in parallel"
            );
            let blocks = self.aggregators[0].convert_to_blocks(merged, self.final_)?;
            self.output = Some(blocks.into());
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }

    fn children(&self) -> Vec<&BatchStream> {
        self.inputs.iter().collect()
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        self.inputs.iter_mut().collect()
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        Ok(None)
    }

    fn describe(&self) -> String {
        format!(
            "{}; side_inputs={}",
            describe_params(self.aggregators[0].params(), self.final_),
            self.side_inputs
        )
    }
}

impl BatchStream {
    /// Aggregates raw rows; `final_` selects finalized values over mergeable
    /// partial states.
    pub fn aggregating(input: BatchStream, params: AggregatorParams, final_: bool) -> Result<Self> {
        let aggregator = Aggregator::new(&input.schema(), params)?;
        let header = aggregator.header(final_);
        Ok(Self::from_kind(
            StreamKind::Aggregating(AggregatingOp {
                input: Box::new(input),
                aggregator,
                final_,
                output: None,
            }),
            header,
        ))
    }

    /// Aggregates each main and side stream separately and merges the results.
    pub fn parallel_aggregating(
        main: Vec<BatchStream>,
        side: Vec<BatchStream>,
        params: AggregatorParams,
        final_: bool,
    ) -> Result<Self> {
        let side_inputs = side.len();
        let inputs = main.into_iter().chain(side).collect::<Vec<_>>();
        if inputs.is_empty() {
            return Err(FqError::Planning("aggregation over zero streams".to_string()));
        }
        let aggregators = inputs
            .iter()
            .map(|input| Aggregator::new(&input.schema(), params.clone()))
            .collect::<Result<Vec<_>>>()?;
        let header = aggregators[0].header(final_);
        Ok(Self::from_kind(
            StreamKind::ParallelAggregating(ParallelAggregatingOp {
                inputs,
                aggregators,
                side_inputs,
                final_,
                output: None,
            }),
            header,
        ))
    }
}
