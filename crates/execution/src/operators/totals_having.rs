//! Finalization of aggregated rows with HAVING, and the WITH TOTALS row.

use std::sync::Arc;

use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use fq_common::{FqError, Result, TotalsMode};
use fq_planner::FilterStep;
use tracing::debug;

use crate::actions::ExpressionActions;
use crate::aggregator::{AggregateStates, Aggregator, AggregatorParams};
use crate::block::{Block, batch_with_columns};
use crate::operators::filter::filter_mask;
use crate::operators::{Operator, StreamKind};
use crate::scalar::default_array;
use crate::sets::PreparedSets;
use crate::stream::BatchStream;

/// Parameters of [`BatchStream::totals_having`].
#[derive(Debug, Clone)]
pub struct TotalsHavingParams {
    /// Keys and aggregates of a partial-state input; `None` when the input is
    /// not aggregated and passes through unchanged.
    pub aggregation: Option<AggregatorParams>,
    /// HAVING, compiled against the finalized layout.
    pub having: Option<FilterStep>,
    /// The input may start with an `is_overflows` block.
    pub overflow_row: bool,
    pub totals_mode: TotalsMode,
    pub totals_auto_threshold: f64,
}

struct Having {
    actions: ExpressionActions,
    column: usize,
    remove_column: bool,
}

impl Having {
    fn apply_projection(&self, batch: RecordBatch, output: &SchemaRef) -> Result<RecordBatch> {
        if !self.remove_column {
            return Ok(batch);
        }
        let rows = batch.num_rows();
        let mut columns = batch.columns().to_vec();
        columns.remove(self.column);
        batch_with_columns(output.clone(), columns, rows)
    }
}

pub(crate) struct TotalsHavingOp {
    input: Box<BatchStream>,
    aggregator: Option<Aggregator>,
    having: Option<Having>,
    overflow_row: bool,
    totals_mode: TotalsMode,
    auto_threshold: f64,
    /// Postponed overflow row, partial layout.
    overflow: Option<RecordBatch>,
    totals: Option<AggregateStates>,
    total_keys: u64,
    passed_keys: u64,
    header: SchemaRef,
}

impl TotalsHavingOp {
    fn include_overflow(&self) -> bool {
        match self.totals_mode {
            TotalsMode::BeforeHaving | TotalsMode::AfterHavingInclusive => true,
            TotalsMode::AfterHavingExclusive => false,
            // NaN (no keys at all) compares false.
            TotalsMode::AfterHavingAuto => {
                self.passed_keys as f64 / self.total_keys as f64 >= self.auto_threshold
            }
        }
    }

    fn totals_batch(&self) -> Result<RecordBatch> {
        let Some(aggregator) = &self.aggregator else {
            let columns = self
                .header
                .fields()
                .iter()
                .map(|f| default_array(f.data_type(), 1))
                .collect::<Result<Vec<_>>>()?;
            return batch_with_columns(self.header.clone(), columns, 1);
        };
        let mut states = self
            .totals
            .clone()
            .unwrap_or_else(|| aggregator.new_states());
        if let Some(overflow) = &self.overflow {
            if self.include_overflow() {
                aggregator.accumulate_rows(&mut states, overflow, None)?;
            }
        }
        let row = aggregator.totals_row(&states)?;
        match &self.having {
            Some(having) => {
                let computed = having.actions.execute(&row)?;
                having.apply_projection(computed, &self.header)
            }
            None => Ok(row),
        }
    }
}

impl Operator for TotalsHavingOp {
    fn name(&self) -> &'static str {
        "TotalsHaving"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        while let Some(block) = self.input.next()? {
            if self.overflow_row && block.info.is_overflows {
                self.overflow = Some(block.batch);
                continue;
            }
            let Some(aggregator) = &self.aggregator else {
                self.total_keys += block.num_rows() as u64;
                self.passed_keys += block.num_rows() as u64;
                return Ok(Some(block));
            };
            let totals = self.totals.get_or_insert_with(|| aggregator.new_states());
            let finalized = aggregator.finalize_block(&block.batch)?;
            self.total_keys += finalized.num_rows() as u64;

            let out = match &self.having {
                None => {
                    aggregator.accumulate_rows(totals, &block.batch, None)?;
                    finalized
                }
                Some(having) => {
                    let computed = having.actions.execute(&finalized)?;
                    let mask = filter_mask(computed.column(having.column))?;
                    if self.totals_mode == TotalsMode::BeforeHaving {
                        aggregator.accumulate_rows(totals, &block.batch, None)?;
                    } else {
                        aggregator.accumulate_rows(totals, &block.batch, Some(&mask))?;
                    }
                    let filtered = filter_record_batch(&computed, &mask)
                        .map_err(|e| FqError::Execution(format!("HAVING filter failed: {e}")))?;
                    having.apply_projection(filtered, &self.header)?
                }
            };
            if out.num_rows() == 0 {
                continue;
            }
            self.passed_keys += out.num_rows() as u64;
            return Ok(Some(Block::new(out)));
        }
        debug!(
            total_keys = self.total_keys,
            passed_keys = self.passed_keys,
            "totals and having finished"
        );
        Ok(None)
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        self.totals_batch().map(Some)
    }

    fn describe(&self) -> String {
        let mode = match self.totals_mode {
            TotalsMode::BeforeHaving => "before_having",
            TotalsMode::AfterHavingInclusive => "after_having_inclusive",
            TotalsMode::AfterHavingExclusive => "after_having_exclusive",
            TotalsMode::AfterHavingAuto => "after_having_auto",
        };
        let mut out = format!("mode={mode}");
        if self.having.is_some() {
            out.push_str("; having");
        }
        if self.overflow_row {
            out.push_str("; overflow_row");
        }
        out
    }
}

impl BatchStream {
    /// Finalizes partial aggregation states, applies HAVING and computes the
    /// totals row reported by [`BatchStream::totals`] once the input ends.
    ///
    /// The input must be a single stream: totals cover every row it returns.
    pub fn totals_having(
        input: BatchStream,
        params: TotalsHavingParams,
        sets: &PreparedSets,
    ) -> Result<Self> {
        let aggregator = params
            .aggregation
            .map(|p| Aggregator::for_merge(&input.schema(), p))
            .transpose()?;
        let finalized = match &aggregator {
            Some(a) => a.header(true),
            None => input.schema(),
        };
        let (having, header) = match params.having {
            Some(step) => {
                if aggregator.is_none() {
                    return Err(FqError::Planning(
                        "HAVING over a stream without aggregation".to_string(),
                    ));
                }
                let actions = ExpressionActions::compile(&step.actions, finalized, sets)?;
                let computed = actions.output_schema();
                let column = computed.index_of(&step.column).map_err(|_| {
                    FqError::Planning(format!(
                        "HAVING column {} is not computed by its actions",
                        step.column
                    ))
                })?;
                let header = if step.remove_column {
                    let mut fields = computed.fields().iter().cloned().collect::<Vec<_>>();
                    fields.remove(column);
                    Arc::new(Schema::new(fields))
                } else {
                    computed
                };
                let having = Having {
                    actions,
                    column,
                    remove_column: step.remove_column,
                };
                (Some(having), header)
            }
            None => (None, finalized),
        };
        Ok(Self::from_kind(
            StreamKind::TotalsHaving(TotalsHavingOp {
                input: Box::new(input),
                aggregator,
                having,
                overflow_row: params.overflow_row,
                totals_mode: params.totals_mode,
                auto_threshold: params.totals_auto_threshold,
                overflow: None,
                totals: None,
                total_keys: 0,
                passed_keys: 0,
                header: header.clone(),
            }),
            header,
        ))
    }
}
