use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray};
use arrow::compute::{cast, filter_record_batch, prep_null_mask_filter};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Schema, SchemaRef};
use fq_common::{FqError, Result};
use fq_planner::SortColumn;

use crate::actions::ExpressionActions;
use crate::block::{Block, batch_with_columns};
use crate::operators::expression::check_input;
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

pub(crate) struct FilterOp {
    input: Box<BatchStream>,
    actions: ExpressionActions,
    column: usize,
    remove_column: bool,
    output: SchemaRef,
}

impl FilterOp {
    fn drop_filter_column(&self, batch: RecordBatch) -> Result<RecordBatch> {
        if !self.remove_column {
            return Ok(batch);
        }
        let rows = batch.num_rows();
        let mut columns = batch.columns().to_vec();
        columns.remove(self.column);
        batch_with_columns(self.output.clone(), columns, rows)
    }
}

impl Operator for FilterOp {
    fn name(&self) -> &'static str {
        "Filter"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        while let Some(block) = self.input.next()? {
            let batch = self.actions.execute(&block.batch)?;
            let mask = filter_mask(batch.column(self.column))?;
            if mask.true_count() == 0 {
                continue;
            }
            let filtered = filter_record_batch(&batch, &mask)
                .map_err(|e| FqError::Execution(format!("filter failed: {e}")))?;
            let filtered = self.drop_filter_column(filtered)?;
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

    fn totals(&self) -> Result<Option<RecordBatch>> {
        match self.input.totals()? {
            Some(totals) => {
                let batch = self.actions.execute(&totals)?;
                self.drop_filter_column(batch).map(Some)
            }
            None => Ok(None),
        }
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        self.input.sort_description()
    }

    fn describe(&self) -> String {
        self.actions
            .output_schema()
            .field(self.column)
            .name()
            .clone()
    }
}

/// Boolean mask of a filter column; NULL counts as false.
pub(crate) fn filter_mask(column: &ArrayRef) -> Result<BooleanArray> {
    let mask = cast(column, &DataType::Boolean)
        .map_err(|e| FqError::Execution(format!("filter column cast failed: {e}")))?;
    let mask = mask
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| FqError::Execution("filter column is not boolean".to_string()))?;
    Ok(if mask.null_count() > 0 {
        prep_null_mask_filter(mask)
    } else {
        mask.clone()
    })
}

impl BatchStream {
    /// Computes `column` with `actions` and keeps the rows where it is true.
    /// NULL counts as false.
    pub fn filter(
        input: BatchStream,
        actions: ExpressionActions,
        column: &str,
        remove_column: bool,
    ) -> Result<Self> {
        check_input(&input, &actions)?;
        let computed = actions.output_schema();
        let idx = computed.index_of(column).map_err(|_| {
            FqError::Planning(format!("filter column {column} is not computed by its actions"))
        })?;
        let output = if remove_column {
            let mut fields = computed.fields().iter().cloned().collect::<Vec<_>>();
            fields.remove(idx);
            Arc::new(Schema::new(fields))
        } else {
            computed
        };
        Ok(Self::from_kind(
            StreamKind::Filter(FilterOp {
                input: Box::new(input),
                actions,
                column: idx,
                remove_column,
                output: output.clone(),
            }),
            output,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow::array::Int64Array;
    use arrow_schema::Field;
    use fq_planner::{ActionList, col, lit_i64};

    use crate::sets::PreparedSets;

    #[test]
    fn filter_keeps_matching_rows_and_drops_its_column() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        let batches = vec![
            RecordBatch::try_new(
                schema.clone(),
                vec![Arc::new(Int64Array::from(vec![Some(1), None, Some(5)]))],
            )
            .expect("b1"),
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![Some(0)]))])
                .expect("b2"),
        ];
        let mut list = ActionList::new(vec!["v".to_string()]);
        let name = list.add_compute(&col("v").gt(lit_i64(2)));
        let actions =
            ExpressionActions::compile(&list, schema.clone(), &PreparedSets::new()).expect("compile");
        let mut s = BatchStream::filter(BatchStream::memory(schema, batches), actions, &name, true)
            .expect("filter");
        assert_eq!(s.schema().fields().len(), 1);
        let out = s.collect().expect("collect");
        assert_eq!(out.len(), 1);
        let v = out[0].column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(v.values().to_vec(), vec![5]);
    }
}
