use arrow::record_batch::RecordBatch;
use fq_common::{FqError, Result};
use fq_planner::SortColumn;

use crate::actions::ExpressionActions;
use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::stream::BatchStream;

pub(crate) struct ExpressionOp {
    input: Box<BatchStream>,
    actions: ExpressionActions,
}

impl Operator for ExpressionOp {
    fn name(&self) -> &'static str {
        "Expression"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        match self.input.next()? {
            Some(block) => {
                let batch = self.actions.execute(&block.batch)?;
                Ok(Some(block.map_batch(batch)))
            }
            None => Ok(None),
        }
    }

    fn children(&self) -> Vec<&BatchStream> {
        vec![&self.input]
    }

    fn children_mut(&mut self) -> Vec<&mut BatchStream> {
        vec![&mut self.input]
    }

    fn totals(&self) -> Result<Option<RecordBatch>> {
        // Totals never probe a join: the right side already contributed rows.
        if self.actions.has_join() {
            return Ok(None);
        }
        match self.input.totals()? {
            Some(totals) => self.actions.execute(&totals).map(Some),
            None => Ok(None),
        }
    }

    fn sort_description(&self) -> Option<Vec<SortColumn>> {
        let description = self.input.sort_description()?;
        let output = self.actions.output_schema();
        description
            .iter()
            .all(|c| output.index_of(&c.name).is_ok())
            .then_some(description)
    }

    fn describe(&self) -> String {
        let names = self
            .actions
            .output_schema()
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!("-> [{names}]")
    }
}

impl BatchStream {
    /// Applies compiled actions to every block and to the totals row.
    pub fn expression(input: BatchStream, actions: ExpressionActions) -> Result<Self> {
        check_input(&input, &actions)?;
        let header = actions.output_schema();
        Ok(Self::from_kind(
            StreamKind::Expression(ExpressionOp {
                input: Box::new(input),
                actions,
            }),
            header,
        ))
    }
}

/// Actions are positional: the stream must deliver the columns they were
/// compiled against, in the same order.
pub(crate) fn check_input(input: &BatchStream, actions: &ExpressionActions) -> Result<()> {
    let have = input.schema();
    let want = actions.input_schema();
    let same = have.fields().len() == want.fields().len()
        && have
            .fields()
            .iter()
            .zip(want.fields())
            .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type());
    if same {
        return Ok(());
    }
    Err(FqError::Planning(format!(
        "actions compiled for [{}] applied to a stream of [{}]",
        names(&want),
        names(&have)
    )))
}

fn names(schema: &arrow_schema::SchemaRef) -> String {
    schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use fq_planner::{Action, ActionList, col, lit_i64};

    use crate::sets::PreparedSets;

    #[test]
    fn expression_maps_blocks_and_checks_the_header() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![1, 2]))])
                .expect("batch");
        let mut list = ActionList::new(vec!["a".to_string()]);
        let name = list.add_compute(&col("a").plus(lit_i64(10)));
        list.add(Action::Retain(vec![name]));
        let actions =
            ExpressionActions::compile(&list, schema.clone(), &PreparedSets::new()).expect("compile");

        let mut s = BatchStream::expression(BatchStream::memory(schema, vec![batch]), actions)
            .expect("stream");
        assert_eq!(s.schema().fields().len(), 1);
        let out = s.collect().expect("collect");
        let v = out[0].column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(v.values().to_vec(), vec![11, 12]);

        let other = Arc::new(Schema::new(vec![Field::new("b", DataType::Int64, false)]));
        let actions = ExpressionActions::compile(
            &ActionList::new(vec!["a".to_string()]),
            Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)])),
            &PreparedSets::new(),
        )
        .expect("compile");
        assert!(BatchStream::expression(BatchStream::null(other), actions).is_err());
    }
}
