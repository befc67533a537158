use std::collections::VecDeque;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use fq_common::{FqError, Result};

use crate::actions::ExpressionActions;
use crate::block::Block;
use crate::operators::{Operator, StreamKind};
use crate::sets::HashJoin;
use crate::stream::BatchStream;

/// Right rows of a RIGHT or FULL join that no left row matched.
///
/// Must be read after every stream probing the same join is exhausted.
pub(crate) struct NonJoinedOp {
    join: Arc<HashJoin>,
    join_output: SchemaRef,
    actions: ExpressionActions,
    max_block_size: usize,
    output: Option<VecDeque<RecordBatch>>,
}

impl Operator for NonJoinedOp {
    fn name(&self) -> &'static str {
        "NonJoined"
    }

    fn read(&mut self) -> Result<Option<Block>> {
        if self.output.is_none() {
            let blocks = self.join.non_joined_block(&self.join_output, self.max_block_size)?;
            self.output = Some(blocks.into());
        }
        match self.output.as_mut().and_then(VecDeque::pop_front) {
            Some(batch) => Ok(Some(Block::new(self.actions.execute_after_join(batch)?))),
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        format!("{:?}", self.join.kind())
    }

    fn on_cancel(&mut self, _kill: bool) {
        self.output = Some(VecDeque::new());
    }
}

impl BatchStream {
    /// Stream of the unmatched right rows of the join inside `actions`, in the
    /// layout `actions` produce.
    pub fn non_joined(actions: ExpressionActions, max_block_size: usize) -> Result<Self> {
        let (join, join_output) = actions
            .join()
            .ok_or_else(|| FqError::Planning("non-joined stream without a JOIN".to_string()))?;
        if !join.kind().is_right_or_full() {
            return Err(FqError::Planning(format!(
                "{:?} JOIN has no non-joined rows",
                join.kind()
            )));
        }
        let header = actions.output_schema();
        Ok(Self::from_kind(
            StreamKind::NonJoined(NonJoinedOp {
                join,
                join_output,
                actions,
                max_block_size,
                output: None,
            }),
            header,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use arrow::array::{Array, Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use fq_planner::{Action, ActionList, JoinDescriptor, JoinKind};

    use crate::sets::{PreparedSet, PreparedSets};

    #[test]
    fn right_join_rows_without_partner_follow_the_main_stream() {
        let right_schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("label", DataType::Utf8, false),
        ]));
        let descriptor = JoinDescriptor {
            set_name: "_join1".to_string(),
            kind: JoinKind::Right,
            keys: vec!["k".to_string()],
            right_columns: vec!["label".to_string()],
        };
        let join = Arc::new(HashJoin::new(descriptor.clone(), right_schema.clone()).expect("join"));
        join.insert_block(
            &RecordBatch::try_new(
                right_schema,
                vec![
                    Arc::new(Int64Array::from(vec![1, 2])),
                    Arc::new(StringArray::from(vec!["one", "two"])),
                ],
            )
            .expect("right"),
        )
        .expect("insert");
        join.mark_ready();
        let mut sets = PreparedSets::new();
        sets.insert("_join1", PreparedSet::Join(join));

        let left_schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let mut list = ActionList::new(vec!["k".to_string()]);
        list.add(Action::Join(descriptor));
        let main_actions =
            ExpressionActions::compile(&list, left_schema.clone(), &sets).expect("compile");
        let side_actions = ExpressionActions::compile(&list, left_schema.clone(), &sets).expect("compile");

        let left = RecordBatch::try_new(left_schema.clone(), vec![Arc::new(Int64Array::from(vec![1]))])
            .expect("left");
        let mut main = BatchStream::expression(BatchStream::memory(left_schema, vec![left]), main_actions)
            .expect("expression");
        let mut side = BatchStream::non_joined(side_actions, 1024).expect("non joined");
        assert_eq!(main.schema(), side.schema());

        assert_eq!(main.collect().expect("main")[0].num_rows(), 1);
        let rest = side.collect().expect("side");
        assert_eq!(rest.len(), 1);
        let k = rest[0].column(0).as_any().downcast_ref::<Int64Array>().expect("k");
        let label = rest[0].column(1).as_any().downcast_ref::<StringArray>().expect("label");
        assert_eq!((k.value(0), label.value(0)), (2, "two"));
        assert!(!k.is_null(0));
    }
}
