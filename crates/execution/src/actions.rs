//! Compiled form of a planner [`ActionList`] bound to a concrete input schema.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow_schema::{Field, Schema, SchemaRef};
use fq_common::{FqError, Result};
use fq_planner::{Action, ActionList};

use crate::block::batch_with_columns;
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::sets::{HashJoin, PreparedSets};

enum Step {
    Compute(Arc<dyn PhysicalExpr>),
    Join(Arc<HashJoin>),
    Select(Vec<usize>),
}

struct CompiledStep {
    step: Step,
    output: SchemaRef,
}

/// Executable actions: each step knows its output schema up front, so the
/// header of a stream is available without reading data.
pub struct ExpressionActions {
    input: SchemaRef,
    steps: Vec<CompiledStep>,
    join_step: Option<usize>,
}

impl std::fmt::Debug for ExpressionActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpressionActions")
            .field("input", &self.input)
            .field("output", &self.output_schema())
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl ExpressionActions {
    pub fn compile(list: &ActionList, input: SchemaRef, sets: &PreparedSets) -> Result<Self> {
        let mut steps = Vec::with_capacity(list.actions.len());
        let mut join_step = None;
        let mut schema = input.clone();
        for action in &list.actions {
            let (step, output) = match action {
                Action::Compute { expr, name } => {
                    let compiled = compile_expr(expr, &schema, sets)?;
                    let mut fields = schema.fields().iter().cloned().collect::<Vec<_>>();
                    fields.push(Arc::new(Field::new(name, compiled.data_type(), true)));
                    (Step::Compute(compiled), Arc::new(Schema::new(fields)))
                }
                Action::Join(descriptor) => {
                    let join = sets.join(&descriptor.set_name)?;
                    let output = join.output_schema(&schema)?;
                    join_step = Some(steps.len());
                    (Step::Join(join), output)
                }
                Action::Retain(columns) => {
                    let pairs = columns
                        .iter()
                        .map(|c| (c.clone(), c.clone()))
                        .collect::<Vec<_>>();
                    select(&schema, &pairs)?
                }
                Action::Project(pairs) => select(&schema, pairs)?,
            };
            steps.push(CompiledStep { step, output: output.clone() });
            schema = output;
        }
        Ok(Self {
            input,
            steps,
            join_step,
        })
    }

    pub fn input_schema(&self) -> SchemaRef {
        self.input.clone()
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.steps
            .last()
            .map(|s| s.output.clone())
            .unwrap_or_else(|| self.input.clone())
    }

    pub fn has_join(&self) -> bool {
        self.join_step.is_some()
    }

    /// The join these actions probe, with the schema of its output.
    pub fn join(&self) -> Option<(Arc<HashJoin>, SchemaRef)> {
        let idx = self.join_step?;
        match &self.steps[idx].step {
            Step::Join(j) => Some((j.clone(), self.steps[idx].output.clone())),
            _ => None,
        }
    }

    pub fn execute(&self, batch: &RecordBatch) -> Result<RecordBatch> {
        self.execute_from(0, batch.clone())
    }

    /// Runs the steps after the join on a batch already in the join's output
    /// layout (rows of the right side that found no partner).
    pub fn execute_after_join(&self, batch: RecordBatch) -> Result<RecordBatch> {
        let start = self.join_step.map(|i| i + 1).unwrap_or(0);
        self.execute_from(start, batch)
    }

    fn execute_from(&self, start: usize, mut batch: RecordBatch) -> Result<RecordBatch> {
        for step in &self.steps[start..] {
            let rows = batch.num_rows();
            batch = match &step.step {
                Step::Compute(expr) => {
                    let value = expr.evaluate(&batch)?;
                    let mut columns = batch.columns().to_vec();
                    columns.push(value);
                    batch_with_columns(step.output.clone(), columns, rows)?
                }
                Step::Join(join) => {
                    if !join.is_ready() {
                        return Err(FqError::Execution(
                            "JOIN is probed before its right side was built".to_string(),
                        ));
                    }
                    join.join_block(&batch, &step.output)?
                }
                Step::Select(indices) => {
                    let columns = indices.iter().map(|&i| batch.column(i).clone()).collect();
                    batch_with_columns(step.output.clone(), columns, rows)?
                }
            };
        }
        Ok(batch)
    }
}

fn select(schema: &SchemaRef, pairs: &[(String, String)]) -> Result<(Step, SchemaRef)> {
    let mut indices = Vec::with_capacity(pairs.len());
    let mut fields = Vec::with_capacity(pairs.len());
    for (src, alias) in pairs {
        let idx = schema.index_of(src).map_err(|_| {
            FqError::Planning(format!(
                "not found column {src} in block, there are only columns: {}",
                schema
                    .fields()
                    .iter()
                    .map(|f| f.name().as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        let f = schema.field(idx);
        indices.push(idx);
        fields.push(Field::new(alias, f.data_type().clone(), f.is_nullable()));
    }
    Ok((Step::Select(indices), Arc::new(Schema::new(fields))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array};
    use arrow_schema::DataType;
    use fq_planner::{col, lit_i64};

    #[test]
    fn compute_then_project_renames_in_order() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(Int64Array::from(vec![5, 6])),
            ],
        )
        .expect("batch");

        let mut list = ActionList::new(vec!["a".to_string(), "b".to_string()]);
        let sum = list.add_compute(&col("a").plus(lit_i64(1)));
        list.add(Action::Project(vec![
            (sum, "x".to_string()),
            ("b".to_string(), "b".to_string()),
        ]));
        let actions =
            ExpressionActions::compile(&list, schema, &PreparedSets::new()).expect("compile");
        assert_eq!(actions.output_schema().field(0).name(), "x");
        let out = actions.execute(&batch).expect("execute");
        assert_eq!(out.num_columns(), 2);
        let x = out.column(0).as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(x.values().to_vec(), vec![2, 3]);
    }

    #[test]
    fn retain_of_missing_column_fails_at_compile_time() {
        let schema = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, false)]));
        let mut list = ActionList::new(vec!["a".to_string()]);
        list.add(Action::Retain(vec!["nope".to_string()]));
        let err = ExpressionActions::compile(&list, schema, &PreparedSets::new())
            .expect_err("missing");
        assert!(matches!(err, FqError::Planning(_)));
    }
}
