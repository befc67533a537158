//! Name-based action descriptors and the expression chain that trims them.
//!
//! An [`ActionList`] is the type-free description of one pipeline step's
//! expression work. Execution compiles it against the actual stream header.
//! [`ExpressionChain::finalize`] runs the backward liveness pass so every step
//! only computes, and only keeps, what later steps read.

use std::collections::HashSet;

use fq_common::{FqError, Result};
use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::query::JoinKind;

/// Hash join against a materialized right side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDescriptor {
    /// Name under which the right side is registered among prepared sets.
    pub set_name: String,
    pub kind: JoinKind,
    pub keys: Vec<String>,
    /// Right-side columns appended to every left row (keys excluded).
    pub right_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Evaluates `expr` and appends it as column `name`.
    Compute { expr: Expr, name: String },
    Join(JoinDescriptor),
    /// Outputs exactly `(source, alias)` pairs in order.
    Project(Vec<(String, String)>),
    /// Outputs exactly these columns, in this order.
    Retain(Vec<String>),
}

/// Ordered actions over a known set of input column names.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionList {
    pub input_columns: Vec<String>,
    pub actions: Vec<Action>,
}

impl ActionList {
    pub fn new(input_columns: Vec<String>) -> Self {
        Self {
            input_columns,
            actions: Vec::new(),
        }
    }

    /// Adds a computation for `expr` unless a column with its name already exists.
    /// Returns the column name.
    pub fn add_compute(&mut self, expr: &Expr) -> String {
        let name = expr.column_name();
        if !self.output_columns().contains(&name) {
            self.actions.push(Action::Compute {
                expr: expr.clone(),
                name: name.clone(),
            });
        }
        name
    }

    pub fn add(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Column names after every action ran.
    pub fn output_columns(&self) -> Vec<String> {
        let mut cols = self.input_columns.clone();
        for action in &self.actions {
            apply_to_columns(action, &mut cols);
        }
        cols
    }

    /// Removes actions whose result is never read and appends a trailing
    /// `Retain(required_output)`. Returns the input columns that must be present.
    ///
    /// # Errors
    /// Returns [`FqError::Planning`] when an action reads a column that neither the
    /// input nor an earlier action provides.
    pub fn finalize(&mut self, required_output: &[String]) -> Result<Vec<String>> {
        let mut available_before = Vec::with_capacity(self.actions.len());
        let mut cols = self.input_columns.clone();
        for action in &self.actions {
            available_before.push(cols.iter().cloned().collect::<HashSet<_>>());
            apply_to_columns(action, &mut cols);
        }
        for name in required_output {
            if !cols.contains(name) {
                return Err(FqError::Planning(format!(
                    "unknown identifier: {name}, available columns: {}",
                    cols.join(", ")
                )));
            }
        }

        let ends_with_projection = matches!(self.actions.last(), Some(Action::Project(_)));
        let mut live: Vec<String> = Vec::new();
        for name in required_output {
            push_unique(&mut live, name);
        }
        let mut kept = Vec::with_capacity(self.actions.len());
        for (idx, action) in self.actions.iter().enumerate().rev() {
            match action {
                Action::Compute { expr, name } => {
                    if let Some(pos) = live.iter().position(|c| c == name) {
                        live.remove(pos);
                        let mut reads = Vec::new();
                        expr.required_columns(&available_before[idx], &mut reads);
                        for r in reads {
                            push_unique(&mut live, &r);
                        }
                        kept.push(action.clone());
                    }
                }
                Action::Join(join) => {
                    live.retain(|c| !join.right_columns.contains(c));
                    for k in &join.keys {
                        push_unique(&mut live, k);
                    }
                    kept.push(action.clone());
                }
                Action::Project(pairs) => {
                    live.clear();
                    for (src, _) in pairs {
                        push_unique(&mut live, src);
                    }
                    kept.push(action.clone());
                }
                Action::Retain(_) => {}
            }
        }
        kept.reverse();
        self.actions = kept;
        if !ends_with_projection {
            self.actions.push(Action::Retain(required_output.to_vec()));
        }

        let input: HashSet<&String> = self.input_columns.iter().collect();
        if let Some(missing) = live.iter().find(|c| !input.contains(c)) {
            return Err(FqError::Planning(format!(
                "unknown identifier: {missing}, available columns: {}",
                self.input_columns.join(", ")
            )));
        }
        let required_inputs = self
            .input_columns
            .iter()
            .filter(|c| live.contains(c))
            .cloned()
            .collect::<Vec<_>>();
        Ok(required_inputs)
    }

    /// Drops unneeded input columns before any action runs.
    pub fn prepend_retain_input(&mut self, required_inputs: &[String]) {
        if required_inputs != self.input_columns.as_slice() {
            self.actions
                .insert(0, Action::Retain(required_inputs.to_vec()));
        }
    }
}

fn apply_to_columns(action: &Action, cols: &mut Vec<String>) {
    match action {
        Action::Compute { name, .. } => push_unique(cols, name),
        Action::Join(join) => {
            for c in &join.right_columns {
                push_unique(cols, c);
            }
        }
        Action::Project(pairs) => {
            *cols = pairs.iter().map(|(_, alias)| alias.clone()).collect();
        }
        Action::Retain(keep) => {
            *cols = keep.clone();
        }
    }
}

fn push_unique(cols: &mut Vec<String>, name: &str) {
    if !cols.iter().any(|c| c == name) {
        cols.push(name.to_string());
    }
}

/// One step of an [`ExpressionChain`].
#[derive(Debug, Clone, Default)]
pub struct ChainStep {
    pub actions: ActionList,
    /// Columns this step itself must output (filter column, aggregation keys, ...).
    pub required_output: Vec<String>,
    /// Filled by [`ExpressionChain::finalize`].
    pub required_inputs: Vec<String>,
}

/// Sequence of steps where each step's input is the previous step's output.
#[derive(Debug, Clone, Default)]
pub struct ExpressionChain {
    pub steps: Vec<ChainStep>,
}

impl ExpressionChain {
    pub fn new(source_columns: Vec<String>) -> Self {
        Self {
            steps: vec![ChainStep {
                actions: ActionList::new(source_columns),
                ..ChainStep::default()
            }],
        }
    }

    /// Starts a new step reading the current step's output.
    pub fn add_step(&mut self) {
        let input = self
            .steps
            .last()
            .map(|s| s.actions.output_columns())
            .unwrap_or_default();
        self.steps.push(ChainStep {
            actions: ActionList::new(input),
            ..ChainStep::default()
        });
    }

    pub fn last_step(&mut self) -> &mut ChainStep {
        if self.steps.is_empty() {
            self.steps.push(ChainStep::default());
        }
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    /// Input columns of the first step; the set of columns that must be read.
    pub fn required_source_columns(&self) -> Vec<String> {
        self.steps
            .first()
            .map(|s| s.required_inputs.clone())
            .unwrap_or_default()
    }

    /// Backward liveness pass over every step.
    pub fn finalize(&mut self) -> Result<()> {
        let mut next_inputs: Vec<String> = Vec::new();
        for step in self.steps.iter_mut().rev() {
            let mut needed = step.required_output.clone();
            for c in &next_inputs {
                push_unique(&mut needed, c);
            }
            step.required_inputs = step.actions.finalize(&needed)?;
            next_inputs = step.required_inputs.clone();
        }
        Ok(())
    }

    /// Whether a column is read by the step after `index`.
    pub fn needed_after(&self, index: usize, column: &str) -> bool {
        self.steps
            .get(index + 1)
            .map(|s| s.required_inputs.iter().any(|c| c == column))
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{col, lit_i64};

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finalize_drops_dead_computations() {
        let mut list = ActionList::new(cols(&["a", "b", "c"]));
        let used = list.add_compute(&col("a").plus(lit_i64(1)));
        list.add_compute(&col("b").plus(lit_i64(1)));
        let inputs = list.finalize(&[used.clone()]).expect("finalize");
        assert_eq!(inputs, cols(&["a"]));
        assert_eq!(list.actions.len(), 2);
        assert_eq!(list.output_columns(), vec![used]);
    }

    #[test]
    fn finalize_reports_unknown_identifiers() {
        let mut list = ActionList::new(cols(&["a"]));
        let name = list.add_compute(&col("zzz"));
        let err = list.finalize(&[name]).expect_err("unknown");
        assert!(matches!(err, FqError::Planning(_)));
    }

    #[test]
    fn chain_propagates_liveness_backwards() {
        let mut chain = ExpressionChain::new(cols(&["k", "v", "unused"]));
        let filter = chain
            .last_step()
            .actions
            .add_compute(&col("v").gt(lit_i64(0)));
        chain.last_step().required_output.push(filter.clone());
        chain.add_step();
        let out = chain.last_step().actions.add_compute(&col("k"));
        chain.last_step().required_output.push(out);
        chain.finalize().expect("finalize");

        assert_eq!(chain.required_source_columns(), cols(&["k", "v"]));
        assert!(!chain.needed_after(0, &filter));
        assert_eq!(chain.steps[1].required_inputs, cols(&["k"]));
    }

    #[test]
    fn projection_keeps_aliases_and_order() {
        let mut list = ActionList::new(cols(&["x", "y"]));
        list.add(Action::Project(vec![
            ("y".to_string(), "first".to_string()),
            ("x".to_string(), "second".to_string()),
        ]));
        let inputs = list
            .finalize(&cols(&["first", "second"]))
            .expect("finalize");
        assert_eq!(inputs, cols(&["x", "y"]));
        assert_eq!(list.output_columns(), cols(&["first", "second"]));
    }
}
