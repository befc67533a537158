//! The per-query plan: which optional steps run, in which phase, with which actions.

use fq_common::{OverflowMode, Result, Settings, TotalsMode};

use crate::actions::{Action, ActionList, ExpressionChain, JoinDescriptor};
use crate::analyzer::{AggregateDescription, ExpressionAnalyzer, SortColumn, SubqueryForSet};
use crate::stage::ProcessingStage;

/// Actions producing a boolean column, followed by a row filter on it.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterStep {
    pub actions: ActionList,
    pub column: String,
    /// The filter column is not read by any later step.
    pub remove_column: bool,
}

/// `LIMIT n BY columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitByColumns {
    pub length: u64,
    pub columns: Vec<String>,
}

/// Immutable plan computed once per query invocation.
///
/// Every optional step is present exactly when its descriptor is `Some`; the
/// booleans mirror the descriptors for the decisions the driver makes.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub need_aggregate: bool,
    pub has_join: bool,
    pub has_where: bool,
    pub has_having: bool,
    pub has_order_by: bool,
    pub has_limit_by: bool,

    /// Partial work happens on this node: `from < WithMergeableState <= to`.
    pub first_stage: bool,
    /// Final/merge work happens on this node: `from <= WithMergeableState < to`.
    pub second_stage: bool,

    /// Keys past `max_rows_to_group_by` fold into one overflow row so totals
    /// still cover them.
    pub aggregate_overflow_row: bool,
    /// Aggregation finalizes in place; no totals step follows it.
    pub aggregate_final: bool,

    pub before_join: Option<ActionList>,
    pub join: Option<JoinDescriptor>,
    pub before_where: Option<FilterStep>,
    pub before_aggregation: Option<ActionList>,
    pub before_having: Option<FilterStep>,
    pub before_order_and_select: Option<ActionList>,
    pub before_limit_by: Option<ActionList>,
    pub final_projection: Option<ActionList>,

    /// Select-list column names before the final projection renames them.
    pub selected_columns: Vec<String>,
    pub order_by: Vec<SortColumn>,
    pub limit_by: Option<LimitByColumns>,
    pub aggregation_keys: Vec<String>,
    pub aggregates: Vec<AggregateDescription>,
    pub required_source_columns: Vec<String>,
    pub subqueries_for_sets: Vec<SubqueryForSet>,
}

impl AnalysisResult {
    /// Walks the clauses once (join, where, group-by/aggregate arguments,
    /// having, select/order, limit-by, projection) and trims every step to
    /// the columns later steps read.
    ///
    /// `with_totals` is the effective flag, which can be off for a query that
    /// spells WITH TOTALS when an outer query aggregates over it.
    pub fn analyze(
        analyzer: &mut ExpressionAnalyzer,
        from_stage: ProcessingStage,
        to_stage: ProcessingStage,
        with_totals: bool,
        settings: &Settings,
    ) -> Result<Self> {
        let first_stage = ProcessingStage::first_stage(from_stage, to_stage);
        let second_stage = ProcessingStage::second_stage(from_stage, to_stage);
        let need_aggregate = analyzer.has_aggregation();
        let mut res = AnalysisResult {
            need_aggregate,
            first_stage,
            second_stage,
            aggregate_overflow_row: need_aggregate
                && with_totals
                && settings.max_rows_to_group_by > 0
                && settings.group_by_overflow_mode == OverflowMode::Any
                && settings.totals_mode != TotalsMode::AfterHavingExclusive,
            aggregate_final: need_aggregate
                && to_stage > ProcessingStage::WithMergeableState
                && !with_totals,
            aggregation_keys: analyzer.aggregation_keys().to_vec(),
            aggregates: analyzer.aggregates().to_vec(),
            ..AnalysisResult::default()
        };

        let mut chain = ExpressionChain::new(analyzer.source_columns().to_vec());
        let mut join_idx = None;
        if analyzer.append_join(&mut chain, !first_stage) {
            join_idx = Some(chain.steps.len() - 1);
            chain.add_step();
        }
        let mut where_step = None;
        if let Some(column) = analyzer.append_where(&mut chain, !first_stage) {
            where_step = Some((chain.steps.len() - 1, column));
            chain.add_step();
        }

        let mut having_step = None;
        if res.need_aggregate {
            analyzer.append_group_by(&mut chain, !first_stage);
            analyzer.append_aggregate_functions_arguments(&mut chain, !first_stage);
            let agg_idx = chain.steps.len() - 1;
            chain.finalize()?;
            res.take_source_steps(&chain, join_idx, where_step.take());
            res.before_aggregation = Some(chain.steps[agg_idx].actions.clone());
            chain.clear();

            if let Some(column) = analyzer.append_having(&mut chain, !second_stage) {
                having_step = Some((chain.steps.len() - 1, column));
                res.has_having = true;
                chain.add_step();
            }
        }

        let select_only_types = if res.need_aggregate {
            !second_stage
        } else {
            !first_stage
        };
        res.selected_columns = analyzer.append_select(&mut chain, select_only_types);
        res.order_by = analyzer.append_order_by(&mut chain, select_only_types);
        res.has_order_by = !res.order_by.is_empty();
        let select_idx = chain.steps.len() - 1;
        chain.add_step();

        let mut limit_by_idx = None;
        if let Some((length, columns)) = analyzer.append_limit_by(&mut chain, !second_stage) {
            limit_by_idx = Some(chain.steps.len() - 1);
            res.has_limit_by = true;
            res.limit_by = Some(LimitByColumns { length, columns });
            chain.add_step();
        }

        analyzer.append_projection(&mut chain);
        let projection_idx = chain.steps.len() - 1;
        chain.finalize()?;

        if !res.need_aggregate {
            res.take_source_steps(&chain, join_idx, where_step);
        }
        res.before_having = having_step.map(|(idx, column)| filter_step(&chain, idx, column));
        res.before_order_and_select = Some(chain.steps[select_idx].actions.clone());
        res.before_limit_by = limit_by_idx.map(|i| chain.steps[i].actions.clone());
        res.final_projection = Some(chain.steps[projection_idx].actions.clone());

        let mut required = res.required_source_columns.clone();
        for c in analyzer.prewhere_columns() {
            if !required.contains(&c) {
                required.push(c);
            }
        }
        if required.is_empty() {
            required.extend(analyzer.source_columns().first().cloned());
        }
        res.required_source_columns = required;
        res.subqueries_for_sets = analyzer.take_subqueries_for_sets();
        Ok(res)
    }

    fn take_source_steps(
        &mut self,
        chain: &ExpressionChain,
        join_idx: Option<usize>,
        where_step: Option<(usize, String)>,
    ) {
        self.required_source_columns = chain.required_source_columns();
        if let Some(idx) = join_idx {
            self.has_join = true;
            self.before_join = Some(chain.steps[idx].actions.clone());
            self.join = chain.steps[idx].actions.actions.iter().find_map(|a| match a {
                Action::Join(d) => Some(d.clone()),
                _ => None,
            });
        }
        if let Some((idx, column)) = where_step {
            self.has_where = true;
            self.before_where = Some(filter_step(chain, idx, column));
        }
    }
}

fn filter_step(chain: &ExpressionChain, idx: usize, column: String) -> FilterStep {
    let step = &chain.steps[idx];
    let mut actions = step.actions.clone();
    actions.prepend_retain_input(&step.required_inputs);
    FilterStep {
        remove_column: !chain.needed_after(idx, &column),
        actions,
        column,
    }
}
