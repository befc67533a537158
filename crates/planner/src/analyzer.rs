use fq_common::{FqError, Result};
use serde::{Deserialize, Serialize};

use crate::actions::{Action, ExpressionChain, JoinDescriptor};
use crate::expr::{AggFunc, Expr, subquery_set_name};
use crate::query::{SelectItem, SelectQuery, SelectWithUnionQuery, TableExpr};

/// The analyzer needs the output columns of subqueries it cannot see into,
/// such as the right side of a JOIN. The interpreter answers from its catalog.
pub trait SchemaProvider {
    /// Output column names of `query`.
    fn subquery_columns(&self, query: &SelectWithUnionQuery) -> Result<Vec<String>>;
}

/// One aggregate function call computed by the aggregation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDescription {
    pub func: AggFunc,
    /// Argument column, `None` for `count()`.
    pub argument: Option<String>,
    /// Result column name, e.g. `sum(v)`.
    pub column_name: String,
}

/// What a materialized subquery feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SetTarget {
    /// Membership set for `IN (subquery)`; built from the first column.
    Set,
    /// Hash table for the right side of a JOIN.
    Join(JoinDescriptor),
}

/// A subquery that must be fully materialized before the main pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubqueryForSet {
    pub name: String,
    pub query: SelectWithUnionQuery,
    pub target: SetTarget,
}

/// Sort key of an ORDER BY, by materialized column name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortColumn {
    pub name: String,
    pub descending: bool,
    pub nulls_first: bool,
}

/// Resolves the clauses of one SELECT into chain steps.
///
/// Construction normalizes the query (wildcard expansion, alias substitution)
/// and validates aggregate placement; the `append_*` methods each add one
/// clause's work to the last step of a chain, in the order the caller decides.
pub struct ExpressionAnalyzer {
    query: SelectQuery,
    source_columns: Vec<String>,
    has_aggregation: bool,
    aggregation_keys: Vec<String>,
    aggregates: Vec<AggregateDescription>,
    join: Option<(JoinDescriptor, SelectWithUnionQuery)>,
    subqueries_for_sets: Vec<SubqueryForSet>,
}

impl ExpressionAnalyzer {
    pub fn new(
        query: &SelectQuery,
        source_columns: Vec<String>,
        provider: &dyn SchemaProvider,
    ) -> Result<Self> {
        let mut query = query.clone();

        let join = match &query.join {
            Some(clause) => {
                let right_query = match &clause.table {
                    TableExpr::Subquery(q) => (**q).clone(),
                    table @ TableExpr::Table { .. } => SelectWithUnionQuery::from(SelectQuery {
                        select: vec![SelectItem {
                            expr: Expr::Wildcard,
                            alias: None,
                        }],
                        from: Some(table.clone()),
                        ..SelectQuery::default()
                    }),
                };
                let right_all = provider.subquery_columns(&right_query)?;
                for key in &clause.using {
                    if !right_all.contains(key) {
                        return Err(FqError::Planning(format!(
                            "USING key {key} is missing on the right side of JOIN"
                        )));
                    }
                    if !source_columns.contains(key) {
                        return Err(FqError::Planning(format!(
                            "USING key {key} is missing on the left side of JOIN"
                        )));
                    }
                }
                let right_columns = right_all
                    .into_iter()
                    .filter(|c| !clause.using.contains(c))
                    .collect::<Vec<_>>();
                let descriptor = JoinDescriptor {
                    set_name: format!("{}_join", subquery_set_name(&right_query)),
                    kind: clause.kind,
                    keys: clause.using.clone(),
                    right_columns,
                };
                Some((descriptor, right_query))
            }
            None => None,
        };

        let mut expanded = Vec::with_capacity(query.select.len());
        for item in query.select.drain(..) {
            if item.expr == Expr::Wildcard {
                let right = join.iter().flat_map(|(d, _)| d.right_columns.iter());
                for c in source_columns.iter().chain(right) {
                    expanded.push(SelectItem {
                        expr: Expr::Column(c.clone()),
                        alias: None,
                    });
                }
            } else {
                expanded.push(item);
            }
        }
        query.select = expanded;
        if query.select.is_empty() {
            return Err(FqError::Planning("empty select list".to_string()));
        }

        let aliases = query
            .select
            .iter()
            .filter_map(|item| item.alias.clone().map(|a| (a, item.expr.clone())))
            .filter(|(alias, expr)| expr.column_name() != *alias)
            .collect::<Vec<_>>();
        query.where_clause = query.where_clause.map(|e| e.substitute_aliases(&aliases));
        query.group_by = query
            .group_by
            .iter()
            .map(|e| e.substitute_aliases(&aliases))
            .collect();
        query.having = query.having.map(|e| e.substitute_aliases(&aliases));
        for item in &mut query.order_by {
            item.expr = item.expr.substitute_aliases(&aliases);
        }
        if let Some(limit_by) = &mut query.limit_by {
            limit_by.exprs = limit_by
                .exprs
                .iter()
                .map(|e| e.substitute_aliases(&aliases))
                .collect();
        }

        for (clause, expr) in [
            ("WHERE", query.where_clause.as_ref()),
            ("PREWHERE", query.prewhere.as_ref()),
        ] {
            if expr.is_some_and(Expr::contains_aggregate) {
                return Err(FqError::Planning(format!(
                    "aggregate function is found in {clause} clause"
                )));
            }
        }
        if query.group_by.iter().any(Expr::contains_aggregate) {
            return Err(FqError::Planning(
                "aggregate function is found in GROUP BY".to_string(),
            ));
        }

        let mut aggregate_exprs = Vec::new();
        for item in &query.select {
            item.expr.collect_aggregates(&mut aggregate_exprs);
        }
        if let Some(h) = &query.having {
            h.collect_aggregates(&mut aggregate_exprs);
        }
        for item in &query.order_by {
            item.expr.collect_aggregates(&mut aggregate_exprs);
        }
        if aggregate_exprs.iter().any(Expr::has_nested_aggregate) {
            return Err(FqError::Planning(
                "aggregate function is found inside another aggregate function".to_string(),
            ));
        }

        let has_aggregation = !query.group_by.is_empty() || !aggregate_exprs.is_empty();
        if query.having.is_some() && !has_aggregation {
            return Err(FqError::Planning(
                "HAVING clause without aggregation".to_string(),
            ));
        }

        let mut aggregation_keys = Vec::new();
        for key in &query.group_by {
            let name = key.column_name();
            if !aggregation_keys.contains(&name) {
                aggregation_keys.push(name);
            }
        }
        let aggregates = aggregate_exprs
            .iter()
            .filter_map(|e| match e {
                Expr::Agg { func, arg } => Some(AggregateDescription {
                    func: *func,
                    argument: arg.as_ref().map(|a| a.column_name()),
                    column_name: e.column_name(),
                }),
                _ => None,
            })
            .collect();

        Ok(Self {
            query,
            source_columns,
            has_aggregation,
            aggregation_keys,
            aggregates,
            join,
            subqueries_for_sets: Vec::new(),
        })
    }

    /// The normalized query: wildcards expanded, aliases substituted.
    pub fn query(&self) -> &SelectQuery {
        &self.query
    }

    pub fn source_columns(&self) -> &[String] {
        &self.source_columns
    }

    pub fn has_aggregation(&self) -> bool {
        self.has_aggregation
    }

    pub fn aggregation_keys(&self) -> &[String] {
        &self.aggregation_keys
    }

    pub fn aggregates(&self) -> &[AggregateDescription] {
        &self.aggregates
    }

    /// Columns of the aggregation step's output: keys then aggregate results.
    pub fn aggregated_columns(&self) -> Vec<String> {
        self.aggregation_keys
            .iter()
            .cloned()
            .chain(self.aggregates.iter().map(|a| a.column_name.clone()))
            .collect()
    }

    /// Subqueries registered by `append_*` calls made with `only_types == false`.
    pub fn take_subqueries_for_sets(&mut self) -> Vec<SubqueryForSet> {
        std::mem::take(&mut self.subqueries_for_sets)
    }

    /// Columns read by PREWHERE, evaluated by the storage itself.
    pub fn prewhere_columns(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(p) = &self.query.prewhere {
            p.required_columns(&Default::default(), &mut out);
        }
        out
    }

    fn register_sets(&mut self, expr: &Expr, only_types: bool) {
        if only_types {
            return;
        }
        let mut found = Vec::new();
        expr.collect_subqueries(&mut found);
        for sub in found {
            let name = subquery_set_name(sub);
            if !self.subqueries_for_sets.iter().any(|s| s.name == name) {
                self.subqueries_for_sets.push(SubqueryForSet {
                    name,
                    query: sub.clone(),
                    target: SetTarget::Set,
                });
            }
        }
    }

    fn init_chain(&self, chain: &mut ExpressionChain, columns: Vec<String>) {
        if chain.steps.is_empty() {
            *chain = ExpressionChain::new(columns);
        }
    }

    pub fn append_join(&mut self, chain: &mut ExpressionChain, only_types: bool) -> bool {
        let Some((descriptor, right_query)) = self.join.clone() else {
            return false;
        };
        self.init_chain(chain, self.source_columns.clone());
        if !only_types && !self.subqueries_for_sets.iter().any(|s| s.name == descriptor.set_name)
        {
            self.subqueries_for_sets.push(SubqueryForSet {
                name: descriptor.set_name.clone(),
                query: right_query,
                target: SetTarget::Join(descriptor.clone()),
            });
        }
        chain.last_step().actions.add(Action::Join(descriptor));
        true
    }

    /// Adds the WHERE predicate; returns its column name.
    pub fn append_where(&mut self, chain: &mut ExpressionChain, only_types: bool) -> Option<String> {
        let expr = self.query.where_clause.clone()?;
        self.init_chain(chain, self.source_columns.clone());
        self.register_sets(&expr, only_types);
        let step = chain.last_step();
        let name = step.actions.add_compute(&expr);
        step.required_output.push(name.clone());
        Some(name)
    }

    pub fn append_group_by(&mut self, chain: &mut ExpressionChain, only_types: bool) -> bool {
        if self.query.group_by.is_empty() {
            return false;
        }
        self.init_chain(chain, self.source_columns.clone());
        let keys = self.query.group_by.clone();
        for key in &keys {
            self.register_sets(key, only_types);
            let step = chain.last_step();
            let name = step.actions.add_compute(key);
            if !step.required_output.contains(&name) {
                step.required_output.push(name);
            }
        }
        true
    }

    pub fn append_aggregate_functions_arguments(
        &mut self,
        chain: &mut ExpressionChain,
        only_types: bool,
    ) {
        self.init_chain(chain, self.source_columns.clone());
        let mut args = Vec::new();
        let mut aggs = Vec::new();
        for item in &self.query.select {
            item.expr.collect_aggregates(&mut aggs);
        }
        if let Some(h) = &self.query.having {
            h.collect_aggregates(&mut aggs);
        }
        for item in &self.query.order_by {
            item.expr.collect_aggregates(&mut aggs);
        }
        for agg in &aggs {
            if let Expr::Agg { arg: Some(a), .. } = agg {
                args.push((**a).clone());
            }
        }
        for arg in &args {
            self.register_sets(arg, only_types);
            let step = chain.last_step();
            let name = step.actions.add_compute(arg);
            if !step.required_output.contains(&name) {
                step.required_output.push(name);
            }
        }
    }

    /// Adds the HAVING predicate over aggregated columns; returns its column name.
    pub fn append_having(
        &mut self,
        chain: &mut ExpressionChain,
        only_types: bool,
    ) -> Option<String> {
        let expr = self.query.having.clone()?;
        self.init_chain(chain, self.aggregated_columns());
        self.register_sets(&expr, only_types);
        let step = chain.last_step();
        let name = step.actions.add_compute(&expr);
        step.required_output.push(name.clone());
        Some(name)
    }

    /// Adds select-list expressions; returns their column names (pre-projection).
    pub fn append_select(&mut self, chain: &mut ExpressionChain, only_types: bool) -> Vec<String> {
        let columns = if self.has_aggregation {
            self.aggregated_columns()
        } else {
            self.source_columns.clone()
        };
        self.init_chain(chain, columns);
        let exprs = self
            .query
            .select
            .iter()
            .map(|i| i.expr.clone())
            .collect::<Vec<_>>();
        let mut names = Vec::with_capacity(exprs.len());
        for expr in &exprs {
            self.register_sets(expr, only_types);
            let step = chain.last_step();
            let name = step.actions.add_compute(expr);
            if !step.required_output.contains(&name) {
                step.required_output.push(name.clone());
            }
            names.push(name);
        }
        names
    }

    /// Adds ORDER BY expressions to the select step; returns the sort description.
    pub fn append_order_by(
        &mut self,
        chain: &mut ExpressionChain,
        only_types: bool,
    ) -> Vec<SortColumn> {
        let items = self.query.order_by.clone();
        let mut description = Vec::with_capacity(items.len());
        for item in &items {
            self.register_sets(&item.expr, only_types);
            let step = chain.last_step();
            let name = step.actions.add_compute(&item.expr);
            if !step.required_output.contains(&name) {
                step.required_output.push(name.clone());
            }
            description.push(SortColumn {
                name,
                descending: item.descending,
                nulls_first: item.nulls_first,
            });
        }
        description
    }

    /// Adds LIMIT BY expressions; returns `(length, columns)`.
    pub fn append_limit_by(
        &mut self,
        chain: &mut ExpressionChain,
        only_types: bool,
    ) -> Option<(u64, Vec<String>)> {
        let limit_by = self.query.limit_by.clone()?;
        let mut names = Vec::with_capacity(limit_by.exprs.len());
        for expr in &limit_by.exprs {
            self.register_sets(expr, only_types);
            let step = chain.last_step();
            let name = step.actions.add_compute(expr);
            if !step.required_output.contains(&name) {
                step.required_output.push(name.clone());
            }
            names.push(name);
        }
        Some((limit_by.length, names))
    }

    /// Renames select expressions to their output names.
    pub fn append_projection(&self, chain: &mut ExpressionChain) {
        let pairs = self
            .query
            .select
            .iter()
            .map(|i| (i.expr.column_name(), i.output_name()))
            .collect::<Vec<_>>();
        let step = chain.last_step();
        step.required_output = pairs.iter().map(|(_, alias)| alias.clone()).collect();
        step.actions.add(Action::Project(pairs));
    }
}
