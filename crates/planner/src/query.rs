//! Already-parsed SELECT query model consumed by the analyzer and the interpreter.
//!
//! Queries are built directly (there is no SQL text front-end in this workspace);
//! the `with_*` builders keep construction readable in callers and tests.

use serde::{Deserialize, Serialize};

use crate::expr::Expr;

/// One entry of a select list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    /// Name of the column in the final result.
    pub fn output_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.expr.column_name())
    }
}

/// Source of a FROM or JOIN clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableExpr {
    Table {
        database: Option<String>,
        name: String,
    },
    Subquery(Box<SelectWithUnionQuery>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    /// Right-side rows without a match must be emitted after the left side is consumed.
    pub fn is_right_or_full(self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Full)
    }

    pub fn is_left_or_full(self) -> bool {
        matches!(self, JoinKind::Left | JoinKind::Full)
    }
}

/// `[kind] JOIN table USING (keys)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub table: TableExpr,
    pub using: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderByItem {
    pub expr: Expr,
    pub descending: bool,
    pub nulls_first: bool,
}

/// `LIMIT length BY exprs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitBy {
    pub length: u64,
    pub exprs: Vec<Expr>,
}

/// `LIMIT [offset,] length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub length: u64,
    pub offset: u64,
}

/// A single SELECT.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: Option<TableExpr>,
    /// Relative sample size (`SAMPLE 0.1`).
    pub sample: Option<f64>,
    #[serde(rename = "final")]
    pub final_: bool,
    pub join: Option<JoinClause>,
    pub prewhere: Option<Expr>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub with_totals: bool,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByItem>,
    pub limit_by: Option<LimitBy>,
    pub limit: Option<Limit>,
    /// `SETTINGS name = value, ...` applied on top of the session settings.
    pub settings: Vec<(String, String)>,
}

/// `SELECT ... UNION ALL SELECT ...`; a plain query is a union of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectWithUnionQuery {
    pub selects: Vec<SelectQuery>,
}

impl From<SelectQuery> for SelectWithUnionQuery {
    fn from(query: SelectQuery) -> Self {
        Self {
            selects: vec![query],
        }
    }
}

impl SelectWithUnionQuery {
    pub fn union_all(selects: Vec<SelectQuery>) -> Self {
        Self { selects }
    }
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, expr: Expr) -> Self {
        self.select.push(SelectItem { expr, alias: None });
        self
    }

    pub fn column_as(mut self, expr: Expr, alias: &str) -> Self {
        self.select.push(SelectItem {
            expr,
            alias: Some(alias.to_string()),
        });
        self
    }

    pub fn wildcard(self) -> Self {
        self.column(Expr::Wildcard)
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn from_table(mut self, name: &str) -> Self {
        self.from = Some(match name.split_once('.') {
            Some((db, table)) => TableExpr::Table {
                database: Some(db.to_string()),
                name: table.to_string(),
            },
            None => TableExpr::Table {
                database: None,
                name: name.to_string(),
            },
        });
        self
    }

    pub fn from_subquery(mut self, query: impl Into<SelectWithUnionQuery>) -> Self {
        self.from = Some(TableExpr::Subquery(Box::new(query.into())));
        self
    }

    pub fn sample(mut self, ratio: f64) -> Self {
        self.sample = Some(ratio);
        self
    }

    pub fn final_(mut self) -> Self {
        self.final_ = true;
        self
    }

    pub fn join(mut self, kind: JoinKind, table: TableExpr, using: &[&str]) -> Self {
        self.join = Some(JoinClause {
            kind,
            table,
            using: using.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn prewhere(mut self, expr: Expr) -> Self {
        self.prewhere = Some(expr);
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.where_clause = Some(expr);
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn with_totals(mut self) -> Self {
        self.with_totals = true;
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }

    pub fn order_by(mut self, expr: Expr, descending: bool) -> Self {
        self.order_by.push(OrderByItem {
            expr,
            descending,
            nulls_first: false,
        });
        self
    }

    pub fn limit_by(mut self, length: u64, exprs: Vec<Expr>) -> Self {
        self.limit_by = Some(LimitBy { length, exprs });
        self
    }

    pub fn limit(mut self, length: u64) -> Self {
        let offset = self.limit.map(|l| l.offset).unwrap_or(0);
        self.limit = Some(Limit { length, offset });
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        let length = self.limit.map(|l| l.length).unwrap_or(0);
        self.limit = Some(Limit { length, offset });
        self
    }

    pub fn setting(mut self, name: &str, value: &str) -> Self {
        self.settings.push((name.to_string(), value.to_string()));
        self
    }

    /// `(length, offset)` of the LIMIT clause, zeros when absent.
    pub fn limit_length_and_offset(&self) -> (u64, u64) {
        self.limit.map(|l| (l.length, l.offset)).unwrap_or((0, 0))
    }

    /// True when any FROM-subquery, at any nesting depth, has WITH TOTALS.
    ///
    /// Purely syntactic: it does not prove the nested totals depend on the outer LIMIT.
    pub fn has_with_totals_in_any_subquery_in_from(&self) -> bool {
        match &self.from {
            Some(TableExpr::Subquery(sub)) => sub
                .selects
                .iter()
                .any(|s| s.with_totals || s.has_with_totals_in_any_subquery_in_from()),
            _ => false,
        }
    }
}
