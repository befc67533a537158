use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

use crate::query::SelectWithUnionQuery;

/// Scalar/aggregate expression tree of an already-parsed query.
///
/// Every node has a canonical column name ([`Expr::column_name`]); the same
/// expression always materializes under the same name, which is how later
/// steps find columns computed by earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(String),
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to_type: DataType,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Aggregate function call; `arg == None` only for `count()`.
    Agg {
        func: AggFunc,
        arg: Option<Box<Expr>>,
    },
    /// `expr [NOT] IN (subquery)`; the subquery is materialized into a set before reading.
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<SelectWithUnionQuery>,
        negated: bool,
    },
    /// `*` in a select list.
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
}

impl BinaryOp {
    fn function_name(self) -> &'static str {
        match self {
            BinaryOp::Eq => "equals",
            BinaryOp::NotEq => "notEquals",
            BinaryOp::Lt => "less",
            BinaryOp::LtEq => "lessOrEquals",
            BinaryOp::Gt => "greater",
            BinaryOp::GtEq => "greaterOrEquals",
            BinaryOp::Plus => "plus",
            BinaryOp::Minus => "minus",
            BinaryOp::Multiply => "multiply",
            BinaryOp::Divide => "divide",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFunc {
    pub fn name(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Avg => "avg",
        }
    }
}

impl Expr {
    /// Canonical name of the column this expression materializes into.
    pub fn column_name(&self) -> String {
        match self {
            Expr::Column(name) => name.clone(),
            Expr::Literal(v) => match v {
                LiteralValue::Int64(x) => x.to_string(),
                LiteralValue::Float64(x) => format!("{x:?}"),
                LiteralValue::Utf8(s) => format!("'{s}'"),
                LiteralValue::Boolean(b) => b.to_string(),
                LiteralValue::Null => "NULL".to_string(),
            },
            Expr::BinaryOp { left, op, right } => format!(
                "{}({}, {})",
                op.function_name(),
                left.column_name(),
                right.column_name()
            ),
            Expr::Cast { expr, to_type } => {
                format!("CAST({}, '{to_type:?}')", expr.column_name())
            }
            Expr::And(a, b) => format!("and({}, {})", a.column_name(), b.column_name()),
            Expr::Or(a, b) => format!("or({}, {})", a.column_name(), b.column_name()),
            Expr::Not(e) => format!("not({})", e.column_name()),
            Expr::Agg { func, arg } => match arg {
                Some(a) => format!("{}({})", func.name(), a.column_name()),
                None => format!("{}()", func.name()),
            },
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => format!(
                "{}({}, {})",
                if *negated { "notIn" } else { "in" },
                expr.column_name(),
                subquery_set_name(subquery)
            ),
            Expr::Wildcard => "*".to_string(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Expr::Agg { .. })
    }

    /// True when an aggregate call appears anywhere in the tree.
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= e.is_aggregate());
        found
    }

    /// Pushes every distinct aggregate call (by column name) into `out`.
    ///
    /// Aggregates are not descended into, so nested calls are reported by
    /// [`Expr::has_nested_aggregate`] instead.
    pub fn collect_aggregates(&self, out: &mut Vec<Expr>) {
        match self {
            Expr::Agg { .. } => {
                let name = self.column_name();
                if !out.iter().any(|e| e.column_name() == name) {
                    out.push(self.clone());
                }
            }
            _ => {
                for c in self.children() {
                    c.collect_aggregates(out);
                }
            }
        }
    }

    pub fn has_nested_aggregate(&self) -> bool {
        match self {
            Expr::Agg { arg: Some(a), .. } => a.contains_aggregate(),
            Expr::Agg { arg: None, .. } => false,
            _ => self.children().into_iter().any(|c| c.has_nested_aggregate()),
        }
    }

    /// Collects `IN (subquery)` nodes in pre-order.
    pub fn collect_subqueries<'a>(&'a self, out: &mut Vec<&'a SelectWithUnionQuery>) {
        if let Expr::InSubquery { subquery, .. } = self {
            out.push(subquery);
        }
        for c in self.children() {
            c.collect_subqueries(out);
        }
    }

    /// Columns this expression reads when `available` columns already exist.
    ///
    /// A sub-expression whose canonical name is available is read as that column
    /// instead of being recomputed from its arguments.
    pub fn required_columns(&self, available: &HashSet<String>, out: &mut Vec<String>) {
        let name = self.column_name();
        if available.contains(&name) && !matches!(self, Expr::Literal(_)) {
            if !out.contains(&name) {
                out.push(name);
            }
            return;
        }
        match self {
            Expr::Column(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Agg { .. } => {
                // An aggregate read outside of aggregation is a column produced by it.
                if !out.contains(&name) {
                    out.push(name);
                }
            }
            _ => {
                for c in self.children() {
                    c.required_columns(available, out);
                }
            }
        }
    }

    /// Replaces column references matching a select-list alias with the aliased expression.
    pub fn substitute_aliases(&self, aliases: &[(String, Expr)]) -> Expr {
        self.substitute_aliases_inner(aliases, 0)
    }

    fn substitute_aliases_inner(&self, aliases: &[(String, Expr)], depth: usize) -> Expr {
        if depth > 32 {
            return self.clone();
        }
        match self {
            Expr::Column(name) => match aliases.iter().find(|(alias, _)| alias == name) {
                Some((_, target)) if target != self => {
                    target.substitute_aliases_inner(aliases, depth + 1)
                }
                _ => self.clone(),
            },
            _ => self.map_children(|c| c.substitute_aliases_inner(aliases, depth)),
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        for c in self.children() {
            c.visit(f);
        }
    }

    fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Wildcard => vec![],
            Expr::BinaryOp { left, right, .. } => vec![left, right],
            Expr::And(a, b) | Expr::Or(a, b) => vec![a, b],
            Expr::Cast { expr, .. } | Expr::Not(expr) | Expr::InSubquery { expr, .. } => {
                vec![expr]
            }
            Expr::Agg { arg, .. } => arg.iter().map(|a| a.as_ref()).collect(),
        }
    }

    fn map_children(&self, mut f: impl FnMut(&Expr) -> Expr) -> Expr {
        match self {
            Expr::Column(_) | Expr::Literal(_) | Expr::Wildcard => self.clone(),
            Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
                left: Box::new(f(left)),
                op: *op,
                right: Box::new(f(right)),
            },
            Expr::Cast { expr, to_type } => Expr::Cast {
                expr: Box::new(f(expr)),
                to_type: to_type.clone(),
            },
            Expr::And(a, b) => Expr::And(Box::new(f(a)), Box::new(f(b))),
            Expr::Or(a, b) => Expr::Or(Box::new(f(a)), Box::new(f(b))),
            Expr::Not(e) => Expr::Not(Box::new(f(e))),
            Expr::Agg { func, arg } => Expr::Agg {
                func: *func,
                arg: arg.as_ref().map(|a| Box::new(f(a))),
            },
            Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Expr::InSubquery {
                expr: Box::new(f(expr)),
                subquery: subquery.clone(),
                negated: *negated,
            },
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        binary(self, BinaryOp::Eq, other)
    }

    pub fn not_eq(self, other: Expr) -> Expr {
        binary(self, BinaryOp::NotEq, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        binary(self, BinaryOp::Lt, other)
    }

    pub fn lt_eq(self, other: Expr) -> Expr {
        binary(self, BinaryOp::LtEq, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        binary(self, BinaryOp::Gt, other)
    }

    pub fn gt_eq(self, other: Expr) -> Expr {
        binary(self, BinaryOp::GtEq, other)
    }

    pub fn plus(self, other: Expr) -> Expr {
        binary(self, BinaryOp::Plus, other)
    }

    pub fn minus(self, other: Expr) -> Expr {
        binary(self, BinaryOp::Minus, other)
    }

    pub fn multiply(self, other: Expr) -> Expr {
        binary(self, BinaryOp::Multiply, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn in_subquery(self, subquery: SelectWithUnionQuery) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
            negated: false,
        }
    }

    pub fn not_in_subquery(self, subquery: SelectWithUnionQuery) -> Expr {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
            negated: true,
        }
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    Expr::BinaryOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

/// Stable name under which a subquery's materialized set or join is registered.
pub fn subquery_set_name(query: &SelectWithUnionQuery) -> String {
    let mut h = DefaultHasher::new();
    format!("{query:?}").hash(&mut h);
    format!("_subquery{:016x}", h.finish())
}

/// Builds a column-reference expression.
pub fn col(name: &str) -> Expr {
    Expr::Column(name.to_string())
}

/// Builds an `Int64` literal expression.
pub fn lit_i64(v: i64) -> Expr {
    Expr::Literal(LiteralValue::Int64(v))
}

/// Builds a `Float64` literal expression.
pub fn lit_f64(v: f64) -> Expr {
    Expr::Literal(LiteralValue::Float64(v))
}

/// Builds a UTF-8 string literal expression.
pub fn lit_str(v: &str) -> Expr {
    Expr::Literal(LiteralValue::Utf8(v.to_string()))
}

/// Builds a boolean literal expression.
pub fn lit_bool(v: bool) -> Expr {
    Expr::Literal(LiteralValue::Boolean(v))
}

/// `count()`.
pub fn count() -> Expr {
    Expr::Agg {
        func: AggFunc::Count,
        arg: None,
    }
}

/// `count(expr)`: non-null values only.
pub fn count_of(arg: Expr) -> Expr {
    agg(AggFunc::Count, arg)
}

pub fn sum(arg: Expr) -> Expr {
    agg(AggFunc::Sum, arg)
}

pub fn min(arg: Expr) -> Expr {
    agg(AggFunc::Min, arg)
}

pub fn max(arg: Expr) -> Expr {
    agg(AggFunc::Max, arg)
}

pub fn avg(arg: Expr) -> Expr {
    agg(AggFunc::Avg, arg)
}

fn agg(func: AggFunc, arg: Expr) -> Expr {
    Expr::Agg {
        func,
        arg: Some(Box::new(arg)),
    }
}
