//! Expression compilation and evaluation for execution operators.
//!
//! Input contract:
//! - expressions are the name-based trees of the planner;
//! - a sub-expression whose canonical name is already a column of the input is
//!   read from that column instead of being recomputed (this is how aggregate
//!   results and previously computed steps are found).
//!
//! Output contract:
//! - each evaluation returns an `ArrayRef` aligned to input batch row count.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringBuilder,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::cast,
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    numeric::{add, div, mul, sub},
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use fq_common::{FqError, Result};
use fq_planner::{BinaryOp, Expr, LiteralValue, subquery_set_name};

use crate::sets::{PreparedSets, Set};

/// Executable expression for the execution engine.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile planner Expr into a runnable expression against `input_schema`.
pub fn compile_expr(
    expr: &Expr,
    input_schema: &SchemaRef,
    sets: &PreparedSets,
) -> Result<Arc<dyn PhysicalExpr>> {
    if !matches!(expr, Expr::Literal(_)) {
        if let Ok(index) = input_schema.index_of(&expr.column_name()) {
            let dt = input_schema.field(index).data_type().clone();
            return Ok(Arc::new(ColumnExpr { index, dt }));
        }
    }
    match expr {
        Expr::Column(name) => Err(FqError::Planning(format!(
            "unknown column in execution: {name}"
        ))),
        Expr::Agg { .. } => Err(FqError::Planning(format!(
            "aggregate {} is not computed by an aggregation step",
            expr.column_name()
        ))),
        Expr::Wildcard => Err(FqError::Planning(
            "wildcard must be expanded before execution".to_string(),
        )),

        Expr::Literal(v) => Ok(Arc::new(LiteralExpr {
            v: v.clone(),
            dt: literal_type(v),
        })),

        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema, sets)?;
            Ok(Arc::new(CastExpr {
                inner,
                to_type: to_type.clone(),
            }))
        }

        Expr::Not(e) => {
            let inner = compile_expr(e, input_schema, sets)?;
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::And(a, b) => {
            let left = compile_expr(a, input_schema, sets)?;
            let right = compile_expr(b, input_schema, sets)?;
            Ok(Arc::new(BoolBinaryExpr {
                left,
                right,
                op: BoolOp::And,
            }))
        }

        Expr::Or(a, b) => {
            let left = compile_expr(a, input_schema, sets)?;
            let right = compile_expr(b, input_schema, sets)?;
            Ok(Arc::new(BoolBinaryExpr {
                left,
                right,
                op: BoolOp::Or,
            }))
        }

        Expr::BinaryOp { left, op, right } => {
            let l = compile_expr(left, input_schema, sets)?;
            let r = compile_expr(right, input_schema, sets)?;
            let operand = operand_type(*op, &l.data_type(), &r.data_type())?;
            let out = match op {
                BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
                    operand.clone()
                }
                _ => DataType::Boolean,
            };
            Ok(Arc::new(BinaryExpr {
                left: l,
                right: r,
                op: *op,
                operand,
                out,
            }))
        }

        Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => {
            let inner = compile_expr(expr, input_schema, sets)?;
            let set = sets.set(&subquery_set_name(subquery))?;
            Ok(Arc::new(InSetExpr {
                inner,
                set,
                negated: *negated,
            }))
        }
    }
}

// =====================
// Standard expressions
// =====================

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralExpr {
    v: LiteralValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        scalar_to_array(&self.v, batch.num_rows())
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| FqError::Execution(format!("cast failed: {e}")))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let b = arr
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| FqError::Execution("NOT expects boolean".to_string()))?;

        let out = not(b).map_err(|e| FqError::Execution(format!("not failed: {e}")))?;
        Ok(Arc::new(out))
    }
}

#[derive(Clone, Copy)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;

        let lb = l
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| FqError::Execution("AND/OR expects boolean".to_string()))?;
        let rb = r
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| FqError::Execution("AND/OR expects boolean".to_string()))?;

        let out = match self.op {
            BoolOp::And => and_kleene(lb, rb),
            BoolOp::Or => or_kleene(lb, rb),
        }
        .map_err(|e| FqError::Execution(format!("boolean kernel failed: {e}")))?;

        Ok(Arc::new(out))
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    /// Both operands are cast to this type before the kernel runs.
    operand: DataType,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = coerce(self.left.evaluate(batch)?, &self.operand)?;
        let r = coerce(self.right.evaluate(batch)?, &self.operand)?;

        match self.op {
            BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide => {
                eval_arith(self.op, &l, &r, &self.out)
            }
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Lt
            | BinaryOp::LtEq
            | BinaryOp::Gt
            | BinaryOp::GtEq => eval_cmp(self.op, &l, &r),
        }
    }
}

struct InSetExpr {
    inner: Arc<dyn PhysicalExpr>,
    set: Arc<Set>,
    negated: bool,
}

impl PhysicalExpr for InSetExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        if !self.set.is_ready() {
            return Err(FqError::Execution(
                "set for IN is read before it was created".to_string(),
            ));
        }
        let arr = self.inner.evaluate(batch)?;
        self.set.contains(&arr, self.negated)
    }
}

// ------------------ helpers ------------------

pub(crate) fn literal_type(v: &LiteralValue) -> DataType {
    match v {
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Utf8(_) => DataType::Utf8,
        LiteralValue::Boolean(_) => DataType::Boolean,
        LiteralValue::Null => DataType::Null,
    }
}

fn scalar_to_array(v: &LiteralValue, len: usize) -> Result<ArrayRef> {
    match v {
        LiteralValue::Int64(x) => {
            let mut b = Int64Builder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Float64(x) => {
            let mut b = Float64Builder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Boolean(x) => {
            let mut b = BooleanBuilder::with_capacity(len);
            for _ in 0..len {
                b.append_value(*x);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Utf8(s) => {
            let mut b = StringBuilder::with_capacity(len, s.len() * len);
            for _ in 0..len {
                b.append_value(s);
            }
            Ok(Arc::new(b.finish()))
        }
        LiteralValue::Null => Ok(arrow::array::new_null_array(&DataType::Null, len)),
    }
}

fn is_numeric(dt: &DataType) -> bool {
    dt.is_integer() || dt.is_floating()
}

/// Common type both operands are brought to.
///
/// Integers stay `Int64`, any float makes the pair `Float64`, `divide` is
/// always floating, and a NULL literal takes the other side's type.
fn operand_type(op: BinaryOp, l: &DataType, r: &DataType) -> Result<DataType> {
    let arithmetic = matches!(
        op,
        BinaryOp::Plus | BinaryOp::Minus | BinaryOp::Multiply | BinaryOp::Divide
    );
    match (l, r) {
        (DataType::Null, DataType::Null) => Ok(if arithmetic {
            DataType::Int64
        } else {
            DataType::Boolean
        }),
        (DataType::Null, other) | (other, DataType::Null) => {
            if is_numeric(other) {
                operand_type(op, other, other)
            } else {
                Ok(other.clone())
            }
        }
        (a, b) if is_numeric(a) && is_numeric(b) => {
            if op == BinaryOp::Divide || a.is_floating() || b.is_floating() {
                Ok(DataType::Float64)
            } else {
                Ok(DataType::Int64)
            }
        }
        (a, b) if a == b && !arithmetic => Ok(a.clone()),
        (a, b) => Err(FqError::Planning(format!(
            "illegal types of arguments for {op:?}: {a:?} and {b:?}"
        ))),
    }
}

fn coerce(arr: ArrayRef, to: &DataType) -> Result<ArrayRef> {
    if arr.data_type() == to {
        return Ok(arr);
    }
    cast(&arr, to).map_err(|e| FqError::Execution(format!("cast failed: {e}")))
}

fn eval_arith(op: BinaryOp, l: &ArrayRef, r: &ArrayRef, out: &DataType) -> Result<ArrayRef> {
    let res = match out {
        DataType::Int64 => {
            let la = l
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| FqError::Execution("expected Int64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| FqError::Execution("expected Int64 array".to_string()))?;
            match op {
                BinaryOp::Plus => add(la, ra),
                BinaryOp::Minus => sub(la, ra),
                BinaryOp::Multiply => mul(la, ra),
                _ => div(la, ra),
            }
        }
        DataType::Float64 => {
            let la = l
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| FqError::Execution("expected Float64 array".to_string()))?;
            let ra = r
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| FqError::Execution("expected Float64 array".to_string()))?;
            match op {
                BinaryOp::Plus => add(la, ra),
                BinaryOp::Minus => sub(la, ra),
                BinaryOp::Multiply => mul(la, ra),
                _ => div(la, ra),
            }
        }
        _ => {
            return Err(FqError::Unsupported(format!(
                "arithmetic not supported for type {out:?}"
            )));
        }
    };
    res.map_err(|e| FqError::Execution(format!("arith kernel failed: {e}")))
}

fn eval_cmp(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    if l.data_type() == &DataType::Boolean && !matches!(op, BinaryOp::Eq | BinaryOp::NotEq) {
        return Err(FqError::Unsupported(
            "ordering comparisons not supported for boolean".to_string(),
        ));
    }
    if !matches!(
        l.data_type(),
        DataType::Int64 | DataType::Float64 | DataType::Utf8 | DataType::Boolean
    ) {
        return Err(FqError::Unsupported(format!(
            "comparison not supported for {:?}",
            l.data_type()
        )));
    }
    let res = match op {
        BinaryOp::Eq => eq(l, r),
        BinaryOp::NotEq => neq(l, r),
        BinaryOp::Lt => lt(l, r),
        BinaryOp::LtEq => lt_eq(l, r),
        BinaryOp::Gt => gt(l, r),
        BinaryOp::GtEq => gt_eq(l, r),
        other => {
            return Err(FqError::Execution(format!(
                "{other:?} is not a comparison"
            )));
        }
    }
    .map_err(|e| FqError::Execution(format!("cmp kernel failed: {e}")))?;
    Ok(Arc::new(res))
}
