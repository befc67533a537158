//! Single-cell values used for grouping keys, set membership and aggregate states.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float32Array, Float64Array, Float64Builder,
    Int32Array, Int64Array, Int64Builder, StringArray, StringBuilder, new_null_array,
};
use arrow_schema::DataType;
use fq_common::{FqError, Result};
use serde::{Deserialize, Serialize};

/// A cell value. Floats are kept as raw bits so values hash and compare exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    Int64(i64),
    Float64Bits(u64),
    Utf8(String),
    Boolean(bool),
    Null,
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Int64(v) => {
                0_u8.hash(state);
                v.hash(state);
            }
            Self::Float64Bits(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Self::Utf8(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Boolean(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::Null => 4_u8.hash(state),
        }
    }
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Approximate heap footprint, used by size limits on hash tables.
    pub fn estimate_bytes(&self) -> usize {
        match self {
            ScalarValue::Int64(_) | ScalarValue::Float64Bits(_) => 8,
            ScalarValue::Utf8(s) => s.len() + 24,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Null => 0,
        }
    }
}

pub fn hash_encoded_key(key: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// Byte encoding of a tuple of values; equal tuples encode to equal bytes.
pub fn encode_group_key(values: &[ScalarValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 16);
    for value in values {
        match value {
            ScalarValue::Null => out.push(0),
            ScalarValue::Int64(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Float64Bits(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
            ScalarValue::Boolean(v) => {
                out.push(3);
                out.push(u8::from(*v));
            }
            ScalarValue::Utf8(s) => {
                out.push(4);
                let len = s.len() as u32;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
        out.push(0xff);
    }
    out
}

/// Encodes row `row` of the given key columns.
pub fn encode_row(columns: &[ArrayRef], row: usize) -> Result<(Vec<ScalarValue>, Vec<u8>)> {
    let key = columns
        .iter()
        .map(|a| scalar_from_array(a, row))
        .collect::<Result<Vec<_>>>()?;
    let encoded = encode_group_key(&key);
    Ok((key, encoded))
}

pub fn scalar_from_array(array: &ArrayRef, row: usize) -> Result<ScalarValue> {
    if array.is_null(row) {
        return Ok(ScalarValue::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| FqError::Execution("expected Int64Array".to_string()))?;
            Ok(ScalarValue::Int64(a.value(row)))
        }
        DataType::Int32 => {
            let a = array
                .as_any()
                .downcast_ref::<Int32Array>()
                .ok_or_else(|| FqError::Execution("expected Int32Array".to_string()))?;
            Ok(ScalarValue::Int64(a.value(row) as i64))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| FqError::Execution("expected Float64Array".to_string()))?;
            Ok(ScalarValue::Float64Bits(a.value(row).to_bits()))
        }
        DataType::Float32 => {
            let a = array
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| FqError::Execution("expected Float32Array".to_string()))?;
            Ok(ScalarValue::Float64Bits((a.value(row) as f64).to_bits()))
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| FqError::Execution("expected StringArray".to_string()))?;
            Ok(ScalarValue::Utf8(a.value(row).to_string()))
        }
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| FqError::Execution("expected BooleanArray".to_string()))?;
            Ok(ScalarValue::Boolean(a.value(row)))
        }
        DataType::Null => Ok(ScalarValue::Null),
        other => Err(FqError::Unsupported(format!(
            "scalar type not supported: {other:?}"
        ))),
    }
}

pub fn scalars_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
    match dt {
        DataType::Int64 => {
            let mut b = Int64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Int64(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(FqError::Execution(
                            "type mismatch while building Int64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Float64 => {
            let mut b = Float64Builder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Float64Bits(x) => b.append_value(f64::from_bits(*x)),
                    ScalarValue::Int64(x) => b.append_value(*x as f64),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(FqError::Execution(
                            "type mismatch while building Float64 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Utf8 => {
            let mut b = StringBuilder::with_capacity(values.len(), values.len() * 8);
            for v in values {
                match v {
                    ScalarValue::Utf8(x) => b.append_value(x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(FqError::Execution(
                            "type mismatch while building Utf8 array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(values.len());
            for v in values {
                match v {
                    ScalarValue::Boolean(x) => b.append_value(*x),
                    ScalarValue::Null => b.append_null(),
                    _ => {
                        return Err(FqError::Execution(
                            "type mismatch while building Boolean array".to_string(),
                        ));
                    }
                }
            }
            Ok(Arc::new(b.finish()))
        }
        DataType::Null => Ok(new_null_array(&DataType::Null, values.len())),
        other => Err(FqError::Unsupported(format!(
            "output type not supported: {other:?}"
        ))),
    }
}

/// The array type values of `dt` are rebuilt into after a round trip through
/// [`ScalarValue`].
pub fn scalar_type(dt: &DataType) -> Result<DataType> {
    match dt {
        DataType::Int64 | DataType::Int32 => Ok(DataType::Int64),
        DataType::Float64 | DataType::Float32 => Ok(DataType::Float64),
        DataType::Utf8 => Ok(DataType::Utf8),
        DataType::Boolean => Ok(DataType::Boolean),
        DataType::Null => Ok(DataType::Null),
        other => Err(FqError::Unsupported(format!(
            "scalar type not supported: {other:?}"
        ))),
    }
}

/// Zero value of a type: `0`, `0.0`, `''`, `false`; NULL for anything else.
pub fn default_scalar(dt: &DataType) -> ScalarValue {
    match dt {
        DataType::Int64 | DataType::Int32 => ScalarValue::Int64(0),
        DataType::Float64 | DataType::Float32 => ScalarValue::Float64Bits(0.0f64.to_bits()),
        DataType::Utf8 => ScalarValue::Utf8(String::new()),
        DataType::Boolean => ScalarValue::Boolean(false),
        _ => ScalarValue::Null,
    }
}

/// A column of `len` default values of type `dt`.
pub fn default_array(dt: &DataType, len: usize) -> Result<ArrayRef> {
    match dt {
        DataType::Int32 => Ok(Arc::new(Int32Array::from(vec![0; len]))),
        DataType::Float32 => Ok(Arc::new(Float32Array::from(vec![0.0; len]))),
        DataType::Int64 | DataType::Float64 | DataType::Utf8 | DataType::Boolean => {
            scalars_to_array(&vec![default_scalar(dt); len], dt)
        }
        other => Ok(new_null_array(other, len)),
    }
}

pub fn as_f64(v: &ScalarValue) -> Option<f64> {
    match v {
        ScalarValue::Int64(x) => Some(*x as f64),
        ScalarValue::Float64Bits(x) => Some(f64::from_bits(*x)),
        _ => None,
    }
}

pub fn scalar_lt(a: &ScalarValue, b: &ScalarValue) -> Result<bool> {
    match (a, b) {
        (ScalarValue::Int64(x), ScalarValue::Int64(y)) => Ok(x < y),
        (ScalarValue::Float64Bits(x), ScalarValue::Float64Bits(y)) => {
            Ok(f64::from_bits(*x) < f64::from_bits(*y))
        }
        (ScalarValue::Int64(_), ScalarValue::Float64Bits(_))
        | (ScalarValue::Float64Bits(_), ScalarValue::Int64(_)) => {
            Ok(as_f64(a).unwrap_or(0.0) < as_f64(b).unwrap_or(0.0))
        }
        (ScalarValue::Utf8(x), ScalarValue::Utf8(y)) => Ok(x < y),
        (ScalarValue::Boolean(x), ScalarValue::Boolean(y)) => Ok((!*x) & *y),
        _ => Err(FqError::Execution(
            "cannot compare values of different types".to_string(),
        )),
    }
}

pub fn scalar_gt(a: &ScalarValue, b: &ScalarValue) -> Result<bool> {
    scalar_lt(b, a)
}
