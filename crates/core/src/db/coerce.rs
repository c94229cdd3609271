//! Declared-type coercion of incoming values.
//!
//! Runs once per column per row on the DML path, after defaults and
//! autoincrement and before the constraint checks that read the coerced
//! value. Everything here either adapts the value to its declared type
//! (width tagging, CHAR padding, text-to-vector parsing) or rejects it with
//! a constraint error. The vector dimension check and unit-norm
//! normalization are deliberately NOT part of this pass: they are a step of
//! the ordered constraint pipeline ([`check_vector`]), run between the
//! column-level FOREIGN KEY check and the table-level CHECKs.

use crate::db::schema::{ColumnSchema, ColumnType};
use crate::error::{ConstraintError, DBError};
use micadb_types::{IntWidth, TextKind, Value};

pub fn coerce_value(value: Value, column: &ColumnSchema) -> Result<Value, DBError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let mismatch = |got: &Value| -> DBError {
        ConstraintError::TypeMismatch {
            column: column.name.clone(),
            expected: column.ty.to_string(),
            got: got.type_name().to_string(),
        }
        .into()
    };

    match &column.ty {
        ColumnType::SmallInt => int_width(value, column, IntWidth::I16),
        ColumnType::Int => int_width(value, column, IntWidth::I32),
        ColumnType::BigInt => int_width(value, column, IntWidth::I64),
        ColumnType::Float => match value {
            Value::Int { v, .. } => Ok(Value::Float(v as f64)),
            Value::Float(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ColumnType::Text => Ok(match value {
            Value::Text { v, .. } => Value::text(v),
            Value::Json(v) => Value::text(v),
            v @ (Value::Int { .. } | Value::Float(_)) => Value::text(v.to_string()),
            other => return Err(mismatch(&other)),
        }),
        ColumnType::Varchar(limit) => {
            let text = text_of(value).map_err(|v| mismatch(&v))?;
            let len = text.chars().count();
            if len > *limit as usize {
                return Err(ConstraintError::VarcharOverflow {
                    column: column.name.clone(),
                    limit: *limit,
                    len,
                }
                .into());
            }
            Ok(Value::Text {
                v: text,
                kind: TextKind::Varchar(*limit),
            })
        }
        ColumnType::Char(width) => {
            let text = text_of(value).map_err(|v| mismatch(&v))?;
            let width = *width as usize;
            // Blank-pad to exactly `width`; over-length input truncates.
            let mut chars: Vec<char> = text.chars().collect();
            chars.truncate(width);
            while chars.len() < width {
                chars.push(' ');
            }
            Ok(Value::Text {
                v: chars.into_iter().collect(),
                kind: TextKind::Char(width as u32),
            })
        }
        ColumnType::Blob => match value {
            Value::Blob(_) => Ok(value),
            Value::Text { v, .. } => Ok(Value::Blob(v.into_bytes())),
            other => Err(mismatch(&other)),
        },
        ColumnType::Json => match value {
            Value::Json(_) => Ok(value),
            Value::Text { v, .. } => Ok(Value::Json(v)),
            other => Err(mismatch(&other)),
        },
        ColumnType::Decimal { precision, scale } => {
            let f = value.as_float().ok_or_else(|| mismatch(&value))?;
            let integer_digits = precision.saturating_sub(*scale) as i32;
            if f.abs() >= 10f64.powi(integer_digits) {
                return Err(ConstraintError::DecimalOverflow {
                    column: column.name.clone(),
                    precision: *precision,
                    scale: *scale,
                }
                .into());
            }
            Ok(Value::Float(f))
        }
        ColumnType::Guid => {
            let text = text_of(value).map_err(|v| mismatch(&v))?;
            if !is_guid(&text) {
                return Err(ConstraintError::GuidFormat {
                    column: column.name.clone(),
                    value: text,
                }
                .into());
            }
            Ok(Value::text(text))
        }
        // Only the representation is adapted here; dimension and
        // normalization belong to the constraint pipeline.
        ColumnType::Vector { .. } => match value {
            Value::Vector(_) => Ok(value),
            Value::Text { ref v, .. } => {
                let vec = parse_vector_text(v).ok_or_else(|| mismatch(&value))?;
                Ok(Value::Vector(vec))
            }
            other => Err(mismatch(&other)),
        },
    }
}

/// The vector constraint step: dimension check, then unit-norm
/// normalization unless the column is marked NO NORMALIZE.
pub(crate) fn check_vector(value: Value, column: &ColumnSchema) -> Result<Value, DBError> {
    let ColumnType::Vector { dim, normalize } = &column.ty else {
        return Ok(value);
    };
    let Value::Vector(vec) = value else {
        return Ok(value);
    };
    if vec.len() != *dim as usize {
        return Err(ConstraintError::VectorDimension {
            column: column.name.clone(),
            expected: *dim as usize,
            got: vec.len(),
        }
        .into());
    }
    Ok(Value::Vector(if *normalize { unit_norm(vec) } else { vec }))
}

fn int_width(value: Value, column: &ColumnSchema, width: IntWidth) -> Result<Value, DBError> {
    let v = match value {
        Value::Int { v, .. } => v,
        // Integral floats are accepted; anything fractional is not an
        // integer value.
        Value::Float(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => f as i64,
        other => {
            return Err(ConstraintError::TypeMismatch {
                column: column.name.clone(),
                expected: column.ty.to_string(),
                got: other.type_name().to_string(),
            }
            .into());
        }
    };
    if !width.contains(v) {
        return Err(ConstraintError::IntRange {
            column: column.name.clone(),
            ty: column.ty.to_string(),
        }
        .into());
    }
    Ok(Value::Int { v, width })
}

fn text_of(value: Value) -> Result<String, Value> {
    match value {
        Value::Text { v, .. } => Ok(v),
        other => Err(other),
    }
}

fn is_guid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    groups.len() == lens.len()
        && groups
            .iter()
            .zip(lens)
            .all(|(g, n)| g.len() == n && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Parse a `[x, y, ..]` vector literal.
pub fn parse_vector_text(s: &str) -> Option<Vec<f32>> {
    let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|p| p.trim().parse::<f32>().ok())
        .collect()
}

fn unit_norm(vec: Vec<f32>) -> Vec<f32> {
    let norm = vec.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec;
    }
    vec.into_iter().map(|x| (x as f64 / norm) as f32).collect()
}
