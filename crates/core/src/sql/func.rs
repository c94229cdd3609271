//! Built-in scalar function registry.
//!
//! Lookup is case-insensitive and returns a plain function pointer taking
//! the already-evaluated argument values.

use crate::error::{DBError, RuntimeError};
use micadb_types::Value;

pub type ScalarFn = fn(&[Value]) -> Result<Value, DBError>;

pub fn lookup(name: &str) -> Option<ScalarFn> {
    Some(match name.to_ascii_uppercase().as_str() {
        "IF" => fn_if,
        "COALESCE" => fn_coalesce,
        "IFNULL" => fn_coalesce,
        "NULLIF" => fn_nullif,
        "ABS" => fn_abs,
        "ROUND" => fn_round,
        "UPPER" => fn_upper,
        "LOWER" => fn_lower,
        "LENGTH" => fn_length,
        "SUBSTR" | "SUBSTRING" => fn_substr,
        "TRIM" => fn_trim,
        "REPLACE" => fn_replace,
        "VECTOR" => fn_vector,
        _ => return None,
    })
}

fn bad(function: &str, message: impl Into<String>) -> DBError {
    RuntimeError::BadArgument {
        function: function.into(),
        message: message.into(),
    }
    .into()
}

fn want(function: &str, args: &[Value], n: usize) -> Result<(), DBError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(bad(function, format!("expected {n} arguments, got {}", args.len())))
    }
}

fn text_arg<'a>(function: &str, args: &'a [Value], i: usize) -> Result<Option<&'a str>, DBError> {
    match &args[i] {
        Value::Null => Ok(None),
        v => v
            .as_text()
            .map(Some)
            .ok_or_else(|| bad(function, format!("argument {} must be text, got {}", i + 1, v.type_name()))),
    }
}

fn fn_if(args: &[Value]) -> Result<Value, DBError> {
    want("IF", args, 3)?;
    Ok(if args[0].is_truthy() {
        args[1].clone()
    } else {
        args[2].clone()
    })
}

fn fn_coalesce(args: &[Value]) -> Result<Value, DBError> {
    Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null))
}

fn fn_nullif(args: &[Value]) -> Result<Value, DBError> {
    want("NULLIF", args, 2)?;
    if args[0].sql_cmp(&args[1]) == Some(std::cmp::Ordering::Equal) {
        Ok(Value::Null)
    } else {
        Ok(args[0].clone())
    }
}

fn fn_abs(args: &[Value]) -> Result<Value, DBError> {
    want("ABS", args, 1)?;
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::Int { v, width } => Ok(Value::Int {
            v: v.wrapping_abs(),
            width: *width,
        }),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        other => Err(bad("ABS", format!("expected a number, got {}", other.type_name()))),
    }
}

fn fn_round(args: &[Value]) -> Result<Value, DBError> {
    if args.is_empty() || args.len() > 2 {
        return Err(bad("ROUND", "expected 1 or 2 arguments"));
    }
    let digits = match args.get(1) {
        None => 0,
        Some(v) => v.as_int().ok_or_else(|| bad("ROUND", "digits must be an integer"))?,
    };
    match &args[0] {
        Value::Null => Ok(Value::Null),
        Value::Int { .. } => Ok(args[0].clone()),
        Value::Float(f) => {
            let scale = 10f64.powi(digits as i32);
            Ok(Value::Float((f * scale).round() / scale))
        }
        other => Err(bad("ROUND", format!("expected a number, got {}", other.type_name()))),
    }
}

fn fn_upper(args: &[Value]) -> Result<Value, DBError> {
    want("UPPER", args, 1)?;
    Ok(match text_arg("UPPER", args, 0)? {
        Some(s) => Value::text(s.to_uppercase()),
        None => Value::Null,
    })
}

fn fn_lower(args: &[Value]) -> Result<Value, DBError> {
    want("LOWER", args, 1)?;
    Ok(match text_arg("LOWER", args, 0)? {
        Some(s) => Value::text(s.to_lowercase()),
        None => Value::Null,
    })
}

fn fn_length(args: &[Value]) -> Result<Value, DBError> {
    want("LENGTH", args, 1)?;
    Ok(match &args[0] {
        Value::Null => Value::Null,
        Value::Blob(b) => Value::int(b.len() as i64),
        v => match v.as_text() {
            Some(s) => Value::int(s.chars().count() as i64),
            None => return Err(bad("LENGTH", format!("expected text or blob, got {}", v.type_name()))),
        },
    })
}

fn fn_substr(args: &[Value]) -> Result<Value, DBError> {
    if args.len() != 2 && args.len() != 3 {
        return Err(bad("SUBSTR", "expected 2 or 3 arguments"));
    }
    let Some(s) = text_arg("SUBSTR", args, 0)? else {
        return Ok(Value::Null);
    };
    let start = args[1].as_int().ok_or_else(|| bad("SUBSTR", "start must be an integer"))?;
    let len = match args.get(2) {
        None => None,
        Some(v) => Some(v.as_int().ok_or_else(|| bad("SUBSTR", "length must be an integer"))?),
    };
    let chars: Vec<char> = s.chars().collect();
    // 1-based start; a non-positive start counts from the string head.
    let from = (start.max(1) - 1) as usize;
    let taken: String = match len {
        Some(n) if n >= 0 => chars.iter().skip(from).take(n as usize).collect(),
        Some(_) => String::new(),
        None => chars.iter().skip(from).collect(),
    };
    Ok(Value::text(taken))
}

fn fn_trim(args: &[Value]) -> Result<Value, DBError> {
    want("TRIM", args, 1)?;
    Ok(match text_arg("TRIM", args, 0)? {
        Some(s) => Value::text(s.trim().to_string()),
        None => Value::Null,
    })
}

fn fn_replace(args: &[Value]) -> Result<Value, DBError> {
    want("REPLACE", args, 3)?;
    let (Some(s), Some(from), Some(to)) = (
        text_arg("REPLACE", args, 0)?,
        text_arg("REPLACE", args, 1)?,
        text_arg("REPLACE", args, 2)?,
    ) else {
        return Ok(Value::Null);
    };
    Ok(Value::text(s.replace(from, to)))
}

/// `VECTOR(x, y, ..)`; also the lowering target of `ARRAY[..]` literals.
fn fn_vector(args: &[Value]) -> Result<Value, DBError> {
    let mut out = Vec::with_capacity(args.len());
    for v in args {
        let f = v
            .as_float()
            .ok_or_else(|| bad("VECTOR", format!("elements must be numbers, got {}", v.type_name())))?;
        out.push(f as f32);
    }
    Ok(Value::Vector(out))
}
