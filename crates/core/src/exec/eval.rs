//! Expression evaluation against a row.
//!
//! Column references resolve by name against the emitted column names of the
//! operator below: a qualified `t.c` matches `t.c` exactly, an unqualified
//! `c` matches `c` or any `<qualifier>.c` (first hit wins). Trigger bodies
//! additionally see `OLD.<col>` / `NEW.<col>` through the trigger context.

use crate::error::{DBError, PlanError, RuntimeError};
use crate::sql::ast::{BinOp, Expr, UnOp};
use crate::sql::func;
use micadb_types::{Row, Value};
use std::cmp::Ordering;

/// OLD/NEW rows visible to expressions inside trigger actions.
#[derive(Debug, Clone)]
pub struct TriggerRowCtx {
    /// Column names of the trigger's target table.
    pub columns: Vec<String>,
    pub old: Option<Row>,
    pub new: Option<Row>,
}

/// Everything an expression can see.
pub struct Env<'a> {
    pub columns: &'a [String],
    pub row: &'a Row,
    pub trigger: Option<&'a TriggerRowCtx>,
}

static EMPTY_ROW: Row = Vec::new();

impl<'a> Env<'a> {
    pub fn new(columns: &'a [String], row: &'a Row) -> Self {
        Env {
            columns,
            row,
            trigger: None,
        }
    }

    /// An environment with no columns in scope: constraint defaults, DDL
    /// expressions, trigger bodies outside any scan.
    pub fn empty(trigger: Option<&'a TriggerRowCtx>) -> Self {
        Env {
            columns: &[],
            row: &EMPTY_ROW,
            trigger,
        }
    }
}

/// Position of `name` (optionally qualified) in `columns`.
pub fn resolve_column(columns: &[String], table: Option<&str>, name: &str) -> Option<usize> {
    if let Some(table) = table {
        let qualified = format!("{table}.{name}");
        return columns.iter().position(|c| c.eq_ignore_ascii_case(&qualified));
    }
    if let Some(i) = columns.iter().position(|c| c.eq_ignore_ascii_case(name)) {
        return Some(i);
    }
    columns.iter().position(|c| {
        c.rsplit_once('.')
            .map(|(_, short)| short.eq_ignore_ascii_case(name))
            .unwrap_or(false)
    })
}

pub fn eval(expr: &Expr, env: &Env) -> Result<Value, DBError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column { table, name } => eval_column(env, table.as_deref(), name),
        Expr::Wildcard => Err(PlanError::Unstructured("`*` outside COUNT(*)".into()).into()),
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, env),
        Expr::Unary { op, expr } => {
            let v = eval(expr, env)?;
            match op {
                UnOp::Neg => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int { v, width } => Ok(Value::Int { v: -v, width }),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(RuntimeError::BadArgument {
                        function: "-".into(),
                        message: format!("cannot negate {}", other.type_name()),
                    }
                    .into()),
                },
                UnOp::Not => Ok(match bool3(&v) {
                    Some(b) => Value::int(!b as i64),
                    None => Value::Null,
                }),
            }
        }
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, env)?;
            Ok(Value::int((v.is_null() != *negated) as i64))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let v = eval(expr, env)?;
            let p = eval(pattern, env)?;
            if v.is_null() || p.is_null() {
                return Ok(Value::Null);
            }
            let (Some(s), Some(pat)) = (v.as_text(), p.as_text()) else {
                return Err(RuntimeError::BadArgument {
                    function: "LIKE".into(),
                    message: "operands must be text".into(),
                }
                .into());
            };
            let hit = like_match(pat.as_bytes(), s.as_bytes());
            Ok(Value::int((hit != *negated) as i64))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let v = eval(expr, env)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                let item = eval(item, env)?;
                if item.is_null() {
                    saw_null = true;
                    continue;
                }
                if v.sql_cmp(&item) == Some(Ordering::Equal) {
                    return Ok(Value::int(!*negated as i64));
                }
            }
            if saw_null {
                return Ok(Value::Null);
            }
            Ok(Value::int(*negated as i64))
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval(expr, env)?;
            let lo = eval(low, env)?;
            let hi = eval(high, env)?;
            let ge = cmp_bool(&v, &lo, |o| o != Ordering::Less);
            let le = cmp_bool(&v, &hi, |o| o != Ordering::Greater);
            Ok(match and3(ge, le) {
                Some(b) => Value::int((b != *negated) as i64),
                None => Value::Null,
            })
        }
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => {
            let operand = operand.as_ref().map(|o| eval(o, env)).transpose()?;
            for (when, then) in branches {
                let w = eval(when, env)?;
                let hit = match &operand {
                    Some(op) => op.sql_cmp(&w) == Some(Ordering::Equal),
                    None => w.is_truthy(),
                };
                if hit {
                    return eval(then, env);
                }
            }
            match else_expr {
                Some(e) => eval(e, env),
                None => Ok(Value::Null),
            }
        }
        Expr::Function(call) => {
            if call.window.is_some() {
                return Err(PlanError::Unstructured(format!(
                    "window function {} outside a window context",
                    call.name
                ))
                .into());
            }
            if call.is_aggregate() {
                return Err(PlanError::Unstructured(format!(
                    "aggregate {} outside an aggregate context",
                    call.name
                ))
                .into());
            }
            if crate::sql::ast::WINDOW_ONLY_FUNCTIONS.contains(&call.name.as_str()) {
                return Err(PlanError::Unstructured(format!("{} requires an OVER clause", call.name)).into());
            }
            let f = func::lookup(&call.name).ok_or_else(|| RuntimeError::UnknownFunction(call.name.clone()))?;
            let args = call
                .args
                .iter()
                .map(|a| eval(a, env))
                .collect::<Result<Vec<_>, _>>()?;
            f(&args)
        }
        Expr::Subquery(_) | Expr::InSubquery { .. } => {
            Err(PlanError::Unstructured("subquery was not materialized before evaluation".into()).into())
        }
    }
}

fn eval_column(env: &Env, table: Option<&str>, name: &str) -> Result<Value, DBError> {
    // OLD/NEW pseudo-tables take priority inside trigger bodies.
    if let (Some(ctx), Some(qualifier)) = (env.trigger, table) {
        let side = if qualifier.eq_ignore_ascii_case("OLD") {
            Some(&ctx.old)
        } else if qualifier.eq_ignore_ascii_case("NEW") {
            Some(&ctx.new)
        } else {
            None
        };
        if let Some(side) = side {
            let row = side
                .as_ref()
                .ok_or_else(|| PlanError::Unstructured(format!("{qualifier}.{name} is not available here")))?;
            let i = resolve_column(&ctx.columns, None, name)
                .ok_or_else(|| PlanError::UnknownColumn {
                    column: format!("{qualifier}.{name}"),
                })?;
            return Ok(row[i].clone());
        }
    }
    match resolve_column(env.columns, table, name) {
        Some(i) => Ok(env.row[i].clone()),
        None => Err(PlanError::UnknownColumn {
            column: match table {
                Some(t) => format!("{t}.{name}"),
                None => name.to_string(),
            },
        }
        .into()),
    }
}

/// Three-valued truth of a value: `None` for NULL.
fn bool3(v: &Value) -> Option<bool> {
    if v.is_null() {
        None
    } else {
        Some(v.is_truthy())
    }
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

fn cmp_bool(a: &Value, b: &Value, test: impl Fn(Ordering) -> bool) -> Option<bool> {
    a.sql_cmp(b).map(test)
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, env: &Env) -> Result<Value, DBError> {
    // AND/OR short-circuit on a determining left side.
    match op {
        BinOp::And => {
            let l = bool3(&eval(left, env)?);
            if l == Some(false) {
                return Ok(Value::int(0));
            }
            let r = bool3(&eval(right, env)?);
            return Ok(match and3(l, r) {
                Some(b) => Value::int(b as i64),
                None => Value::Null,
            });
        }
        BinOp::Or => {
            let l = bool3(&eval(left, env)?);
            if l == Some(true) {
                return Ok(Value::int(1));
            }
            let r = bool3(&eval(right, env)?);
            return Ok(match or3(l, r) {
                Some(b) => Value::int(b as i64),
                None => Value::Null,
            });
        }
        _ => {}
    }

    let l = eval(left, env)?;
    let r = eval(right, env)?;
    match op {
        BinOp::Eq => Ok(tri(cmp_bool(&l, &r, |o| o == Ordering::Equal))),
        BinOp::NotEq => Ok(tri(cmp_bool(&l, &r, |o| o != Ordering::Equal))),
        BinOp::Lt => Ok(tri(cmp_bool(&l, &r, |o| o == Ordering::Less))),
        BinOp::LtEq => Ok(tri(cmp_bool(&l, &r, |o| o != Ordering::Greater))),
        BinOp::Gt => Ok(tri(cmp_bool(&l, &r, |o| o == Ordering::Greater))),
        BinOp::GtEq => Ok(tri(cmp_bool(&l, &r, |o| o != Ordering::Less))),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => arith(op, &l, &r),
        BinOp::Concat => {
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::text(format!("{l}{r}")))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn tri(b: Option<bool>) -> Value {
    match b {
        Some(b) => Value::int(b as i64),
        None => Value::Null,
    }
}

fn arith(op: BinOp, l: &Value, r: &Value) -> Result<Value, DBError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (l.as_int(), r.as_int()) {
        (Some(a), Some(b)) => {
            let out = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div => {
                    if b == 0 {
                        return Err(RuntimeError::DivisionByZero.into());
                    }
                    a.checked_div(b)
                }
                BinOp::Mod => {
                    if b == 0 {
                        return Err(RuntimeError::DivisionByZero.into());
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            match out {
                Some(v) => Ok(Value::int(v)),
                // Overflow widens to float rather than wrapping.
                None => arith_float(op, a as f64, b as f64),
            }
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_float(), r.as_float()) else {
                return Err(RuntimeError::BadArgument {
                    function: op.to_string(),
                    message: format!("cannot apply to {} and {}", l.type_name(), r.type_name()),
                }
                .into());
            };
            arith_float(op, a, b)
        }
    }
}

fn arith_float(op: BinOp, a: f64, b: f64) -> Result<Value, DBError> {
    if b == 0.0 && matches!(op, BinOp::Div | BinOp::Mod) {
        return Err(RuntimeError::DivisionByZero.into());
    }
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a % b,
        _ => unreachable!(),
    }))
}

/// `%` / `_` glob matching over bytes, case-sensitive.
fn like_match(pattern: &[u8], s: &[u8]) -> bool {
    match pattern.split_first() {
        None => s.is_empty(),
        Some((b'%', rest)) => (0..=s.len()).any(|i| like_match(rest, &s[i..])),
        Some((b'_', rest)) => !s.is_empty() && like_match(rest, &s[1..]),
        Some((c, rest)) => s.first() == Some(c) && like_match(rest, &s[1..]),
    }
}
