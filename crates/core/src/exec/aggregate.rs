//! Hash group-by with accumulating aggregates.

use crate::error::{DBError, PlanError, RuntimeError};
use crate::exec::eval::{eval, Env};
use crate::exec::{BoxIter, RowIter};
use crate::sql::ast::{Expr, FunctionCall};
use ahash::AHashMap;
use ahash::AHashSet;
use micadb_types::{Row, RowKey, Value};
use std::cmp::Ordering;

/// Materializes its child, groups rows by the GROUP BY expressions keyed by
/// [`RowKey`] (NULL is its own key, distinct from any value), accumulates
/// each aggregate, then filters groups by HAVING. Output rows are the
/// group-by values followed by the aggregate values, in declaration order.
///
/// Without GROUP BY, a single group always exists: zero input rows still
/// produce one output row with `COUNT(*) = 0` and NULL for the others.
pub struct AggregateIter {
    child: Option<BoxIter>,
    child_columns: Vec<String>,
    group_by: Vec<Expr>,
    aggregates: Vec<FunctionCall>,
    having: Option<Expr>,
    /// Output column names (group names then aggregate names); HAVING
    /// resolves against these.
    out_columns: Vec<String>,
    out: std::vec::IntoIter<Row>,
    current: Row,
    err: Option<DBError>,
}

impl AggregateIter {
    pub fn new(
        child: BoxIter,
        child_columns: Vec<String>,
        group_by: Vec<Expr>,
        aggregates: Vec<FunctionCall>,
        having: Option<Expr>,
        out_columns: Vec<String>,
    ) -> Self {
        AggregateIter {
            child: Some(child),
            child_columns,
            group_by,
            aggregates,
            having,
            out_columns,
            out: Vec::new().into_iter(),
            current: Row::new(),
            err: None,
        }
    }

    fn materialize(&mut self) -> Result<(), DBError> {
        let mut child = self.child.take().expect("aggregate input already consumed");
        let rows = crate::exec::drain(child.as_mut())?;

        // Group state in first-seen order.
        let mut keys: AHashMap<RowKey, usize> = AHashMap::new();
        let mut groups: Vec<(Row, Vec<Acc>)> = Vec::new();

        if self.group_by.is_empty() {
            keys.insert(RowKey::of_row(&[]), 0);
            groups.push((Row::new(), self.aggregates.iter().map(Acc::new).collect()));
        }

        for row in &rows {
            let env = Env::new(&self.child_columns, row);
            let mut group_vals = Row::with_capacity(self.group_by.len());
            for g in &self.group_by {
                group_vals.push(eval(g, &env)?);
            }
            let key = RowKey::of_row(&group_vals);
            let slot = match keys.get(&key) {
                Some(i) => *i,
                None => {
                    keys.insert(key, groups.len());
                    groups.push((group_vals, self.aggregates.iter().map(Acc::new).collect()));
                    groups.len() - 1
                }
            };
            for (acc, call) in groups[slot].1.iter_mut().zip(&self.aggregates) {
                acc.update(call, &env)?;
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (group_vals, accs) in groups {
            let mut row = group_vals;
            for acc in accs {
                row.push(acc.finish());
            }
            if let Some(having) = &self.having {
                let env = Env::new(&self.out_columns, &row);
                if !eval(having, &env)?.is_truthy() {
                    continue;
                }
            }
            out.push(row);
        }
        self.out = out.into_iter();
        Ok(())
    }
}

impl RowIter for AggregateIter {
    fn advance(&mut self) -> bool {
        if self.child.is_some() {
            if let Err(e) = self.materialize() {
                self.err = Some(e);
                return false;
            }
        }
        match self.out.next() {
            Some(row) => {
                self.current = row;
                true
            }
            None => false,
        }
    }

    fn current(&self) -> &Row {
        &self.current
    }

    fn take_err(&mut self) -> Option<DBError> {
        self.err.take()
    }

    fn close(&mut self) {
        if let Some(child) = self.child.as_mut() {
            child.close();
        }
        self.child = None;
        self.out = Vec::new().into_iter();
        self.current = Row::new();
    }
}

/// One aggregate's running state. Shared with framed window aggregates.
pub(crate) enum Acc {
    CountStar(i64),
    Count {
        n: i64,
        distinct: Option<AHashSet<RowKey>>,
    },
    /// SUM stays integer while every input is an integer; the first float
    /// (or an integer overflow) promotes it to float permanently.
    Sum {
        int: i64,
        float: f64,
        all_int: bool,
        seen: bool,
        distinct: Option<AHashSet<RowKey>>,
    },
    Avg {
        sum: f64,
        n: i64,
        distinct: Option<AHashSet<RowKey>>,
    },
    Min(Option<Value>),
    Max(Option<Value>),
}

pub(crate) fn is_count_star(call: &FunctionCall) -> bool {
    call.name == "COUNT" && (call.args.is_empty() || matches!(call.args[0], Expr::Wildcard))
}

impl Acc {
    pub(crate) fn new(call: &FunctionCall) -> Acc {
        let distinct = call.distinct.then(AHashSet::new);
        match call.name.as_str() {
            "COUNT" if is_count_star(call) => Acc::CountStar(0),
            "COUNT" => Acc::Count { n: 0, distinct },
            "SUM" => Acc::Sum {
                int: 0,
                float: 0.0,
                all_int: true,
                seen: false,
                distinct,
            },
            "AVG" => Acc::Avg {
                sum: 0.0,
                n: 0,
                distinct,
            },
            "MIN" => Acc::Min(None),
            "MAX" => Acc::Max(None),
            other => unreachable!("not an aggregate: {other}"),
        }
    }

    pub(crate) fn update(&mut self, call: &FunctionCall, env: &Env) -> Result<(), DBError> {
        if let Acc::CountStar(n) = self {
            *n += 1;
            return Ok(());
        }
        let arg = call
            .args
            .first()
            .ok_or_else(|| PlanError::Unstructured(format!("{} requires an argument", call.name)))?;
        let v = eval(arg, env)?;
        if v.is_null() {
            return Ok(());
        }
        match self {
            Acc::CountStar(_) => unreachable!(),
            Acc::Count { n, distinct } => {
                if fresh(distinct, &v) {
                    *n += 1;
                }
            }
            Acc::Sum {
                int,
                float,
                all_int,
                seen,
                distinct,
            } => {
                if !fresh(distinct, &v) {
                    return Ok(());
                }
                let f = v.as_float().ok_or_else(|| bad_agg("SUM", &v))?;
                *float += f;
                *seen = true;
                match (v.as_int(), *all_int) {
                    (Some(i), true) => match int.checked_add(i) {
                        Some(s) => *int = s,
                        None => *all_int = false,
                    },
                    _ => *all_int = false,
                }
            }
            Acc::Avg { sum, n, distinct } => {
                if !fresh(distinct, &v) {
                    return Ok(());
                }
                *sum += v.as_float().ok_or_else(|| bad_agg("AVG", &v))?;
                *n += 1;
            }
            Acc::Min(best) => {
                if best.as_ref().map(|b| v.total_cmp(b) == Ordering::Less).unwrap_or(true) {
                    *best = Some(v);
                }
            }
            Acc::Max(best) => {
                if best
                    .as_ref()
                    .map(|b| v.total_cmp(b) == Ordering::Greater)
                    .unwrap_or(true)
                {
                    *best = Some(v);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Value {
        match self {
            Acc::CountStar(n) => Value::int(n),
            Acc::Count { n, .. } => Value::int(n),
            Acc::Sum {
                int,
                float,
                all_int,
                seen,
                ..
            } => {
                if !seen {
                    Value::Null
                } else if all_int {
                    Value::int(int)
                } else {
                    Value::Float(float)
                }
            }
            Acc::Avg { sum, n, .. } => {
                if n == 0 {
                    Value::Null
                } else {
                    Value::Float(sum / n as f64)
                }
            }
            Acc::Min(best) | Acc::Max(best) => best.unwrap_or(Value::Null),
        }
    }
}

fn fresh(distinct: &mut Option<AHashSet<RowKey>>, v: &Value) -> bool {
    match distinct {
        Some(seen) => seen.insert(RowKey::of_value(v)),
        None => true,
    }
}

fn bad_agg(name: &str, v: &Value) -> DBError {
    RuntimeError::BadArgument {
        function: name.into(),
        message: format!("expected a number, got {}", v.type_name()),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::drain;
    use crate::exec::scan::SliceIter;
    use crate::sql::parser::parse_expr_text;

    fn agg_call(text: &str) -> FunctionCall {
        match parse_expr_text(text).unwrap() {
            Expr::Function(f) => f,
            other => panic!("not a call: {other:?}"),
        }
    }

    fn run(
        rows: Vec<Row>,
        columns: &[&str],
        group_by: &[&str],
        aggs: &[&str],
        having: Option<&str>,
    ) -> Vec<Row> {
        let group_by: Vec<Expr> = group_by.iter().map(|g| parse_expr_text(g).unwrap()).collect();
        let aggregates: Vec<FunctionCall> = aggs.iter().map(|a| agg_call(a)).collect();
        let mut out_columns: Vec<String> = group_by.iter().map(|g| g.to_string()).collect();
        out_columns.extend(aggregates.iter().map(|a| Expr::Function(a.clone()).to_string()));
        let mut iter = AggregateIter::new(
            Box::new(SliceIter::new(rows)),
            columns.iter().map(|s| s.to_string()).collect(),
            group_by,
            aggregates,
            having.map(|h| parse_expr_text(h).unwrap()),
            out_columns,
        );
        drain(&mut iter).unwrap()
    }

    fn dept_rows() -> Vec<Row> {
        vec![
            vec![Value::text("eng"), Value::int(10)],
            vec![Value::text("eng"), Value::int(20)],
            vec![Value::text("ops"), Value::int(5)],
        ]
    }

    #[test]
    fn group_by_counts_and_sums() {
        let out = run(
            dept_rows(),
            &["dept", "amount"],
            &["dept"],
            &["COUNT(*)", "SUM(amount)"],
            None,
        );
        assert_eq!(
            out,
            vec![
                vec![Value::text("eng"), Value::int(2), Value::int(30)],
                vec![Value::text("ops"), Value::int(1), Value::int(5)],
            ]
        );
    }

    #[test]
    fn empty_input_without_group_by_emits_one_group() {
        let out = run(vec![], &["x"], &[], &["COUNT(*)", "SUM(x)", "MIN(x)", "AVG(x)"], None);
        assert_eq!(
            out,
            vec![vec![Value::int(0), Value::Null, Value::Null, Value::Null]]
        );
    }

    #[test]
    fn count_expr_skips_nulls() {
        let rows = vec![vec![Value::int(1)], vec![Value::Null], vec![Value::int(3)]];
        let out = run(rows, &["x"], &[], &["COUNT(x)", "COUNT(*)"], None);
        assert_eq!(out, vec![vec![Value::int(2), Value::int(3)]]);
    }

    #[test]
    fn sum_preserves_floats() {
        let rows = vec![vec![Value::int(1)], vec![Value::Float(0.5)]];
        let out = run(rows, &["x"], &[], &["SUM(x)"], None);
        assert_eq!(out, vec![vec![Value::Float(1.5)]]);

        let rows = vec![vec![Value::int(1)], vec![Value::int(2)]];
        let out = run(rows, &["x"], &[], &["SUM(x)"], None);
        assert_eq!(out, vec![vec![Value::int(3)]]);
    }

    #[test]
    fn having_filters_groups_by_aggregate_name() {
        let out = run(
            dept_rows(),
            &["dept", "amount"],
            &["dept"],
            &["COUNT(*)"],
            Some("COUNT(*) > 1"),
        );
        assert_eq!(out, vec![vec![Value::text("eng"), Value::int(2)]]);
    }

    #[test]
    fn null_groups_merge() {
        let rows = vec![
            vec![Value::Null, Value::int(1)],
            vec![Value::Null, Value::int(2)],
            vec![Value::text("NULL"), Value::int(4)],
        ];
        let out = run(rows, &["k", "x"], &["k"], &["SUM(x)"], None);
        // NULL keys group together and never merge with the text 'NULL'.
        assert_eq!(
            out,
            vec![
                vec![Value::Null, Value::int(3)],
                vec![Value::text("NULL"), Value::int(4)],
            ]
        );
    }

    #[test]
    fn distinct_count() {
        let rows = vec![vec![Value::int(1)], vec![Value::int(1)], vec![Value::int(2)]];
        let out = run(rows, &["x"], &[], &["COUNT(DISTINCT x)"], None);
        assert_eq!(out, vec![vec![Value::int(2)]]);
    }
}
