//! Window functions.
//!
//! The window operator replaces the projection for any SELECT list that
//! contains an OVER clause. It materializes its input, computes each window
//! item over its partitions, evaluates the plain items per row, and emits in
//! the order of the first window's PARTITION BY / ORDER BY sort; rows in a
//! windowless query would never reach this operator.

use crate::error::{DBError, PlanError};
use crate::exec::aggregate::Acc;
use crate::exec::eval::{eval, Env};
use crate::exec::{BoxIter, RowIter};
use crate::plan::ProjItem;
use crate::sql::ast::{Expr, FrameBound, FrameUnits, FunctionCall, WindowFrame, WindowSpec};
use ahash::AHashMap;
use micadb_types::{Row, RowKey, Value};
use std::cmp::Ordering;

pub struct WindowIter {
    child: Option<BoxIter>,
    child_columns: Vec<String>,
    items: Vec<ProjItem>,
    out: std::vec::IntoIter<Row>,
    current: Row,
    err: Option<DBError>,
}

impl WindowIter {
    pub fn new(child: BoxIter, child_columns: Vec<String>, items: Vec<ProjItem>) -> Self {
        WindowIter {
            child: Some(child),
            child_columns,
            items,
            out: Vec::new().into_iter(),
            current: Row::new(),
            err: None,
        }
    }

    fn materialize(&mut self) -> Result<(), DBError> {
        let mut child = self.child.take().expect("window input already consumed");
        let rows = crate::exec::drain(child.as_mut())?;
        let n = rows.len();

        let mut columns: Vec<Vec<Value>> = Vec::with_capacity(self.items.len());
        let mut emission: Option<Vec<usize>> = None;

        for item in &self.items {
            match &item.expr {
                Expr::Function(call) if call.window.is_some() => {
                    let spec = call.window.as_ref().unwrap();
                    if emission.is_none() {
                        emission = Some(self.window_order(spec, &rows)?);
                    }
                    columns.push(self.compute_window(call, &rows)?);
                }
                e if e.contains_window() => {
                    return Err(PlanError::Unsupported {
                        feature: format!("window function inside a larger expression: {e}"),
                    }
                    .into());
                }
                e => {
                    let mut vals = Vec::with_capacity(n);
                    for row in &rows {
                        vals.push(eval(e, &Env::new(&self.child_columns, row))?);
                    }
                    columns.push(vals);
                }
            }
        }

        let order = emission.unwrap_or_else(|| (0..n).collect());
        let mut out = Vec::with_capacity(n);
        for idx in order {
            out.push(columns.iter().map(|c| c[idx].clone()).collect());
        }
        self.out = out.into_iter();
        Ok(())
    }

    /// Row indices in the order the first window's sort dictates.
    fn window_order(&self, spec: &WindowSpec, rows: &[Row]) -> Result<Vec<usize>, DBError> {
        let mut keyed = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let env = Env::new(&self.child_columns, row);
            let mut pkey = Vec::with_capacity(spec.partition_by.len());
            for p in &spec.partition_by {
                pkey.push(eval(p, &env)?);
            }
            let mut okey = Vec::with_capacity(spec.order_by.len());
            for o in &spec.order_by {
                okey.push(eval(&o.expr, &env)?);
            }
            keyed.push((pkey, okey, i));
        }
        let descs: Vec<bool> = spec.order_by.iter().map(|o| o.desc).collect();
        keyed.sort_by(|(pa, oa, _), (pb, ob, _)| {
            cmp_values(pa, pb, &[]).then_with(|| cmp_values(oa, ob, &descs))
        });
        Ok(keyed.into_iter().map(|(_, _, i)| i).collect())
    }

    fn compute_window(&self, call: &FunctionCall, rows: &[Row]) -> Result<Vec<Value>, DBError> {
        let spec = call.window.as_ref().unwrap();
        let n = rows.len();

        // Partition in first-seen order; order keys are computed once.
        let mut partition_index: AHashMap<RowKey, usize> = AHashMap::new();
        let mut partitions: Vec<Vec<usize>> = Vec::new();
        let mut okeys: Vec<Vec<Value>> = Vec::with_capacity(n);
        for (i, row) in rows.iter().enumerate() {
            let env = Env::new(&self.child_columns, row);
            let mut pvals = Vec::with_capacity(spec.partition_by.len());
            for p in &spec.partition_by {
                pvals.push(eval(p, &env)?);
            }
            let mut ovals = Vec::with_capacity(spec.order_by.len());
            for o in &spec.order_by {
                ovals.push(eval(&o.expr, &env)?);
            }
            okeys.push(ovals);
            let key = RowKey::of_row(&pvals);
            let slot = match partition_index.get(&key) {
                Some(s) => *s,
                None => {
                    partition_index.insert(key, partitions.len());
                    partitions.push(Vec::new());
                    partitions.len() - 1
                }
            };
            partitions[slot].push(i);
        }

        let descs: Vec<bool> = spec.order_by.iter().map(|o| o.desc).collect();
        let mut values = vec![Value::Null; n];

        for members in &mut partitions {
            members.sort_by(|&a, &b| cmp_values(&okeys[a], &okeys[b], &descs));
            self.fill_partition(call, spec, rows, members, &okeys, &descs, &mut values)?;
        }
        Ok(values)
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_partition(
        &self,
        call: &FunctionCall,
        spec: &WindowSpec,
        rows: &[Row],
        members: &[usize],
        okeys: &[Vec<Value>],
        descs: &[bool],
        values: &mut [Value],
    ) -> Result<(), DBError> {
        match call.name.as_str() {
            "ROW_NUMBER" => {
                for (pos, &idx) in members.iter().enumerate() {
                    values[idx] = Value::int(pos as i64 + 1);
                }
            }
            "RANK" | "DENSE_RANK" => {
                let dense = call.name == "DENSE_RANK";
                let mut rank = 0i64;
                let mut dense_rank = 0i64;
                for (pos, &idx) in members.iter().enumerate() {
                    let new_tier = pos == 0
                        || cmp_values(&okeys[idx], &okeys[members[pos - 1]], descs) != Ordering::Equal;
                    if new_tier {
                        rank = pos as i64 + 1;
                        dense_rank += 1;
                    }
                    values[idx] = Value::int(if dense { dense_rank } else { rank });
                }
            }
            "LAG" | "LEAD" => {
                let lead = call.name == "LEAD";
                let arg = call
                    .args
                    .first()
                    .ok_or_else(|| PlanError::Unstructured(format!("{} requires an argument", call.name)))?;
                let k = match call.args.get(1) {
                    Some(e) => e.literal_int().ok_or_else(|| PlanError::Unstructured(
                        format!("{} offset must be an integer literal", call.name),
                    ))?,
                    None => 1,
                };
                for (pos, &idx) in members.iter().enumerate() {
                    let target = if lead {
                        pos.checked_add(k as usize)
                    } else {
                        pos.checked_sub(k as usize)
                    };
                    values[idx] = match target.and_then(|t| members.get(t)) {
                        Some(&t) => eval(arg, &Env::new(&self.child_columns, &rows[t]))?,
                        None => match call.args.get(2) {
                            Some(d) => eval(d, &Env::new(&self.child_columns, &rows[idx]))?,
                            None => Value::Null,
                        },
                    };
                }
            }
            "SUM" | "AVG" | "COUNT" | "MIN" | "MAX" => {
                let frame = effective_frame(spec);
                for (pos, &idx) in members.iter().enumerate() {
                    let mut acc = Acc::new(call);
                    for (jpos, &jidx) in members.iter().enumerate() {
                        if !in_frame(&frame, pos, jpos, members, okeys, descs)? {
                            continue;
                        }
                        acc.update(call, &Env::new(&self.child_columns, &rows[jidx]))?;
                    }
                    // An empty frame falls out naturally: COUNT finishes at
                    // 0, the rest finish NULL.
                    values[idx] = acc.finish();
                }
            }
            other => {
                return Err(PlanError::Unsupported {
                    feature: format!("window function {other}"),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl RowIter for WindowIter {
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

fn cmp_values(a: &[Value], b: &[Value], descs: &[bool]) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let ord = x.total_cmp(y);
        let ord = if descs.get(i).copied().unwrap_or(false) {
            ord.reverse()
        } else {
            ord
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// The frame in effect: the explicit one, else `RANGE UNBOUNDED PRECEDING ..
/// CURRENT ROW` under an ORDER BY, else the full partition.
fn effective_frame(spec: &WindowSpec) -> WindowFrame {
    match &spec.frame {
        Some(f) => f.clone(),
        None if !spec.order_by.is_empty() => WindowFrame {
            units: FrameUnits::Range,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::CurrentRow,
        },
        None => WindowFrame {
            units: FrameUnits::Range,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::UnboundedFollowing,
        },
    }
}

/// Whether partition position `jpos` falls inside the frame anchored at
/// `pos`.
fn in_frame(
    frame: &WindowFrame,
    pos: usize,
    jpos: usize,
    members: &[usize],
    okeys: &[Vec<Value>],
    descs: &[bool],
) -> Result<bool, DBError> {
    // Signed "how far after the current row" measure: positions for ROWS,
    // peer comparison or numeric key distance for RANGE.
    let row_dist = jpos as i64 - pos as i64;
    let peer_cmp = || {
        cmp_values(&okeys[members[jpos]], &okeys[members[pos]], descs) as i64
    };
    let value_dist = || -> Result<f64, DBError> {
        let a = okeys[members[jpos]]
            .first()
            .and_then(Value::as_float);
        let b = okeys[members[pos]]
            .first()
            .and_then(Value::as_float);
        let (Some(a), Some(b)) = (a, b) else {
            return Err(PlanError::Unsupported {
                feature: "RANGE offsets over a non-numeric ORDER BY key".into(),
            }
            .into());
        };
        let dir = if descs.first().copied().unwrap_or(false) { -1.0 } else { 1.0 };
        Ok((a - b) * dir)
    };

    let start_ok = match (frame.units, frame.start) {
        (_, FrameBound::UnboundedPreceding) => true,
        (_, FrameBound::UnboundedFollowing) => false,
        (FrameUnits::Rows, FrameBound::Preceding(k)) => row_dist >= -k,
        (FrameUnits::Rows, FrameBound::CurrentRow) => row_dist >= 0,
        (FrameUnits::Rows, FrameBound::Following(k)) => row_dist >= k,
        (FrameUnits::Range, FrameBound::CurrentRow) => peer_cmp() >= 0,
        (FrameUnits::Range, FrameBound::Preceding(k)) => value_dist()? >= -(k as f64),
        (FrameUnits::Range, FrameBound::Following(k)) => value_dist()? >= k as f64,
    };
    if !start_ok {
        return Ok(false);
    }
    let end_ok = match (frame.units, frame.end) {
        (_, FrameBound::UnboundedFollowing) => true,
        (_, FrameBound::UnboundedPreceding) => false,
        (FrameUnits::Rows, FrameBound::Preceding(k)) => row_dist <= -k,
        (FrameUnits::Rows, FrameBound::CurrentRow) => row_dist <= 0,
        (FrameUnits::Rows, FrameBound::Following(k)) => row_dist <= k,
        (FrameUnits::Range, FrameBound::CurrentRow) => peer_cmp() <= 0,
        (FrameUnits::Range, FrameBound::Preceding(k)) => value_dist()? <= -(k as f64),
        (FrameUnits::Range, FrameBound::Following(k)) => value_dist()? <= k as f64,
    };
    Ok(end_ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::drain;
    use crate::exec::scan::SliceIter;
    use crate::sql::parser::parse_expr_text;

    fn item(text: &str) -> ProjItem {
        ProjItem {
            expr: parse_expr_text(text).unwrap(),
            name: text.to_string(),
        }
    }

    fn run(rows: Vec<Row>, columns: &[&str], items: &[&str]) -> Vec<Row> {
        let mut iter = WindowIter::new(
            Box::new(SliceIter::new(rows)),
            columns.iter().map(|s| s.to_string()).collect(),
            items.iter().map(|i| item(i)).collect(),
        );
        drain(&mut iter).unwrap()
    }

    fn salaries() -> Vec<Row> {
        vec![
            vec![Value::text("Alice"), Value::int(50000)],
            vec![Value::text("Bob"), Value::int(60000)],
            vec![Value::text("Charlie"), Value::int(55000)],
        ]
    }

    #[test]
    fn row_number_orders_emission() {
        let out = run(
            salaries(),
            &["name", "salary"],
            &["name", "ROW_NUMBER() OVER (ORDER BY salary DESC)"],
        );
        assert_eq!(
            out,
            vec![
                vec![Value::text("Bob"), Value::int(1)],
                vec![Value::text("Charlie"), Value::int(2)],
                vec![Value::text("Alice"), Value::int(3)],
            ]
        );
    }

    #[test]
    fn rank_and_dense_rank_share_tiers() {
        let rows = vec![
            vec![Value::int(10)],
            vec![Value::int(10)],
            vec![Value::int(20)],
        ];
        let out = run(
            rows,
            &["x"],
            &[
                "RANK() OVER (ORDER BY x)",
                "DENSE_RANK() OVER (ORDER BY x)",
            ],
        );
        assert_eq!(
            out,
            vec![
                vec![Value::int(1), Value::int(1)],
                vec![Value::int(1), Value::int(1)],
                vec![Value::int(3), Value::int(2)],
            ]
        );
    }

    #[test]
    fn lag_and_lead_defaults() {
        let rows = vec![vec![Value::int(1)], vec![Value::int(2)], vec![Value::int(3)]];
        let out = run(
            rows,
            &["x"],
            &[
                "x",
                "LAG(x) OVER (ORDER BY x)",
                "LEAD(x, 1, -1) OVER (ORDER BY x)",
            ],
        );
        assert_eq!(
            out,
            vec![
                vec![Value::int(1), Value::Null, Value::int(2)],
                vec![Value::int(2), Value::int(1), Value::int(3)],
                vec![Value::int(3), Value::int(2), Value::int(-1)],
            ]
        );
    }

    #[test]
    fn default_frame_is_running_total() {
        let rows = vec![vec![Value::int(10)], vec![Value::int(20)], vec![Value::int(30)]];
        let out = run(rows, &["x"], &["x", "SUM(x) OVER (ORDER BY x)"]);
        assert_eq!(
            out,
            vec![
                vec![Value::int(10), Value::int(10)],
                vec![Value::int(20), Value::int(30)],
                vec![Value::int(30), Value::int(60)],
            ]
        );
    }

    #[test]
    fn range_current_row_includes_peers() {
        let rows = vec![vec![Value::int(10)], vec![Value::int(10)], vec![Value::int(20)]];
        let out = run(rows, &["x"], &["SUM(x) OVER (ORDER BY x)"]);
        // Both peers at 10 see the full peer group.
        assert_eq!(
            out,
            vec![
                vec![Value::int(20)],
                vec![Value::int(20)],
                vec![Value::int(40)],
            ]
        );
    }

    #[test]
    fn explicit_rows_frame() {
        let rows = vec![vec![Value::int(1)], vec![Value::int(2)], vec![Value::int(3)], vec![Value::int(4)]];
        let out = run(
            rows,
            &["x"],
            &["SUM(x) OVER (ORDER BY x ROWS BETWEEN 1 PRECEDING AND CURRENT ROW)"],
        );
        assert_eq!(
            out,
            vec![
                vec![Value::int(1)],
                vec![Value::int(3)],
                vec![Value::int(5)],
                vec![Value::int(7)],
            ]
        );
    }

    #[test]
    fn partitioned_row_number() {
        let rows = vec![
            vec![Value::text("a"), Value::int(1)],
            vec![Value::text("b"), Value::int(2)],
            vec![Value::text("a"), Value::int(3)],
        ];
        let out = run(
            rows,
            &["grp", "x"],
            &["grp", "ROW_NUMBER() OVER (PARTITION BY grp ORDER BY x)"],
        );
        // Partitions sort before emission: all of `a` then all of `b`.
        assert_eq!(
            out,
            vec![
                vec![Value::text("a"), Value::int(1)],
                vec![Value::text("a"), Value::int(2)],
                vec![Value::text("b"), Value::int(1)],
            ]
        );
    }

    #[test]
    fn empty_input_emits_nothing() {
        let out = run(vec![], &["x"], &["ROW_NUMBER() OVER (ORDER BY x)"]);
        assert!(out.is_empty());
    }

    #[test]
    fn full_partition_without_order() {
        let rows = vec![vec![Value::int(1)], vec![Value::int(2)]];
        let out = run(rows, &["x"], &["SUM(x) OVER ()"]);
        assert_eq!(out, vec![vec![Value::int(3)], vec![Value::int(3)]]);
    }
}
