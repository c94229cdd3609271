//! Join operators: a nested-loop join covering INNER/LEFT/RIGHT/FULL, and a
//! hash join for inner equi-joins.

use crate::error::DBError;
use crate::exec::eval::{eval, Env};
use crate::exec::{BoxIter, RowIter};
use crate::sql::ast::{Expr, JoinKind};
use ahash::AHashMap;
use micadb_types::{Row, RowKey, Value};

/// Nested-loop join.
///
/// The right input is fully materialized on first advance (iterators are not
/// restartable). A per-right-row matched flag supports RIGHT/FULL padding;
/// the pad width of each side starts from the planner-provided column counts
/// and is refined by the first observed row.
pub struct NestedLoopJoinIter {
    left: BoxIter,
    right: Option<BoxIter>,
    kind: JoinKind,
    on: Option<Expr>,
    columns: Vec<String>,
    left_cols: usize,
    right_cols: usize,
    right_rows: Vec<Row>,
    right_matched: Vec<bool>,
    current_left: Option<Row>,
    left_matched: bool,
    right_pos: usize,
    phase: Phase,
    current: Row,
    err: Option<DBError>,
}

enum Phase {
    Scan,
    RightPad(usize),
    Done,
}

impl NestedLoopJoinIter {
    pub fn new(
        left: BoxIter,
        right: BoxIter,
        kind: JoinKind,
        on: Option<Expr>,
        columns: Vec<String>,
        left_cols: usize,
        right_cols: usize,
    ) -> Self {
        NestedLoopJoinIter {
            left,
            right: Some(right),
            kind,
            on,
            columns,
            left_cols,
            right_cols,
            right_rows: Vec::new(),
            right_matched: Vec::new(),
            current_left: None,
            left_matched: false,
            right_pos: 0,
            phase: Phase::Scan,
            current: Row::new(),
            err: None,
        }
    }

    fn step(&mut self) -> Result<bool, DBError> {
        if let Some(mut right) = self.right.take() {
            self.right_rows = crate::exec::drain(right.as_mut())?;
            self.right_matched = vec![false; self.right_rows.len()];
            if let Some(first) = self.right_rows.first() {
                self.right_cols = first.len();
            }
        }

        loop {
            match self.phase {
                Phase::Scan => {
                    if self.current_left.is_none() {
                        if self.left.advance() {
                            let row = self.left.current().clone();
                            self.left_cols = row.len();
                            self.current_left = Some(row);
                            self.left_matched = false;
                            self.right_pos = 0;
                        } else {
                            if let Some(e) = self.left.take_err() {
                                return Err(e);
                            }
                            self.phase = if matches!(self.kind, JoinKind::Right | JoinKind::Full) {
                                Phase::RightPad(0)
                            } else {
                                Phase::Done
                            };
                            continue;
                        }
                    }
                    let left_row = self.current_left.as_ref().unwrap();

                    while self.right_pos < self.right_rows.len() {
                        let i = self.right_pos;
                        self.right_pos += 1;
                        let mut combined = left_row.clone();
                        combined.extend(self.right_rows[i].iter().cloned());
                        let hit = match &self.on {
                            Some(on) => {
                                let env = Env::new(&self.columns, &combined);
                                eval(on, &env)?.is_truthy()
                            }
                            None => true,
                        };
                        if hit {
                            self.left_matched = true;
                            self.right_matched[i] = true;
                            self.current = combined;
                            return Ok(true);
                        }
                    }

                    // Right side exhausted for this left row.
                    let pad_left = !self.left_matched && matches!(self.kind, JoinKind::Left | JoinKind::Full);
                    let mut finished = self.current_left.take().unwrap();
                    if pad_left {
                        finished.extend(std::iter::repeat(Value::Null).take(self.right_cols));
                        self.current = finished;
                        return Ok(true);
                    }
                }
                Phase::RightPad(mut i) => {
                    while i < self.right_rows.len() && self.right_matched[i] {
                        i += 1;
                    }
                    if i >= self.right_rows.len() {
                        self.phase = Phase::Done;
                        continue;
                    }
                    let mut row: Row = std::iter::repeat(Value::Null).take(self.left_cols).collect();
                    row.extend(self.right_rows[i].iter().cloned());
                    self.phase = Phase::RightPad(i + 1);
                    self.current = row;
                    return Ok(true);
                }
                Phase::Done => return Ok(false),
            }
        }
    }
}

impl RowIter for NestedLoopJoinIter {
    fn advance(&mut self) -> bool {
        match self.step() {
            Ok(more) => more,
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    fn current(&self) -> &Row {
        &self.current
    }

    fn take_err(&mut self) -> Option<DBError> {
        self.err.take().or_else(|| self.left.take_err())
    }

    fn close(&mut self) {
        self.left.close();
        if let Some(right) = self.right.as_mut() {
            right.close();
        }
        self.right = None;
        self.right_rows.clear();
        self.current = Row::new();
        self.phase = Phase::Done;
    }
}

/// Hash join for inner equi-joins on one key column per side.
///
/// The left input is built into a key → rows map on first advance; the right
/// input streams, emitting the cross-product of each right row with its
/// bucket. NULL keys never match.
pub struct HashJoinIter {
    left: Option<BoxIter>,
    right: BoxIter,
    left_key: Expr,
    right_key: Expr,
    left_columns: Vec<String>,
    right_columns: Vec<String>,
    buckets: AHashMap<RowKey, Vec<Row>>,
    pending: Vec<Row>,
    current: Row,
    err: Option<DBError>,
}

impl HashJoinIter {
    pub fn new(
        left: BoxIter,
        right: BoxIter,
        left_key: Expr,
        right_key: Expr,
        left_columns: Vec<String>,
        right_columns: Vec<String>,
    ) -> Self {
        HashJoinIter {
            left: Some(left),
            right,
            left_key,
            right_key,
            left_columns,
            right_columns,
            buckets: AHashMap::new(),
            pending: Vec::new(),
            current: Row::new(),
            err: None,
        }
    }

    fn build(&mut self) -> Result<(), DBError> {
        let mut left = self.left.take().expect("hash join already built");
        let rows = crate::exec::drain(left.as_mut())?;
        for row in rows {
            let key = eval(&self.left_key, &Env::new(&self.left_columns, &row))?;
            if key.is_null() {
                continue;
            }
            self.buckets.entry(RowKey::of_value(&key)).or_default().push(row);
        }
        Ok(())
    }

    fn step(&mut self) -> Result<bool, DBError> {
        if self.left.is_some() {
            self.build()?;
        }
        loop {
            if let Some(row) = self.pending.pop() {
                self.current = row;
                return Ok(true);
            }
            if !self.right.advance() {
                if let Some(e) = self.right.take_err() {
                    return Err(e);
                }
                return Ok(false);
            }
            let right_row = self.right.current();
            let key = eval(&self.right_key, &Env::new(&self.right_columns, right_row))?;
            if key.is_null() {
                continue;
            }
            if let Some(bucket) = self.buckets.get(&RowKey::of_value(&key)) {
                // Emit in bucket order.
                for left_row in bucket.iter().rev() {
                    let mut combined = left_row.clone();
                    combined.extend(right_row.iter().cloned());
                    self.pending.push(combined);
                }
            }
        }
    }
}

impl RowIter for HashJoinIter {
    fn advance(&mut self) -> bool {
        match self.step() {
            Ok(more) => more,
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    fn current(&self) -> &Row {
        &self.current
    }

    fn take_err(&mut self) -> Option<DBError> {
        self.err.take()
    }

    fn close(&mut self) {
        if let Some(left) = self.left.as_mut() {
            left.close();
        }
        self.left = None;
        self.right.close();
        self.buckets.clear();
        self.pending.clear();
        self.current = Row::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::drain;
    use crate::exec::scan::SliceIter;
    use crate::sql::parser::parse_expr_text;

    fn users() -> Vec<Row> {
        vec![
            vec![Value::int(1), Value::text("Alice")],
            vec![Value::int(2), Value::text("Bob")],
            vec![Value::int(3), Value::text("Charlie")],
        ]
    }

    fn orders() -> Vec<Row> {
        vec![
            vec![Value::int(101), Value::int(1), Value::int(50)],
            vec![Value::int(102), Value::int(1), Value::int(20)],
            vec![Value::int(103), Value::int(2), Value::int(100)],
        ]
    }

    fn join_cols() -> Vec<String> {
        ["users.id", "users.name", "orders.id", "orders.user_id", "orders.amount"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn nl_join(kind: JoinKind, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
        let on = parse_expr_text("users.id = orders.user_id").unwrap();
        let mut iter = NestedLoopJoinIter::new(
            Box::new(SliceIter::new(left)),
            Box::new(SliceIter::new(right)),
            kind,
            Some(on),
            join_cols(),
            2,
            3,
        );
        drain(&mut iter).unwrap()
    }

    #[test]
    fn inner_join_matches() {
        let out = nl_join(JoinKind::Inner, users(), orders());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0][1], Value::text("Alice"));
        assert_eq!(out[2][1], Value::text("Bob"));
    }

    #[test]
    fn left_join_pads_unmatched_left() {
        let out = nl_join(JoinKind::Left, users(), orders());
        // Charlie has no orders: padded with three NULLs.
        assert_eq!(out.len(), 4);
        let charlie = out.iter().find(|r| r[1] == Value::text("Charlie")).unwrap();
        assert_eq!(&charlie[2..], &[Value::Null, Value::Null, Value::Null]);
    }

    #[test]
    fn left_join_with_empty_right_yields_all_left() {
        let out = nl_join(JoinKind::Left, users(), vec![]);
        assert_eq!(out.len(), 3);
        for row in &out {
            assert_eq!(row.len(), 5);
            assert_eq!(&row[2..], &[Value::Null, Value::Null, Value::Null]);
        }
    }

    #[test]
    fn right_join_pads_unmatched_right() {
        let mut orders = orders();
        orders.push(vec![Value::int(104), Value::int(99), Value::int(7)]);
        let out = nl_join(JoinKind::Right, users(), orders);
        // Three matches plus one unmatched right row padded on the left.
        assert_eq!(out.len(), 4);
        let orphan = out.iter().find(|r| r[2] == Value::int(104)).unwrap();
        assert_eq!(&orphan[..2], &[Value::Null, Value::Null]);
    }

    #[test]
    fn right_join_with_empty_left_yields_all_right() {
        let out = nl_join(JoinKind::Right, vec![], orders());
        assert_eq!(out.len(), 3);
        for row in &out {
            assert_eq!(&row[..2], &[Value::Null, Value::Null]);
        }
    }

    #[test]
    fn full_join_pads_both_sides() {
        let mut orders = orders();
        orders.push(vec![Value::int(104), Value::int(99), Value::int(7)]);
        let out = nl_join(JoinKind::Full, users(), orders);
        // 3 matches + Charlie padded + orphan order padded.
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn hash_join_inner_equi() {
        let mut iter = HashJoinIter::new(
            Box::new(SliceIter::new(users())),
            Box::new(SliceIter::new(orders())),
            parse_expr_text("id").unwrap(),
            parse_expr_text("user_id").unwrap(),
            vec!["users.id".into(), "users.name".into()],
            vec!["orders.id".into(), "orders.user_id".into(), "orders.amount".into()],
        );
        let out = drain(&mut iter).unwrap();
        assert_eq!(out.len(), 3);
        let amounts: Vec<&Value> = out.iter().map(|r| &r[4]).collect();
        assert!(amounts.contains(&&Value::int(50)));
        assert!(amounts.contains(&&Value::int(100)));
    }

    #[test]
    fn hash_join_merges_numeric_classes() {
        // Bucketing must agree with the comparator: 2 = 2.0 is a match.
        let left = vec![vec![Value::int(2), Value::text("two")]];
        let right = vec![vec![Value::int(1), Value::Float(2.0), Value::int(9)]];
        let mut iter = HashJoinIter::new(
            Box::new(SliceIter::new(left)),
            Box::new(SliceIter::new(right)),
            parse_expr_text("id").unwrap(),
            parse_expr_text("user_id").unwrap(),
            vec!["users.id".into(), "users.name".into()],
            vec!["orders.id".into(), "orders.user_id".into(), "orders.amount".into()],
        );
        let out = drain(&mut iter).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][1], Value::text("two"));
    }

    #[test]
    fn hash_join_null_keys_never_match() {
        let left = vec![vec![Value::Null, Value::text("n")]];
        let right = vec![vec![Value::int(1), Value::Null, Value::int(5)]];
        let mut iter = HashJoinIter::new(
            Box::new(SliceIter::new(left)),
            Box::new(SliceIter::new(right)),
            parse_expr_text("id").unwrap(),
            parse_expr_text("user_id").unwrap(),
            vec!["users.id".into(), "users.name".into()],
            vec!["orders.id".into(), "orders.user_id".into(), "orders.amount".into()],
        );
        assert!(drain(&mut iter).unwrap().is_empty());
    }
}
