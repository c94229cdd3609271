//! Transform operators: filter, projection, sort, limit.

use crate::error::DBError;
use crate::exec::eval::{eval, Env};
use crate::exec::{BoxIter, RowIter};
use crate::plan::ProjItem;
use crate::sql::ast::OrderBy;
use ahash::AHashSet;
use micadb_types::{Row, RowKey, Value};
use std::cmp::Ordering;

/// Drops rows for which the predicate does not evaluate true.
pub struct FilterIter {
    child: BoxIter,
    predicate: crate::sql::ast::Expr,
    columns: Vec<String>,
    err: Option<DBError>,
}

impl FilterIter {
    pub fn new(child: BoxIter, columns: Vec<String>, predicate: crate::sql::ast::Expr) -> Self {
        FilterIter {
            child,
            predicate,
            columns,
            err: None,
        }
    }
}

impl RowIter for FilterIter {
    fn advance(&mut self) -> bool {
        while self.child.advance() {
            let env = Env::new(&self.columns, self.child.current());
            match eval(&self.predicate, &env) {
                Ok(v) if v.is_truthy() => return true,
                Ok(_) => continue,
                Err(e) => {
                    self.err = Some(e);
                    return false;
                }
            }
        }
        false
    }

    fn current(&self) -> &Row {
        self.child.current()
    }

    fn take_err(&mut self) -> Option<DBError> {
        self.err.take().or_else(|| self.child.take_err())
    }

    fn close(&mut self) {
        self.child.close();
    }
}

/// Evaluates each output expression against the child row. With `distinct`,
/// projected rows deduplicate by [`RowKey`].
pub struct ProjectIter {
    child: BoxIter,
    items: Vec<ProjItem>,
    columns: Vec<String>,
    distinct: bool,
    seen: AHashSet<RowKey>,
    current: Row,
    err: Option<DBError>,
}

impl ProjectIter {
    pub fn new(child: BoxIter, columns: Vec<String>, items: Vec<ProjItem>, distinct: bool) -> Self {
        ProjectIter {
            child,
            items,
            columns,
            distinct,
            seen: AHashSet::new(),
            current: Row::new(),
            err: None,
        }
    }
}

impl RowIter for ProjectIter {
    fn advance(&mut self) -> bool {
        while self.child.advance() {
            let env = Env::new(&self.columns, self.child.current());
            let mut row = Row::with_capacity(self.items.len());
            for item in &self.items {
                match eval(&item.expr, &env) {
                    Ok(v) => row.push(v),
                    Err(e) => {
                        self.err = Some(e);
                        return false;
                    }
                }
            }
            if self.distinct && !self.seen.insert(RowKey::of_row(&row)) {
                continue;
            }
            self.current = row;
            return true;
        }
        false
    }

    fn current(&self) -> &Row {
        &self.current
    }

    fn take_err(&mut self) -> Option<DBError> {
        self.err.take().or_else(|| self.child.take_err())
    }

    fn close(&mut self) {
        self.child.close();
        self.seen.clear();
        self.current = Row::new();
    }
}

/// Materializes its child and emits rows ordered by the ORDER BY list under
/// the engine's total value ordering. The sort is stable.
pub struct SortIter {
    child: Option<BoxIter>,
    order_by: Vec<OrderBy>,
    columns: Vec<String>,
    sorted: std::vec::IntoIter<Row>,
    current: Row,
    err: Option<DBError>,
}

impl SortIter {
    pub fn new(child: BoxIter, columns: Vec<String>, order_by: Vec<OrderBy>) -> Self {
        SortIter {
            child: Some(child),
            order_by,
            columns,
            sorted: Vec::new().into_iter(),
            current: Row::new(),
            err: None,
        }
    }

    fn materialize(&mut self) -> Result<(), DBError> {
        let mut child = self.child.take().expect("sort input already consumed");
        let rows = crate::exec::drain(child.as_mut())?;
        // Precompute the key tuple per row, then sort stably.
        let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(rows.len());
        for row in rows {
            let env = Env::new(&self.columns, &row);
            let mut key = Vec::with_capacity(self.order_by.len());
            for o in &self.order_by {
                key.push(eval(&o.expr, &env)?);
            }
            keyed.push((key, row));
        }
        let order_by = self.order_by.clone();
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, o) in order_by.iter().enumerate() {
                let ord = a[i].total_cmp(&b[i]);
                let ord = if o.desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        self.sorted = keyed.into_iter().map(|(_, r)| r).collect::<Vec<_>>().into_iter();
        Ok(())
    }
}

impl RowIter for SortIter {
    fn advance(&mut self) -> bool {
        if self.child.is_some() {
            if let Err(e) = self.materialize() {
                self.err = Some(e);
                return false;
            }
        }
        match self.sorted.next() {
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
        self.sorted = Vec::new().into_iter();
        self.current = Row::new();
    }
}

/// Discards OFFSET rows on first advance, then emits at most LIMIT rows.
/// A limit of -1 means unlimited.
pub struct LimitIter {
    child: BoxIter,
    limit: i64,
    offset: i64,
    offset_done: bool,
    emitted: i64,
}

impl LimitIter {
    pub fn new(child: BoxIter, limit: i64, offset: i64) -> Self {
        LimitIter {
            child,
            limit,
            offset: offset.max(0),
            offset_done: false,
            emitted: 0,
        }
    }
}

impl RowIter for LimitIter {
    fn advance(&mut self) -> bool {
        if !self.offset_done {
            self.offset_done = true;
            for _ in 0..self.offset {
                if !self.child.advance() {
                    return false;
                }
            }
        }
        if self.limit >= 0 && self.emitted >= self.limit {
            return false;
        }
        if self.child.advance() {
            self.emitted += 1;
            true
        } else {
            false
        }
    }

    fn current(&self) -> &Row {
        self.child.current()
    }

    fn take_err(&mut self) -> Option<DBError> {
        self.child.take_err()
    }

    fn close(&mut self) {
        self.child.close();
    }
}
