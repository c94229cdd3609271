//! Leaf iterators: table scan, materialized-slice scan (CTEs, table
//! functions, set-operation results) and dual.

use crate::error::DBError;
use crate::exec::RowIter;
use micadb_types::{Row, Value};
use micadb_storage::{decode_row, BCursor, SharedPager};

/// Scan of a table's primary B-tree in rowid order.
///
/// Emits raw rows in declared column order; never filters or projects.
/// Declared JSON columns that come back as text are re-tagged as JSON
/// (*type restoration*). Rows are decoded into owned values, so cursor
/// buffer reuse never leaks upward.
pub struct TableScanIter {
    pager: SharedPager,
    cursor: Option<BCursor>,
    json_cols: Vec<bool>,
    current: Row,
    err: Option<DBError>,
}

impl TableScanIter {
    pub fn new(pager: SharedPager, cursor: BCursor, json_cols: Vec<bool>) -> Self {
        TableScanIter {
            pager,
            cursor: Some(cursor),
            json_cols,
            current: Row::new(),
            err: None,
        }
    }
}

impl RowIter for TableScanIter {
    fn advance(&mut self) -> bool {
        let Some(cursor) = self.cursor.as_mut() else {
            return false;
        };
        let step = {
            let pager = self.pager.borrow();
            cursor.next(&pager).and_then(|more| {
                if !more {
                    return Ok(None);
                }
                decode_row(cursor.value()).map(Some)
            })
        };
        match step {
            Ok(Some(mut row)) => {
                for (i, is_json) in self.json_cols.iter().enumerate() {
                    if *is_json {
                        if let Some(Value::Text { v, .. }) = row.get(i) {
                            row[i] = Value::Json(v.clone());
                        }
                    }
                }
                self.current = row;
                true
            }
            Ok(None) => {
                self.cursor = None;
                false
            }
            Err(e) => {
                self.err = Some(e.into());
                self.cursor = None;
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
        self.cursor = None;
        self.current = Row::new();
    }
}

/// Iterator over pre-materialized rows. Backs CTE scans, table functions
/// and set-operation results.
pub struct SliceIter {
    rows: std::vec::IntoIter<Row>,
    current: Row,
}

impl SliceIter {
    pub fn new(rows: Vec<Row>) -> Self {
        SliceIter {
            rows: rows.into_iter(),
            current: Row::new(),
        }
    }
}

impl RowIter for SliceIter {
    fn advance(&mut self) -> bool {
        match self.rows.next() {
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
        None
    }

    fn close(&mut self) {
        self.rows = Vec::new().into_iter();
        self.current = Row::new();
    }
}

/// Emits exactly one empty row; the source for `SELECT` without `FROM`.
pub struct DualIter {
    emitted: bool,
    row: Row,
}

impl DualIter {
    pub fn new() -> Self {
        DualIter {
            emitted: false,
            row: Row::new(),
        }
    }
}

impl Default for DualIter {
    fn default() -> Self {
        Self::new()
    }
}

impl RowIter for DualIter {
    fn advance(&mut self) -> bool {
        if self.emitted {
            false
        } else {
            self.emitted = true;
            true
        }
    }

    fn current(&self) -> &Row {
        &self.row
    }

    fn take_err(&mut self) -> Option<DBError> {
        None
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::drain;

    #[test]
    fn slice_iter_yields_all_rows() {
        let rows = vec![vec![Value::int(1)], vec![Value::int(2)]];
        let mut iter = SliceIter::new(rows.clone());
        assert_eq!(drain(&mut iter).unwrap(), rows);
    }

    #[test]
    fn dual_emits_one_empty_row() {
        let mut iter = DualIter::new();
        let rows = drain(&mut iter).unwrap();
        assert_eq!(rows, vec![Row::new()]);
    }
}
