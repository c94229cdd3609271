//! The pull-based operator tree.
//!
//! Every operator implements [`RowIter`]: `advance` pulls the next row,
//! `current` exposes it until the next `advance`/`close`, and a terminal
//! error slot is read by the consumer once the pull loop ends. Errors raised
//! mid-iteration (a trigger `RAISE` inside a scan, a bad expression) are
//! never silently swallowed into an early end-of-stream.
//!
//! Iterators are single-threaded and not restartable; operators that need to
//! rescan their input materialize it (sort, aggregate, window, the right
//! side of a nested-loop join).

pub mod aggregate;
pub mod eval;
pub mod join;
pub mod scan;
pub mod transform;
pub mod translate;
pub mod window;

use crate::error::DBError;
use micadb_types::Row;

pub trait RowIter {
    /// Pull the next row; `false` on exhaustion or error.
    fn advance(&mut self) -> bool;
    /// The current row. Valid only between a successful [`RowIter::advance`]
    /// and the next `advance`/`close`.
    fn current(&self) -> &Row;
    /// Terminal error slot, checked by the consumer after the pull loop.
    fn take_err(&mut self) -> Option<DBError>;
    /// Release cursors and buffers. Reachable on every exit path.
    fn close(&mut self);
}

pub type BoxIter = Box<dyn RowIter>;

/// Run an iterator to completion, collecting rows and surfacing the terminal
/// error. The iterator is closed on every path.
pub fn drain(iter: &mut dyn RowIter) -> Result<Vec<Row>, DBError> {
    let mut rows = Vec::new();
    while iter.advance() {
        rows.push(iter.current().clone());
    }
    let err = iter.take_err();
    iter.close();
    match err {
        Some(e) => Err(e),
        None => Ok(rows),
    }
}
