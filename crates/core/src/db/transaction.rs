//! Transactions and savepoints.
//!
//! The engine runs single-writer: at most one transaction is active, owned
//! exclusively by the [`crate::Database`] handle. Rollback is a logical undo
//! log of inverse B-tree operations and row-count deltas recorded by DML;
//! savepoints are markers into that log, forming a stack.

use crate::error::TxError;

/// One recorded inverse operation. Applied in reverse order on rollback.
#[derive(Debug, Clone)]
pub enum UndoOp {
    /// Undo of a fresh insert: remove the key.
    Remove { tree: String, key: Vec<u8> },
    /// Undo of an overwrite or delete: put the old payload back.
    Restore {
        tree: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Undo of an incremental statistics row-count bump.
    RowCount { table: String, delta: i64 },
}

#[derive(Debug, Default)]
pub struct Tx {
    undo: Vec<UndoOp>,
    savepoints: Vec<(String, usize)>,
}

/// Begin/commit/rollback surface. Commit and rollback consume the handle on
/// the [`crate::Database`] side; this type only manages the log.
pub struct TxManager;

impl TxManager {
    pub fn begin() -> Tx {
        Tx::default()
    }
}

impl Tx {
    pub fn is_active(&self) -> bool {
        true
    }

    pub fn record(&mut self, op: UndoOp) {
        self.undo.push(op);
    }

    pub fn savepoint(&mut self, name: &str) {
        self.savepoints.push((name.to_string(), self.undo.len()));
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.savepoints
            .iter()
            .rposition(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Undo ops recorded since the named savepoint, newest first. The
    /// savepoint itself stays active; savepoints nested inside it are gone.
    pub fn rollback_to(&mut self, name: &str) -> Result<Vec<UndoOp>, TxError> {
        let at = self.find(name).ok_or_else(|| TxError::UnknownSavepoint(name.to_string()))?;
        let mark = self.savepoints[at].1;
        self.savepoints.truncate(at + 1);
        let mut ops = self.undo.split_off(mark);
        ops.reverse();
        Ok(ops)
    }

    /// Release merges the savepoint (and everything nested inside it) into
    /// the enclosing scope.
    pub fn release(&mut self, name: &str) -> Result<(), TxError> {
        let at = self.find(name).ok_or_else(|| TxError::UnknownSavepoint(name.to_string()))?;
        self.savepoints.truncate(at);
        Ok(())
    }

    /// The whole log, newest first; used by full ROLLBACK.
    pub fn into_undo(mut self) -> Vec<UndoOp> {
        self.undo.reverse();
        self.savepoints.clear();
        self.undo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(n: u8) -> UndoOp {
        UndoOp::Remove {
            tree: "t".into(),
            key: vec![n],
        }
    }

    fn key_of(op: &UndoOp) -> u8 {
        match op {
            UndoOp::Remove { key, .. } => key[0],
            _ => panic!("unexpected op"),
        }
    }

    #[test]
    fn rollback_to_returns_ops_since_savepoint_newest_first() {
        let mut tx = TxManager::begin();
        tx.record(op(1));
        tx.savepoint("sp1");
        tx.record(op(2));
        tx.record(op(3));
        let ops = tx.rollback_to("sp1").unwrap();
        assert_eq!(ops.iter().map(key_of).collect::<Vec<_>>(), [3, 2]);
        // The savepoint survives its own rollback.
        assert!(tx.rollback_to("sp1").unwrap().is_empty());
        assert_eq!(tx.into_undo().iter().map(key_of).collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn release_merges_into_outer_scope() {
        let mut tx = TxManager::begin();
        tx.savepoint("a");
        tx.record(op(1));
        tx.savepoint("b");
        tx.record(op(2));
        tx.release("b").unwrap();
        assert!(matches!(tx.rollback_to("b"), Err(TxError::UnknownSavepoint(_))));
        // Rolling back to `a` still undoes work recorded under `b`.
        let ops = tx.rollback_to("a").unwrap();
        assert_eq!(ops.iter().map(key_of).collect::<Vec<_>>(), [2, 1]);
    }

    #[test]
    fn unknown_savepoint_errors() {
        let mut tx = TxManager::begin();
        assert!(matches!(tx.rollback_to("nope"), Err(TxError::UnknownSavepoint(_))));
        assert!(matches!(tx.release("nope"), Err(TxError::UnknownSavepoint(_))));
    }

    #[test]
    fn shadowed_savepoint_names_resolve_to_newest() {
        let mut tx = TxManager::begin();
        tx.record(op(1));
        tx.savepoint("sp");
        tx.record(op(2));
        tx.savepoint("sp");
        tx.record(op(3));
        let ops = tx.rollback_to("sp").unwrap();
        assert_eq!(ops.iter().map(key_of).collect::<Vec<_>>(), [3]);
    }
}
