//! The owning database handle.
//!
//! One [`Database`] owns the pager, the catalog, the lazily-opened B-tree
//! handle cache (keyed by table name or `"index:" + name`), the in-memory
//! HNSW instances, the current transaction and the optional query cache.
//! There are no ambient singletons; everything reaches state through this
//! handle.

use crate::db::cache::QueryCache;
use crate::db::catalog::Catalog;
use crate::db::hnsw::HnswIndex;
use crate::db::schema::IndexKind;
use crate::db::transaction::{Tx, TxManager, UndoOp};
use crate::error::{DBError, IndexError, TxError};
use crate::exec::eval::TriggerRowCtx;
use crate::sql::parser::parse_trigger_text;
use micadb_storage::{decode_row, encode_row, rowid_from_key, BTree, Pager, SharedPager, StorageError};
use micadb_types::Row;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Debug, Clone, Default)]
pub struct DatabaseOptions {
    /// Database file; `None` runs fully in memory.
    pub path: Option<PathBuf>,
    /// Enable the query-result cache with this capacity.
    pub query_cache_capacity: Option<usize>,
    /// Histogram buckets for ANALYZE; 0 means the default.
    pub histogram_buckets: usize,
}

pub struct Database {
    pager: SharedPager,
    catalog: Catalog,
    catalog_tree: BTree,
    trees: HashMap<String, BTree>,
    pub(crate) hnsw: HashMap<String, HnswIndex>,
    pub(crate) current_tx: Option<Tx>,
    pub(crate) cache: Option<QueryCache>,
    pub(crate) trigger_depth: u32,
    pub(crate) trigger_ctx: Option<TriggerRowCtx>,
    pub(crate) histogram_buckets: usize,
    /// Nesting depth of query evaluation; bounds circular view expansion.
    pub(crate) query_depth: u32,
}

impl Database {
    #[tracing::instrument(skip_all)]
    pub fn open(options: DatabaseOptions) -> Result<Self, DBError> {
        let mut pager = Pager::open(options.path.as_deref())?;

        // The catalog lives in its own tree, rooted from header meta slot 0.
        let root = pager.meta_u32(0);
        let (catalog_tree, catalog, trigger_sql) = if root == 0 {
            let tree = BTree::create(&mut pager)?;
            pager.set_meta_u32(0, tree.root_page());
            (tree, Catalog::new(), Vec::new())
        } else {
            let tree = BTree::open(root);
            let mut rows = Vec::new();
            let mut cursor = tree.cursor(&pager)?;
            while cursor.next(&pager)? {
                let key = String::from_utf8_lossy(cursor.key()).into_owned();
                rows.push((key, decode_row(cursor.value())?));
            }
            let (catalog, trigger_sql) = Catalog::from_rows(rows)?;
            (tree, catalog, trigger_sql)
        };

        let mut db = Database {
            pager: Rc::new(RefCell::new(pager)),
            catalog,
            catalog_tree,
            trees: HashMap::new(),
            hnsw: HashMap::new(),
            current_tx: None,
            cache: options.query_cache_capacity.map(QueryCache::new),
            trigger_depth: 0,
            trigger_ctx: None,
            query_depth: 0,
            histogram_buckets: if options.histogram_buckets == 0 {
                crate::db::stats::DEFAULT_HISTOGRAM_BUCKETS
            } else {
                options.histogram_buckets
            },
        };
        for sql in trigger_sql {
            let def = parse_trigger_text(&sql)?;
            db.catalog.insert_trigger(def);
        }
        log::info!(
            "opened database ({} tables, {} indexes)",
            db.catalog.tables().count(),
            db.catalog.indexes().count()
        );
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, DBError> {
        Self::open(DatabaseOptions::default())
    }

    pub fn close(self) -> Result<(), DBError> {
        self.pager.borrow_mut().flush()?;
        Ok(())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub(crate) fn pager(&self) -> SharedPager {
        self.pager.clone()
    }

    // --- tree handle cache -------------------------------------------------

    pub(crate) fn table_tree(&mut self, table: &str) -> Result<BTree, DBError> {
        let key = table.to_ascii_lowercase();
        if let Some(tree) = self.trees.get(&key) {
            return Ok(*tree);
        }
        let schema = self.catalog.require_table(table)?;
        let tree = BTree::open(schema.root_page);
        self.trees.insert(key, tree);
        Ok(tree)
    }

    pub(crate) fn index_tree(&mut self, index: &str) -> Result<BTree, DBError> {
        let key = format!("index:{}", index.to_ascii_lowercase());
        if let Some(tree) = self.trees.get(&key) {
            return Ok(*tree);
        }
        let def = self
            .catalog
            .index(index)
            .ok_or_else(|| IndexError::NotFound(index.to_string()))?;
        let tree = BTree::open(def.root_page);
        self.trees.insert(key, tree);
        Ok(tree)
    }

    fn tree_by_key(&mut self, tree_key: &str) -> Result<BTree, DBError> {
        match tree_key.strip_prefix("index:") {
            Some(index) => self.index_tree(index),
            None => self.table_tree(tree_key),
        }
    }

    pub(crate) fn forget_tree(&mut self, table: &str) {
        self.trees.remove(&table.to_ascii_lowercase());
    }

    pub(crate) fn forget_index_tree(&mut self, index: &str) {
        self.trees.remove(&format!("index:{}", index.to_ascii_lowercase()));
    }

    // --- undo-logged mutations ---------------------------------------------

    /// Insert into a tree, recording the inverse op when a transaction is
    /// active. `tree_key` is a table name or `"index:" + name`.
    pub(crate) fn tree_insert(&mut self, tree_key: &str, key: &[u8], value: &[u8]) -> Result<(), DBError> {
        let mut tree = self.tree_by_key(tree_key)?;
        let pager = self.pager.clone();
        let old = if self.current_tx.is_some() {
            tree.get(&pager.borrow(), key)?
        } else {
            None
        };
        tree.insert(&mut pager.borrow_mut(), key, value)?;
        if let Some(tx) = &mut self.current_tx {
            tx.record(match old {
                Some(value) => UndoOp::Restore {
                    tree: tree_key.to_string(),
                    key: key.to_vec(),
                    value,
                },
                None => UndoOp::Remove {
                    tree: tree_key.to_string(),
                    key: key.to_vec(),
                },
            });
        }
        Ok(())
    }

    pub(crate) fn tree_delete(&mut self, tree_key: &str, key: &[u8]) -> Result<bool, DBError> {
        let mut tree = self.tree_by_key(tree_key)?;
        let pager = self.pager.clone();
        let old = if self.current_tx.is_some() {
            tree.get(&pager.borrow(), key)?
        } else {
            None
        };
        let removed = tree.delete(&mut pager.borrow_mut(), key)?;
        if removed {
            if let (Some(tx), Some(value)) = (&mut self.current_tx, old) {
                tx.record(UndoOp::Restore {
                    tree: tree_key.to_string(),
                    key: key.to_vec(),
                    value,
                });
            }
        }
        Ok(removed)
    }

    /// Incremental statistics row count, undo-logged.
    pub(crate) fn bump_row_count(&mut self, table: &str, delta: i64) {
        if let Some(stats) = self.catalog.stats_mut(table) {
            stats.row_count += delta;
            if let Some(tx) = &mut self.current_tx {
                tx.record(UndoOp::RowCount {
                    table: table.to_string(),
                    delta,
                });
            }
        }
    }

    fn apply_undo(&mut self, ops: Vec<UndoOp>) -> Result<(), DBError> {
        for op in ops {
            match op {
                UndoOp::Remove { tree, key } => {
                    let mut t = self.tree_by_key(&tree)?;
                    t.delete(&mut self.pager.borrow_mut(), &key)?;
                }
                UndoOp::Restore { tree, key, value } => {
                    let mut t = self.tree_by_key(&tree)?;
                    t.insert(&mut self.pager.borrow_mut(), &key, &value)?;
                }
                UndoOp::RowCount { table, delta } => {
                    if let Some(stats) = self.catalog.stats_mut(&table) {
                        stats.row_count -= delta;
                    }
                }
            }
        }
        Ok(())
    }

    // --- transaction surface -----------------------------------------------

    pub fn begin_tx(&mut self) -> Result<(), DBError> {
        if self.current_tx.is_some() {
            return Err(TxError::AlreadyActive.into());
        }
        self.current_tx = Some(TxManager::begin());
        log::debug!("transaction started");
        Ok(())
    }

    pub fn commit_tx(&mut self) -> Result<(), DBError> {
        let tx = self.current_tx.take().ok_or(TxError::NoActive("COMMIT"))?;
        debug_assert!(tx.is_active());
        drop(tx);
        self.pager.borrow_mut().flush()?;
        log::debug!("transaction committed");
        Ok(())
    }

    pub fn rollback_tx(&mut self) -> Result<(), DBError> {
        let tx = self.current_tx.take().ok_or(TxError::NoActive("ROLLBACK"))?;
        self.apply_undo(tx.into_undo())?;
        // Anything cached during the transaction may reflect undone writes.
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
        log::debug!("transaction rolled back");
        Ok(())
    }

    pub fn savepoint(&mut self, name: &str) -> Result<(), DBError> {
        let tx = self.current_tx.as_mut().ok_or(TxError::NoActive("SAVEPOINT"))?;
        tx.savepoint(name);
        Ok(())
    }

    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DBError> {
        let tx = self
            .current_tx
            .as_mut()
            .ok_or(TxError::NoActive("ROLLBACK TO"))?;
        let ops = tx.rollback_to(name)?;
        self.apply_undo(ops)?;
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
        Ok(())
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<(), DBError> {
        let tx = self.current_tx.as_mut().ok_or(TxError::NoActive("RELEASE"))?;
        tx.release(name)?;
        Ok(())
    }

    // --- persistence --------------------------------------------------------

    /// Mirror the in-memory catalog into the catalog tree.
    pub(crate) fn save_catalog(&mut self) -> Result<(), DBError> {
        let mut tree = self.catalog_tree;
        let stale: Vec<Vec<u8>> = {
            let pager = self.pager.borrow();
            let mut cursor = tree.cursor(&pager)?;
            let mut keys = Vec::new();
            while cursor.next(&pager)? {
                keys.push(cursor.key().to_vec());
            }
            keys
        };
        let mut pager = self.pager.borrow_mut();
        for key in stale {
            tree.delete(&mut pager, &key)?;
        }
        for (key, row) in self.catalog.to_rows() {
            tree.insert(&mut pager, key.as_bytes(), &encode_row(&row))?;
        }
        Ok(())
    }

    /// In auto-commit mode every statement is its own transaction; write the
    /// image back after each mutating statement.
    pub(crate) fn autocommit_flush(&mut self) -> Result<(), DBError> {
        if self.current_tx.is_none() {
            self.pager.borrow_mut().flush()?;
        }
        Ok(())
    }

    // --- raw row access -----------------------------------------------------

    /// Snapshot every `(rowid, row)` of a table. DML and FK propagation work
    /// from snapshots so cursor invalidation cannot bite mid-mutation.
    pub(crate) fn scan_table(&mut self, table: &str) -> Result<Vec<(u64, Row)>, DBError> {
        let tree = self.table_tree(table)?;
        let pager = self.pager();
        let pager = pager.borrow();
        let mut cursor = tree.cursor(&pager)?;
        let mut out = Vec::new();
        while cursor.next(&pager)? {
            let rowid = rowid_from_key(cursor.key()).ok_or_else(|| {
                StorageError::Corrupt(format!("non-rowid key in table `{table}`"))
            })?;
            out.push((rowid, decode_row(cursor.value())?));
        }
        Ok(out)
    }

    // --- vector indexes -----------------------------------------------------

    pub(crate) fn hnsw_for(&mut self, index_name: &str) -> Result<&mut HnswIndex, DBError> {
        let key = index_name.to_ascii_lowercase();
        if !self.hnsw.contains_key(&key) {
            let def = self
                .catalog
                .index(index_name)
                .ok_or_else(|| IndexError::NotFound(index_name.to_string()))?;
            self.hnsw.insert(key.clone(), HnswIndex::new(def.hnsw));
        }
        Ok(self.hnsw.get_mut(&key).unwrap())
    }

    /// Probe the HNSW index on `table.column`; the backing store for
    /// `vector_quantize_scan`.
    pub(crate) fn vector_search(
        &mut self,
        table: &str,
        column: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<(u64, f64)>, DBError> {
        let def = self
            .catalog
            .indexes_for_table(table)
            .into_iter()
            .find(|d| {
                d.kind == IndexKind::Hnsw
                    && d.columns.len() == 1
                    && d.columns[0].eq_ignore_ascii_case(column)
            })
            .ok_or_else(|| IndexError::HnswMissing {
                table: table.to_string(),
                column: column.to_string(),
            })?;
        let index = self.hnsw_for(&def.name)?;
        Ok(index.search_knn(query, k))
    }
}

pub mod tests_utils {
    use super::*;

    pub type ResultTest<T> = anyhow::Result<T>;

    /// In-memory database with the query cache enabled, the way most tests
    /// want it.
    pub fn make_test_db() -> Database {
        Database::open(DatabaseOptions {
            path: None,
            query_cache_capacity: Some(64),
            histogram_buckets: 0,
        })
        .expect("in-memory open cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::tests_utils::make_test_db;
    use super::*;

    #[test]
    fn fresh_database_has_empty_catalog() {
        let db = make_test_db();
        assert_eq!(db.catalog().tables().count(), 0);
    }

    #[test]
    fn tree_mutations_are_undone_by_rollback() {
        let mut db = make_test_db();
        let root_page = {
            let pager = db.pager();
            let mut pager = pager.borrow_mut();
            BTree::create(&mut pager).unwrap().root_page()
        };
        db.catalog_mut().insert_table(crate::db::schema::TableSchema {
            name: "t".into(),
            columns: vec![],
            constraints: vec![],
            root_page,
            next_rowid: 1,
            max_integer_pk: 0,
        });

        db.begin_tx().unwrap();
        db.tree_insert("t", b"k1", b"v1").unwrap();
        db.savepoint("sp").unwrap();
        db.tree_insert("t", b"k2", b"v2").unwrap();
        db.rollback_to_savepoint("sp").unwrap();

        let tree = db.table_tree("t").unwrap();
        let pager = db.pager();
        assert!(tree.get(&pager.borrow(), b"k2").unwrap().is_none());
        assert!(tree.get(&pager.borrow(), b"k1").unwrap().is_some());

        db.rollback_tx().unwrap();
        assert!(tree.get(&pager.borrow(), b"k1").unwrap().is_none());
    }

    #[test]
    fn nested_begin_is_an_error() {
        let mut db = make_test_db();
        db.begin_tx().unwrap();
        assert!(matches!(
            db.begin_tx(),
            Err(DBError::Tx(TxError::AlreadyActive))
        ));
    }

    #[test]
    fn commit_without_tx_is_an_error() {
        let mut db = make_test_db();
        assert!(matches!(db.commit_tx(), Err(DBError::Tx(TxError::NoActive(_)))));
    }
}
