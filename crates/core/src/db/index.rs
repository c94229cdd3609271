//! Secondary index maintenance.
//!
//! For every index on a mutated table the engine builds the key from the
//! indexed column values. Unique B-tree entries are `key → rowid`;
//! non-unique entries append the rowid to the key and carry no payload,
//! which keeps entries distinct. Unique entries containing NULL use the
//! non-unique layout too, so multiple NULLs coexist (NULL never collides
//! with NULL under UNIQUE). Partial indexes skip rows their predicate
//! rejects; HNSW indexes receive vector inserts only.

use crate::db::database::Database;
use crate::db::schema::{IndexDef, IndexKind, TableSchema};
use crate::error::{DBError, IndexError, PlanError};
use crate::exec::eval::{eval, Env};
use crate::sql::ast::Expr;
use crate::sql::parser::parse_expr_text;
use itertools::Itertools;
use micadb_storage::{encode_index_key, rowid_key};
use micadb_types::{Row, Value};

enum IndexCol {
    Position(usize),
    Expr(Expr),
}

/// An index definition with its column expressions and partial predicate
/// parsed once per statement.
pub(crate) struct PreparedIndex {
    pub def: IndexDef,
    cols: Vec<IndexCol>,
    predicate: Option<Expr>,
    /// Short column names of the table, the evaluation scope for
    /// expression columns and predicates.
    env_columns: Vec<String>,
}

pub(crate) fn prepare_indexes(db: &Database, schema: &TableSchema) -> Result<Vec<PreparedIndex>, DBError> {
    db.catalog()
        .indexes_for_table(&schema.name)
        .into_iter()
        .map(|def| prepare(schema, def))
        .collect()
}

pub(crate) fn prepare(schema: &TableSchema, def: IndexDef) -> Result<PreparedIndex, DBError> {
    let cols = def
        .columns
        .iter()
        .map(|c| match schema.col_index(c) {
            Some(i) => Ok(IndexCol::Position(i)),
            None => Ok(IndexCol::Expr(parse_expr_text(c)?)),
        })
        .collect::<Result<Vec<_>, DBError>>()?;
    let predicate = def.predicate.as_deref().map(parse_expr_text).transpose()?;
    Ok(PreparedIndex {
        cols,
        predicate,
        env_columns: schema.columns.iter().map(|c| c.name.clone()).collect(),
        def,
    })
}

impl PreparedIndex {
    /// The indexed values for `row`, or `None` when the partial predicate
    /// excludes it.
    pub(crate) fn key_values(&self, row: &Row) -> Result<Option<Vec<Value>>, DBError> {
        let env = Env::new(&self.env_columns, row);
        if let Some(predicate) = &self.predicate {
            if !eval(predicate, &env)?.is_truthy() {
                return Ok(None);
            }
        }
        let mut values = Vec::with_capacity(self.cols.len());
        for col in &self.cols {
            values.push(match col {
                IndexCol::Position(i) => row
                    .get(*i)
                    .cloned()
                    .ok_or_else(|| PlanError::Unstructured("row shorter than schema".into()))?,
                IndexCol::Expr(e) => eval(e, &env)?,
            });
        }
        Ok(Some(values))
    }

    fn entry(&self, values: &[Value], rowid: u64) -> (Vec<u8>, Vec<u8>) {
        let mut key = encode_index_key(values);
        let has_null = values.iter().any(Value::is_null);
        if self.def.unique && !has_null {
            (key, rowid_key(rowid).to_vec())
        } else {
            key.extend_from_slice(&rowid_key(rowid));
            (key, Vec::new())
        }
    }

    fn tree_key(&self) -> String {
        format!("index:{}", self.def.name)
    }
}

/// Probe a unique index for a conflicting entry. `exclude_rowid` lets an
/// UPDATE re-insert its own key.
pub(crate) fn check_unique(
    db: &mut Database,
    prep: &PreparedIndex,
    row: &Row,
    exclude_rowid: Option<u64>,
) -> Result<(), DBError> {
    if !prep.def.unique || prep.def.kind != IndexKind::BTree {
        return Ok(());
    }
    let Some(values) = prep.key_values(row)? else {
        return Ok(());
    };
    if values.iter().any(Value::is_null) {
        return Ok(());
    }
    let key = encode_index_key(&values);
    let tree = db.index_tree(&prep.def.name)?;
    let pager = db.pager();
    let existing = tree.get(&pager.borrow(), &key)?;
    if let Some(payload) = existing {
        let holder = micadb_storage::rowid_from_key(&payload);
        if exclude_rowid.is_none() || holder != exclude_rowid {
            return Err(IndexError::UniqueViolation {
                index: prep.def.name.clone(),
                value: values.iter().map(Value::to_string).join(", "),
            }
            .into());
        }
    }
    Ok(())
}

/// Insert this row's entries into every prepared index.
pub(crate) fn insert_entries(
    db: &mut Database,
    preps: &[PreparedIndex],
    rowid: u64,
    row: &Row,
) -> Result<(), DBError> {
    for prep in preps {
        match prep.def.kind {
            IndexKind::BTree => {
                let Some(values) = prep.key_values(row)? else {
                    continue;
                };
                let (key, payload) = prep.entry(&values, rowid);
                db.tree_insert(&prep.tree_key(), &key, &payload)?;
            }
            IndexKind::Hnsw => {
                let Some(values) = prep.key_values(row)? else {
                    continue;
                };
                if let Some(Value::Vector(vec)) = values.first() {
                    let vec = vec.clone();
                    db.hnsw_for(&prep.def.name)?.insert(rowid, vec);
                }
            }
        }
    }
    Ok(())
}

/// Remove this row's entries from every prepared B-tree index. HNSW has no
/// delete; stale graph entries are tolerated until the index is rebuilt.
pub(crate) fn delete_entries(
    db: &mut Database,
    preps: &[PreparedIndex],
    rowid: u64,
    row: &Row,
) -> Result<(), DBError> {
    for prep in preps {
        if prep.def.kind != IndexKind::BTree {
            continue;
        }
        let Some(values) = prep.key_values(row)? else {
            continue;
        };
        let (key, _) = prep.entry(&values, rowid);
        db.tree_delete(&prep.tree_key(), &key)?;
    }
    Ok(())
}
