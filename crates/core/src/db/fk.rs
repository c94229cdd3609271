//! Foreign-key propagation.
//!
//! When a referenced row is deleted or its referenced column changes, every
//! referencing table is scanned (snapshot first, then act, so cursor
//! invalidation cannot occur) and its ON DELETE / ON UPDATE action applied:
//! NO ACTION and RESTRICT error out while matches exist, CASCADE deletes or
//! rewrites the referencing rows, SET NULL clears the referencing column.
//! SET DEFAULT never reaches here; it is rejected when the schema is
//! declared.

use crate::db::database::Database;
use crate::db::schema::{FkAction, ForeignKey, TableSchema};
use crate::error::{ConstraintError, DBError};
use micadb_types::{Row, Value};
use std::cmp::Ordering;

/// Every foreign key in the catalog that references `table`:
/// `(referencing schema, referencing column index, fk)`.
fn referencing(db: &Database, table: &str) -> Vec<(TableSchema, usize, ForeignKey)> {
    let mut out = Vec::new();
    for schema in db.catalog().tables() {
        for (i, col) in schema.columns.iter().enumerate() {
            if let Some(fk) = col.foreign_key() {
                if fk.table.eq_ignore_ascii_case(table) {
                    out.push((schema.clone(), i, fk.clone()));
                }
            }
        }
        for (cols, fk) in schema.table_foreign_keys() {
            if fk.table.eq_ignore_ascii_case(table) {
                if let Some(i) = cols.first().and_then(|c| schema.col_index(c)) {
                    out.push((schema.clone(), i, fk.clone()));
                }
            }
        }
    }
    out
}

fn matches_of(db: &mut Database, schema: &TableSchema, col: usize, value: &Value) -> Result<Vec<(u64, Row)>, DBError> {
    Ok(db
        .scan_table(&schema.name)?
        .into_iter()
        .filter(|(_, row)| row[col].sql_cmp(value) == Some(Ordering::Equal))
        .collect())
}

fn restricted(schema: &TableSchema, col: usize, fk: &ForeignKey) -> DBError {
    ConstraintError::ForeignKey {
        table: schema.name.clone(),
        column: schema.columns[col].name.clone(),
        ref_table: fk.table.clone(),
        ref_column: fk.column.clone(),
    }
    .into()
}

#[tracing::instrument(skip_all, fields(table = %table.name))]
pub(crate) fn propagate_delete(db: &mut Database, table: &TableSchema, row: &Row) -> Result<(), DBError> {
    for (rschema, col, fk) in referencing(db, &table.name) {
        let Some(ref_col) = table.col_index(&fk.column) else {
            continue;
        };
        let value = &row[ref_col];
        if value.is_null() {
            continue;
        }
        let matches = matches_of(db, &rschema, col, value)?;
        if matches.is_empty() {
            continue;
        }
        match fk.on_delete {
            FkAction::NoAction | FkAction::Restrict => {
                return Err(restricted(&rschema, col, &fk));
            }
            FkAction::Cascade => {
                log::debug!(
                    "cascade delete: {} rows of {} via {}",
                    matches.len(),
                    rschema.name,
                    fk.column
                );
                for (rowid, rrow) in matches {
                    crate::db::dml::delete_row_raw(db, &rschema, rowid, &rrow)?;
                }
            }
            FkAction::SetNull => {
                for (rowid, rrow) in matches {
                    crate::db::dml::rewrite_column(db, &rschema, rowid, &rrow, col, Value::Null)?;
                }
            }
        }
    }
    Ok(())
}

#[tracing::instrument(skip_all, fields(table = %table.name))]
pub(crate) fn propagate_update(
    db: &mut Database,
    table: &TableSchema,
    old_row: &Row,
    new_row: &Row,
) -> Result<(), DBError> {
    for (rschema, col, fk) in referencing(db, &table.name) {
        let Some(ref_col) = table.col_index(&fk.column) else {
            continue;
        };
        let old_value = &old_row[ref_col];
        let new_value = &new_row[ref_col];
        if old_value.is_null() || old_value.group_eq(new_value) {
            continue;
        }
        let matches = matches_of(db, &rschema, col, old_value)?;
        if matches.is_empty() {
            continue;
        }
        match fk.on_update {
            FkAction::NoAction | FkAction::Restrict => {
                return Err(restricted(&rschema, col, &fk));
            }
            FkAction::Cascade => {
                for (rowid, rrow) in matches {
                    crate::db::dml::rewrite_column(db, &rschema, rowid, &rrow, col, new_value.clone())?;
                }
            }
            FkAction::SetNull => {
                for (rowid, rrow) in matches {
                    crate::db::dml::rewrite_column(db, &rschema, rowid, &rrow, col, Value::Null)?;
                }
            }
        }
    }
    Ok(())
}

/// Existence check on the referenced side: used when a referencing row is
/// inserted or updated. NULL values skip the check entirely.
pub(crate) fn referenced_row_exists(db: &mut Database, fk: &ForeignKey, value: &Value) -> Result<bool, DBError> {
    if value.is_null() {
        return Ok(true);
    }
    let schema = db.catalog().require_table(&fk.table)?.clone();
    let Some(col) = schema.col_index(&fk.column) else {
        return Ok(false);
    };
    Ok(db
        .scan_table(&schema.name)?
        .iter()
        .any(|(_, row)| row[col].sql_cmp(value) == Some(Ordering::Equal)))
}
