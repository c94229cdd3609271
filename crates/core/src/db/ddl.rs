//! DDL: tables, indexes, views, triggers, ALTER TABLE.
//!
//! Table creation allocates the primary B-tree, resolves foreign-key
//! targets, and auto-creates a unique index per PRIMARY KEY / UNIQUE
//! declaration. Index creation backfills from existing rows (detecting
//! uniqueness violations up front); HNSW indexes build their in-memory
//! graph the same way.

use crate::db::database::Database;
use crate::db::index;
use crate::db::schema::{
    ColumnConstraint, ColumnSchema, IndexDef, IndexKind, TableConstraint, TableSchema, TriggerDef, ViewDef,
};
use crate::error::{DBError, IndexError, TableError, TriggerError};
use crate::sql::ast::{AlterOp, CreateIndex, CreateTable};
use crate::sql::parser::{parse_expr_text, parse_query_text};
use micadb_storage::{encode_row, rowid_key, BTree};
use micadb_types::Value;

#[tracing::instrument(skip_all, fields(table = %stmt.name))]
pub(crate) fn create_table(db: &mut Database, stmt: &CreateTable) -> Result<(), DBError> {
    if db.catalog().table(&stmt.name).is_some() {
        if stmt.if_not_exists {
            return Ok(());
        }
        return Err(TableError::Exist(stmt.name.clone()).into());
    }

    let mut columns = stmt.columns.clone();
    for col in &mut columns {
        resolve_fk_targets(db, &stmt.name, &columns_snapshot(&stmt.columns), col)?;
    }
    let mut constraints = stmt.constraints.clone();
    for c in &mut constraints {
        if let TableConstraint::ForeignKey { fk, .. } = c {
            resolve_fk_column(db, &stmt.name, &columns_snapshot(&stmt.columns), fk)?;
        }
    }

    let root_page = {
        let pager = db.pager();
        let mut pager = pager.borrow_mut();
        BTree::create(&mut pager)?.root_page()
    };
    let schema = TableSchema {
        name: stmt.name.clone(),
        columns,
        constraints,
        root_page,
        next_rowid: 1,
        max_integer_pk: 0,
    };
    let unique_sets = schema.unique_column_sets();
    let pk_columns = schema.primary_key_columns();
    db.catalog_mut().insert_table(schema);

    // One unique index per PRIMARY KEY / UNIQUE declaration.
    for set in unique_sets {
        let name = if set == pk_columns {
            format!("{}_pkey", stmt.name.to_ascii_lowercase())
        } else {
            format!(
                "{}_{}_key",
                stmt.name.to_ascii_lowercase(),
                set.join("_").to_ascii_lowercase()
            )
        };
        if db.catalog().index(&name).is_some() {
            continue;
        }
        let root_page = {
            let pager = db.pager();
            let mut pager = pager.borrow_mut();
            BTree::create(&mut pager)?.root_page()
        };
        db.catalog_mut().insert_index(IndexDef {
            name,
            table: stmt.name.clone(),
            columns: set,
            kind: IndexKind::BTree,
            unique: true,
            root_page,
            predicate: None,
            hnsw: Default::default(),
        });
    }

    db.save_catalog()?;
    log::info!("created table {}", stmt.name);
    Ok(())
}

/// Column names of a table under construction, primary key first so the
/// `REFERENCES t` self-reference shorthand resolves onto it.
fn columns_snapshot(columns: &[ColumnSchema]) -> Vec<String> {
    let mut names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    if let Some(pk) = columns.iter().position(ColumnSchema::is_primary_key) {
        names.swap(0, pk);
    }
    names
}

/// Fill in empty FK target columns (the `REFERENCES t` shorthand) and check
/// that the target exists.
fn resolve_fk_targets(
    db: &Database,
    table: &str,
    own_columns: &[String],
    col: &mut ColumnSchema,
) -> Result<(), DBError> {
    for c in &mut col.constraints {
        if let ColumnConstraint::ForeignKey(fk) = c {
            resolve_fk_column(db, table, own_columns, fk)?;
        }
    }
    Ok(())
}

fn resolve_fk_column(
    db: &Database,
    table: &str,
    own_columns: &[String],
    fk: &mut crate::db::schema::ForeignKey,
) -> Result<(), DBError> {
    let self_reference = fk.table.eq_ignore_ascii_case(table);
    if fk.column.is_empty() {
        fk.column = if self_reference {
            own_columns
                .first()
                .cloned()
                .ok_or_else(|| TableError::NotFound(fk.table.clone()))?
        } else {
            let target = db.catalog().require_table(&fk.table)?;
            target
                .primary_key_columns()
                .first()
                .cloned()
                .ok_or_else(|| TableError::ColumnNotFound(fk.table.clone(), "<primary key>".into()))?
        };
    } else if !self_reference {
        let target = db.catalog().require_table(&fk.table)?;
        if target.col_index(&fk.column).is_none() {
            return Err(TableError::ColumnNotFound(fk.table.clone(), fk.column.clone()).into());
        }
    }
    Ok(())
}

pub(crate) fn drop_table(db: &mut Database, name: &str, if_exists: bool) -> Result<(), DBError> {
    if db.catalog().table(name).is_none() {
        if if_exists {
            return Ok(());
        }
        return Err(TableError::NotFound(name.to_string()).into());
    }

    for def in db.catalog().indexes_for_table(name) {
        drop_index_inner(db, &def)?;
    }
    let schema = db.catalog_mut().remove_table(name).expect("checked above");
    {
        let pager = db.pager();
        let mut pager = pager.borrow_mut();
        BTree::open(schema.root_page).destroy(&mut pager)?;
    }
    db.catalog_mut().drop_triggers_for_table(name);
    db.forget_tree(name);
    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(name);
    }
    db.save_catalog()?;
    log::info!("dropped table {name}");
    Ok(())
}

#[tracing::instrument(skip_all, fields(index = %stmt.name))]
pub(crate) fn create_index(db: &mut Database, stmt: &CreateIndex) -> Result<(), DBError> {
    if db.catalog().index(&stmt.name).is_some() {
        return Err(IndexError::Exist(stmt.name.clone()).into());
    }
    let schema = db.catalog().require_table(&stmt.table)?.clone();

    let root_page = match stmt.kind {
        IndexKind::BTree => {
            let pager = db.pager();
            let mut pager = pager.borrow_mut();
            BTree::create(&mut pager)?.root_page()
        }
        // HNSW graphs are in-memory only.
        IndexKind::Hnsw => 0,
    };
    let def = IndexDef {
        name: stmt.name.clone(),
        table: stmt.table.clone(),
        columns: stmt.columns.clone(),
        kind: stmt.kind,
        unique: stmt.unique,
        root_page,
        predicate: stmt.predicate.clone(),
        hnsw: stmt.hnsw,
    };
    // Validate the definition parses against the table before keeping it.
    let prep = index::prepare(&schema, def.clone())?;
    db.catalog_mut().insert_index(def.clone());

    // Backfill from existing rows; a uniqueness violation aborts cleanly.
    let rows = db.scan_table(&stmt.table)?;
    for (rowid, row) in &rows {
        if let Err(e) = index::check_unique(db, &prep, row, None)
            .and_then(|()| index::insert_entries(db, std::slice::from_ref(&prep), *rowid, row))
        {
            db.catalog_mut().remove_index(&stmt.name);
            db.forget_index_tree(&stmt.name);
            db.hnsw.remove(&stmt.name.to_ascii_lowercase());
            return Err(e);
        }
    }

    db.save_catalog()?;
    log::info!(
        "created {} index {} on {} ({} rows)",
        if stmt.kind == IndexKind::Hnsw { "hnsw" } else { "btree" },
        stmt.name,
        stmt.table,
        rows.len()
    );
    Ok(())
}

pub(crate) fn drop_index(db: &mut Database, name: &str) -> Result<(), DBError> {
    let def = db
        .catalog()
        .index(name)
        .cloned()
        .ok_or_else(|| IndexError::NotFound(name.to_string()))?;
    drop_index_inner(db, &def)?;
    db.save_catalog()
}

fn drop_index_inner(db: &mut Database, def: &IndexDef) -> Result<(), DBError> {
    db.catalog_mut().remove_index(&def.name);
    if def.kind == IndexKind::BTree {
        let pager = db.pager();
        let mut pager = pager.borrow_mut();
        BTree::open(def.root_page).destroy(&mut pager)?;
    }
    db.forget_index_tree(&def.name);
    db.hnsw.remove(&def.name.to_ascii_lowercase());
    Ok(())
}

pub(crate) fn create_view(
    db: &mut Database,
    name: &str,
    columns: Option<Vec<String>>,
    sql: &str,
) -> Result<(), DBError> {
    if db.catalog().view(name).is_some() {
        return Err(TableError::ViewExist(name.to_string()).into());
    }
    // The body has to parse now, not at first use.
    parse_query_text(sql)?;
    db.catalog_mut().insert_view(ViewDef {
        name: name.to_string(),
        sql: sql.to_string(),
        columns,
    });
    db.save_catalog()
}

pub(crate) fn drop_view(db: &mut Database, name: &str) -> Result<(), DBError> {
    db.catalog_mut()
        .remove_view(name)
        .ok_or_else(|| TableError::ViewNotFound(name.to_string()))?;
    db.save_catalog()
}

pub(crate) fn create_trigger(db: &mut Database, def: &TriggerDef) -> Result<(), DBError> {
    if db.catalog().trigger(&def.name).is_some() {
        return Err(TriggerError::Exist(def.name.clone()).into());
    }
    db.catalog().require_table(&def.table)?;
    db.catalog_mut().insert_trigger(def.clone());
    db.save_catalog()
}

pub(crate) fn drop_trigger(db: &mut Database, name: &str) -> Result<(), DBError> {
    db.catalog_mut()
        .remove_trigger(name)
        .ok_or_else(|| TriggerError::NotFound(name.to_string()))?;
    db.save_catalog()
}

#[tracing::instrument(skip_all, fields(table = table))]
pub(crate) fn alter_table(db: &mut Database, table: &str, op: &AlterOp) -> Result<(), DBError> {
    db.catalog().require_table(table)?;
    match op {
        AlterOp::AddColumn(col) => add_column(db, table, col),
        AlterOp::DropColumn(name) => drop_column(db, table, name),
        AlterOp::RenameColumn { old, new } => rename_column(db, table, old, new),
        AlterOp::RenameTable(new) => rename_table(db, table, new),
    }?;
    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(table);
    }
    db.save_catalog()
}

fn add_column(db: &mut Database, table: &str, col: &ColumnSchema) -> Result<(), DBError> {
    let schema = db.catalog().require_table(table)?.clone();
    if schema.col_index(&col.name).is_some() {
        return Err(TableError::DuplicateColumnName(col.name.clone()).into());
    }
    let mut col = col.clone();
    resolve_fk_targets(db, table, &columns_snapshot(&schema.columns), &mut col)?;

    // Backfill: DEFAULT if declared, else NULL, coerced to the new type and
    // run through the vector constraint step.
    let fill = match col.default_sql() {
        Some(text) => {
            let expr = parse_expr_text(text)?;
            let v = crate::exec::eval::eval(&expr, &crate::exec::eval::Env::empty(None))?;
            crate::db::coerce::check_vector(crate::db::coerce::coerce_value(v, &col)?, &col)?
        }
        None => Value::Null,
    };
    for (rowid, mut row) in db.scan_table(table)? {
        row.push(fill.clone());
        db.tree_insert(table, &rowid_key(rowid), &encode_row(&row))?;
    }
    db.catalog_mut().table_mut(table).expect("checked above").columns.push(col);
    Ok(())
}

fn drop_column(db: &mut Database, table: &str, name: &str) -> Result<(), DBError> {
    let schema = db.catalog().require_table(table)?.clone();
    let at = schema
        .col_index(name)
        .ok_or_else(|| TableError::ColumnNotFound(table.to_string(), name.to_string()))?;

    if schema.primary_key_columns().iter().any(|c| c.eq_ignore_ascii_case(name)) {
        return Err(TableError::CannotDropColumn(name.to_string(), "it is part of the primary key".into()).into());
    }
    for def in db.catalog().indexes_for_table(table) {
        if def.columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            return Err(TableError::CannotDropColumn(
                name.to_string(),
                format!("index {} depends on it", def.name),
            )
            .into());
        }
    }

    for (rowid, mut row) in db.scan_table(table)? {
        row.remove(at);
        db.tree_insert(table, &rowid_key(rowid), &encode_row(&row))?;
    }
    let schema = db.catalog_mut().table_mut(table).expect("checked above");
    schema.columns.remove(at);
    schema.constraints.retain(|c| match c {
        TableConstraint::PrimaryKey(cols) | TableConstraint::Unique(cols) => {
            !cols.iter().any(|c| c.eq_ignore_ascii_case(name))
        }
        TableConstraint::ForeignKey { columns, .. } => !columns.iter().any(|c| c.eq_ignore_ascii_case(name)),
        TableConstraint::Check(_) => true,
    });
    Ok(())
}

fn rename_column(db: &mut Database, table: &str, old: &str, new: &str) -> Result<(), DBError> {
    let schema = db.catalog().require_table(table)?.clone();
    if schema.col_index(new).is_some() {
        return Err(TableError::DuplicateColumnName(new.to_string()).into());
    }
    let at = schema
        .col_index(old)
        .ok_or_else(|| TableError::ColumnNotFound(table.to_string(), old.to_string()))?;

    let rename = |cols: &mut Vec<String>| {
        for c in cols {
            if c.eq_ignore_ascii_case(old) {
                *c = new.to_string();
            }
        }
    };

    {
        let schema = db.catalog_mut().table_mut(table).expect("checked above");
        schema.columns[at].name = new.to_string();
        for c in &mut schema.constraints {
            match c {
                TableConstraint::PrimaryKey(cols) | TableConstraint::Unique(cols) => rename(cols),
                TableConstraint::ForeignKey { columns, .. } => rename(columns),
                TableConstraint::Check(_) => {}
            }
        }
    }

    // Indexes on this table and foreign keys pointing at the renamed column
    // follow along.
    let index_names: Vec<String> = db.catalog().indexes_for_table(table).iter().map(|d| d.name.clone()).collect();
    for iname in index_names {
        let mut def = db.catalog().index(&iname).expect("listed above").clone();
        rename(&mut def.columns);
        db.catalog_mut().insert_index(def);
    }
    let table_names: Vec<String> = db.catalog().tables().map(|t| t.name.clone()).collect();
    for tname in table_names {
        let schema = db.catalog_mut().table_mut(&tname).expect("listed above");
        for col in &mut schema.columns {
            for c in &mut col.constraints {
                if let ColumnConstraint::ForeignKey(fk) = c {
                    if fk.table.eq_ignore_ascii_case(table) && fk.column.eq_ignore_ascii_case(old) {
                        fk.column = new.to_string();
                    }
                }
            }
        }
        for c in &mut schema.constraints {
            if let TableConstraint::ForeignKey { fk, .. } = c {
                if fk.table.eq_ignore_ascii_case(table) && fk.column.eq_ignore_ascii_case(old) {
                    fk.column = new.to_string();
                }
            }
        }
    }
    Ok(())
}

fn rename_table(db: &mut Database, table: &str, new: &str) -> Result<(), DBError> {
    if db.catalog().table(new).is_some() {
        return Err(TableError::Exist(new.to_string()).into());
    }
    let mut schema = db.catalog_mut().remove_table(table).expect("checked by caller");
    schema.name = new.to_string();
    db.catalog_mut().insert_table(schema);
    db.forget_tree(table);

    let index_names: Vec<String> = db.catalog().indexes_for_table(table).iter().map(|d| d.name.clone()).collect();
    for iname in index_names {
        let mut def = db.catalog().index(&iname).expect("listed above").clone();
        def.table = new.to_string();
        db.catalog_mut().insert_index(def);
    }
    let table_names: Vec<String> = db.catalog().tables().map(|t| t.name.clone()).collect();
    for tname in table_names {
        let schema = db.catalog_mut().table_mut(&tname).expect("listed above");
        for col in &mut schema.columns {
            for c in &mut col.constraints {
                if let ColumnConstraint::ForeignKey(fk) = c {
                    if fk.table.eq_ignore_ascii_case(table) {
                        fk.table = new.to_string();
                    }
                }
            }
        }
        for c in &mut schema.constraints {
            if let TableConstraint::ForeignKey { fk, .. } = c {
                if fk.table.eq_ignore_ascii_case(table) {
                    fk.table = new.to_string();
                }
            }
        }
    }
    let trigger_names: Vec<String> = db
        .catalog()
        .triggers()
        .iter()
        .filter(|t| t.table.eq_ignore_ascii_case(table))
        .map(|t| t.name.clone())
        .collect();
    for tname in trigger_names {
        if let Some(mut def) = db.catalog_mut().remove_trigger(&tname) {
            def.table = new.to_string();
            def.sql = def.sql.replacen(&format!(" ON {table} "), &format!(" ON {new} "), 1);
            db.catalog_mut().insert_trigger(def);
        }
    }
    Ok(())
}
