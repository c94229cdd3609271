//! INSERT / UPDATE / DELETE.
//!
//! Per-row pipeline: defaults and autoincrement, declared-type coercion,
//! then the constraint order of the engine (PK null check, NOT NULL, column
//! CHECK, column FK, vector dimension + normalization, table CHECK, table
//! FK), unique-index probes, BEFORE triggers, then the storage write, index
//! maintenance, FK propagation, statistics and AFTER triggers. Every check
//! runs before the first write of a row, so a failing row leaves no partial
//! state behind.

use crate::db::coerce::{check_vector, coerce_value};
use crate::db::database::Database;
use crate::db::index::{self, PreparedIndex};
use crate::db::schema::{TableSchema, TriggerEvent, TriggerTiming};
use crate::db::trigger::fire_triggers;
use crate::db::{fk, schema::ForeignKey};
use crate::error::{ConstraintError, DBError, PlanError, TableError};
use crate::exec::eval::{eval, Env};
use crate::sql::ast::{Delete, Expr, Insert, Update};
use crate::sql::parser::parse_expr_text;
use micadb_storage::{encode_row, rowid_key};
use micadb_types::{Row, Value};

/// Everything about a table's constraints parsed once per statement.
struct Prepared {
    schema: TableSchema,
    indexes: Vec<PreparedIndex>,
    /// `(column index, check expr, original text)`.
    column_checks: Vec<(usize, Expr, String)>,
    /// `(check expr, original text)`.
    table_checks: Vec<(Expr, String)>,
    /// `(column index, fk)` from column declarations; checked with the
    /// other column-level constraints.
    column_fks: Vec<(usize, ForeignKey)>,
    /// `(column index, fk)` from table-level declarations; checked after
    /// the table-level CHECKs.
    table_fks: Vec<(usize, ForeignKey)>,
    /// Positions of vector columns, for the dimension/normalization step.
    vector_cols: Vec<usize>,
    defaults: Vec<Option<Expr>>,
    /// Short column names, the env for constraint evaluation.
    columns: Vec<String>,
    /// Qualified `table.col` names, the env for WHERE evaluation.
    qualified: Vec<String>,
    pk_positions: Vec<usize>,
    integer_pk: Option<usize>,
}

fn prepare(db: &Database, table: &str) -> Result<Prepared, DBError> {
    let schema = db.catalog().require_table(table)?.clone();
    let indexes = index::prepare_indexes(db, &schema)?;

    let mut column_checks = Vec::new();
    let mut column_fks = Vec::new();
    let mut vector_cols = Vec::new();
    let mut defaults = Vec::with_capacity(schema.columns.len());
    for (i, col) in schema.columns.iter().enumerate() {
        for text in col.checks() {
            column_checks.push((i, parse_expr_text(text)?, text.to_string()));
        }
        if let Some(fk) = col.foreign_key() {
            column_fks.push((i, fk.clone()));
        }
        if matches!(col.ty, crate::db::schema::ColumnType::Vector { .. }) {
            vector_cols.push(i);
        }
        defaults.push(col.default_sql().map(parse_expr_text).transpose()?);
    }
    let mut table_checks = Vec::new();
    for text in schema.table_checks() {
        table_checks.push((parse_expr_text(text)?, text.to_string()));
    }
    let mut table_fks = Vec::new();
    for (cols, fk) in schema.table_foreign_keys() {
        if let Some(i) = cols.first().and_then(|c| schema.col_index(c)) {
            table_fks.push((i, fk.clone()));
        }
    }

    let columns: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
    let qualified: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{}.{}", schema.name, c.name))
        .collect();
    let pk_positions = schema
        .primary_key_columns()
        .iter()
        .filter_map(|c| schema.col_index(c))
        .collect();
    let integer_pk = schema.integer_pk();

    Ok(Prepared {
        indexes,
        column_checks,
        table_checks,
        column_fks,
        table_fks,
        vector_cols,
        defaults,
        columns,
        qualified,
        pk_positions,
        integer_pk,
        schema,
    })
}

impl Prepared {
    /// The shared constraint pipeline, in order: PK null check, NOT NULL,
    /// column CHECK, column FK, vector dimension + normalization, table
    /// CHECK, table FK, unique probes. Everything here runs before any
    /// write; the vector step rewrites the row in place. `exclude_rowid`
    /// carries the updated row's own id.
    fn check_row(&self, db: &mut Database, row: &mut Row, exclude_rowid: Option<u64>) -> Result<(), DBError> {
        // PRIMARY KEY must not be NULL, except the autoincrementing integer
        // key, which was assigned before we got here.
        for &pk in &self.pk_positions {
            if row[pk].is_null() && Some(pk) != self.integer_pk {
                return Err(ConstraintError::PrimaryKeyNull {
                    table: self.schema.name.clone(),
                    column: self.schema.columns[pk].name.clone(),
                }
                .into());
            }
        }
        for (i, col) in self.schema.columns.iter().enumerate() {
            if col.is_not_null() && row[i].is_null() {
                return Err(ConstraintError::NotNull {
                    table: self.schema.name.clone(),
                    column: col.name.clone(),
                }
                .into());
            }
        }
        {
            let env = Env::new(&self.columns, row);
            for (i, check, text) in &self.column_checks {
                // A NULL in the checked column (or a NULL result) passes,
                // per the SQL standard.
                if row[*i].is_null() {
                    continue;
                }
                let v = eval(check, &env)?;
                if !v.is_null() && !v.is_truthy() {
                    return Err(ConstraintError::Check(text.clone()).into());
                }
            }
        }
        for (i, fk) in &self.column_fks {
            self.check_fk(db, row, *i, fk)?;
        }
        for &i in &self.vector_cols {
            let value = std::mem::replace(&mut row[i], Value::Null);
            row[i] = check_vector(value, &self.schema.columns[i])?;
        }
        {
            let env = Env::new(&self.columns, row);
            for (check, text) in &self.table_checks {
                let v = eval(check, &env)?;
                if !v.is_null() && !v.is_truthy() {
                    return Err(ConstraintError::Check(text.clone()).into());
                }
            }
        }
        for (i, fk) in &self.table_fks {
            self.check_fk(db, row, *i, fk)?;
        }
        for prep in &self.indexes {
            index::check_unique(db, prep, row, exclude_rowid)?;
        }
        Ok(())
    }

    fn check_fk(&self, db: &mut Database, row: &Row, col: usize, fk: &ForeignKey) -> Result<(), DBError> {
        if fk::referenced_row_exists(db, fk, &row[col])? {
            return Ok(());
        }
        Err(ConstraintError::ForeignKey {
            table: self.schema.name.clone(),
            column: self.schema.columns[col].name.clone(),
            ref_table: fk.table.clone(),
            ref_column: fk.column.clone(),
        }
        .into())
    }
}

#[tracing::instrument(skip_all, fields(table = %stmt.table))]
pub(crate) fn insert(db: &mut Database, stmt: &Insert) -> Result<usize, DBError> {
    let prepared = prepare(db, &stmt.table)?;
    let schema = &prepared.schema;
    let ncols = schema.columns.len();

    let positions: Vec<usize> = if stmt.columns.is_empty() {
        (0..ncols).collect()
    } else {
        stmt.columns
            .iter()
            .map(|c| {
                schema
                    .col_index(c)
                    .ok_or_else(|| TableError::ColumnNotFound(schema.name.clone(), c.clone()).into())
            })
            .collect::<Result<Vec<_>, DBError>>()?
    };

    let trigger_ctx = db.trigger_ctx.clone();
    let mut affected = 0usize;

    'rows: for value_exprs in &stmt.rows {
        if value_exprs.len() != positions.len() {
            return Err(PlanError::Unstructured(format!(
                "INSERT into {} supplies {} values for {} columns",
                schema.name,
                value_exprs.len(),
                positions.len()
            ))
            .into());
        }

        let mut row: Row = vec![Value::Null; ncols];
        let mut provided = vec![false; ncols];
        {
            let env = Env::empty(trigger_ctx.as_ref());
            for (expr, &pos) in value_exprs.iter().zip(&positions) {
                row[pos] = eval(expr, &env)?;
                provided[pos] = true;
            }
            for i in 0..ncols {
                if !provided[i] {
                    if let Some(default) = &prepared.defaults[i] {
                        row[i] = eval(default, &env)?;
                    }
                }
            }
        }

        // AUTOINCREMENT: a NULL integer primary key draws max-ever + 1; an
        // explicit value ratchets the high-water mark.
        if let Some(pk) = prepared.integer_pk {
            if row[pk].is_null() {
                let table = db.catalog_mut().table_mut(&schema.name).expect("prepared table");
                table.max_integer_pk += 1;
                row[pk] = Value::int(table.max_integer_pk);
            } else if let Some(v) = row[pk].as_int() {
                let table = db.catalog_mut().table_mut(&schema.name).expect("prepared table");
                if v > table.max_integer_pk {
                    table.max_integer_pk = v;
                }
            }
        }

        for i in 0..ncols {
            row[i] = coerce_value(std::mem::replace(&mut row[i], Value::Null), &schema.columns[i])?;
        }

        prepared.check_row(db, &mut row, None)?;

        match fire_triggers(db, &schema.name, TriggerTiming::Before, TriggerEvent::Insert, None, Some(&row)) {
            Err(e) if e.is_trigger_ignore() => continue 'rows,
            other => other?,
        }

        let rowid = {
            let table = db.catalog_mut().table_mut(&schema.name).expect("prepared table");
            let id = table.next_rowid;
            table.next_rowid += 1;
            id
        };

        db.tree_insert(&schema.name, &rowid_key(rowid), &encode_row(&row))?;
        index::insert_entries(db, &prepared.indexes, rowid, &row)?;
        db.bump_row_count(&schema.name, 1);

        match fire_triggers(db, &schema.name, TriggerTiming::After, TriggerEvent::Insert, None, Some(&row)) {
            Err(e) if e.is_trigger_ignore() => {}
            other => other?,
        }
        affected += 1;
    }

    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(&stmt.table);
    }
    db.save_catalog()?;
    Ok(affected)
}

#[tracing::instrument(skip_all, fields(table = %stmt.table))]
pub(crate) fn update(db: &mut Database, stmt: &Update) -> Result<usize, DBError> {
    let prepared = prepare(db, &stmt.table)?;
    let schema = &prepared.schema;

    let assignments: Vec<(usize, &Expr)> = stmt
        .assignments
        .iter()
        .map(|(name, expr)| {
            schema
                .col_index(name)
                .map(|i| (i, expr))
                .ok_or_else(|| TableError::ColumnNotFound(schema.name.clone(), name.clone()).into())
        })
        .collect::<Result<Vec<_>, DBError>>()?;

    let selection = stmt.selection.clone();
    let trigger_ctx = db.trigger_ctx.clone();
    let snapshot = db.scan_table(&schema.name)?;
    let mut affected = 0usize;

    'rows: for (rowid, old_row) in snapshot {
        if let Some(filter) = &selection {
            let mut env = Env::new(&prepared.qualified, &old_row);
            env.trigger = trigger_ctx.as_ref();
            if !eval(filter, &env)?.is_truthy() {
                continue;
            }
        }

        let mut new_row = old_row.clone();
        {
            let mut env = Env::new(&prepared.qualified, &old_row);
            env.trigger = trigger_ctx.as_ref();
            for (i, expr) in &assignments {
                new_row[*i] = eval(expr, &env)?;
            }
        }
        for (i, _) in &assignments {
            new_row[*i] = coerce_value(
                std::mem::replace(&mut new_row[*i], Value::Null),
                &schema.columns[*i],
            )?;
        }

        prepared.check_row(db, &mut new_row, Some(rowid))?;

        match fire_triggers(
            db,
            &schema.name,
            TriggerTiming::Before,
            TriggerEvent::Update,
            Some(&old_row),
            Some(&new_row),
        ) {
            Err(e) if e.is_trigger_ignore() => continue 'rows,
            other => other?,
        }

        fk::propagate_update(db, schema, &old_row, &new_row)?;

        // Old entries out, row replaced, new entries in. The delete-then-
        // insert dance matters even when the key is unchanged: the unique
        // entry must track the row replacement.
        index::delete_entries(db, &prepared.indexes, rowid, &old_row)?;
        db.tree_insert(&schema.name, &rowid_key(rowid), &encode_row(&new_row))?;
        index::insert_entries(db, &prepared.indexes, rowid, &new_row)?;

        match fire_triggers(
            db,
            &schema.name,
            TriggerTiming::After,
            TriggerEvent::Update,
            Some(&old_row),
            Some(&new_row),
        ) {
            Err(e) if e.is_trigger_ignore() => {}
            other => other?,
        }
        affected += 1;
    }

    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(&stmt.table);
    }
    db.save_catalog()?;
    Ok(affected)
}

#[tracing::instrument(skip_all, fields(table = %stmt.table))]
pub(crate) fn delete(db: &mut Database, stmt: &Delete) -> Result<usize, DBError> {
    let prepared = prepare(db, &stmt.table)?;
    let schema = &prepared.schema;

    let selection = stmt.selection.clone();
    let trigger_ctx = db.trigger_ctx.clone();
    let snapshot = db.scan_table(&schema.name)?;
    let mut affected = 0usize;

    'rows: for (rowid, row) in snapshot {
        if let Some(filter) = &selection {
            let mut env = Env::new(&prepared.qualified, &row);
            env.trigger = trigger_ctx.as_ref();
            if !eval(filter, &env)?.is_truthy() {
                continue;
            }
        }

        match fire_triggers(db, &schema.name, TriggerTiming::Before, TriggerEvent::Delete, Some(&row), None) {
            Err(e) if e.is_trigger_ignore() => continue 'rows,
            other => other?,
        }

        fk::propagate_delete(db, schema, &row)?;

        index::delete_entries(db, &prepared.indexes, rowid, &row)?;
        db.tree_delete(&schema.name, &rowid_key(rowid))?;
        db.bump_row_count(&schema.name, -1);

        match fire_triggers(db, &schema.name, TriggerTiming::After, TriggerEvent::Delete, Some(&row), None) {
            Err(e) if e.is_trigger_ignore() => {}
            other => other?,
        }
        affected += 1;
    }

    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(&stmt.table);
    }
    db.save_catalog()?;
    Ok(affected)
}

/// Raw row deletion used by CASCADE: FK recursion and index cleanup without
/// trigger firing.
pub(crate) fn delete_row_raw(
    db: &mut Database,
    schema: &TableSchema,
    rowid: u64,
    row: &Row,
) -> Result<(), DBError> {
    fk::propagate_delete(db, schema, row)?;
    let preps = index::prepare_indexes(db, schema)?;
    index::delete_entries(db, &preps, rowid, row)?;
    db.tree_delete(&schema.name, &rowid_key(rowid))?;
    db.bump_row_count(&schema.name, -1);
    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(&schema.name);
    }
    Ok(())
}

/// Rewrite one column of an existing row (CASCADE update / SET NULL), with
/// index maintenance but no re-validation.
pub(crate) fn rewrite_column(
    db: &mut Database,
    schema: &TableSchema,
    rowid: u64,
    row: &Row,
    col: usize,
    value: Value,
) -> Result<(), DBError> {
    let preps = index::prepare_indexes(db, schema)?;
    let mut new_row = row.clone();
    new_row[col] = value;
    index::delete_entries(db, &preps, rowid, row)?;
    db.tree_insert(&schema.name, &rowid_key(rowid), &encode_row(&new_row))?;
    index::insert_entries(db, &preps, rowid, &new_row)?;
    if let Some(cache) = &mut db.cache {
        cache.invalidate_table(&schema.name);
    }
    Ok(())
}
