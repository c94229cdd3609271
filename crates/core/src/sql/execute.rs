//! Statement dispatch.
//!
//! `Database::run_sql` parses, then routes each statement: DDL and DML to
//! their `db::` handlers, queries through the planner and the iterator
//! translator, transaction statements to the transaction surface, EXPLAIN to
//! the renderer. Query-level concerns the plan tree does not model (CTE
//! materialization, recursive included, set operations, scalar-subquery
//! substitution, the result cache) live here.

use crate::db::database::Database;
use crate::db::stats::{derive_stats, Reservoir, RESERVOIR_CAPACITY};
use crate::db::{ddl, dml};
use crate::error::{DBError, PlanError, RuntimeError};
use crate::exec::translate::{translate, CteData, CteEnv};
use crate::exec::drain;
use crate::plan::{build_select_plan, optimize, PlanContext};
use crate::sql::ast::{
    CteDef, Expr, FunctionCall, OrderBy, Query, QueryBody, Select, SelectItem, SetOp, Statement, TableRef,
};
use crate::sql::parser::{parse_query_text, parse_statements};
use ahash::AHashMap;
use micadb_types::{Row, RowKey, Value};
use std::collections::BTreeSet;
use std::rc::Rc;

/// The result of one statement.
#[derive(Debug, Clone, Default)]
pub struct StmtResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: usize,
}

/// Internal query result, before statement packaging.
pub(crate) struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Database {
    /// Run a string of `;`-separated statements, returning one result each.
    #[tracing::instrument(skip_all)]
    pub fn run_sql(&mut self, sql: &str) -> Result<Vec<StmtResult>, DBError> {
        let statements = parse_statements(sql)?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in &statements {
            results.push(dispatch_statement(self, statement)?);
        }
        Ok(results)
    }

    /// Run a string and keep the last statement's result; the single-shot
    /// CLI surface.
    pub fn run(&mut self, sql: &str) -> Result<StmtResult, DBError> {
        Ok(self.run_sql(sql)?.pop().unwrap_or_default())
    }
}

fn affected(n: usize) -> StmtResult {
    StmtResult {
        rows_affected: n,
        ..Default::default()
    }
}

pub(crate) fn dispatch_statement(db: &mut Database, stmt: &Statement) -> Result<StmtResult, DBError> {
    match stmt {
        Statement::CreateTable(ct) => {
            ddl::create_table(db, ct)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::DropTable { name, if_exists } => {
            ddl::drop_table(db, name, *if_exists)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::CreateIndex(ci) => {
            ddl::create_index(db, ci)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::DropIndex { name } => {
            ddl::drop_index(db, name)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::CreateView { name, columns, sql } => {
            ddl::create_view(db, name, columns.clone(), sql)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::DropView { name } => {
            ddl::drop_view(db, name)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::CreateTrigger(def) => {
            ddl::create_trigger(db, def)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::DropTrigger { name } => {
            ddl::drop_trigger(db, name)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::AlterTable { table, op } => {
            ddl::alter_table(db, table, op)?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::Insert(insert) => {
            let n = dml::insert(db, insert)?;
            db.autocommit_flush()?;
            Ok(affected(n))
        }
        Statement::Update(update) => {
            let n = dml::update(db, update)?;
            db.autocommit_flush()?;
            Ok(affected(n))
        }
        Statement::Delete(delete) => {
            let n = dml::delete(db, delete)?;
            db.autocommit_flush()?;
            Ok(affected(n))
        }
        Statement::Query(query) => run_select_statement(db, query),
        Statement::Analyze { table } => {
            analyze(db, table.as_deref())?;
            db.autocommit_flush()?;
            Ok(StmtResult::default())
        }
        Statement::Begin => {
            db.begin_tx()?;
            Ok(StmtResult::default())
        }
        Statement::Commit => {
            db.commit_tx()?;
            Ok(StmtResult::default())
        }
        Statement::Rollback => {
            db.rollback_tx()?;
            Ok(StmtResult::default())
        }
        Statement::Savepoint { name } => {
            db.savepoint(name)?;
            Ok(StmtResult::default())
        }
        Statement::RollbackTo { name } => {
            db.rollback_to_savepoint(name)?;
            Ok(StmtResult::default())
        }
        Statement::Release { name } => {
            db.release_savepoint(name)?;
            Ok(StmtResult::default())
        }
        Statement::Explain { query_plan, inner } => crate::sql::explain::explain(db, inner, *query_plan),
    }
}

fn run_select_statement(db: &mut Database, query: &Query) -> Result<StmtResult, DBError> {
    let cacheable = db.current_tx.is_none() && db.trigger_depth == 0 && db.cache.is_some();
    let cache_key = if cacheable {
        let text = format!("{query:?}");
        let key = db.cache.as_ref().unwrap().key(&text);
        if let Some(hit) = db.cache.as_ref().unwrap().get(key) {
            log::trace!("query cache hit");
            return Ok(StmtResult {
                columns: hit.columns.clone(),
                rows: hit.rows.clone(),
                rows_affected: 0,
            });
        }
        Some(key)
    } else {
        None
    };

    let result = run_query(db, query, CteEnv::default())?;

    if let Some(key) = cache_key {
        let mut tables = BTreeSet::new();
        referenced_tables(db, query, &mut tables, 0);
        let tables: Vec<String> = tables.into_iter().collect();
        if let Some(cache) = &mut db.cache {
            cache.put(
                key,
                &tables,
                crate::db::cache::CachedResult {
                    columns: result.columns.clone(),
                    rows: result.rows.clone(),
                },
            );
        }
    }

    Ok(StmtResult {
        columns: result.columns,
        rows: result.rows,
        rows_affected: 0,
    })
}

/// Run a query with the given outer CTE scope. Every sub-query path
/// (views, derived tables, scalar subqueries, CTE bodies) funnels back
/// through here.
pub(crate) fn run_query(db: &mut Database, query: &Query, outer: CteEnv) -> Result<QueryResult, DBError> {
    if db.query_depth >= 64 {
        return Err(PlanError::Unstructured("query nesting too deep (circular view?)".into()).into());
    }
    db.query_depth += 1;
    let result = run_query_inner(db, query, outer);
    db.query_depth -= 1;
    result
}

fn run_query_inner(db: &mut Database, query: &Query, outer: CteEnv) -> Result<QueryResult, DBError> {
    let mut ctes = outer;
    for cte in &query.ctes {
        let data = if query.recursive && is_recursive_cte(cte) {
            materialize_recursive(db, cte, &ctes)?
        } else {
            let r = run_query(db, &cte.query, ctes.clone())?;
            CteData {
                columns: cte_columns(cte, &r)?,
                rows: r.rows,
            }
        };
        ctes.push(cte.name.clone(), Rc::new(data));
    }

    match &query.body {
        QueryBody::Select(select) => run_select_body(db, select, query, &ctes),
        QueryBody::SetOp { .. } => {
            let (columns, rows) = eval_set_op(db, &query.body, &ctes)?;
            finish_set_op(db, query, &ctes, columns, rows)
        }
    }
}

fn cte_columns(cte: &CteDef, result: &QueryResult) -> Result<Vec<String>, DBError> {
    match &cte.columns {
        Some(declared) => {
            if declared.len() != result.columns.len() {
                return Err(RuntimeError::RecursiveCteColumns {
                    expected: declared.len(),
                    got: result.columns.len(),
                }
                .into());
            }
            Ok(declared.clone())
        }
        None => Ok(result.columns.iter().map(|c| short(c)).collect()),
    }
}

fn short(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, s)) => s.to_string(),
        None => name.to_string(),
    }
}

fn run_select_body(
    db: &mut Database,
    select: &Select,
    query: &Query,
    ctes: &CteEnv,
) -> Result<QueryResult, DBError> {
    // Scalar and IN subqueries evaluate once, before planning.
    let select = substitute_select(db, select, ctes)?;
    let order_by = query
        .order_by
        .iter()
        .map(|o| {
            Ok(OrderBy {
                expr: substitute(db, &o.expr, ctes)?,
                desc: o.desc,
            })
        })
        .collect::<Result<Vec<_>, DBError>>()?;

    let plan = {
        let ctx = PlanContext {
            catalog: db.catalog(),
            ctes: ctes.names_and_columns(),
        };
        optimize(build_select_plan(
            &select,
            &order_by,
            query.limit.as_ref(),
            query.offset.as_ref(),
            &ctx,
        )?)
    };

    let mut translated = translate(db, ctes, &plan)?;
    let rows = drain(translated.iter.as_mut())?;
    Ok(QueryResult {
        columns: translated.columns,
        rows,
    })
}

// --- set operations ---------------------------------------------------------

fn eval_set_op(db: &mut Database, body: &QueryBody, ctes: &CteEnv) -> Result<(Vec<String>, Vec<Row>), DBError> {
    match body {
        QueryBody::Select(select) => {
            let wrapper = Query {
                ctes: Vec::new(),
                recursive: false,
                body: QueryBody::Select(select.clone()),
                order_by: Vec::new(),
                limit: None,
                offset: None,
            };
            let r = run_query(db, &wrapper, ctes.clone())?;
            Ok((r.columns, r.rows))
        }
        QueryBody::SetOp {
            op,
            all,
            left,
            right,
        } => {
            let (columns, left_rows) = eval_set_op(db, left, ctes)?;
            let (right_columns, right_rows) = eval_set_op(db, right, ctes)?;
            if columns.len() != right_columns.len() {
                return Err(PlanError::Unstructured(format!(
                    "set operation arity mismatch: {} vs {} columns",
                    columns.len(),
                    right_columns.len()
                ))
                .into());
            }
            Ok((columns, combine(*op, *all, left_rows, right_rows)))
        }
    }
}

/// Bag/set semantics for UNION / INTERSECT / EXCEPT. NULL equals NULL for
/// de-duplication; keys are discriminated [`RowKey`]s.
fn combine(op: SetOp, all: bool, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
    match (op, all) {
        (SetOp::Union, true) => {
            let mut out = left;
            out.extend(right);
            out
        }
        (SetOp::Union, false) => {
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for row in left.into_iter().chain(right) {
                if seen.insert(RowKey::of_row(&row)) {
                    out.push(row);
                }
            }
            out
        }
        (SetOp::Intersect, all) => {
            let mut counts: AHashMap<RowKey, usize> = AHashMap::new();
            for row in &right {
                *counts.entry(RowKey::of_row(row)).or_default() += 1;
            }
            let mut out = Vec::new();
            let mut emitted = std::collections::HashSet::new();
            for row in left {
                let key = RowKey::of_row(&row);
                let Some(remaining) = counts.get_mut(&key) else {
                    continue;
                };
                if *remaining == 0 {
                    continue;
                }
                if all {
                    *remaining -= 1;
                    out.push(row);
                } else if emitted.insert(key) {
                    out.push(row);
                }
            }
            out
        }
        (SetOp::Except, all) => {
            let mut counts: AHashMap<RowKey, usize> = AHashMap::new();
            for row in &right {
                *counts.entry(RowKey::of_row(row)).or_default() += 1;
            }
            let mut out = Vec::new();
            let mut emitted = std::collections::HashSet::new();
            for row in left {
                let key = RowKey::of_row(&row);
                if let Some(remaining) = counts.get_mut(&key) {
                    if *remaining > 0 {
                        if all {
                            *remaining -= 1;
                        }
                        continue;
                    }
                }
                if all || emitted.insert(key) {
                    out.push(row);
                }
            }
            out
        }
    }
}

/// Apply a trailing ORDER BY / LIMIT / OFFSET to a combined set-op result.
fn finish_set_op(
    db: &mut Database,
    query: &Query,
    ctes: &CteEnv,
    columns: Vec<String>,
    mut rows: Vec<Row>,
) -> Result<QueryResult, DBError> {
    if !query.order_by.is_empty() {
        let order_by = query
            .order_by
            .iter()
            .map(|o| {
                Ok(OrderBy {
                    expr: substitute(db, &o.expr, ctes)?,
                    desc: o.desc,
                })
            })
            .collect::<Result<Vec<_>, DBError>>()?;
        let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(rows.len());
        for row in rows {
            let env = crate::exec::eval::Env::new(&columns, &row);
            let mut key = Vec::with_capacity(order_by.len());
            for o in &order_by {
                key.push(crate::exec::eval::eval(&o.expr, &env)?);
            }
            keyed.push((key, row));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, o) in order_by.iter().enumerate() {
                let ord = a[i].total_cmp(&b[i]);
                let ord = if o.desc { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        rows = keyed.into_iter().map(|(_, r)| r).collect();
    }

    let offset = match &query.offset {
        Some(e) => e.literal_int().ok_or(RuntimeError::LimitNotLiteral)? as usize,
        None => 0,
    };
    let limit = match &query.limit {
        Some(e) => e.literal_int().ok_or(RuntimeError::LimitNotLiteral)?,
        None => -1,
    };
    let mut rows: Vec<Row> = rows.into_iter().skip(offset).collect();
    if limit >= 0 {
        rows.truncate(limit as usize);
    }
    Ok(QueryResult { columns, rows })
}

// --- recursive CTEs ---------------------------------------------------------

fn is_recursive_cte(cte: &CteDef) -> bool {
    match &cte.query.body {
        QueryBody::SetOp {
            op: SetOp::Union,
            right,
            ..
        } => body_references(right, &cte.name),
        _ => false,
    }
}

fn body_references(body: &QueryBody, name: &str) -> bool {
    match body {
        QueryBody::Select(select) => select
            .from
            .as_ref()
            .map(|f| table_ref_references(f, name))
            .unwrap_or(false),
        QueryBody::SetOp { left, right, .. } => body_references(left, name) || body_references(right, name),
    }
}

fn table_ref_references(tr: &TableRef, name: &str) -> bool {
    match tr {
        TableRef::Table { name: t, .. } => t.eq_ignore_ascii_case(name),
        TableRef::Derived { query, .. } => body_references(&query.body, name),
        TableRef::Function { .. } => false,
        TableRef::Join { left, right, .. } => {
            table_ref_references(left, name) || table_ref_references(right, name)
        }
    }
}

/// Iterate `base UNION [ALL] step` to a fixpoint, binding the CTE name to
/// the previous iteration's delta.
fn materialize_recursive(db: &mut Database, cte: &CteDef, ctes: &CteEnv) -> Result<CteData, DBError> {
    let QueryBody::SetOp {
        op: SetOp::Union,
        all,
        left,
        right,
    } = &cte.query.body
    else {
        return Err(PlanError::Unstructured(format!(
            "recursive CTE `{}` must be `base UNION [ALL] step`",
            cte.name
        ))
        .into());
    };

    let base_query = Query {
        ctes: Vec::new(),
        recursive: false,
        body: (**left).clone(),
        order_by: Vec::new(),
        limit: None,
        offset: None,
    };
    let base = run_query(db, &base_query, ctes.clone())?;
    let columns = cte_columns(cte, &base)?;

    let mut seen: std::collections::HashSet<RowKey> = std::collections::HashSet::new();
    let mut acc: Vec<Row> = Vec::new();
    let mut working: Vec<Row> = Vec::new();
    for row in base.rows {
        if *all || seen.insert(RowKey::of_row(&row)) {
            acc.push(row.clone());
            working.push(row);
        }
    }

    while !working.is_empty() {
        let mut env = ctes.clone();
        env.push(
            cte.name.clone(),
            Rc::new(CteData {
                columns: columns.clone(),
                rows: std::mem::take(&mut working),
            }),
        );
        let step_query = Query {
            ctes: Vec::new(),
            recursive: false,
            body: (**right).clone(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        };
        let step = run_query(db, &step_query, env)?;
        if step.columns.len() != columns.len() {
            return Err(RuntimeError::RecursiveCteColumns {
                expected: columns.len(),
                got: step.columns.len(),
            }
            .into());
        }
        for row in step.rows {
            if *all || seen.insert(RowKey::of_row(&row)) {
                acc.push(row.clone());
                working.push(row);
            }
        }
    }

    Ok(CteData { columns, rows: acc })
}

// --- scalar subquery substitution -------------------------------------------

fn substitute_select(db: &mut Database, select: &Select, ctes: &CteEnv) -> Result<Select, DBError> {
    let mut out = select.clone();
    for item in &mut out.projection {
        if let SelectItem::Expr { expr, .. } = item {
            *expr = substitute(db, expr, ctes)?;
        }
    }
    if let Some(selection) = &mut out.selection {
        *selection = substitute(db, selection, ctes)?;
    }
    for g in &mut out.group_by {
        *g = substitute(db, g, ctes)?;
    }
    if let Some(having) = &mut out.having {
        *having = substitute(db, having, ctes)?;
    }
    if let Some(from) = &mut out.from {
        substitute_table_ref(db, from, ctes)?;
    }
    Ok(out)
}

fn substitute_table_ref(db: &mut Database, tr: &mut TableRef, ctes: &CteEnv) -> Result<(), DBError> {
    match tr {
        TableRef::Join {
            left, right, on, ..
        } => {
            substitute_table_ref(db, left, ctes)?;
            substitute_table_ref(db, right, ctes)?;
            if let Some(on) = on {
                *on = substitute(db, on, ctes)?;
            }
        }
        TableRef::Function { args, .. } => {
            for a in args {
                *a = substitute(db, a, ctes)?;
            }
        }
        // Derived tables run through run_query themselves.
        TableRef::Table { .. } | TableRef::Derived { .. } => {}
    }
    Ok(())
}

/// Replace scalar subqueries with their value and `IN (subquery)` with an
/// `IN` list. Only uncorrelated subqueries can succeed; a correlated column
/// surfaces as unknown inside the inner query.
fn substitute(db: &mut Database, expr: &Expr, ctes: &CteEnv) -> Result<Expr, DBError> {
    Ok(match expr {
        Expr::Subquery(q) => {
            let r = run_query(db, q, ctes.clone())?;
            match r.rows.len() {
                0 => Expr::Literal(Value::Null),
                1 => Expr::Literal(r.rows[0].first().cloned().unwrap_or(Value::Null)),
                n => return Err(RuntimeError::ScalarSubqueryRows(n).into()),
            }
        }
        Expr::InSubquery {
            expr: inner,
            subquery,
            negated,
        } => {
            let r = run_query(db, subquery, ctes.clone())?;
            Expr::InList {
                expr: Box::new(substitute(db, inner, ctes)?),
                list: r
                    .rows
                    .into_iter()
                    .map(|row| Expr::Literal(row.into_iter().next().unwrap_or(Value::Null)))
                    .collect(),
                negated: *negated,
            }
        }
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(substitute(db, left, ctes)?),
            right: Box::new(substitute(db, right, ctes)?),
        },
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(substitute(db, expr, ctes)?),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(substitute(db, expr, ctes)?),
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => Expr::Like {
            expr: Box::new(substitute(db, expr, ctes)?),
            pattern: Box::new(substitute(db, pattern, ctes)?),
            negated: *negated,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(substitute(db, expr, ctes)?),
            list: list
                .iter()
                .map(|e| substitute(db, e, ctes))
                .collect::<Result<Vec<_>, _>>()?,
            negated: *negated,
        },
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: Box::new(substitute(db, expr, ctes)?),
            low: Box::new(substitute(db, low, ctes)?),
            high: Box::new(substitute(db, high, ctes)?),
            negated: *negated,
        },
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => Expr::Case {
            operand: match operand {
                Some(o) => Some(Box::new(substitute(db, o, ctes)?)),
                None => None,
            },
            branches: branches
                .iter()
                .map(|(w, t)| Ok::<_, DBError>((substitute(db, w, ctes)?, substitute(db, t, ctes)?)))
                .collect::<Result<Vec<_>, _>>()?,
            else_expr: match else_expr {
                Some(e) => Some(Box::new(substitute(db, e, ctes)?)),
                None => None,
            },
        },
        Expr::Function(f) => Expr::Function(FunctionCall {
            name: f.name.clone(),
            args: f
                .args
                .iter()
                .map(|a| substitute(db, a, ctes))
                .collect::<Result<Vec<_>, _>>()?,
            distinct: f.distinct,
            window: f.window.clone(),
        }),
        Expr::Literal(_) | Expr::Column { .. } | Expr::Wildcard => expr.clone(),
    })
}

// --- ANALYZE ----------------------------------------------------------------

#[tracing::instrument(skip_all)]
pub(crate) fn analyze(db: &mut Database, table: Option<&str>) -> Result<(), DBError> {
    let names: Vec<String> = match table {
        Some(t) => vec![db.catalog().require_table(t)?.name.clone()],
        None => db.catalog().tables().map(|t| t.name.clone()).collect(),
    };
    for name in names {
        let schema = db.catalog().require_table(&name)?.clone();
        let mut reservoir = Reservoir::new(RESERVOIR_CAPACITY);
        let rows = db.scan_table(&name)?;
        let total = rows.len() as i64;
        for (_, row) in rows {
            reservoir.offer(row);
        }
        let sample = reservoir.into_rows();
        let stats = derive_stats(&schema, &sample, total, db.histogram_buckets);
        log::debug!("analyzed {name}: {total} rows, {} sampled", sample.len());
        db.catalog_mut().set_stats(&name, stats);
    }
    Ok(())
}

// --- cache support ----------------------------------------------------------

/// Base tables a query reads, views expanded one level per recursion step.
fn referenced_tables(db: &Database, query: &Query, out: &mut BTreeSet<String>, depth: usize) {
    if depth > 8 {
        return;
    }
    for cte in &query.ctes {
        referenced_tables(db, &cte.query, out, depth + 1);
    }
    body_tables(db, &query.body, out, depth);
}

fn body_tables(db: &Database, body: &QueryBody, out: &mut BTreeSet<String>, depth: usize) {
    match body {
        QueryBody::Select(select) => {
            if let Some(from) = &select.from {
                from_tables(db, from, out, depth);
            }
            let mut exprs: Vec<&Expr> = Vec::new();
            for item in &select.projection {
                if let SelectItem::Expr { expr, .. } = item {
                    exprs.push(expr);
                }
            }
            exprs.extend(select.selection.iter());
            exprs.extend(select.having.iter());
            for e in exprs {
                e.walk(&mut |e| match e {
                    Expr::Subquery(q) | Expr::InSubquery { subquery: q, .. } => {
                        referenced_tables(db, q, out, depth + 1);
                    }
                    _ => {}
                });
            }
        }
        QueryBody::SetOp { left, right, .. } => {
            body_tables(db, left, out, depth);
            body_tables(db, right, out, depth);
        }
    }
}

fn from_tables(db: &Database, tr: &TableRef, out: &mut BTreeSet<String>, depth: usize) {
    match tr {
        TableRef::Table { name, .. } => {
            if let Some(view) = db.catalog().view(name) {
                if depth <= 8 {
                    if let Ok(inner) = parse_query_text(&view.sql) {
                        referenced_tables(db, &inner, out, depth + 1);
                    }
                }
            } else {
                out.insert(name.to_ascii_lowercase());
            }
        }
        TableRef::Derived { query, .. } => referenced_tables(db, query, out, depth + 1),
        TableRef::Function { args, .. } => {
            // vector_quantize_scan names its table in the first argument.
            if let Some(Expr::Column { name, .. } | Expr::Literal(Value::Text { v: name, .. })) = args.first() {
                out.insert(name.to_ascii_lowercase());
            }
        }
        TableRef::Join { left, right, .. } => {
            from_tables(db, left, out, depth);
            from_tables(db, right, out, depth);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::database::tests_utils::{make_test_db, ResultTest};
    use crate::db::database::DatabaseOptions;
    use pretty_assertions::assert_eq;

    fn rows(db: &mut Database, sql: &str) -> Vec<Row> {
        db.run(sql).unwrap_or_else(|e| panic!("`{sql}` failed: {e}")).rows
    }

    fn ints(db: &mut Database, sql: &str) -> Vec<i64> {
        rows(db, sql)
            .into_iter()
            .map(|r| r[0].as_int().expect("integer column"))
            .collect()
    }

    fn texts(db: &mut Database, sql: &str) -> Vec<String> {
        rows(db, sql)
            .into_iter()
            .map(|r| r[0].to_string())
            .collect()
    }

    fn seed_users_orders(db: &mut Database) {
        db.run_sql(
            "CREATE TABLE users (id INT PRIMARY KEY, name TEXT); \
             CREATE TABLE orders (id INT PRIMARY KEY, user_id INT, amount INT); \
             INSERT INTO users VALUES (1, 'Alice'), (2, 'Bob'), (3, 'Charlie'); \
             INSERT INTO orders VALUES (101, 1, 50), (102, 1, 20), (103, 2, 100)",
        )
        .unwrap();
    }

    #[test]
    fn inner_join_scenario() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let result = db.run(
            "SELECT users.name, orders.amount FROM users JOIN orders ON users.id = orders.user_id",
        )?;
        assert_eq!(result.columns, ["name", "amount"]);
        let mut got: Vec<(String, i64)> = result
            .rows
            .iter()
            .map(|r| (r[0].to_string(), r[1].as_int().unwrap()))
            .collect();
        got.sort();
        assert_eq!(
            got,
            [
                ("Alice".to_string(), 20),
                ("Alice".to_string(), 50),
                ("Bob".to_string(), 100),
            ]
        );
        Ok(())
    }

    #[test]
    fn unique_index_scenario() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE accounts (email TEXT)")?;
        db.run("CREATE UNIQUE INDEX idx_email ON accounts (email)")?;
        db.run("INSERT INTO accounts VALUES ('alice@example.com')")?;
        let err = db.run("INSERT INTO accounts VALUES ('alice@example.com')").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"), "{err}");
        // The failed row was not applied.
        assert_eq!(rows(&mut db, "SELECT * FROM accounts").len(), 1);
        Ok(())
    }

    #[test]
    fn autoincrement_scenario() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE test (id SERIAL PRIMARY KEY, name TEXT)")?;
        db.run("INSERT INTO test (name) VALUES ('a')")?;
        db.run("INSERT INTO test (name) VALUES ('b')")?;
        db.run("INSERT INTO test (name) VALUES ('c')")?;
        assert_eq!(ints(&mut db, "SELECT id FROM test"), [1, 2, 3]);
        Ok(())
    }

    #[test]
    fn autoincrement_resumes_after_explicit_value() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (id INT PRIMARY KEY, x TEXT)")?;
        db.run("INSERT INTO t VALUES (10, 'a')")?;
        db.run("INSERT INTO t (x) VALUES ('b')")?;
        assert_eq!(ints(&mut db, "SELECT id FROM t"), [10, 11]);
        Ok(())
    }

    #[test]
    fn cascade_delete_scenario() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE departments (id INT PRIMARY KEY, name TEXT); \
             CREATE TABLE employees (id INT PRIMARY KEY, dept_id INT REFERENCES departments(id) ON DELETE CASCADE); \
             INSERT INTO departments VALUES (1, 'eng'); \
             INSERT INTO employees VALUES (10, 1), (11, 1)",
        )?;
        db.run("DELETE FROM departments WHERE id = 1")?;
        assert!(rows(&mut db, "SELECT * FROM employees").is_empty());
        Ok(())
    }

    #[test]
    fn fk_restrict_blocks_delete() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE p (id INT PRIMARY KEY); \
             CREATE TABLE c (id INT PRIMARY KEY, p_id INT REFERENCES p(id) ON DELETE RESTRICT); \
             INSERT INTO p VALUES (1); INSERT INTO c VALUES (1, 1)",
        )?;
        assert!(db.run("DELETE FROM p WHERE id = 1").is_err());
        assert_eq!(rows(&mut db, "SELECT * FROM p").len(), 1);
        Ok(())
    }

    #[test]
    fn fk_set_null_on_delete() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE p (id INT PRIMARY KEY); \
             CREATE TABLE c (id INT PRIMARY KEY, p_id INT REFERENCES p(id) ON DELETE SET NULL); \
             INSERT INTO p VALUES (1); INSERT INTO c VALUES (7, 1)",
        )?;
        db.run("DELETE FROM p WHERE id = 1")?;
        let c = rows(&mut db, "SELECT p_id FROM c");
        assert_eq!(c, vec![vec![Value::Null]]);
        Ok(())
    }

    #[test]
    fn fk_cascade_on_update() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE p (id INT PRIMARY KEY); \
             CREATE TABLE c (id INT PRIMARY KEY, p_id INT REFERENCES p(id) ON UPDATE CASCADE); \
             INSERT INTO p VALUES (1); INSERT INTO c VALUES (7, 1)",
        )?;
        db.run("UPDATE p SET id = 5 WHERE id = 1")?;
        assert_eq!(ints(&mut db, "SELECT p_id FROM c"), [5]);
        Ok(())
    }

    #[test]
    fn fk_insert_requires_referenced_row() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE p (id INT PRIMARY KEY); \
             CREATE TABLE c (id INT PRIMARY KEY, p_id INT REFERENCES p(id))",
        )?;
        assert!(db.run("INSERT INTO c VALUES (1, 99)").is_err());
        // NULL skips the existence check.
        db.run("INSERT INTO c VALUES (1, NULL)")?;
        Ok(())
    }

    #[test]
    fn row_number_scenario() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE employees (id INT PRIMARY KEY, name TEXT, salary INT); \
             INSERT INTO employees VALUES (1, 'Alice', 50000), (2, 'Bob', 60000), (3, 'Charlie', 55000)",
        )?;
        let result = db.run("SELECT name, ROW_NUMBER() OVER (ORDER BY salary DESC) FROM employees")?;
        let got: Vec<(String, i64)> = result
            .rows
            .iter()
            .map(|r| (r[0].to_string(), r[1].as_int().unwrap()))
            .collect();
        assert_eq!(
            got,
            [
                ("Bob".to_string(), 1),
                ("Charlie".to_string(), 2),
                ("Alice".to_string(), 3),
            ]
        );
        Ok(())
    }

    #[test]
    fn union_scenarios() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE t1 (x INT); CREATE TABLE t2 (y INT); \
             INSERT INTO t1 VALUES (1), (2); INSERT INTO t2 VALUES (2), (3)",
        )?;
        let mut union: Vec<i64> = ints(&mut db, "SELECT x FROM t1 UNION SELECT y FROM t2");
        union.sort();
        assert_eq!(union, [1, 2, 3]);

        let mut union_all = ints(&mut db, "SELECT x FROM t1 UNION ALL SELECT y FROM t2");
        union_all.sort();
        assert_eq!(union_all, [1, 2, 2, 3]);

        let intersect = ints(&mut db, "SELECT x FROM t1 INTERSECT SELECT y FROM t2");
        assert_eq!(intersect, [2]);

        let except = ints(&mut db, "SELECT x FROM t1 EXCEPT SELECT y FROM t2");
        assert_eq!(except, [1]);
        Ok(())
    }

    #[test]
    fn set_op_with_order_and_limit() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE t1 (x INT); CREATE TABLE t2 (y INT); \
             INSERT INTO t1 VALUES (5), (1); INSERT INTO t2 VALUES (3), (9)",
        )?;
        assert_eq!(
            ints(&mut db, "SELECT x FROM t1 UNION SELECT y FROM t2 ORDER BY x DESC LIMIT 2"),
            [9, 5]
        );
        Ok(())
    }

    #[test]
    fn set_op_bag_semantics() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE t1 (x INT); CREATE TABLE t2 (y INT); \
             INSERT INTO t1 VALUES (1), (1), (2), (2), (2); \
             INSERT INTO t2 VALUES (1), (2), (2)",
        )?;
        // INTERSECT ALL keeps min(count_left, count_right) copies.
        let mut i = ints(&mut db, "SELECT x FROM t1 INTERSECT ALL SELECT y FROM t2");
        i.sort();
        assert_eq!(i, [1, 2, 2]);
        // EXCEPT ALL keeps count_left - count_right copies.
        let mut e = ints(&mut db, "SELECT x FROM t1 EXCEPT ALL SELECT y FROM t2");
        e.sort();
        assert_eq!(e, [1, 2]);
        Ok(())
    }

    #[test]
    fn lag_lead_and_frames_via_sql() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE m (v INT); INSERT INTO m VALUES (10), (20), (30)")?;
        let result = db.run(
            "SELECT v, LAG(v) OVER (ORDER BY v), LEAD(v, 1, 0) OVER (ORDER BY v), \
             SUM(v) OVER (ORDER BY v ROWS BETWEEN 1 PRECEDING AND CURRENT ROW) FROM m",
        )?;
        // LAG/LEAD carry the stored value through (width tag included); the
        // LEAD default is the literal as written.
        let i32v = |v: i64| Value::int_width(v, micadb_types::IntWidth::I32);
        assert_eq!(
            result.rows,
            vec![
                vec![i32v(10), Value::Null, i32v(20), Value::int(10)],
                vec![i32v(20), i32v(10), i32v(30), Value::int(30)],
                vec![i32v(30), i32v(20), Value::int(0), Value::int(50)],
            ]
        );
        Ok(())
    }

    #[test]
    fn cross_join_and_between_and_like() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE a (x INT); CREATE TABLE b (y INT); \
             INSERT INTO a VALUES (1), (2); INSERT INTO b VALUES (10), (20)",
        )?;
        assert_eq!(rows(&mut db, "SELECT x, y FROM a CROSS JOIN b").len(), 4);
        assert_eq!(rows(&mut db, "SELECT x, y FROM a, b").len(), 4);
        db.run_sql("CREATE TABLE s (name TEXT); INSERT INTO s VALUES ('apple'), ('banana'), ('avocado')")?;
        let mut got = texts(&mut db, "SELECT name FROM s WHERE name LIKE 'a%'");
        got.sort();
        assert_eq!(got, ["apple", "avocado"]);
        assert_eq!(ints(&mut db, "SELECT x FROM a WHERE x BETWEEN 2 AND 9"), [2]);
        Ok(())
    }

    #[test]
    fn savepoint_rollback_scenario() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v TEXT)")?;
        db.run_sql(
            "BEGIN; \
             INSERT INTO t VALUES ('A'); \
             SAVEPOINT sp1; \
             INSERT INTO t VALUES ('B'); \
             INSERT INTO t VALUES ('C'); \
             ROLLBACK TO sp1; \
             COMMIT",
        )?;
        assert_eq!(texts(&mut db, "SELECT v FROM t"), ["A"]);
        Ok(())
    }

    #[test]
    fn rollback_undoes_everything() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT)")?;
        db.run_sql("BEGIN; INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); ROLLBACK")?;
        assert!(rows(&mut db, "SELECT * FROM t").is_empty());
        Ok(())
    }

    #[test]
    fn rollback_restores_updates_and_deletes() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (id INT PRIMARY KEY, v TEXT); INSERT INTO t VALUES (1, 'old'), (2, 'gone')")?;
        db.run_sql("BEGIN; UPDATE t SET v = 'new' WHERE id = 1; DELETE FROM t WHERE id = 2; ROLLBACK")?;
        let mut vs = texts(&mut db, "SELECT v FROM t");
        vs.sort();
        assert_eq!(vs, ["gone", "old"]);
        Ok(())
    }

    #[test]
    fn tx_errors() {
        let mut db = make_test_db();
        assert!(db.run("COMMIT").is_err());
        assert!(db.run("ROLLBACK").is_err());
        assert!(db.run("SAVEPOINT sp").is_err());
        db.run("BEGIN").unwrap();
        assert!(db.run("BEGIN").is_err());
        assert!(db.run("ROLLBACK TO nope").is_err());
    }

    #[test]
    fn select_star_counts_match_dml() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT)")?;
        for i in 0..10 {
            db.run(&format!("INSERT INTO t VALUES ({i})"))?;
        }
        db.run("DELETE FROM t WHERE v >= 7")?;
        assert_eq!(rows(&mut db, "SELECT * FROM t").len(), 7);
        Ok(())
    }

    #[test]
    fn empty_table_boundaries() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT)")?;
        assert!(rows(&mut db, "SELECT * FROM t").is_empty());
        db.run_sql("INSERT INTO t VALUES (1), (2), (3)")?;
        assert!(rows(&mut db, "SELECT * FROM t LIMIT 0").is_empty());
        assert!(rows(&mut db, "SELECT * FROM t LIMIT 10 OFFSET 5").is_empty());
        assert_eq!(rows(&mut db, "SELECT * FROM t LIMIT -1").len(), 3);
        Ok(())
    }

    #[test]
    fn limit_requires_literal() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (v INT); INSERT INTO t VALUES (1)")?;
        let err = db.run("SELECT * FROM t LIMIT v").unwrap_err();
        assert!(err.to_string().contains("expected literal"), "{err}");
        Ok(())
    }

    #[test]
    fn outer_join_boundaries() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE l (id INT); CREATE TABLE r (id INT, l_id INT); \
             INSERT INTO l VALUES (1), (2)",
        )?;
        let left = rows(&mut db, "SELECT l.id, r.id FROM l LEFT JOIN r ON l.id = r.l_id");
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|row| row[1].is_null()));

        db.run("DELETE FROM l")?;
        db.run_sql("INSERT INTO r VALUES (7, 1), (8, 2)")?;
        let right = rows(&mut db, "SELECT l.id, r.id FROM l RIGHT JOIN r ON l.id = r.l_id");
        assert_eq!(right.len(), 2);
        assert!(right.iter().all(|row| row[0].is_null()));
        Ok(())
    }

    #[test]
    fn declared_type_boundaries() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run(
            "CREATE TABLE t (c CHAR(5), v VARCHAR(3), s SMALLINT, d DECIMAL(4, 1), g GUID)",
        )?;
        db.run("INSERT INTO t (c) VALUES ('ab')")?;
        assert_eq!(texts(&mut db, "SELECT c FROM t"), ["ab   "]);
        db.run("INSERT INTO t (c) VALUES ('abcdefgh')")?;
        assert!(texts(&mut db, "SELECT c FROM t").contains(&"abcde".to_string()));

        assert!(db.run("INSERT INTO t (v) VALUES ('abcd')").is_err());
        assert!(db.run("INSERT INTO t (s) VALUES (32768)").is_err());
        assert!(db.run("INSERT INTO t (d) VALUES (1000.0)").is_err());
        assert!(db.run("INSERT INTO t (g) VALUES ('nope')").is_err());
        db.run("INSERT INTO t (g) VALUES ('01234567-89ab-cdef-0123-456789abcdef')")?;
        Ok(())
    }

    #[test]
    fn mixed_numeric_hash_join_matches() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE a (x INT); CREATE TABLE b (y FLOAT); \
             INSERT INTO a VALUES (1), (2); \
             INSERT INTO b VALUES (1.0), (3.5)",
        )?;
        // The equi-join rewrite to hash join must agree with the
        // nested-loop comparison: 1 = 1.0 is a match.
        let result = db.run("SELECT x, y FROM a JOIN b ON a.x = b.y")?;
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0].as_int(), Some(1));
        assert_eq!(result.rows[0][1], Value::Float(1.0));
        Ok(())
    }

    #[test]
    fn mixed_numeric_union_dedups() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE a (x INT); CREATE TABLE b (y FLOAT); \
             INSERT INTO a VALUES (1), (2); \
             INSERT INTO b VALUES (1.0), (3.0)",
        )?;
        // 1 and 1.0 are one row under de-dup equality.
        let union = rows(&mut db, "SELECT x FROM a UNION SELECT y FROM b");
        assert_eq!(union.len(), 3);
        let distinct = rows(
            &mut db,
            "SELECT DISTINCT v FROM (SELECT x AS v FROM a UNION ALL SELECT y FROM b) AS u",
        );
        assert_eq!(distinct.len(), 3);
        Ok(())
    }

    #[test]
    fn constraint_order_not_null_before_vector() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (a INT NOT NULL, v VECTOR(2))")?;
        // Both the NOT NULL on `a` and the dimension of `v` are violated;
        // NOT NULL is checked first.
        let err = db.run("INSERT INTO t VALUES (NULL, '[1, 2, 3]')").unwrap_err();
        assert!(err.to_string().contains("NOT NULL"), "{err}");
        let err = db.run("INSERT INTO t VALUES (1, '[1, 2, 3]')").unwrap_err();
        assert!(err.to_string().contains("dimension"), "{err}");
        Ok(())
    }

    #[test]
    fn constraint_order_table_check_before_table_fk() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE p (id INT PRIMARY KEY); \
             CREATE TABLE t (c INT, CHECK (c > 0), FOREIGN KEY (c) REFERENCES p(id))",
        )?;
        // -5 violates both the table CHECK and the table FK; CHECK wins.
        let err = db.run("INSERT INTO t VALUES (-5)").unwrap_err();
        assert!(err.to_string().contains("CHECK"), "{err}");
        // A positive but unreferenced value falls through to the FK error.
        let err = db.run("INSERT INTO t VALUES (5)").unwrap_err();
        assert!(err.to_string().contains("FOREIGN KEY"), "{err}");
        Ok(())
    }

    #[test]
    fn not_null_and_check_constraints() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (a INT NOT NULL, b INT CHECK (b > 0))")?;
        assert!(db.run("INSERT INTO t (b) VALUES (1)").is_err());
        assert!(db.run("INSERT INTO t VALUES (1, -5)").is_err());
        // A NULL checked value passes.
        db.run("INSERT INTO t (a) VALUES (1)")?;
        db.run("INSERT INTO t VALUES (1, 5)")?;
        assert_eq!(rows(&mut db, "SELECT * FROM t").len(), 2);
        Ok(())
    }

    #[test]
    fn primary_key_rejects_null_and_duplicates() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (k TEXT PRIMARY KEY, v INT)")?;
        assert!(db.run("INSERT INTO t (v) VALUES (1)").is_err());
        db.run("INSERT INTO t VALUES ('a', 1)")?;
        let err = db.run("INSERT INTO t VALUES ('a', 2)").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"), "{err}");
        Ok(())
    }

    #[test]
    fn update_and_delete_with_where() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (id INT PRIMARY KEY, v INT); INSERT INTO t VALUES (1, 10), (2, 20), (3, 30)")?;
        let result = db.run("UPDATE t SET v = v + 1 WHERE v >= 20")?;
        assert_eq!(result.rows_affected, 2);
        assert_eq!(ints(&mut db, "SELECT v FROM t ORDER BY v"), [10, 21, 31]);
        let result = db.run("DELETE FROM t WHERE v = 21")?;
        assert_eq!(result.rows_affected, 1);
        assert_eq!(rows(&mut db, "SELECT * FROM t").len(), 2);
        Ok(())
    }

    #[test]
    fn group_by_and_having() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let result = db.run(
            "SELECT user_id, COUNT(*), SUM(amount) FROM orders GROUP BY user_id \
             HAVING COUNT(*) > 1",
        )?;
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0][0].as_int(), Some(1));
        assert_eq!(result.rows[0][1].as_int(), Some(2));
        assert_eq!(result.rows[0][2].as_int(), Some(70));
        Ok(())
    }

    #[test]
    fn aggregates_over_empty_input() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT)")?;
        let result = db.run("SELECT COUNT(*), SUM(v), AVG(v), MIN(v), MAX(v) FROM t")?;
        assert_eq!(
            result.rows,
            vec![vec![Value::int(0), Value::Null, Value::Null, Value::Null, Value::Null]]
        );
        Ok(())
    }

    #[test]
    fn order_by_aggregate_name() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let result = db.run("SELECT user_id, COUNT(*) FROM orders GROUP BY user_id ORDER BY COUNT(*) DESC")?;
        assert_eq!(result.rows[0][1].as_int(), Some(2));
        assert_eq!(result.rows[1][1].as_int(), Some(1));
        Ok(())
    }

    #[test]
    fn distinct_select() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (v INT); INSERT INTO t VALUES (1), (2), (1), (3), (2)")?;
        let mut got = ints(&mut db, "SELECT DISTINCT v FROM t");
        got.sort();
        assert_eq!(got, [1, 2, 3]);
        Ok(())
    }

    #[test]
    fn scalar_functions_and_case() -> ResultTest<()> {
        let mut db = make_test_db();
        let result = db.run("SELECT IF(1 = 1, 'y', 'n'), COALESCE(NULL, 'fallback'), ABS(-5), UPPER('abc')")?;
        assert_eq!(
            result.rows[0],
            vec![
                Value::text("y"),
                Value::text("fallback"),
                Value::int(5),
                Value::text("ABC"),
            ]
        );
        let result = db.run("SELECT CASE WHEN 2 > 1 THEN 'bigger' ELSE 'smaller' END")?;
        assert_eq!(result.rows[0][0], Value::text("bigger"));
        Ok(())
    }

    #[test]
    fn scalar_subquery() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        assert_eq!(
            texts(&mut db, "SELECT name FROM users WHERE id = (SELECT MAX(user_id) FROM orders)"),
            ["Bob"]
        );
        let err = db
            .run("SELECT name FROM users WHERE id = (SELECT user_id FROM orders)")
            .unwrap_err();
        assert!(err.to_string().contains("scalar subquery"), "{err}");
        Ok(())
    }

    #[test]
    fn in_subquery() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let mut got = texts(
            &mut db,
            "SELECT name FROM users WHERE id IN (SELECT user_id FROM orders)",
        );
        got.sort();
        assert_eq!(got, ["Alice", "Bob"]);
        assert_eq!(
            texts(&mut db, "SELECT name FROM users WHERE id NOT IN (SELECT user_id FROM orders)"),
            ["Charlie"]
        );
        Ok(())
    }

    #[test]
    fn derived_table() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        assert_eq!(
            ints(
                &mut db,
                "SELECT total FROM (SELECT SUM(amount) AS total FROM orders) AS sums",
            ),
            [170]
        );
        Ok(())
    }

    #[test]
    fn views_expand_by_name() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        db.run("CREATE VIEW big_orders AS SELECT id, amount FROM orders WHERE amount >= 50")?;
        let mut got = ints(&mut db, "SELECT id FROM big_orders");
        got.sort();
        assert_eq!(got, [101, 103]);
        db.run("DROP VIEW big_orders")?;
        assert!(db.run("SELECT * FROM big_orders").is_err());
        Ok(())
    }

    #[test]
    fn view_with_declared_columns() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        db.run("CREATE VIEW order_sizes (oid, size) AS SELECT id, amount FROM orders")?;
        assert_eq!(rows(&mut db, "SELECT size FROM order_sizes WHERE oid = 103")[0][0].as_int(), Some(100));
        Ok(())
    }

    #[test]
    fn cte_and_recursive_cte() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let mut got = texts(
            &mut db,
            "WITH big AS (SELECT user_id FROM orders WHERE amount >= 50) \
             SELECT name FROM users WHERE id IN (SELECT user_id FROM big)",
        );
        got.sort();
        assert_eq!(got, ["Alice", "Bob"]);

        assert_eq!(
            ints(
                &mut db,
                "WITH RECURSIVE cnt (n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM cnt WHERE n < 5) \
                 SELECT n FROM cnt ORDER BY n",
            ),
            [1, 2, 3, 4, 5]
        );
        Ok(())
    }

    #[test]
    fn triggers_raise_abort_and_ignore() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE guarded (v INT)")?;
        db.run("CREATE TRIGGER no_insert BEFORE INSERT ON guarded BEGIN RAISE(ABORT, 'read only table') END")?;
        let err = db.run("INSERT INTO guarded VALUES (1)").unwrap_err();
        assert!(err.to_string().contains("trigger abort"), "{err}");
        assert!(err.to_string().contains("read only table"), "{err}");
        assert!(rows(&mut db, "SELECT * FROM guarded").is_empty());

        db.run("CREATE TABLE silent (v INT)")?;
        db.run("CREATE TRIGGER skip_all BEFORE INSERT ON silent BEGIN RAISE(IGNORE) END")?;
        let result = db.run("INSERT INTO silent VALUES (1)")?;
        assert_eq!(result.rows_affected, 0);
        assert!(rows(&mut db, "SELECT * FROM silent").is_empty());
        Ok(())
    }

    #[test]
    fn trigger_body_sees_new_row() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE users (id INT PRIMARY KEY, name TEXT); \
             CREATE TABLE audit_log (who TEXT)",
        )?;
        db.run(
            "CREATE TRIGGER audit AFTER INSERT ON users FOR EACH ROW BEGIN \
             INSERT INTO audit_log (who) VALUES (NEW.name); END",
        )?;
        db.run("INSERT INTO users VALUES (1, 'Alice')")?;
        assert_eq!(texts(&mut db, "SELECT who FROM audit_log"), ["Alice"]);
        db.run("DROP TRIGGER audit")?;
        db.run("INSERT INTO users VALUES (2, 'Bob')")?;
        assert_eq!(rows(&mut db, "SELECT * FROM audit_log").len(), 1);
        Ok(())
    }

    #[test]
    fn triggers_do_not_refire_from_trigger_bodies() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE a (v INT); CREATE TABLE b (v INT)")?;
        // b's trigger would write back into a; the depth gate stops it.
        db.run("CREATE TRIGGER ta AFTER INSERT ON a BEGIN INSERT INTO b VALUES (NEW.v); END")?;
        db.run("CREATE TRIGGER tb AFTER INSERT ON b BEGIN INSERT INTO a VALUES (99); END")?;
        db.run("INSERT INTO a VALUES (1)")?;
        assert_eq!(ints(&mut db, "SELECT v FROM a"), [1]);
        assert_eq!(ints(&mut db, "SELECT v FROM b"), [1]);
        Ok(())
    }

    #[test]
    fn analyze_is_idempotent() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT)")?;
        for i in 1..=20 {
            db.run(&format!("INSERT INTO t VALUES ({i})"))?;
        }
        db.run("ANALYZE t")?;
        let first = db.catalog().stats("t").unwrap().clone();
        db.run("ANALYZE t")?;
        let second = db.catalog().stats("t").unwrap().clone();
        assert_eq!(first.row_count, 20);
        assert_eq!(first, second);
        assert_eq!(first.columns[0].min, Some(Value::int_width(1, micadb_types::IntWidth::I32)));
        assert_eq!(first.columns[0].distinct_count, 20);
        assert_eq!(first.columns[0].histogram.len(), 4);
        Ok(())
    }

    #[test]
    fn incremental_row_count_tracks_dml() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (v INT); INSERT INTO t VALUES (1), (2)")?;
        db.run("ANALYZE t")?;
        assert_eq!(db.catalog().stats("t").unwrap().row_count, 2);
        db.run("INSERT INTO t VALUES (3)")?;
        db.run("DELETE FROM t WHERE v = 1")?;
        assert_eq!(db.catalog().stats("t").unwrap().row_count, 2);
        db.run("INSERT INTO t VALUES (4)")?;
        assert_eq!(db.catalog().stats("t").unwrap().row_count, 3);
        Ok(())
    }

    #[test]
    fn analyze_without_table_covers_all() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE a (v INT); CREATE TABLE b (v INT); INSERT INTO a VALUES (1)")?;
        db.run("ANALYZE")?;
        assert_eq!(db.catalog().stats("a").unwrap().row_count, 1);
        assert_eq!(db.catalog().stats("b").unwrap().row_count, 0);
        Ok(())
    }

    #[test]
    fn explain_bytecode_shape() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (v INT); INSERT INTO t VALUES (1)")?;
        let result = db.run("EXPLAIN SELECT v FROM t")?;
        assert_eq!(
            result.columns,
            ["addr", "opcode", "p1", "p2", "p3", "p4", "p5", "comment"]
        );
        let opcodes: Vec<String> = result.rows.iter().map(|r| r[1].to_string()).collect();
        assert_eq!(opcodes.first().map(String::as_str), Some("Init"));
        assert_eq!(opcodes.last().map(String::as_str), Some("Halt"));
        assert!(opcodes.iter().any(|o| o == "OpenRead"));
        Ok(())
    }

    #[test]
    fn explain_falls_back_to_query_plan() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        // Joins are outside the bytecode surface.
        let result = db.run("EXPLAIN SELECT users.name FROM users JOIN orders ON users.id = orders.user_id")?;
        assert_eq!(result.columns, ["id", "parent", "notused", "detail"]);
        Ok(())
    }

    #[test]
    fn explain_query_plan_elides_projection() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let result = db.run(
            "EXPLAIN QUERY PLAN SELECT users.name FROM users JOIN orders ON users.id = orders.user_id ORDER BY users.name",
        )?;
        let details: Vec<String> = result.rows.iter().map(|r| r[3].to_string()).collect();
        assert!(details.iter().any(|d| d.contains("JOIN")), "{details:?}");
        assert!(details.iter().any(|d| d.contains("SORT")), "{details:?}");
        assert!(details.iter().all(|d| !d.contains("PROJECT")), "{details:?}");
        Ok(())
    }

    #[test]
    fn explain_query_plan_uses_index_for_equality() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (id INT PRIMARY KEY, v INT)")?;
        let result = db.run("EXPLAIN QUERY PLAN SELECT v FROM t WHERE id = 5")?;
        let details: Vec<String> = result.rows.iter().map(|r| r[3].to_string()).collect();
        assert!(
            details.iter().any(|d| d.contains("USING INDEX")),
            "{details:?}"
        );
        Ok(())
    }

    #[test]
    fn vector_search_end_to_end() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE docs (id INT PRIMARY KEY, embedding VECTOR(3))")?;
        db.run_sql(
            "INSERT INTO docs VALUES (1, '[1, 0, 0]'); \
             INSERT INTO docs VALUES (2, '[0, 1, 0]'); \
             INSERT INTO docs VALUES (3, '[0, 0, 1]')",
        )?;
        db.run("CREATE INDEX idx_vec ON docs USING HNSW (embedding)")?;
        let result = db.run(
            "SELECT rowid, distance FROM vector_quantize_scan(docs, embedding, '[1, 0, 0]', 2)",
        )?;
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][0].as_int(), Some(1));
        let d0 = result.rows[0][1].as_float().unwrap();
        let d1 = result.rows[1][1].as_float().unwrap();
        assert!(d0 <= d1);
        assert!(d0 < 1e-6);
        Ok(())
    }

    #[test]
    fn vector_search_without_index_errors() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE docs (id INT PRIMARY KEY, embedding VECTOR(2))")?;
        let err = db
            .run("SELECT rowid FROM vector_quantize_scan(docs, embedding, '[1, 0]', 1)")
            .unwrap_err();
        assert!(err.to_string().contains("HNSW"), "{err}");
        Ok(())
    }

    #[test]
    fn vector_dimension_enforced() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE docs (embedding VECTOR(3))")?;
        assert!(db.run("INSERT INTO docs VALUES ('[1, 2]')").is_err());
        db.run("INSERT INTO docs VALUES ('[3, 0, 4]')")?;
        // Stored vectors are unit-normalized by default.
        let Value::Vector(v) = rows(&mut db, "SELECT embedding FROM docs")[0][0].clone() else {
            panic!("not a vector");
        };
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn partial_index_skips_filtered_rows() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT, tag TEXT)")?;
        db.run("CREATE UNIQUE INDEX idx_tagged ON t (v) WHERE tag = 'keep'")?;
        db.run("INSERT INTO t VALUES (1, 'keep')")?;
        // Same v, but outside the predicate: no conflict.
        db.run("INSERT INTO t VALUES (1, 'drop')")?;
        let err = db.run("INSERT INTO t VALUES (1, 'keep')").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"), "{err}");
        Ok(())
    }

    #[test]
    fn unique_survives_update_of_other_columns() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE t (email TEXT, hits INT); \
             CREATE UNIQUE INDEX idx_mail ON t (email); \
             INSERT INTO t VALUES ('a@x', 0)",
        )?;
        // The row may be rewritten under the same unique key.
        db.run("UPDATE t SET hits = hits + 1")?;
        db.run("UPDATE t SET hits = hits + 1")?;
        assert_eq!(ints(&mut db, "SELECT hits FROM t"), [2]);
        let err = db.run("INSERT INTO t VALUES ('a@x', 0)").unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"), "{err}");
        Ok(())
    }

    #[test]
    fn index_entries_follow_update_and_delete() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE t (email TEXT); \
             CREATE UNIQUE INDEX idx_mail ON t (email); \
             INSERT INTO t VALUES ('old@x')",
        )?;
        db.run("UPDATE t SET email = 'new@x'")?;
        // The old key is free again, the new one is taken.
        db.run("INSERT INTO t VALUES ('old@x')")?;
        assert!(db.run("INSERT INTO t VALUES ('new@x')").is_err());
        db.run("DELETE FROM t WHERE email = 'new@x'")?;
        db.run("INSERT INTO t VALUES ('new@x')")?;
        Ok(())
    }

    #[test]
    fn alter_table_operations() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (id INT PRIMARY KEY, name TEXT); INSERT INTO t VALUES (1, 'a')")?;

        db.run("ALTER TABLE t ADD COLUMN score INT DEFAULT 7")?;
        assert_eq!(ints(&mut db, "SELECT score FROM t"), [7]);

        db.run("ALTER TABLE t RENAME COLUMN score TO points")?;
        assert_eq!(ints(&mut db, "SELECT points FROM t"), [7]);

        db.run("ALTER TABLE t DROP COLUMN points")?;
        assert!(db.run("SELECT points FROM t").is_err());

        db.run("ALTER TABLE t RENAME TO renamed")?;
        assert_eq!(texts(&mut db, "SELECT name FROM renamed"), ["a"]);
        assert!(db.run("SELECT * FROM t").is_err());

        // The primary key cannot be dropped.
        assert!(db.run("ALTER TABLE renamed DROP COLUMN id").is_err());
        Ok(())
    }

    #[test]
    fn ddl_name_collisions() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (v INT)")?;
        assert!(db.run("CREATE TABLE t (v INT)").is_err());
        db.run("CREATE TABLE IF NOT EXISTS t (v INT)")?;
        db.run("DROP TABLE t")?;
        assert!(db.run("DROP TABLE t").is_err());
        db.run("DROP TABLE IF EXISTS t")?;
        assert!(db.run("SELECT * FROM t").is_err());
        Ok(())
    }

    #[test]
    fn dropping_table_drops_its_indexes_and_triggers() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql(
            "CREATE TABLE t (v INT); \
             CREATE UNIQUE INDEX idx_v ON t (v); \
             CREATE TRIGGER tt BEFORE INSERT ON t BEGIN RAISE(IGNORE) END",
        )?;
        db.run("DROP TABLE t")?;
        assert!(db.catalog().index("idx_v").is_none());
        assert!(db.catalog().trigger("tt").is_none());
        // The names are free for reuse.
        db.run("CREATE TABLE t (v INT)")?;
        db.run("CREATE UNIQUE INDEX idx_v ON t (v)")?;
        Ok(())
    }

    #[test]
    fn json_columns_round_trip() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run("CREATE TABLE t (j JSON)")?;
        db.run(r#"INSERT INTO t VALUES ('{"a": [1, 2]}')"#)?;
        let v = rows(&mut db, "SELECT j FROM t")[0][0].clone();
        assert!(matches!(v, Value::Json(_)), "{v:?}");
        Ok(())
    }

    #[test]
    fn expressions_in_projection_get_canonical_names() -> ResultTest<()> {
        let mut db = make_test_db();
        seed_users_orders(&mut db);
        let result = db.run("SELECT COUNT(*) FROM orders")?;
        assert_eq!(result.columns, ["COUNT(*)"]);
        let result = db.run("SELECT amount * 2 AS double_amount FROM orders WHERE id = 101")?;
        assert_eq!(result.columns, ["double_amount"]);
        assert_eq!(result.rows[0][0].as_int(), Some(100));
        Ok(())
    }

    #[test]
    fn query_cache_serves_and_invalidates() -> ResultTest<()> {
        let mut db = make_test_db();
        db.run_sql("CREATE TABLE t (v INT); INSERT INTO t VALUES (1)")?;
        assert_eq!(ints(&mut db, "SELECT v FROM t"), [1]);
        // Cached result still correct…
        assert_eq!(ints(&mut db, "SELECT v FROM t"), [1]);
        // …and invalidated by DML on the table.
        db.run("INSERT INTO t VALUES (2)")?;
        assert_eq!(ints(&mut db, "SELECT v FROM t ORDER BY v"), [1, 2]);
        assert_eq!(ints(&mut db, "SELECT v FROM t"), ints(&mut db, "SELECT v FROM t"));
        Ok(())
    }

    #[test]
    fn database_persists_across_reopen() -> ResultTest<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("test.mica");
        let options = DatabaseOptions {
            path: Some(path.clone()),
            query_cache_capacity: None,
            histogram_buckets: 0,
        };
        {
            let mut db = Database::open(options.clone())?;
            db.run_sql(
                "CREATE TABLE notes (id SERIAL PRIMARY KEY, body VARCHAR(100)); \
                 INSERT INTO notes (body) VALUES ('first'); \
                 INSERT INTO notes (body) VALUES ('second')",
            )?;
            db.close()?;
        }
        let mut db = Database::open(options)?;
        assert_eq!(texts(&mut db, "SELECT body FROM notes"), ["first", "second"]);
        // Counters survived: the next id continues the sequence.
        db.run("INSERT INTO notes (body) VALUES ('third')")?;
        assert_eq!(ints(&mut db, "SELECT id FROM notes"), [1, 2, 3]);
        // So did the unique index.
        assert!(db.run("INSERT INTO notes (id, body) VALUES (2, 'dup')").is_err());
        Ok(())
    }

    #[test]
    fn multi_statement_results() -> ResultTest<()> {
        let mut db = make_test_db();
        let results = db.run_sql("CREATE TABLE t (v INT); INSERT INTO t VALUES (1), (2); SELECT v FROM t")?;
        assert_eq!(results.len(), 3);
        assert_eq!(results[1].rows_affected, 2);
        assert_eq!(results[2].rows.len(), 2);
        Ok(())
    }

    #[test]
    fn unsupported_statement_errors() {
        let mut db = make_test_db();
        let err = db.run("SHOW TABLES").unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("unsupported statement") || msg.contains("SqlParser"),
            "{msg}"
        );
    }
}
