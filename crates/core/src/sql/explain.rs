//! EXPLAIN surfaces.
//!
//! `EXPLAIN stmt` renders a fixed 8-column bytecode listing (`addr, opcode,
//! p1, p2, p3, p4, p5, comment`) for the statements the bytecode compiler
//! covers; anything it cannot compile falls back to `EXPLAIN QUERY PLAN`.
//! `EXPLAIN QUERY PLAN` walks the optimizer's plan tree into the 4-column
//! shape (`id, parent, notused, detail`); projection nodes are elided.

use crate::db::database::Database;
use crate::db::schema::IndexKind;
use crate::error::{DBError, PlanError};
use crate::plan::{build_select_plan, optimize, PlanContext, PlanNode};
use crate::sql::ast::{BinOp, Expr, JoinKind, Query, QueryBody, Statement};
use crate::sql::execute::StmtResult;
use itertools::Itertools;
use micadb_types::{Row, Value};

pub(crate) fn explain(db: &mut Database, stmt: &Statement, query_plan: bool) -> Result<StmtResult, DBError> {
    if query_plan {
        return explain_query_plan(db, stmt);
    }
    match compile_bytecode(db, stmt) {
        Ok(rows) => Ok(StmtResult {
            columns: ["addr", "opcode", "p1", "p2", "p3", "p4", "p5", "comment"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rows,
            rows_affected: 0,
        }),
        Err(e) => {
            log::debug!("bytecode compile failed, falling back to query plan: {e}");
            explain_query_plan(db, stmt)
        }
    }
}

// --- EXPLAIN QUERY PLAN -----------------------------------------------------

fn explain_query_plan(db: &mut Database, stmt: &Statement) -> Result<StmtResult, DBError> {
    let mut rows = Vec::new();
    match stmt {
        Statement::Query(query) => {
            let mut next_id = 1i64;
            plan_rows_for_query(db, query, 0, &mut next_id, &mut rows)?;
        }
        other => rows.push(plan_row(1, 0, statement_detail(other))),
    }
    Ok(StmtResult {
        columns: ["id", "parent", "notused", "detail"].iter().map(|s| s.to_string()).collect(),
        rows,
        rows_affected: 0,
    })
}

fn statement_detail(stmt: &Statement) -> String {
    match stmt {
        Statement::Insert(i) => format!("INSERT INTO {}", i.table),
        Statement::Update(u) => format!("UPDATE {}", u.table),
        Statement::Delete(d) => format!("DELETE FROM {}", d.table),
        Statement::CreateTable(ct) => format!("CREATE TABLE {}", ct.name),
        Statement::CreateIndex(ci) => format!("CREATE INDEX {}", ci.name),
        Statement::Analyze { table: Some(t) } => format!("ANALYZE {t}"),
        Statement::Analyze { table: None } => "ANALYZE".to_string(),
        _ => "STATEMENT".to_string(),
    }
}

fn plan_row(id: i64, parent: i64, detail: String) -> Row {
    vec![Value::int(id), Value::int(parent), Value::int(0), Value::text(detail)]
}

fn plan_rows_for_query(
    db: &mut Database,
    query: &Query,
    parent: i64,
    next_id: &mut i64,
    out: &mut Vec<Row>,
) -> Result<(), DBError> {
    plan_rows_for_body(db, query, &query.body, parent, next_id, out)
}

fn plan_rows_for_body(
    db: &mut Database,
    query: &Query,
    body: &QueryBody,
    parent: i64,
    next_id: &mut i64,
    out: &mut Vec<Row>,
) -> Result<(), DBError> {
    match body {
        QueryBody::Select(select) => {
            let ctx = PlanContext {
                catalog: db.catalog(),
                ctes: query
                    .ctes
                    .iter()
                    .map(|c| (c.name.clone(), c.columns.clone().unwrap_or_default()))
                    .collect(),
            };
            let plan = optimize(build_select_plan(
                select,
                &query.order_by,
                query.limit.as_ref(),
                query.offset.as_ref(),
                &ctx,
            )?);
            let plan = annotate_index_scans(db, plan);
            plan_node_rows(&plan, parent, next_id, out);
            Ok(())
        }
        QueryBody::SetOp { op, all, left, right } => {
            let id = *next_id;
            *next_id += 1;
            let name = format!(
                "COMPOUND ({}{})",
                match op {
                    crate::sql::ast::SetOp::Union => "UNION",
                    crate::sql::ast::SetOp::Intersect => "INTERSECT",
                    crate::sql::ast::SetOp::Except => "EXCEPT",
                },
                if *all { " ALL" } else { "" }
            );
            out.push(plan_row(id, parent, name));
            plan_rows_for_body(db, query, left, id, next_id, out)?;
            plan_rows_for_body(db, query, right, id, next_id, out)
        }
    }
}

/// The one EXPLAIN-only rewrite: a filter that is a pure equality on the
/// leading column of a B-tree index renders its scan as an index search.
fn annotate_index_scans(db: &Database, plan: PlanNode) -> PlanNode {
    match plan {
        PlanNode::Filter { input, predicate } => {
            if let PlanNode::TableScan { table, alias } = &*input {
                if let Some(index) = equality_index(db, table, &predicate) {
                    return PlanNode::Filter {
                        input: Box::new(PlanNode::IndexScan {
                            table: table.clone(),
                            alias: alias.clone(),
                            index,
                        }),
                        predicate,
                    };
                }
            }
            PlanNode::Filter {
                input: Box::new(annotate_index_scans(db, *input)),
                predicate,
            }
        }
        PlanNode::Projection { input, items, distinct } => PlanNode::Projection {
            input: Box::new(annotate_index_scans(db, *input)),
            items,
            distinct,
        },
        PlanNode::Window { input, items } => PlanNode::Window {
            input: Box::new(annotate_index_scans(db, *input)),
            items,
        },
        PlanNode::Aggregate {
            input,
            group_by,
            aggregates,
            having,
        } => PlanNode::Aggregate {
            input: Box::new(annotate_index_scans(db, *input)),
            group_by,
            aggregates,
            having,
        },
        PlanNode::Sort { input, order_by } => PlanNode::Sort {
            input: Box::new(annotate_index_scans(db, *input)),
            order_by,
        },
        PlanNode::Limit { input, limit, offset } => PlanNode::Limit {
            input: Box::new(annotate_index_scans(db, *input)),
            limit,
            offset,
        },
        PlanNode::NestedLoopJoin { left, right, kind, on } => PlanNode::NestedLoopJoin {
            left: Box::new(annotate_index_scans(db, *left)),
            right: Box::new(annotate_index_scans(db, *right)),
            kind,
            on,
        },
        PlanNode::HashJoin { left, right, keys } => PlanNode::HashJoin {
            left: Box::new(annotate_index_scans(db, *left)),
            right: Box::new(annotate_index_scans(db, *right)),
            keys,
        },
        leaf => leaf,
    }
}

fn equality_index(db: &Database, table: &str, predicate: &Expr) -> Option<String> {
    let Expr::Binary {
        op: BinOp::Eq,
        left,
        right,
    } = predicate
    else {
        return None;
    };
    let column = match (&**left, &**right) {
        (Expr::Column { name, .. }, Expr::Literal(_)) => name,
        (Expr::Literal(_), Expr::Column { name, .. }) => name,
        _ => return None,
    };
    db.catalog()
        .indexes_for_table(table)
        .into_iter()
        .find(|d| {
            d.kind == IndexKind::BTree
                && d.predicate.is_none()
                && d.columns.first().map(|c| c.eq_ignore_ascii_case(column)).unwrap_or(false)
        })
        .map(|d| d.name)
}

fn plan_node_rows(plan: &PlanNode, parent: i64, next_id: &mut i64, out: &mut Vec<Row>) {
    fn emit(out: &mut Vec<Row>, next_id: &mut i64, parent: i64, detail: String) -> i64 {
        let id = *next_id;
        *next_id += 1;
        out.push(plan_row(id, parent, detail));
        id
    }
    match plan {
        // Projections are elided from the rendering.
        PlanNode::Projection { input, .. } => plan_node_rows(input, parent, next_id, out),
        PlanNode::TableScan { table, .. } => {
            emit(out, next_id, parent, format!("SCAN TABLE {table}"));
        }
        PlanNode::IndexScan { table, index, .. } => {
            emit(out, next_id, parent, format!("SEARCH TABLE {table} USING INDEX {index}"));
        }
        PlanNode::CteScan { name, .. } => {
            emit(out, next_id, parent, format!("SCAN CTE {name}"));
        }
        PlanNode::SubqueryScan { alias, .. } => {
            emit(out, next_id, parent, format!("SCAN SUBQUERY {alias}"));
        }
        PlanNode::TableFunction { name, .. } => {
            emit(out, next_id, parent, format!("SCAN TABLE FUNCTION {name}"));
        }
        PlanNode::Dual => {
            emit(out, next_id, parent, "SCAN CONSTANT ROW".to_string());
        }
        PlanNode::Filter { input, predicate } => {
            let id = emit(out, next_id, parent, format!("FILTER {predicate}"));
            plan_node_rows(input, id, next_id, out);
        }
        PlanNode::Window { input, .. } => {
            let id = emit(out, next_id, parent, "WINDOW".to_string());
            plan_node_rows(input, id, next_id, out);
        }
        PlanNode::Aggregate { input, group_by, .. } => {
            let detail = if group_by.is_empty() {
                "AGGREGATE".to_string()
            } else {
                format!(
                    "AGGREGATE GROUP BY {}",
                    group_by.iter().map(|g| g.to_string()).join(", ")
                )
            };
            let id = emit(out, next_id, parent, detail);
            plan_node_rows(input, id, next_id, out);
        }
        PlanNode::NestedLoopJoin { left, right, kind, .. } => {
            let kind = match kind {
                JoinKind::Inner => "INNER",
                JoinKind::Left => "LEFT",
                JoinKind::Right => "RIGHT",
                JoinKind::Full => "FULL",
                JoinKind::Cross => "CROSS",
            };
            let id = emit(out, next_id, parent, format!("NESTED LOOP JOIN ({kind})"));
            plan_node_rows(left, id, next_id, out);
            plan_node_rows(right, id, next_id, out);
        }
        PlanNode::HashJoin { left, right, .. } => {
            let id = emit(out, next_id, parent, "HASH JOIN".to_string());
            plan_node_rows(left, id, next_id, out);
            plan_node_rows(right, id, next_id, out);
        }
        PlanNode::Sort { input, order_by } => {
            let keys = order_by
                .iter()
                .map(|o| format!("{}{}", o.expr, if o.desc { " DESC" } else { "" }))
                .join(", ");
            let id = emit(out, next_id, parent, format!("SORT BY {keys}"));
            plan_node_rows(input, id, next_id, out);
        }
        PlanNode::Limit { input, .. } => {
            let id = emit(out, next_id, parent, "LIMIT".to_string());
            plan_node_rows(input, id, next_id, out);
        }
    }
}

// --- EXPLAIN bytecode -------------------------------------------------------

struct Program {
    rows: Vec<Row>,
}

impl Program {
    fn new() -> Self {
        Program { rows: Vec::new() }
    }

    fn op(&mut self, opcode: &str, p1: i64, p2: i64, p3: i64, p4: &str, comment: &str) -> usize {
        let addr = self.rows.len();
        self.rows.push(vec![
            Value::int(addr as i64),
            Value::text(opcode),
            Value::int(p1),
            Value::int(p2),
            Value::int(p3),
            Value::text(p4),
            Value::int(0),
            Value::text(comment),
        ]);
        addr
    }

    fn patch_p2(&mut self, addr: usize, p2: i64) {
        self.rows[addr][3] = Value::int(p2);
    }
}

/// Compile the statements the bytecode renderer understands: a plain
/// single-table SELECT (optional filter, optional limit). Everything else
/// errors, which sends the caller to the query-plan fallback.
fn compile_bytecode(db: &mut Database, stmt: &Statement) -> Result<Vec<Row>, DBError> {
    let Statement::Query(query) = stmt else {
        return Err(unsupported("non-query bytecode"));
    };
    if !query.ctes.is_empty() || !query.order_by.is_empty() {
        return Err(unsupported("compound query bytecode"));
    }
    let QueryBody::Select(select) = &query.body else {
        return Err(unsupported("set operation bytecode"));
    };

    let ctx = PlanContext {
        catalog: db.catalog(),
        ctes: Vec::new(),
    };
    let plan = optimize(build_select_plan(
        select,
        &[],
        query.limit.as_ref(),
        query.offset.as_ref(),
        &ctx,
    )?);

    // Accept Projection over (Limit over)? (Filter over)? TableScan.
    let PlanNode::Projection { input, items, .. } = plan else {
        return Err(unsupported("plan shape"));
    };
    let mut node = *input;
    let mut limit = None;
    if let PlanNode::Limit { input, limit: l, .. } = node {
        limit = l.as_ref().and_then(Expr::literal_int);
        node = *input;
    }
    let mut filter = None;
    if let PlanNode::Filter { input, predicate } = node {
        filter = Some(predicate);
        node = *input;
    }
    let PlanNode::TableScan { table, .. } = node else {
        return Err(unsupported("plan shape"));
    };
    let schema = db.catalog().require_table(&table)?;
    let root = schema.root_page as i64;
    let ncols = schema.columns.len() as i64;

    let mut prog = Program::new();
    let init = prog.op("Init", 0, 0, 0, "", "Start at next address");
    prog.op("OpenRead", 0, root, ncols, &table, &format!("root={root}; {table}"));
    let rewind = prog.op("Rewind", 0, 0, 0, "", "");
    let loop_top = prog.rows.len();
    if let Some(predicate) = &filter {
        prog.op("Filter", 0, 0, 0, &predicate.to_string(), "skip row unless true");
    }
    for (i, item) in items.iter().enumerate() {
        prog.op("Column", 0, i as i64, i as i64 + 1, &item.name, "");
    }
    prog.op("ResultRow", 1, items.len() as i64, 0, "", "output one row");
    if let Some(limit) = limit {
        prog.op("DecrJumpZero", 0, 0, limit, "", "stop at LIMIT");
    }
    prog.op("Next", 0, loop_top as i64, 0, "", "");
    let halt = prog.op("Halt", 0, 0, 0, "", "");
    prog.patch_p2(init, 1);
    prog.patch_p2(rewind, halt as i64);
    Ok(prog.rows)
}

fn unsupported(what: &str) -> DBError {
    PlanError::Unsupported {
        feature: what.to_string(),
    }
    .into()
}
