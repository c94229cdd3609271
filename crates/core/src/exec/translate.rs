//! Plan → iterator translation.
//!
//! Walks the optimizer's plan bottom-up, building the operator tree and
//! computing the emitted column names alongside. Children are owned by their
//! parents, so every iterator outlives its input and `close` is reachable
//! from the root on all exit paths.

use crate::db::coerce::parse_vector_text;
use crate::db::database::Database;
use crate::db::schema::ColumnType;
use crate::error::{DBError, PlanError, RuntimeError};
use crate::exec::aggregate::AggregateIter;
use crate::exec::eval::{eval, resolve_column, Env};
use crate::exec::join::{HashJoinIter, NestedLoopJoinIter};
use crate::exec::scan::{DualIter, SliceIter, TableScanIter};
use crate::exec::transform::{FilterIter, LimitIter, ProjectIter, SortIter};
use crate::exec::window::WindowIter;
use crate::exec::BoxIter;
use crate::plan::{PlanNode, ProjItem};
use crate::sql::ast::Expr;
use micadb_types::{Row, Value};
use std::rc::Rc;

/// Materialized CTE data, shared by every scan of the same name.
#[derive(Debug)]
pub struct CteData {
    /// Short column names.
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// CTEs in scope during translation, innermost last.
#[derive(Default, Clone)]
pub struct CteEnv {
    entries: Vec<(String, Rc<CteData>)>,
}

impl CteEnv {
    pub fn push(&mut self, name: String, data: Rc<CteData>) {
        self.entries.push((name, data));
    }

    pub fn lookup(&self, name: &str) -> Option<&Rc<CteData>> {
        self.entries
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, d)| d)
    }

    pub fn names_and_columns(&self) -> Vec<(String, Vec<String>)> {
        self.entries
            .iter()
            .map(|(n, d)| (n.clone(), d.columns.clone()))
            .collect()
    }
}

pub struct Translated {
    pub iter: BoxIter,
    pub columns: Vec<String>,
}

#[tracing::instrument(skip_all)]
pub fn translate(db: &mut Database, ctes: &CteEnv, plan: &PlanNode) -> Result<Translated, DBError> {
    match plan {
        PlanNode::TableScan { table, alias } | PlanNode::IndexScan { table, alias, .. } => {
            table_scan(db, table, alias.as_deref())
        }
        PlanNode::CteScan { name, alias } => {
            let data = ctes
                .lookup(name)
                .ok_or_else(|| RuntimeError::UnknownCte(name.clone()))?;
            let qualifier = alias.clone().unwrap_or_else(|| name.clone());
            let columns = data.columns.iter().map(|c| format!("{qualifier}.{c}")).collect();
            Ok(Translated {
                iter: Box::new(SliceIter::new(data.rows.clone())),
                columns,
            })
        }
        PlanNode::SubqueryScan {
            query,
            alias,
            columns,
        } => {
            // Sub-plans are materialized through the dispatcher, which
            // handles their own CTEs and set operations.
            let result = crate::sql::execute::run_query(db, query, ctes.clone())?;
            let shorts: Vec<String> = match columns {
                Some(declared) => declared.clone(),
                None => result.columns.iter().map(|c| short_name(c)).collect(),
            };
            Ok(Translated {
                iter: Box::new(SliceIter::new(result.rows)),
                columns: shorts.iter().map(|c| format!("{alias}.{c}")).collect(),
            })
        }
        PlanNode::TableFunction { name, args } => table_function(db, name, args),
        PlanNode::Dual => Ok(Translated {
            iter: Box::new(DualIter::new()),
            columns: Vec::new(),
        }),
        PlanNode::Filter { input, predicate } => {
            let child = translate(db, ctes, input)?;
            Ok(Translated {
                iter: Box::new(FilterIter::new(child.iter, child.columns.clone(), predicate.clone())),
                columns: child.columns,
            })
        }
        PlanNode::Projection {
            input,
            items,
            distinct,
        } => {
            let child = translate(db, ctes, input)?;
            let columns = items.iter().map(|i| i.name.clone()).collect();
            Ok(Translated {
                iter: Box::new(ProjectIter::new(
                    child.iter,
                    child.columns,
                    items.clone(),
                    *distinct,
                )),
                columns,
            })
        }
        PlanNode::Window { input, items } => {
            let child = translate(db, ctes, input)?;
            let columns = items.iter().map(|i| i.name.clone()).collect();
            Ok(Translated {
                iter: Box::new(WindowIter::new(child.iter, child.columns, items.clone())),
                columns,
            })
        }
        PlanNode::Aggregate {
            input,
            group_by,
            aggregates,
            having,
        } => {
            let child = translate(db, ctes, input)?;
            let mut columns: Vec<String> = group_by.iter().map(|g| g.to_string()).collect();
            columns.extend(
                aggregates
                    .iter()
                    .map(|a| Expr::Function(a.clone()).to_string()),
            );
            Ok(Translated {
                iter: Box::new(AggregateIter::new(
                    child.iter,
                    child.columns,
                    group_by.clone(),
                    aggregates.clone(),
                    having.clone(),
                    columns.clone(),
                )),
                columns,
            })
        }
        PlanNode::NestedLoopJoin {
            left,
            right,
            kind,
            on,
        } => {
            let left = translate(db, ctes, left)?;
            let right = translate(db, ctes, right)?;
            let mut columns = left.columns.clone();
            columns.extend(right.columns.iter().cloned());
            Ok(Translated {
                iter: Box::new(NestedLoopJoinIter::new(
                    left.iter,
                    right.iter,
                    kind.clone(),
                    on.clone(),
                    columns.clone(),
                    left.columns.len(),
                    right.columns.len(),
                )),
                columns,
            })
        }
        PlanNode::HashJoin { left, right, keys } => {
            let left = translate(db, ctes, left)?;
            let right = translate(db, ctes, right)?;
            let mut columns = left.columns.clone();
            columns.extend(right.columns.iter().cloned());
            // The ON operands arrive unordered; resolve which one belongs to
            // the build side.
            let (a, b) = keys;
            let (left_key, right_key) = if resolves(a, &left.columns) {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            Ok(Translated {
                iter: Box::new(HashJoinIter::new(
                    left.iter,
                    right.iter,
                    left_key,
                    right_key,
                    left.columns,
                    right.columns,
                )),
                columns,
            })
        }
        PlanNode::Sort { input, order_by } => {
            let child = translate(db, ctes, input)?;
            Ok(Translated {
                iter: Box::new(SortIter::new(child.iter, child.columns.clone(), order_by.clone())),
                columns: child.columns,
            })
        }
        PlanNode::Limit {
            input,
            limit,
            offset,
        } => {
            let child = translate(db, ctes, input)?;
            let limit = match limit {
                Some(e) => literal_i64(e)?,
                None => -1,
            };
            let offset = match offset {
                Some(e) => literal_i64(e)?,
                None => 0,
            };
            Ok(Translated {
                iter: Box::new(LimitIter::new(child.iter, limit, offset)),
                columns: child.columns,
            })
        }
    }
}

/// LIMIT/OFFSET bounds must be integer literals by the time they reach the
/// translator.
fn literal_i64(e: &Expr) -> Result<i64, DBError> {
    e.literal_int().ok_or_else(|| RuntimeError::LimitNotLiteral.into())
}

fn resolves(e: &Expr, columns: &[String]) -> bool {
    match e {
        Expr::Column { table, name } => resolve_column(columns, table.as_deref(), name).is_some(),
        _ => false,
    }
}

fn short_name(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((_, short)) => short.to_string(),
        None => name.to_string(),
    }
}

fn table_scan(db: &mut Database, table: &str, alias: Option<&str>) -> Result<Translated, DBError> {
    let schema = db.catalog().require_table(table)?.clone();
    let tree = db.table_tree(table)?;
    let pager = db.pager();
    let cursor = tree.cursor(&pager.borrow())?;
    let qualifier = alias.unwrap_or(&schema.name).to_string();
    let columns = schema
        .columns
        .iter()
        .map(|c| format!("{qualifier}.{}", c.name))
        .collect();
    let json_cols = schema
        .columns
        .iter()
        .map(|c| matches!(c.ty, ColumnType::Json))
        .collect();
    Ok(Translated {
        iter: Box::new(TableScanIter::new(pager, cursor, json_cols)),
        columns,
    })
}

/// The one defined table function: `vector_quantize_scan(table, column,
/// query_vec, k)` probes the HNSW index and emits `(rowid, distance)` pairs
/// by ascending distance.
fn table_function(db: &mut Database, name: &str, args: &[Expr]) -> Result<Translated, DBError> {
    if !name.eq_ignore_ascii_case("vector_quantize_scan") {
        return Err(RuntimeError::UnknownTableFunction(name.to_string()).into());
    }
    let [table, column, query, k] = args else {
        return Err(PlanError::Unstructured(
            "vector_quantize_scan(table, column, query_vec, k) takes four arguments".into(),
        )
        .into());
    };

    let table = name_of(table)?;
    let column = name_of(column)?;
    let query = match eval(query, &Env::empty(None))? {
        Value::Vector(v) => v,
        Value::Text { v, .. } => parse_vector_text(&v).ok_or_else(|| PlanError::Unstructured(
            format!("`{v}` is not a vector literal"),
        ))?,
        other => {
            return Err(PlanError::Unstructured(format!(
                "query vector must be a vector, got {}",
                other.type_name()
            ))
            .into());
        }
    };
    let k = eval(k, &Env::empty(None))?
        .as_int()
        .filter(|k| *k >= 0)
        .ok_or_else(|| PlanError::Unstructured("k must be a non-negative integer".into()))?;

    let hits = db.vector_search(&table, &column, &query, k as usize)?;
    let rows = hits
        .into_iter()
        .map(|(rowid, dist)| vec![Value::int(rowid as i64), Value::Float(dist)])
        .collect();
    Ok(Translated {
        iter: Box::new(SliceIter::new(rows)),
        columns: vec!["rowid".to_string(), "distance".to_string()],
    })
}

/// Table/column arguments may arrive as identifiers or string literals.
fn name_of(e: &Expr) -> Result<String, DBError> {
    match e {
        Expr::Column { table: None, name } => Ok(name.clone()),
        Expr::Literal(Value::Text { v, .. }) => Ok(v.clone()),
        other => Err(PlanError::Unstructured(format!("expected a name, got {other}")).into()),
    }
}
