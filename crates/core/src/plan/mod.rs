//! Logical plan construction and rewrites: the "optimizer" collaborator.
//!
//! [`build_select_plan`] lowers one SELECT body into a [`PlanNode`] tree:
//! source → joins → filter → aggregate/window → sort → limit → projection,
//! with the projection last so sorts and filters still see unprojected
//! columns. [`optimize`] then applies the only rewrite this engine performs
//! itself: an inner nested-loop join over a pure column equality becomes a
//! hash join. Plan shapes are deliberately naive; correctness comes first.

use crate::db::catalog::Catalog;
use crate::error::{DBError, PlanError};
use crate::sql::ast::{
    BinOp, Expr, FunctionCall, JoinKind, OrderBy, Query, Select, SelectItem, TableRef,
};
use crate::sql::parser;

#[derive(Debug, Clone, PartialEq)]
pub struct ProjItem {
    pub expr: Expr,
    /// Emitted column name: alias, else short column name, else canonical
    /// expression text.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    TableScan {
        table: String,
        alias: Option<String>,
    },
    /// Produced only for EXPLAIN rendering; executes as a full scan.
    IndexScan {
        table: String,
        alias: Option<String>,
        index: String,
    },
    CteScan {
        name: String,
        alias: Option<String>,
    },
    /// A derived table, view body or other sub-query, materialized by the
    /// dispatcher and renamed under `alias`.
    SubqueryScan {
        query: Box<Query>,
        alias: String,
        /// Declared output names (views with column lists).
        columns: Option<Vec<String>>,
    },
    TableFunction {
        name: String,
        args: Vec<Expr>,
    },
    Dual,
    Filter {
        input: Box<PlanNode>,
        predicate: Expr,
    },
    Projection {
        input: Box<PlanNode>,
        items: Vec<ProjItem>,
        distinct: bool,
    },
    Window {
        input: Box<PlanNode>,
        items: Vec<ProjItem>,
    },
    Aggregate {
        input: Box<PlanNode>,
        group_by: Vec<Expr>,
        aggregates: Vec<FunctionCall>,
        /// Rewritten to reference the aggregate's own output columns.
        having: Option<Expr>,
    },
    NestedLoopJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        kind: JoinKind,
        on: Option<Expr>,
    },
    HashJoin {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        /// ON-clause equality operands; the translator resolves which side
        /// each belongs to.
        keys: (Expr, Expr),
    },
    Sort {
        input: Box<PlanNode>,
        order_by: Vec<OrderBy>,
    },
    Limit {
        input: Box<PlanNode>,
        limit: Option<Expr>,
        offset: Option<Expr>,
    },
}

pub struct PlanContext<'a> {
    pub catalog: &'a Catalog,
    /// CTEs visible to table references: `(name, output column names)`,
    /// innermost scope last.
    pub ctes: Vec<(String, Vec<String>)>,
}

impl PlanContext<'_> {
    fn cte(&self, name: &str) -> Option<&(String, Vec<String>)> {
        self.ctes.iter().rev().find(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Build the plan for one SELECT body plus its query-level ORDER BY, LIMIT
/// and OFFSET. Set operations are combined above this level by the
/// dispatcher.
pub fn build_select_plan(
    select: &Select,
    order_by: &[OrderBy],
    limit: Option<&Expr>,
    offset: Option<&Expr>,
    ctx: &PlanContext,
) -> Result<PlanNode, DBError> {
    let mut node = match &select.from {
        Some(from) => build_from(from, ctx)?,
        None => PlanNode::Dual,
    };
    if let Some(predicate) = &select.selection {
        node = PlanNode::Filter {
            input: Box::new(node),
            predicate: predicate.clone(),
        };
    }

    let items = expand_projection(select, ctx)?;
    let has_window = items.iter().any(|i| i.expr.contains_window());
    let has_aggregate = !select.group_by.is_empty()
        || items.iter().any(|i| i.expr.contains_aggregate())
        || select.having.as_ref().map(Expr::contains_aggregate).unwrap_or(false)
        || order_by.iter().any(|o| o.expr.contains_aggregate());

    let wrap_tail = |mut node: PlanNode, order_by: Vec<OrderBy>, items: Vec<ProjItem>| {
        if !order_by.is_empty() {
            node = PlanNode::Sort {
                input: Box::new(node),
                order_by,
            };
        }
        // DISTINCT deduplicates the projected rows, so the limit has to sit
        // above the projection in that case.
        if select.distinct {
            node = PlanNode::Projection {
                input: Box::new(node),
                items,
                distinct: true,
            };
            if limit.is_some() || offset.is_some() {
                node = PlanNode::Limit {
                    input: Box::new(node),
                    limit: limit.cloned(),
                    offset: offset.cloned(),
                };
            }
        } else {
            if limit.is_some() || offset.is_some() {
                node = PlanNode::Limit {
                    input: Box::new(node),
                    limit: limit.cloned(),
                    offset: offset.cloned(),
                };
            }
            node = PlanNode::Projection {
                input: Box::new(node),
                items,
                distinct: false,
            };
        }
        node
    };

    if has_aggregate {
        let mut aggregates = Vec::new();
        for item in &items {
            collect_aggregates(&item.expr, &mut aggregates);
        }
        if let Some(having) = &select.having {
            collect_aggregates(having, &mut aggregates);
        }
        for o in order_by {
            collect_aggregates(&o.expr, &mut aggregates);
        }

        let having = select
            .having
            .as_ref()
            .map(|h| rewrite_over_aggregate(h, &select.group_by, &aggregates));
        node = PlanNode::Aggregate {
            input: Box::new(node),
            group_by: select.group_by.clone(),
            aggregates: aggregates.clone(),
            having,
        };

        let order_by = order_by
            .iter()
            .map(|o| OrderBy {
                expr: rewrite_over_aggregate(&o.expr, &select.group_by, &aggregates),
                desc: o.desc,
            })
            .collect();
        let items = items
            .into_iter()
            .map(|i| ProjItem {
                expr: rewrite_over_aggregate(&i.expr, &select.group_by, &aggregates),
                name: i.name,
            })
            .collect();
        return Ok(wrap_tail(node, order_by, items));
    }

    if has_window {
        // The projection is replaced by the window operator, which emits the
        // final item values directly; anything above references them by name.
        let names: Vec<String> = items.iter().map(|i| i.name.clone()).collect();
        node = PlanNode::Window {
            input: Box::new(node),
            items,
        };
        if select.distinct {
            node = PlanNode::Projection {
                input: Box::new(node),
                items: passthrough(&names),
                distinct: true,
            };
        }
        if !order_by.is_empty() {
            node = PlanNode::Sort {
                input: Box::new(node),
                order_by: order_by.to_vec(),
            };
        }
        if limit.is_some() || offset.is_some() {
            node = PlanNode::Limit {
                input: Box::new(node),
                limit: limit.cloned(),
                offset: offset.cloned(),
            };
        }
        return Ok(node);
    }

    Ok(wrap_tail(node, order_by.to_vec(), items))
}

fn passthrough(names: &[String]) -> Vec<ProjItem> {
    names
        .iter()
        .map(|n| ProjItem {
            expr: Expr::Column {
                table: None,
                name: n.clone(),
            },
            name: n.clone(),
        })
        .collect()
}

/// Expand wildcards and name every projection item.
fn expand_projection(select: &Select, ctx: &PlanContext) -> Result<Vec<ProjItem>, DBError> {
    let mut items = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        match item {
            SelectItem::Expr { expr, alias } => {
                let name = match alias {
                    Some(a) => a.clone(),
                    None => match expr {
                        Expr::Column { name, .. } => name.clone(),
                        other => other.to_string(),
                    },
                };
                items.push(ProjItem {
                    expr: expr.clone(),
                    name,
                });
            }
            SelectItem::Wildcard => {
                for (qualifier, column) in visible_columns(select.from.as_ref(), ctx)? {
                    items.push(ProjItem {
                        expr: Expr::Column {
                            table: Some(qualifier),
                            name: column.clone(),
                        },
                        name: column,
                    });
                }
            }
            SelectItem::QualifiedWildcard(qualifier) => {
                let mut any = false;
                for (q, column) in visible_columns(select.from.as_ref(), ctx)? {
                    if q.eq_ignore_ascii_case(qualifier) {
                        any = true;
                        items.push(ProjItem {
                            expr: Expr::Column {
                                table: Some(q),
                                name: column.clone(),
                            },
                            name: column,
                        });
                    }
                }
                if !any {
                    return Err(PlanError::UnknownTable {
                        table: qualifier.clone(),
                    }
                    .into());
                }
            }
        }
    }
    Ok(items)
}

/// `(qualifier, column)` pairs a FROM clause puts in scope, left to right.
fn visible_columns(
    from: Option<&TableRef>,
    ctx: &PlanContext,
) -> Result<Vec<(String, String)>, DBError> {
    let mut out = Vec::new();
    let Some(from) = from else {
        return Ok(out);
    };
    collect_visible(from, ctx, &mut out)?;
    Ok(out)
}

fn collect_visible(
    tr: &TableRef,
    ctx: &PlanContext,
    out: &mut Vec<(String, String)>,
) -> Result<(), DBError> {
    match tr {
        TableRef::Table { name, alias } => {
            let qualifier = alias.clone().unwrap_or_else(|| name.clone());
            if let Some((_, columns)) = ctx.cte(name) {
                for c in columns {
                    out.push((qualifier.clone(), c.clone()));
                }
                return Ok(());
            }
            if let Some(view) = ctx.catalog.view(name) {
                let query = parser::parse_query_text(&view.sql)?;
                let names = match &view.columns {
                    Some(cols) => cols.clone(),
                    None => query_output_names(&query)?,
                };
                for n in names {
                    out.push((qualifier.clone(), n));
                }
                return Ok(());
            }
            let table = ctx.catalog.require_table(name)?;
            for c in &table.columns {
                out.push((qualifier.clone(), c.name.clone()));
            }
            Ok(())
        }
        TableRef::Derived { query, alias } => {
            for n in query_output_names(query)? {
                out.push((alias.clone(), n));
            }
            Ok(())
        }
        TableRef::Function { name, alias, .. } => {
            let qualifier = alias.clone().unwrap_or_else(|| name.clone());
            // The only table function emits (rowid, distance).
            out.push((qualifier.clone(), "rowid".to_string()));
            out.push((qualifier, "distance".to_string()));
            Ok(())
        }
        TableRef::Join { left, right, .. } => {
            collect_visible(left, ctx, out)?;
            collect_visible(right, ctx, out)
        }
    }
}

/// Output column names of a query, without running it (wildcard-free
/// projections only; used for derived tables and views).
fn query_output_names(query: &Query) -> Result<Vec<String>, DBError> {
    use crate::sql::ast::QueryBody;
    let mut body = &query.body;
    loop {
        match body {
            QueryBody::Select(select) => {
                let mut names = Vec::with_capacity(select.projection.len());
                for item in &select.projection {
                    match item {
                        SelectItem::Expr { expr, alias } => names.push(match alias {
                            Some(a) => a.clone(),
                            None => match expr {
                                Expr::Column { name, .. } => name.clone(),
                                other => other.to_string(),
                            },
                        }),
                        _ => {
                            return Err(PlanError::Unsupported {
                                feature: "wildcard projection inside a derived table".into(),
                            }
                            .into());
                        }
                    }
                }
                return Ok(names);
            }
            QueryBody::SetOp { left, .. } => body = left,
        }
    }
}

fn build_from(tr: &TableRef, ctx: &PlanContext) -> Result<PlanNode, DBError> {
    match tr {
        TableRef::Table { name, alias } => {
            if ctx.cte(name).is_some() {
                return Ok(PlanNode::CteScan {
                    name: name.clone(),
                    alias: alias.clone(),
                });
            }
            if let Some(view) = ctx.catalog.view(name) {
                return Ok(PlanNode::SubqueryScan {
                    query: Box::new(parser::parse_query_text(&view.sql)?),
                    alias: alias.clone().unwrap_or_else(|| name.clone()),
                    columns: view.columns.clone(),
                });
            }
            ctx.catalog.require_table(name)?;
            Ok(PlanNode::TableScan {
                table: name.clone(),
                alias: alias.clone(),
            })
        }
        TableRef::Derived { query, alias } => Ok(PlanNode::SubqueryScan {
            query: query.clone(),
            alias: alias.clone(),
            columns: None,
        }),
        TableRef::Function { name, args, .. } => Ok(PlanNode::TableFunction {
            name: name.clone(),
            args: args.clone(),
        }),
        TableRef::Join {
            left,
            right,
            kind,
            on,
        } => Ok(PlanNode::NestedLoopJoin {
            left: Box::new(build_from(left, ctx)?),
            right: Box::new(build_from(right, ctx)?),
            kind: kind.clone(),
            on: on.clone(),
        }),
    }
}

fn collect_aggregates(expr: &Expr, out: &mut Vec<FunctionCall>) {
    expr.walk(&mut |e| {
        if let Expr::Function(f) = e {
            if f.is_aggregate() && !out.contains(f) {
                out.push(f.clone());
            }
        }
    });
}

/// Rewrite an expression to run over an aggregate's output row: group-by
/// expressions and aggregate calls become column references to the names the
/// aggregate emits.
fn rewrite_over_aggregate(expr: &Expr, group_by: &[Expr], aggregates: &[FunctionCall]) -> Expr {
    if let Some(g) = group_by.iter().find(|g| *g == expr) {
        return Expr::Column {
            table: None,
            name: g.to_string(),
        };
    }
    if let Expr::Function(f) = expr {
        if aggregates.contains(f) {
            return Expr::Column {
                table: None,
                name: expr.to_string(),
            };
        }
    }
    match expr {
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(rewrite_over_aggregate(left, group_by, aggregates)),
            right: Box::new(rewrite_over_aggregate(right, group_by, aggregates)),
        },
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(rewrite_over_aggregate(expr, group_by, aggregates)),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(rewrite_over_aggregate(expr, group_by, aggregates)),
            negated: *negated,
        },
        Expr::Case {
            operand,
            branches,
            else_expr,
        } => Expr::Case {
            operand: operand
                .as_ref()
                .map(|o| Box::new(rewrite_over_aggregate(o, group_by, aggregates))),
            branches: branches
                .iter()
                .map(|(w, t)| {
                    (
                        rewrite_over_aggregate(w, group_by, aggregates),
                        rewrite_over_aggregate(t, group_by, aggregates),
                    )
                })
                .collect(),
            else_expr: else_expr
                .as_ref()
                .map(|e| Box::new(rewrite_over_aggregate(e, group_by, aggregates))),
        },
        Expr::Function(f) => Expr::Function(FunctionCall {
            name: f.name.clone(),
            args: f
                .args
                .iter()
                .map(|a| rewrite_over_aggregate(a, group_by, aggregates))
                .collect(),
            distinct: f.distinct,
            window: f.window.clone(),
        }),
        other => other.clone(),
    }
}

/// Rewrites over the built plan. The only structural rewrite is promoting an
/// inner nested-loop join with a pure `col = col` ON-clause into a hash
/// join.
pub fn optimize(plan: PlanNode) -> PlanNode {
    match plan {
        PlanNode::NestedLoopJoin {
            left,
            right,
            kind,
            on,
        } => {
            let left = Box::new(optimize(*left));
            let right = Box::new(optimize(*right));
            if kind == JoinKind::Inner {
                if let Some(Expr::Binary {
                    op: BinOp::Eq,
                    left: a,
                    right: b,
                }) = &on
                {
                    if matches!(**a, Expr::Column { .. }) && matches!(**b, Expr::Column { .. }) {
                        return PlanNode::HashJoin {
                            left,
                            right,
                            keys: ((**a).clone(), (**b).clone()),
                        };
                    }
                }
            }
            PlanNode::NestedLoopJoin {
                left,
                right,
                kind,
                on,
            }
        }
        PlanNode::Filter { input, predicate } => PlanNode::Filter {
            input: Box::new(optimize(*input)),
            predicate,
        },
        PlanNode::Projection {
            input,
            items,
            distinct,
        } => PlanNode::Projection {
            input: Box::new(optimize(*input)),
            items,
            distinct,
        },
        PlanNode::Window { input, items } => PlanNode::Window {
            input: Box::new(optimize(*input)),
            items,
        },
        PlanNode::Aggregate {
            input,
            group_by,
            aggregates,
            having,
        } => PlanNode::Aggregate {
            input: Box::new(optimize(*input)),
            group_by,
            aggregates,
            having,
        },
        PlanNode::Sort { input, order_by } => PlanNode::Sort {
            input: Box::new(optimize(*input)),
            order_by,
        },
        PlanNode::Limit {
            input,
            limit,
            offset,
        } => PlanNode::Limit {
            input: Box::new(optimize(*input)),
            limit,
            offset,
        },
        PlanNode::HashJoin { left, right, keys } => PlanNode::HashJoin {
            left: Box::new(optimize(*left)),
            right: Box::new(optimize(*right)),
            keys,
        },
        leaf => leaf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{ColumnSchema, ColumnType, TableSchema};
    use crate::sql::ast::{QueryBody, Statement};
    use crate::sql::parser::parse_statements;

    fn catalog_with(tables: &[(&str, &[&str])]) -> Catalog {
        let mut catalog = Catalog::new();
        for (name, cols) in tables {
            catalog.insert_table(TableSchema {
                name: name.to_string(),
                columns: cols
                    .iter()
                    .map(|c| ColumnSchema {
                        name: c.to_string(),
                        ty: ColumnType::Int,
                        serial: false,
                        constraints: vec![],
                    })
                    .collect(),
                constraints: vec![],
                root_page: 1,
                next_rowid: 1,
                max_integer_pk: 0,
            });
        }
        catalog
    }

    fn plan_for(sql: &str, catalog: &Catalog) -> PlanNode {
        let Statement::Query(q) = parse_statements(sql).unwrap().pop().unwrap() else {
            panic!("not a query")
        };
        let QueryBody::Select(select) = &q.body else { panic!("not a select") };
        let ctx = PlanContext {
            catalog,
            ctes: vec![],
        };
        optimize(
            build_select_plan(select, &q.order_by, q.limit.as_ref(), q.offset.as_ref(), &ctx).unwrap(),
        )
    }

    #[test]
    fn projection_sits_on_top_of_scan() {
        let catalog = catalog_with(&[("t", &["a", "b"])]);
        let plan = plan_for("SELECT a FROM t WHERE b > 1", &catalog);
        let PlanNode::Projection { input, items, .. } = plan else { panic!("no projection") };
        assert_eq!(items.len(), 1);
        assert!(matches!(*input, PlanNode::Filter { .. }));
    }

    #[test]
    fn equi_join_becomes_hash_join() {
        let catalog = catalog_with(&[("a", &["id"]), ("b", &["id", "a_id"])]);
        let plan = plan_for("SELECT a.id FROM a JOIN b ON a.id = b.a_id", &catalog);
        let PlanNode::Projection { input, .. } = plan else { panic!() };
        assert!(matches!(*input, PlanNode::HashJoin { .. }));
    }

    #[test]
    fn left_join_stays_nested_loop() {
        let catalog = catalog_with(&[("a", &["id"]), ("b", &["id", "a_id"])]);
        let plan = plan_for("SELECT a.id FROM a LEFT JOIN b ON a.id = b.a_id", &catalog);
        let PlanNode::Projection { input, .. } = plan else { panic!() };
        assert!(matches!(
            *input,
            PlanNode::NestedLoopJoin {
                kind: JoinKind::Left,
                ..
            }
        ));
    }

    #[test]
    fn aggregate_plan_shape() {
        let catalog = catalog_with(&[("t", &["dept", "salary"])]);
        let plan = plan_for(
            "SELECT dept, COUNT(*) FROM t GROUP BY dept HAVING COUNT(*) > 1 ORDER BY COUNT(*) DESC",
            &catalog,
        );
        let PlanNode::Projection { input, .. } = plan else { panic!() };
        let PlanNode::Sort { input, .. } = *input else { panic!("expected sort") };
        let PlanNode::Aggregate {
            group_by,
            aggregates,
            having,
            ..
        } = *input
        else {
            panic!("expected aggregate")
        };
        assert_eq!(group_by.len(), 1);
        assert_eq!(aggregates.len(), 1);
        assert!(having.is_some());
    }

    #[test]
    fn wildcard_expansion_uses_catalog_order() {
        let catalog = catalog_with(&[("t", &["x", "y"])]);
        let plan = plan_for("SELECT * FROM t", &catalog);
        let PlanNode::Projection { items, .. } = plan else { panic!() };
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["x", "y"]);
    }

    #[test]
    fn select_without_from_is_dual() {
        let catalog = catalog_with(&[]);
        let plan = plan_for("SELECT 1 + 1", &catalog);
        let PlanNode::Projection { input, .. } = plan else { panic!() };
        assert!(matches!(*input, PlanNode::Dual));
    }
}
