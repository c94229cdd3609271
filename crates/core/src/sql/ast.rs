//! The internal statement AST and its lowering from `sqlparser`.
//!
//! The engine never walks `sqlparser` types outside this module: every
//! statement form is lowered into the sum types below, and everything the
//! dialect cannot express (triggers, `RAISE`, index options, savepoint
//! rollback) is produced by the hand-written layer in [`crate::sql::parser`].

use crate::db::schema::{
    ColumnConstraint, ColumnSchema, ColumnType, FkAction, ForeignKey, HnswParams, IndexKind,
    TableConstraint, TriggerDef,
};
use crate::error::{DBError, PlanError, RuntimeError};
use micadb_types::Value;
use sqlparser::ast as sp;
use std::fmt;

// ---------------------------------------------------------------------------
// Expressions

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Column {
        table: Option<String>,
        name: String,
    },
    /// `*` as a function argument (`COUNT(*)`).
    Wildcard,
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Query>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        else_expr: Option<Box<Expr>>,
    },
    Function(FunctionCall),
    /// Scalar subquery; replaced by its value before planning.
    Subquery(Box<Query>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Upper-cased function name.
    pub name: String,
    pub args: Vec<Expr>,
    pub distinct: bool,
    pub window: Option<WindowSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderBy>,
    pub frame: Option<WindowFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub desc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUnits {
    Rows,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameBound {
    UnboundedPreceding,
    Preceding(i64),
    CurrentRow,
    Following(i64),
    UnboundedFollowing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowFrame {
    pub units: FrameUnits,
    pub start: FrameBound,
    pub end: FrameBound,
}

pub const AGGREGATE_FUNCTIONS: [&str; 5] = ["COUNT", "SUM", "AVG", "MIN", "MAX"];
pub const WINDOW_ONLY_FUNCTIONS: [&str; 5] = ["ROW_NUMBER", "RANK", "DENSE_RANK", "LAG", "LEAD"];

impl FunctionCall {
    pub fn is_aggregate(&self) -> bool {
        self.window.is_none() && AGGREGATE_FUNCTIONS.contains(&self.name.as_str())
    }
}

impl Expr {
    pub fn literal_int(&self) -> Option<i64> {
        match self {
            Expr::Literal(v) => v.as_int(),
            _ => None,
        }
    }

    /// Walk the expression tree, visiting every node top-down.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Literal(_) | Expr::Column { .. } | Expr::Wildcard => {}
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.walk(visit),
            Expr::Like { expr, pattern, .. } => {
                expr.walk(visit);
                pattern.walk(visit);
            }
            Expr::InList { expr, list, .. } => {
                expr.walk(visit);
                for e in list {
                    e.walk(visit);
                }
            }
            Expr::InSubquery { expr, .. } => expr.walk(visit),
            Expr::Between { expr, low, high, .. } => {
                expr.walk(visit);
                low.walk(visit);
                high.walk(visit);
            }
            Expr::Case {
                operand,
                branches,
                else_expr,
            } => {
                if let Some(op) = operand {
                    op.walk(visit);
                }
                for (w, t) in branches {
                    w.walk(visit);
                    t.walk(visit);
                }
                if let Some(e) = else_expr {
                    e.walk(visit);
                }
            }
            Expr::Function(f) => {
                for a in &f.args {
                    a.walk(visit);
                }
                if let Some(w) = &f.window {
                    for p in &w.partition_by {
                        p.walk(visit);
                    }
                    for o in &w.order_by {
                        o.expr.walk(visit);
                    }
                }
            }
            Expr::Subquery(_) => {}
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Function(f) = e {
                found |= f.is_aggregate();
            }
        });
        found
    }

    pub fn contains_window(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Function(f) = e {
                found |= f.window.is_some();
            }
        });
        found
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Eq => "=",
            BinOp::NotEq => "<>",
            BinOp::Lt => "<",
            BinOp::LtEq => "<=",
            BinOp::Gt => ">",
            BinOp::GtEq => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Concat => "||",
        };
        write!(f, "{s}")
    }
}

/// The canonical text of an expression, used as the emitted column name for
/// computed projections and as the lookup name for aggregate results
/// (`HAVING COUNT(*) > 1` resolves against the column named `COUNT(*)`).
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Column { table: Some(t), name } => write!(f, "{t}.{name}"),
            Expr::Column { table: None, name } => write!(f, "{name}"),
            Expr::Wildcard => write!(f, "*"),
            Expr::Binary { op, left, right } => write!(f, "{left} {op} {right}"),
            Expr::Unary { op: UnOp::Neg, expr } => write!(f, "-{expr}"),
            Expr::Unary { op: UnOp::Not, expr } => write!(f, "NOT {expr}"),
            Expr::IsNull { expr, negated: false } => write!(f, "{expr} IS NULL"),
            Expr::IsNull { expr, negated: true } => write!(f, "{expr} IS NOT NULL"),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                write!(f, "{expr} {}LIKE {pattern}", if *negated { "NOT " } else { "" })
            }
            Expr::InList { expr, negated, .. } | Expr::InSubquery { expr, negated, .. } => {
                write!(f, "{expr} {}IN (..)", if *negated { "NOT " } else { "" })
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "{expr} {}BETWEEN {low} AND {high}",
                if *negated { "NOT " } else { "" }
            ),
            Expr::Case { .. } => write!(f, "CASE"),
            Expr::Function(call) => {
                write!(f, "{}(", call.name)?;
                if call.distinct {
                    write!(f, "DISTINCT ")?;
                }
                for (i, a) in call.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")?;
                if call.window.is_some() {
                    write!(f, " OVER (..)")?;
                }
                Ok(())
            }
            Expr::Subquery(_) => write!(f, "(SELECT ..)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CteDef {
    pub name: String,
    pub columns: Option<Vec<String>>,
    pub query: Box<Query>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub ctes: Vec<CteDef>,
    pub recursive: bool,
    pub body: QueryBody,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryBody {
    Select(Box<Select>),
    SetOp {
        op: SetOp,
        all: bool,
        left: Box<QueryBody>,
        right: Box<QueryBody>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Expr { expr: Expr, alias: Option<String> },
    Wildcard,
    QualifiedWildcard(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    Table {
        name: String,
        alias: Option<String>,
    },
    Derived {
        query: Box<Query>,
        alias: String,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        alias: Option<String>,
    },
    Join {
        left: Box<TableRef>,
        right: Box<TableRef>,
        kind: JoinKind,
        on: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
}

// ---------------------------------------------------------------------------
// Statements

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub constraints: Vec<TableConstraint>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub kind: IndexKind,
    pub predicate: Option<String>,
    pub hnsw: HnswParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlterOp {
    AddColumn(ColumnSchema),
    DropColumn(String),
    RenameColumn { old: String, new: String },
    RenameTable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum Statement {
    CreateTable(CreateTable),
    DropTable { name: String, if_exists: bool },
    CreateIndex(CreateIndex),
    DropIndex { name: String },
    CreateView {
        name: String,
        columns: Option<Vec<String>>,
        sql: String,
    },
    DropView { name: String },
    CreateTrigger(TriggerDef),
    DropTrigger { name: String },
    AlterTable { table: String, op: AlterOp },
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    Query(Query),
    Analyze { table: Option<String> },
    Begin,
    Commit,
    Rollback,
    Savepoint { name: String },
    RollbackTo { name: String },
    Release { name: String },
    Explain { query_plan: bool, inner: Box<Statement> },
}

// ---------------------------------------------------------------------------
// Lowering from sqlparser

fn unsupported<T>(feature: impl Into<String>) -> Result<T, DBError> {
    Err(PlanError::Unsupported {
        feature: feature.into(),
    }
    .into())
}

pub fn lower_statement(stmt: sp::Statement) -> Result<Statement, DBError> {
    match stmt {
        sp::Statement::Query(query) => Ok(Statement::Query(lower_query(*query)?)),
        sp::Statement::Insert {
            table_name,
            columns,
            source,
            ..
        } => lower_insert(table_name, columns, *source),
        sp::Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            if from.is_some() {
                return unsupported("UPDATE .. FROM");
            }
            lower_update(table, assignments, selection)
        }
        sp::Statement::Delete {
            from, selection, ..
        } => lower_delete(from, selection),
        sp::Statement::CreateTable {
            name,
            columns,
            constraints,
            if_not_exists,
            ..
        } => lower_create_table(name, columns, constraints, if_not_exists),
        sp::Statement::Drop {
            object_type,
            if_exists,
            names,
            ..
        } => lower_drop(object_type, if_exists, names),
        sp::Statement::CreateView {
            name,
            columns,
            query,
            ..
        } => Ok(Statement::CreateView {
            name: object_name(&name),
            columns: if columns.is_empty() {
                None
            } else {
                Some(columns.iter().map(|c| c.value.clone()).collect())
            },
            sql: query.to_string(),
        }),
        sp::Statement::Analyze { table_name, .. } => Ok(Statement::Analyze {
            table: Some(object_name(&table_name)),
        }),
        sp::Statement::StartTransaction { .. } => Ok(Statement::Begin),
        sp::Statement::Commit { .. } => Ok(Statement::Commit),
        sp::Statement::Rollback { .. } => Ok(Statement::Rollback),
        sp::Statement::Savepoint { name } => Ok(Statement::Savepoint { name: name.value }),
        sp::Statement::Explain { statement, .. } => Ok(Statement::Explain {
            query_plan: false,
            inner: Box::new(lower_statement(*statement)?),
        }),
        other => Err(DBError::UnsupportedStatement(format!("{other}"))),
    }
}

fn object_name(name: &sp::ObjectName) -> String {
    name.0
        .iter()
        .map(|i| i.value.clone())
        .collect::<Vec<_>>()
        .join(".")
}

fn lower_insert(
    table_name: sp::ObjectName,
    columns: Vec<sp::Ident>,
    source: sp::Query,
) -> Result<Statement, DBError> {
    let sp::SetExpr::Values(values) = *source.body else {
        return unsupported("INSERT without VALUES");
    };
    let mut rows = Vec::with_capacity(values.rows.len());
    for row in values.rows {
        rows.push(row.into_iter().map(lower_expr).collect::<Result<Vec<_>, _>>()?);
    }
    Ok(Statement::Insert(Insert {
        table: object_name(&table_name),
        columns: columns.into_iter().map(|c| c.value).collect(),
        rows,
    }))
}

fn lower_update(
    table: sp::TableWithJoins,
    assignments: Vec<sp::Assignment>,
    selection: Option<sp::Expr>,
) -> Result<Statement, DBError> {
    let sp::TableFactor::Table { name, .. } = table.relation else {
        return unsupported("UPDATE of a non-table");
    };
    let mut lowered = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = a
            .id
            .last()
            .ok_or_else(|| PlanError::Unstructured("empty assignment target".into()))?
            .value
            .clone();
        lowered.push((column, lower_expr(a.value)?));
    }
    Ok(Statement::Update(Update {
        table: object_name(&name),
        assignments: lowered,
        selection: selection.map(lower_expr).transpose()?,
    }))
}

fn lower_delete(
    from: Vec<sp::TableWithJoins>,
    selection: Option<sp::Expr>,
) -> Result<Statement, DBError> {
    let [table] = from.as_slice() else {
        return unsupported("DELETE over multiple tables");
    };
    let sp::TableFactor::Table { name, .. } = &table.relation else {
        return unsupported("DELETE of a non-table");
    };
    Ok(Statement::Delete(Delete {
        table: object_name(name),
        selection: selection.map(lower_expr).transpose()?,
    }))
}

fn lower_drop(
    object_type: sp::ObjectType,
    if_exists: bool,
    names: Vec<sp::ObjectName>,
) -> Result<Statement, DBError> {
    let [name] = names.as_slice() else {
        return unsupported("DROP with more than one name");
    };
    let name = object_name(name);
    match object_type {
        sp::ObjectType::Table => Ok(Statement::DropTable { name, if_exists }),
        sp::ObjectType::Index => Ok(Statement::DropIndex { name }),
        sp::ObjectType::View => Ok(Statement::DropView { name }),
        other => unsupported(format!("DROP {other}")),
    }
}

fn lower_create_table(
    name: sp::ObjectName,
    columns: Vec<sp::ColumnDef>,
    constraints: Vec<sp::TableConstraint>,
    if_not_exists: bool,
) -> Result<Statement, DBError> {
    let table = object_name(&name);
    let columns = columns
        .into_iter()
        .map(|c| lower_column_def(&table, c))
        .collect::<Result<Vec<_>, _>>()?;
    let constraints = constraints
        .into_iter()
        .map(lower_table_constraint)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Statement::CreateTable(CreateTable {
        name: table,
        columns,
        constraints,
        if_not_exists,
    }))
}

pub(crate) fn lower_column_def(table: &str, def: sp::ColumnDef) -> Result<ColumnSchema, DBError> {
    let name = def.name.value.clone();
    let (ty, serial) = lower_data_type(&def.data_type)
        .ok_or_else(|| PlanError::Unsupported {
            feature: format!("column {table}.{name} of type {}", def.data_type),
        })?;
    let mut constraints = Vec::new();
    if serial {
        constraints.push(ColumnConstraint::PrimaryKey);
    }
    for opt in def.options {
        match opt.option {
            sp::ColumnOption::Null => {}
            sp::ColumnOption::NotNull => constraints.push(ColumnConstraint::NotNull),
            sp::ColumnOption::Unique { is_primary, .. } => constraints.push(if is_primary {
                ColumnConstraint::PrimaryKey
            } else {
                ColumnConstraint::Unique
            }),
            sp::ColumnOption::Default(expr) => {
                constraints.push(ColumnConstraint::Default(expr.to_string()));
            }
            sp::ColumnOption::Check(expr) => {
                constraints.push(ColumnConstraint::Check(expr.to_string()));
            }
            sp::ColumnOption::ForeignKey {
                foreign_table,
                referred_columns,
                on_delete,
                on_update,
                ..
            } => {
                constraints.push(ColumnConstraint::ForeignKey(lower_fk(
                    &foreign_table,
                    referred_columns.first().map(|c| c.value.clone()),
                    on_delete,
                    on_update,
                )?));
            }
            sp::ColumnOption::Comment(_) => {}
            other => {
                return unsupported(format!("column option {other}"));
            }
        }
    }
    // Duplicate PRIMARY KEY markers can arrive from SERIAL plus an explicit
    // declaration.
    let mut seen = Vec::new();
    constraints.retain(|c| {
        if seen.contains(c) {
            false
        } else {
            seen.push(c.clone());
            true
        }
    });
    Ok(ColumnSchema {
        name,
        ty,
        serial,
        constraints,
    })
}

fn lower_fk(
    foreign_table: &sp::ObjectName,
    referred_column: Option<String>,
    on_delete: Option<sp::ReferentialAction>,
    on_update: Option<sp::ReferentialAction>,
) -> Result<ForeignKey, DBError> {
    Ok(ForeignKey {
        table: object_name(foreign_table),
        // `REFERENCES t` without a column resolves against the referenced
        // table's primary key when the schema is applied.
        column: referred_column.unwrap_or_default(),
        on_delete: lower_fk_action(on_delete)?,
        on_update: lower_fk_action(on_update)?,
    })
}

fn lower_fk_action(action: Option<sp::ReferentialAction>) -> Result<FkAction, DBError> {
    Ok(match action {
        None | Some(sp::ReferentialAction::NoAction) => FkAction::NoAction,
        Some(sp::ReferentialAction::Restrict) => FkAction::Restrict,
        Some(sp::ReferentialAction::Cascade) => FkAction::Cascade,
        Some(sp::ReferentialAction::SetNull) => FkAction::SetNull,
        // Declared but never implemented by the engine; reject early.
        Some(sp::ReferentialAction::SetDefault) => {
            return Err(RuntimeError::SetDefaultUnsupported.into());
        }
    })
}

fn lower_table_constraint(c: sp::TableConstraint) -> Result<TableConstraint, DBError> {
    match c {
        sp::TableConstraint::Unique {
            columns, is_primary, ..
        } => {
            let cols = columns.into_iter().map(|c| c.value).collect();
            Ok(if is_primary {
                TableConstraint::PrimaryKey(cols)
            } else {
                TableConstraint::Unique(cols)
            })
        }
        sp::TableConstraint::ForeignKey {
            columns,
            foreign_table,
            referred_columns,
            on_delete,
            on_update,
            ..
        } => Ok(TableConstraint::ForeignKey {
            columns: columns.into_iter().map(|c| c.value).collect(),
            fk: lower_fk(
                &foreign_table,
                referred_columns.first().map(|c| c.value.clone()),
                on_delete,
                on_update,
            )?,
        }),
        sp::TableConstraint::Check { expr, .. } => Ok(TableConstraint::Check(expr.to_string())),
        other => unsupported(format!("table constraint {other}")),
    }
}

/// Map a declared SQL type onto a [`ColumnType`]; the second component marks
/// SERIAL autoincrement columns.
pub(crate) fn lower_data_type(ty: &sp::DataType) -> Option<(ColumnType, bool)> {
    use sp::DataType as DT;
    let mapped = match ty {
        DT::TinyInt(_) | DT::SmallInt(_) => ColumnType::SmallInt,
        DT::Int(_) | DT::Integer(_) => ColumnType::Int,
        DT::BigInt(_) => ColumnType::BigInt,
        DT::Real | DT::Float(_) | DT::Double | DT::DoublePrecision => ColumnType::Float,
        DT::Text | DT::String => ColumnType::Text,
        DT::Varchar(len) | DT::CharacterVarying(len) => match len {
            Some(l) => ColumnType::Varchar(l.length as u32),
            None => ColumnType::Text,
        },
        DT::Char(len) | DT::Character(len) => match len {
            Some(l) => ColumnType::Char(l.length as u32),
            None => ColumnType::Char(1),
        },
        DT::Blob(_) | DT::Bytea => ColumnType::Blob,
        DT::JSON => ColumnType::Json,
        DT::Uuid => ColumnType::Guid,
        DT::Decimal(info) | DT::Numeric(info) => {
            let (precision, scale) = match info {
                sp::ExactNumberInfo::None => (18, 0),
                sp::ExactNumberInfo::Precision(p) => (*p as u8, 0),
                sp::ExactNumberInfo::PrecisionAndScale(p, s) => (*p as u8, *s as u8),
            };
            ColumnType::Decimal { precision, scale }
        }
        DT::Custom(name, args) => {
            let head = object_name(name).to_ascii_uppercase();
            match head.as_str() {
                "SERIAL" | "BIGSERIAL" => return Some((ColumnType::BigInt, true)),
                "GUID" => ColumnType::Guid,
                "VECTOR" => {
                    let dim: u32 = args.first()?.parse().ok()?;
                    let normalize = !args
                        .get(1)
                        .map(|a| a.eq_ignore_ascii_case("NONORM") || a.eq_ignore_ascii_case("NO_NORMALIZE"))
                        .unwrap_or(false);
                    ColumnType::Vector { dim, normalize }
                }
                _ => return None,
            }
        }
        _ => return None,
    };
    Some((mapped, false))
}

// ---------------------------------------------------------------------------
// Query lowering

pub fn lower_query(query: sp::Query) -> Result<Query, DBError> {
    let (ctes, recursive) = match query.with {
        Some(with) => {
            let mut ctes = Vec::with_capacity(with.cte_tables.len());
            for cte in with.cte_tables {
                ctes.push(CteDef {
                    name: cte.alias.name.value.clone(),
                    columns: if cte.alias.columns.is_empty() {
                        None
                    } else {
                        Some(cte.alias.columns.iter().map(|c| c.value.clone()).collect())
                    },
                    query: Box::new(lower_query(*cte.query)?),
                });
            }
            (ctes, with.recursive)
        }
        None => (Vec::new(), false),
    };

    let body = lower_query_body(*query.body)?;
    let order_by = query
        .order_by
        .into_iter()
        .map(lower_order_by)
        .collect::<Result<Vec<_>, _>>()?;
    let limit = query.limit.map(lower_expr).transpose()?;
    let offset = query.offset.map(|o| lower_expr(o.value)).transpose()?;

    Ok(Query {
        ctes,
        recursive,
        body,
        order_by,
        limit,
        offset,
    })
}

fn lower_query_body(body: sp::SetExpr) -> Result<QueryBody, DBError> {
    match body {
        sp::SetExpr::Select(select) => Ok(QueryBody::Select(Box::new(lower_select(*select)?))),
        sp::SetExpr::SetOperation {
            op,
            set_quantifier,
            left,
            right,
        } => {
            let op = match op {
                sp::SetOperator::Union => SetOp::Union,
                sp::SetOperator::Intersect => SetOp::Intersect,
                sp::SetOperator::Except => SetOp::Except,
            };
            let all = matches!(set_quantifier, sp::SetQuantifier::All);
            Ok(QueryBody::SetOp {
                op,
                all,
                left: Box::new(lower_query_body(*left)?),
                right: Box::new(lower_query_body(*right)?),
            })
        }
        sp::SetExpr::Query(q) => Ok(lower_query(*q)?.body),
        other => unsupported(format!("query body {other}")),
    }
}

fn lower_select(select: sp::Select) -> Result<Select, DBError> {
    let distinct = match select.distinct {
        None => false,
        Some(sp::Distinct::Distinct) => true,
        Some(sp::Distinct::On(_)) => return unsupported("DISTINCT ON"),
    };

    let mut projection = Vec::with_capacity(select.projection.len());
    for item in select.projection {
        projection.push(match item {
            sp::SelectItem::UnnamedExpr(e) => SelectItem::Expr {
                expr: lower_expr(e)?,
                alias: None,
            },
            sp::SelectItem::ExprWithAlias { expr, alias } => SelectItem::Expr {
                expr: lower_expr(expr)?,
                alias: Some(alias.value),
            },
            sp::SelectItem::QualifiedWildcard(name, _) => SelectItem::QualifiedWildcard(object_name(&name)),
            sp::SelectItem::Wildcard(_) => SelectItem::Wildcard,
        });
    }

    let from = lower_from(select.from)?;
    let selection = select.selection.map(lower_expr).transpose()?;
    let group_by = match select.group_by {
        sp::GroupByExpr::All => return unsupported("GROUP BY ALL"),
        sp::GroupByExpr::Expressions(exprs) => exprs
            .into_iter()
            .map(lower_expr)
            .collect::<Result<Vec<_>, _>>()?,
    };
    let having = select.having.map(lower_expr).transpose()?;

    Ok(Select {
        distinct,
        projection,
        from,
        selection,
        group_by,
        having,
    })
}

fn lower_from(from: Vec<sp::TableWithJoins>) -> Result<Option<TableRef>, DBError> {
    let mut tables = from.into_iter();
    let Some(first) = tables.next() else {
        return Ok(None);
    };
    let mut result = lower_table_with_joins(first)?;
    // Comma-separated FROM items are cross joins.
    for next in tables {
        result = TableRef::Join {
            left: Box::new(result),
            right: Box::new(lower_table_with_joins(next)?),
            kind: JoinKind::Cross,
            on: None,
        };
    }
    Ok(Some(result))
}

fn lower_table_with_joins(twj: sp::TableWithJoins) -> Result<TableRef, DBError> {
    let mut result = lower_table_factor(twj.relation)?;
    for join in twj.joins {
        let (kind, constraint) = match join.join_operator {
            sp::JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
            sp::JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
            sp::JoinOperator::RightOuter(c) => (JoinKind::Right, Some(c)),
            sp::JoinOperator::FullOuter(c) => (JoinKind::Full, Some(c)),
            sp::JoinOperator::CrossJoin => (JoinKind::Cross, None),
            other => return unsupported(format!("join operator {other:?}")),
        };
        let on = match constraint {
            Some(sp::JoinConstraint::On(e)) => Some(lower_expr(e)?),
            Some(sp::JoinConstraint::None) | None => None,
            Some(other) => return unsupported(format!("join constraint {other:?}")),
        };
        result = TableRef::Join {
            left: Box::new(result),
            right: Box::new(lower_table_factor(join.relation)?),
            kind,
            on,
        };
    }
    Ok(result)
}

fn lower_table_factor(factor: sp::TableFactor) -> Result<TableRef, DBError> {
    match factor {
        sp::TableFactor::Table { name, alias, args, .. } => {
            let name = object_name(&name);
            let alias = alias.map(|a| a.name.value);
            match args {
                // `FROM fn(arg, ..)` is a table function.
                Some(args) => {
                    let args = args
                        .into_iter()
                        .map(lower_function_arg)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(TableRef::Function { name, args, alias })
                }
                None => Ok(TableRef::Table { name, alias }),
            }
        }
        sp::TableFactor::Derived {
            subquery, alias, ..
        } => {
            let alias = alias
                .map(|a| a.name.value)
                .ok_or_else(|| PlanError::Unstructured("derived table requires an alias".into()))?;
            Ok(TableRef::Derived {
                query: Box::new(lower_query(*subquery)?),
                alias,
            })
        }
        sp::TableFactor::NestedJoin {
            table_with_joins, ..
        } => lower_table_with_joins(*table_with_joins),
        other => unsupported(format!("table factor {other}")),
    }
}

fn lower_order_by(o: sp::OrderByExpr) -> Result<OrderBy, DBError> {
    Ok(OrderBy {
        expr: lower_expr(o.expr)?,
        desc: o.asc == Some(false),
    })
}

// ---------------------------------------------------------------------------
// Expression lowering

fn lower_bin_op(op: &sp::BinaryOperator) -> Result<BinOp, DBError> {
    Ok(match op {
        sp::BinaryOperator::Eq => BinOp::Eq,
        sp::BinaryOperator::NotEq => BinOp::NotEq,
        sp::BinaryOperator::Lt => BinOp::Lt,
        sp::BinaryOperator::LtEq => BinOp::LtEq,
        sp::BinaryOperator::Gt => BinOp::Gt,
        sp::BinaryOperator::GtEq => BinOp::GtEq,
        sp::BinaryOperator::And => BinOp::And,
        sp::BinaryOperator::Or => BinOp::Or,
        sp::BinaryOperator::Plus => BinOp::Add,
        sp::BinaryOperator::Minus => BinOp::Sub,
        sp::BinaryOperator::Multiply => BinOp::Mul,
        sp::BinaryOperator::Divide => BinOp::Div,
        sp::BinaryOperator::Modulo => BinOp::Mod,
        sp::BinaryOperator::StringConcat => BinOp::Concat,
        other => return unsupported(format!("operator {other}")),
    })
}

pub fn lower_expr(expr: sp::Expr) -> Result<Expr, DBError> {
    Ok(match expr {
        sp::Expr::Identifier(ident) => Expr::Column {
            table: None,
            name: ident.value,
        },
        sp::Expr::CompoundIdentifier(parts) => {
            let mut parts: Vec<String> = parts.into_iter().map(|i| i.value).collect();
            let name = parts.pop().ok_or_else(|| PlanError::Unstructured("empty identifier".into()))?;
            Expr::Column {
                table: Some(parts.join(".")),
                name,
            }
        }
        sp::Expr::Value(v) => Expr::Literal(lower_value(v)?),
        sp::Expr::BinaryOp { left, op, right } => Expr::Binary {
            op: lower_bin_op(&op)?,
            left: Box::new(lower_expr(*left)?),
            right: Box::new(lower_expr(*right)?),
        },
        sp::Expr::UnaryOp { op, expr } => match op {
            sp::UnaryOperator::Plus => lower_expr(*expr)?,
            sp::UnaryOperator::Minus => {
                // Fold negated numeric literals so `LIMIT -1` and negative
                // defaults stay literals.
                match lower_expr(*expr)? {
                    Expr::Literal(Value::Int { v, width }) => Expr::Literal(Value::Int { v: -v, width }),
                    Expr::Literal(Value::Float(f)) => Expr::Literal(Value::Float(-f)),
                    inner => Expr::Unary {
                        op: UnOp::Neg,
                        expr: Box::new(inner),
                    },
                }
            }
            sp::UnaryOperator::Not => Expr::Unary {
                op: UnOp::Not,
                expr: Box::new(lower_expr(*expr)?),
            },
            other => return unsupported(format!("unary operator {other}")),
        },
        sp::Expr::Nested(inner) => lower_expr(*inner)?,
        sp::Expr::IsNull(inner) => Expr::IsNull {
            expr: Box::new(lower_expr(*inner)?),
            negated: false,
        },
        sp::Expr::IsNotNull(inner) => Expr::IsNull {
            expr: Box::new(lower_expr(*inner)?),
            negated: true,
        },
        sp::Expr::Like {
            negated,
            expr,
            pattern,
            ..
        } => Expr::Like {
            expr: Box::new(lower_expr(*expr)?),
            pattern: Box::new(lower_expr(*pattern)?),
            negated,
        },
        sp::Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(lower_expr(*expr)?),
            list: list.into_iter().map(lower_expr).collect::<Result<Vec<_>, _>>()?,
            negated,
        },
        sp::Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => Expr::InSubquery {
            expr: Box::new(lower_expr(*expr)?),
            subquery: Box::new(lower_query(*subquery)?),
            negated,
        },
        sp::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Expr::Between {
            expr: Box::new(lower_expr(*expr)?),
            low: Box::new(lower_expr(*low)?),
            high: Box::new(lower_expr(*high)?),
            negated,
        },
        sp::Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => Expr::Case {
            operand: operand.map(|o| lower_expr(*o).map(Box::new)).transpose()?,
            branches: conditions
                .into_iter()
                .zip(results)
                .map(|(c, r)| Ok::<_, DBError>((lower_expr(c)?, lower_expr(r)?)))
                .collect::<Result<Vec<_>, _>>()?,
            else_expr: else_result.map(|e| lower_expr(*e).map(Box::new)).transpose()?,
        },
        sp::Expr::Function(f) => Expr::Function(lower_function(f)?),
        // TRIM and SUBSTRING have dedicated grammar; both lower onto the
        // ordinary registry calls.
        sp::Expr::Trim { expr, .. } => Expr::Function(FunctionCall {
            name: "TRIM".to_string(),
            args: vec![lower_expr(*expr)?],
            distinct: false,
            window: None,
        }),
        sp::Expr::Substring {
            expr,
            substring_from,
            substring_for,
            ..
        } => {
            let mut args = vec![lower_expr(*expr)?];
            if let Some(from) = substring_from {
                args.push(lower_expr(*from)?);
            }
            if let Some(len) = substring_for {
                args.push(lower_expr(*len)?);
            }
            Expr::Function(FunctionCall {
                name: "SUBSTR".to_string(),
                args,
                distinct: false,
                window: None,
            })
        }
        sp::Expr::Subquery(q) => Expr::Subquery(Box::new(lower_query(*q)?)),
        sp::Expr::Array(array) => {
            // ARRAY[..] literals build vectors.
            Expr::Function(FunctionCall {
                name: "VECTOR".to_string(),
                args: array
                    .elem
                    .into_iter()
                    .map(lower_expr)
                    .collect::<Result<Vec<_>, _>>()?,
                distinct: false,
                window: None,
            })
        }
        other => return unsupported(format!("expression {other}")),
    })
}

fn lower_value(v: sp::Value) -> Result<Value, DBError> {
    Ok(match v {
        sp::Value::Null => Value::Null,
        sp::Value::Boolean(b) => Value::int(b as i64),
        sp::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Value::int(i)
            } else {
                Value::Float(n.parse::<f64>().map_err(|_| PlanError::Unstructured(format!("bad number `{n}`")))?)
            }
        }
        sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => Value::text(s),
        sp::Value::HexStringLiteral(s) => {
            let bytes = (0..s.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&s[i..(i + 2).min(s.len())], 16))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| PlanError::Unstructured(format!("bad hex literal `{s}`")))?;
            Value::Blob(bytes)
        }
        other => return unsupported(format!("literal {other}")),
    })
}

fn lower_function_arg(arg: sp::FunctionArg) -> Result<Expr, DBError> {
    match arg {
        sp::FunctionArg::Unnamed(e) => lower_function_arg_expr(e),
        sp::FunctionArg::Named { arg, .. } => lower_function_arg_expr(arg),
    }
}

fn lower_function_arg_expr(e: sp::FunctionArgExpr) -> Result<Expr, DBError> {
    match e {
        sp::FunctionArgExpr::Expr(e) => lower_expr(e),
        sp::FunctionArgExpr::Wildcard => Ok(Expr::Wildcard),
        sp::FunctionArgExpr::QualifiedWildcard(_) => Ok(Expr::Wildcard),
    }
}

fn lower_function(f: sp::Function) -> Result<FunctionCall, DBError> {
    let name = object_name(&f.name).to_ascii_uppercase();
    let args = f
        .args
        .into_iter()
        .map(lower_function_arg)
        .collect::<Result<Vec<_>, _>>()?;
    let window = match f.over {
        None => None,
        Some(sp::WindowType::WindowSpec(spec)) => Some(lower_window_spec(spec)?),
        Some(sp::WindowType::NamedWindow(_)) => return unsupported("named windows"),
    };
    Ok(FunctionCall {
        name,
        args,
        distinct: f.distinct,
        window,
    })
}

fn lower_window_spec(spec: sp::WindowSpec) -> Result<WindowSpec, DBError> {
    Ok(WindowSpec {
        partition_by: spec
            .partition_by
            .into_iter()
            .map(lower_expr)
            .collect::<Result<Vec<_>, _>>()?,
        order_by: spec
            .order_by
            .into_iter()
            .map(lower_order_by)
            .collect::<Result<Vec<_>, _>>()?,
        frame: spec.window_frame.map(lower_window_frame).transpose()?,
    })
}

fn lower_window_frame(frame: sp::WindowFrame) -> Result<WindowFrame, DBError> {
    let units = match frame.units {
        sp::WindowFrameUnits::Rows => FrameUnits::Rows,
        sp::WindowFrameUnits::Range => FrameUnits::Range,
        sp::WindowFrameUnits::Groups => return unsupported("GROUPS window frames"),
    };
    let start = lower_frame_bound(frame.start_bound)?;
    let end = match frame.end_bound {
        Some(b) => lower_frame_bound(b)?,
        None => FrameBound::CurrentRow,
    };
    Ok(WindowFrame { units, start, end })
}

fn lower_frame_bound(bound: sp::WindowFrameBound) -> Result<FrameBound, DBError> {
    Ok(match bound {
        sp::WindowFrameBound::CurrentRow => FrameBound::CurrentRow,
        sp::WindowFrameBound::Preceding(None) => FrameBound::UnboundedPreceding,
        sp::WindowFrameBound::Following(None) => FrameBound::UnboundedFollowing,
        sp::WindowFrameBound::Preceding(Some(e)) => FrameBound::Preceding(frame_offset(&e)?),
        sp::WindowFrameBound::Following(Some(e)) => FrameBound::Following(frame_offset(&e)?),
    })
}

fn frame_offset(e: &sp::Expr) -> Result<i64, DBError> {
    if let sp::Expr::Value(sp::Value::Number(n, _)) = e {
        if let Ok(v) = n.parse::<i64>() {
            return Ok(v);
        }
    }
    unsupported(format!("window frame offset {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parser::parse_statements;

    fn parse_one(sql: &str) -> Statement {
        let mut stmts = parse_statements(sql).unwrap();
        assert_eq!(stmts.len(), 1);
        stmts.pop().unwrap()
    }

    #[test]
    fn lowers_select_with_joins_and_where() {
        let stmt = parse_one(
            "SELECT users.name, orders.amount FROM users JOIN orders ON users.id = orders.user_id WHERE amount > 10",
        );
        let Statement::Query(q) = stmt else { panic!("not a query") };
        let QueryBody::Select(select) = &q.body else { panic!("not a select") };
        assert_eq!(select.projection.len(), 2);
        assert!(matches!(
            select.from,
            Some(TableRef::Join {
                kind: JoinKind::Inner,
                ..
            })
        ));
        assert!(select.selection.is_some());
    }

    #[test]
    fn lowers_create_table_with_constraints() {
        let stmt = parse_one(
            "CREATE TABLE employees (id INT PRIMARY KEY, dept_id INT REFERENCES departments(id) ON DELETE CASCADE, \
             name VARCHAR(40) NOT NULL, bio TEXT DEFAULT 'none', CHECK (id > 0))",
        );
        let Statement::CreateTable(ct) = stmt else { panic!("not create table") };
        assert_eq!(ct.columns.len(), 4);
        assert!(ct.columns[0].is_primary_key());
        let fk = ct.columns[1].foreign_key().expect("fk");
        assert_eq!(fk.table, "departments");
        assert_eq!(fk.on_delete, FkAction::Cascade);
        assert_eq!(ct.columns[2].ty, ColumnType::Varchar(40));
        assert_eq!(ct.columns[3].default_sql(), Some("'none'"));
        assert_eq!(ct.constraints.len(), 1);
    }

    #[test]
    fn serial_is_integer_primary_key() {
        let stmt = parse_one("CREATE TABLE t (id SERIAL PRIMARY KEY, name TEXT)");
        let Statement::CreateTable(ct) = stmt else { panic!() };
        assert!(ct.columns[0].serial);
        assert!(ct.columns[0].is_primary_key());
        assert_eq!(ct.columns[0].ty, ColumnType::BigInt);
    }

    #[test]
    fn set_default_rejected_at_ddl() {
        let err = parse_statements(
            "CREATE TABLE t (a INT REFERENCES p(id) ON DELETE SET DEFAULT)",
        )
        .unwrap_err();
        assert!(err.to_string().contains("SET DEFAULT"));
    }

    #[test]
    fn negative_limit_stays_a_literal() {
        let Statement::Query(q) = parse_one("SELECT 1 LIMIT -1") else { panic!() };
        assert_eq!(q.limit.as_ref().and_then(Expr::literal_int), Some(-1));
    }

    #[test]
    fn window_call_lowering() {
        let stmt = parse_one(
            "SELECT name, ROW_NUMBER() OVER (PARTITION BY dept ORDER BY salary DESC) FROM employees",
        );
        let Statement::Query(q) = stmt else { panic!() };
        let QueryBody::Select(select) = &q.body else { panic!() };
        let SelectItem::Expr { expr, .. } = &select.projection[1] else { panic!() };
        let Expr::Function(call) = expr else { panic!("not a function") };
        let win = call.window.as_ref().expect("window spec");
        assert_eq!(win.partition_by.len(), 1);
        assert!(win.order_by[0].desc);
    }

    #[test]
    fn canonical_names() {
        let Statement::Query(q) = parse_one("SELECT COUNT(*), SUM(amount) FROM t") else { panic!() };
        let QueryBody::Select(select) = &q.body else { panic!() };
        let names: Vec<String> = select
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::Expr { expr, .. } => expr.to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(names, ["COUNT(*)", "SUM(amount)"]);
    }

    #[test]
    fn union_all_lowering() {
        let Statement::Query(q) = parse_one("SELECT x FROM t1 UNION ALL SELECT y FROM t2") else { panic!() };
        assert!(matches!(
            q.body,
            QueryBody::SetOp {
                op: SetOp::Union,
                all: true,
                ..
            }
        ));
    }
}
