//! Schema definitions: tables, columns, constraints, indexes, views and
//! triggers. Constraint expressions, index predicates and view bodies are
//! carried as SQL text and parsed where they are evaluated, which keeps the
//! catalog trivially serializable.

use crate::sql::ast::Statement;
use micadb_storage::PageId;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnType {
    SmallInt,
    Int,
    BigInt,
    Float,
    Text,
    Varchar(u32),
    Char(u32),
    Blob,
    Json,
    Decimal { precision: u8, scale: u8 },
    Guid,
    Vector { dim: u32, normalize: bool },
}

impl ColumnType {
    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::SmallInt | ColumnType::Int | ColumnType::BigInt)
    }

    /// Parse the textual form produced by [`fmt::Display`]. Used when the
    /// catalog is loaded back from its tree.
    pub fn parse(s: &str) -> Option<ColumnType> {
        let s = s.trim();
        let (head, args) = match s.find('(') {
            Some(i) if s.ends_with(')') => {
                let inner = &s[i + 1..s.len() - 1];
                (&s[..i], inner.split(',').map(str::trim).collect::<Vec<_>>())
            }
            _ => (s, Vec::new()),
        };
        match head.to_ascii_uppercase().as_str() {
            "SMALLINT" => Some(ColumnType::SmallInt),
            "INT" => Some(ColumnType::Int),
            "BIGINT" => Some(ColumnType::BigInt),
            "FLOAT" => Some(ColumnType::Float),
            "TEXT" => Some(ColumnType::Text),
            "BLOB" => Some(ColumnType::Blob),
            "JSON" => Some(ColumnType::Json),
            "GUID" => Some(ColumnType::Guid),
            "VARCHAR" => Some(ColumnType::Varchar(args.first()?.parse().ok()?)),
            "CHAR" => Some(ColumnType::Char(args.first()?.parse().ok()?)),
            "DECIMAL" => Some(ColumnType::Decimal {
                precision: args.first()?.parse().ok()?,
                scale: args.get(1)?.parse().ok()?,
            }),
            "VECTOR" => Some(ColumnType::Vector {
                dim: args.first()?.parse().ok()?,
                normalize: args.get(1).map(|a| !a.eq_ignore_ascii_case("NONORM")).unwrap_or(true),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::SmallInt => write!(f, "SMALLINT"),
            ColumnType::Int => write!(f, "INT"),
            ColumnType::BigInt => write!(f, "BIGINT"),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::Varchar(n) => write!(f, "VARCHAR({n})"),
            ColumnType::Char(n) => write!(f, "CHAR({n})"),
            ColumnType::Blob => write!(f, "BLOB"),
            ColumnType::Json => write!(f, "JSON"),
            ColumnType::Decimal { precision, scale } => write!(f, "DECIMAL({precision},{scale})"),
            ColumnType::Guid => write!(f, "GUID"),
            ColumnType::Vector { dim, normalize: true } => write!(f, "VECTOR({dim})"),
            ColumnType::Vector { dim, normalize: false } => write!(f, "VECTOR({dim},NONORM)"),
        }
    }
}

/// Referential action on the referencing side of a foreign key.
/// `SET DEFAULT` is rejected when the schema is declared, so it has no
/// variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FkAction {
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

impl FkAction {
    pub fn parse(s: &str) -> Option<FkAction> {
        match s.to_ascii_uppercase().as_str() {
            "NO ACTION" => Some(FkAction::NoAction),
            "RESTRICT" => Some(FkAction::Restrict),
            "CASCADE" => Some(FkAction::Cascade),
            "SET NULL" => Some(FkAction::SetNull),
            _ => None,
        }
    }
}

impl fmt::Display for FkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FkAction::NoAction => write!(f, "NO ACTION"),
            FkAction::Restrict => write!(f, "RESTRICT"),
            FkAction::Cascade => write!(f, "CASCADE"),
            FkAction::SetNull => write!(f, "SET NULL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
    pub on_delete: FkAction,
    pub on_update: FkAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey,
    NotNull,
    Unique,
    /// CHECK expression, stored as SQL text.
    Check(String),
    ForeignKey(ForeignKey),
    /// DEFAULT expression, stored as SQL text.
    Default(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub ty: ColumnType,
    /// SERIAL columns autoincrement like INTEGER PRIMARY KEY.
    pub serial: bool,
    pub constraints: Vec<ColumnConstraint>,
}

impl ColumnSchema {
    pub fn is_primary_key(&self) -> bool {
        self.constraints.contains(&ColumnConstraint::PrimaryKey)
    }

    pub fn is_not_null(&self) -> bool {
        self.constraints.contains(&ColumnConstraint::NotNull)
    }

    pub fn is_unique(&self) -> bool {
        self.constraints.contains(&ColumnConstraint::Unique)
    }

    pub fn default_sql(&self) -> Option<&str> {
        self.constraints.iter().find_map(|c| match c {
            ColumnConstraint::Default(sql) => Some(sql.as_str()),
            _ => None,
        })
    }

    pub fn foreign_key(&self) -> Option<&ForeignKey> {
        self.constraints.iter().find_map(|c| match c {
            ColumnConstraint::ForeignKey(fk) => Some(fk),
            _ => None,
        })
    }

    pub fn checks(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().filter_map(|c| match c {
            ColumnConstraint::Check(sql) => Some(sql.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableConstraint {
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
    Check(String),
    ForeignKey { columns: Vec<String>, fk: ForeignKey },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub constraints: Vec<TableConstraint>,
    /// Root page of the primary B-tree, keyed by 8-byte big-endian rowid.
    pub root_page: PageId,
    /// Strictly greater than any rowid ever handed out.
    pub next_rowid: u64,
    /// Highest INTEGER PRIMARY KEY value ever seen, user-supplied included.
    pub max_integer_pk: i64,
}

impl TableSchema {
    pub fn col_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.col_index(name).map(|i| &self.columns[i])
    }

    /// Position of the single INTEGER PRIMARY KEY (or SERIAL) column, if the
    /// table has one. Such a column autoincrements when inserted as NULL.
    pub fn integer_pk(&self) -> Option<usize> {
        let pk_cols = self.primary_key_columns();
        if pk_cols.len() != 1 {
            return None;
        }
        let i = self.col_index(&pk_cols[0])?;
        let col = &self.columns[i];
        (col.ty.is_integer() || col.serial).then_some(i)
    }

    /// Primary key column names, from either the column-level or the
    /// table-level declaration.
    pub fn primary_key_columns(&self) -> Vec<String> {
        let mut cols: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key())
            .map(|c| c.name.clone())
            .collect();
        for c in &self.constraints {
            if let TableConstraint::PrimaryKey(names) = c {
                cols.extend(names.iter().cloned());
            }
        }
        cols
    }

    /// Column sets that must be unique: the primary key plus every UNIQUE
    /// declaration. Drives the auto-created unique indexes.
    pub fn unique_column_sets(&self) -> Vec<Vec<String>> {
        let mut sets = Vec::new();
        let pk = self.primary_key_columns();
        if !pk.is_empty() {
            sets.push(pk);
        }
        for c in &self.columns {
            if c.is_unique() {
                sets.push(vec![c.name.clone()]);
            }
        }
        for c in &self.constraints {
            if let TableConstraint::Unique(names) = c {
                sets.push(names.clone());
            }
        }
        sets
    }

    pub fn table_checks(&self) -> impl Iterator<Item = &str> {
        self.constraints.iter().filter_map(|c| match c {
            TableConstraint::Check(sql) => Some(sql.as_str()),
            _ => None,
        })
    }

    pub fn table_foreign_keys(&self) -> impl Iterator<Item = (&[String], &ForeignKey)> {
        self.constraints.iter().filter_map(|c| match c {
            TableConstraint::ForeignKey { columns, fk } => Some((columns.as_slice(), fk)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    BTree,
    Hnsw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HnswParams {
    pub m: usize,
    pub ef_construction: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        HnswParams {
            m: 16,
            ef_construction: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub table: String,
    /// Column names, or expression SQL text for expression indexes.
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub unique: bool,
    /// Root page of the index B-tree; 0 for in-memory HNSW indexes.
    pub root_page: PageId,
    /// Partial-index predicate, stored as SQL text.
    pub predicate: Option<String>,
    pub hnsw: HnswParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewDef {
    pub name: String,
    pub sql: String,
    pub columns: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseKind {
    Abort,
    Ignore,
}

#[derive(Debug, Clone)]
pub enum TriggerAction {
    Statement(Statement),
    Raise(RaiseKind, Option<String>),
}

#[derive(Debug, Clone)]
pub struct TriggerDef {
    pub name: String,
    pub table: String,
    pub timing: TriggerTiming,
    pub event: TriggerEvent,
    /// Original CREATE TRIGGER text; actions are re-parsed from this when
    /// the catalog is loaded.
    pub sql: String,
    pub actions: Vec<TriggerAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_type_text_round_trip() {
        for ty in [
            ColumnType::SmallInt,
            ColumnType::Varchar(40),
            ColumnType::Char(8),
            ColumnType::Decimal {
                precision: 10,
                scale: 2,
            },
            ColumnType::Vector {
                dim: 3,
                normalize: false,
            },
            ColumnType::Guid,
        ] {
            assert_eq!(ColumnType::parse(&ty.to_string()), Some(ty));
        }
    }

    #[test]
    fn integer_pk_detection() {
        let schema = TableSchema {
            name: "t".into(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    ty: ColumnType::Int,
                    serial: false,
                    constraints: vec![ColumnConstraint::PrimaryKey],
                },
                ColumnSchema {
                    name: "name".into(),
                    ty: ColumnType::Text,
                    serial: false,
                    constraints: vec![],
                },
            ],
            constraints: vec![],
            root_page: 0,
            next_rowid: 1,
            max_integer_pk: 0,
        };
        assert_eq!(schema.integer_pk(), Some(0));
        assert_eq!(schema.unique_column_sets(), vec![vec!["id".to_string()]]);
    }
}
