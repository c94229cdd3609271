use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Table with name `{0}` already exists.")]
    Exist(String),
    #[error("Table with name `{0}` not found.")]
    NotFound(String),
    #[error("Column `{0}.{1}` not found.")]
    ColumnNotFound(String, String),
    #[error("Column with name `{0}` already exists.")]
    DuplicateColumnName(String),
    #[error("Cannot drop column `{0}`: {1}.")]
    CannotDropColumn(String, String),
    #[error("View with name `{0}` already exists.")]
    ViewExist(String),
    #[error("View with name `{0}` not found.")]
    ViewNotFound(String),
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index with name `{0}` already exists.")]
    Exist(String),
    #[error("Index with name `{0}` not found.")]
    NotFound(String),
    #[error("UNIQUE constraint failed: {index} (value: {value})")]
    UniqueViolation { index: String, value: String },
    #[error("no HNSW index on `{table}.{column}`")]
    HnswMissing { table: String, column: String },
}

#[derive(Error, Debug)]
pub enum ConstraintError {
    #[error("NOT NULL constraint failed: {table}.{column}")]
    NotNull { table: String, column: String },
    #[error("PRIMARY KEY must not be NULL: {table}.{column}")]
    PrimaryKeyNull { table: String, column: String },
    #[error("CHECK constraint failed: {0}")]
    Check(String),
    #[error("FOREIGN KEY constraint failed: {table}.{column} -> {ref_table}.{ref_column}")]
    ForeignKey {
        table: String,
        column: String,
        ref_table: String,
        ref_column: String,
    },
    #[error("vector dimension mismatch for {column}: expected {expected}, got {got}")]
    VectorDimension {
        column: String,
        expected: usize,
        got: usize,
    },
    #[error("value too long for {column}: VARCHAR({limit}) got length {len}")]
    VarcharOverflow { column: String, limit: u32, len: usize },
    #[error("integer out of range for {column} ({ty})")]
    IntRange { column: String, ty: String },
    #[error("numeric overflow for {column}: DECIMAL({precision},{scale})")]
    DecimalOverflow {
        column: String,
        precision: u8,
        scale: u8,
    },
    #[error("invalid GUID for {column}: `{value}`")]
    GuidFormat { column: String, value: String },
    #[error("type mismatch for {column}: expected {expected}, got {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Trigger with name `{0}` already exists.")]
    Exist(String),
    #[error("Trigger with name `{0}` not found.")]
    NotFound(String),
    #[error("trigger abort: {0}")]
    Abort(String),
    /// Control-flow marker for `RAISE(IGNORE)`; never surfaced to callers.
    #[error("RAISE(IGNORE)")]
    Ignore,
}

#[derive(Error, Debug)]
pub enum TxError {
    #[error("cannot start a transaction within a transaction")]
    AlreadyActive,
    #[error("no active transaction for {0}")]
    NoActive(&'static str),
    #[error("no such savepoint: {0}")]
    UnknownSavepoint(String),
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("scalar subquery returned {0} rows")]
    ScalarSubqueryRows(usize),
    #[error("LIMIT/OFFSET: expected literal")]
    LimitNotLiteral,
    #[error("unknown set operator: {0}")]
    UnknownSetOperator(String),
    #[error("unknown CTE: {0}")]
    UnknownCte(String),
    #[error("recursive CTE column mismatch: expected {expected}, got {got}")]
    RecursiveCteColumns { expected: usize, got: usize },
    #[error("ON DELETE/UPDATE SET DEFAULT is not supported")]
    SetDefaultUnsupported,
    #[error("unknown table function: {0}")]
    UnknownTableFunction(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("wrong argument to {function}: {message}")]
    BadArgument { function: String, message: String },
    #[error("division by zero")]
    DivisionByZero,
}

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Unsupported feature: `{feature}`")]
    Unsupported { feature: String },
    #[error("Unknown table: `{table}`")]
    UnknownTable { table: String },
    #[error("Unknown column: `{column}`")]
    UnknownColumn { column: String },
    #[error("Plan error: `{0}`")]
    Unstructured(String),
}

#[derive(Error, Debug)]
pub enum DBError {
    #[error("TableError: {0}")]
    Table(#[from] TableError),
    #[error("IndexError: {0}")]
    Index(#[from] IndexError),
    #[error("ConstraintError: {0}")]
    Constraint(#[from] ConstraintError),
    #[error("TriggerError: {0}")]
    Trigger(#[from] TriggerError),
    #[error("TxError: {0}")]
    Tx(#[from] TxError),
    #[error("RuntimeError: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("PlanError: {0}")]
    Plan(#[from] PlanError),
    #[error("StorageError: {0}")]
    Storage(#[from] micadb_storage::StorageError),
    #[error("SqlParserError: {error}, executing: `{sql}`")]
    SqlParser {
        sql: String,
        error: sqlparser::parser::ParserError,
    },
    #[error("unsupported statement: {0}")]
    UnsupportedStatement(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DBError {
    /// Whether this error is the `RAISE(IGNORE)` control-flow marker.
    pub(crate) fn is_trigger_ignore(&self) -> bool {
        matches!(self, DBError::Trigger(TriggerError::Ignore))
    }
}
