//! The micadb execution engine.
//!
//! Given SQL text and a database handle, this crate parses, plans and runs
//! DDL, DML, queries and transaction statements, persisting table and index
//! data through the page-oriented storage layer in `micadb-storage`.

pub mod db;
pub mod error;
pub mod exec;
pub mod plan;
pub mod sql;

pub use db::database::{Database, DatabaseOptions};
pub use error::DBError;
pub use sql::execute::StmtResult;
