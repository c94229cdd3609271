//! The SQL value model shared by every layer of micadb.
//!
//! A [`Value`] is a tagged union over every type the engine can store or
//! compute. Rows are plain `Vec<Value>`; the storage codec, the executor and
//! the catalog all traffic in these.

mod key;
mod value;

pub use key::{KeyValue, RowKey};
pub use value::{IntWidth, TextKind, Value, ValueClass};

/// An ordered sequence of values, indexed by column position.
pub type Row = Vec<Value>;
