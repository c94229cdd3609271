//! Page-oriented storage for micadb: a [`Pager`] over a single database
//! file, a [`BTree`] primitive keyed by byte strings, and the record codec
//! that maps rows to and from their stored form.
//!
//! The execution layer treats all three as collaborators with narrow
//! contracts: trees are identified by their root page, keys are opaque
//! ordered byte strings, and values are opaque payloads.

mod btree;
mod codec;
mod keycode;
mod pager;

pub use btree::{BCursor, BTree};
pub use codec::{decode_row, encode_row};
pub use keycode::{encode_index_key, rowid_from_key, rowid_key};
pub use pager::{PageId, Pager, SharedPager};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IOError: {0}")]
    Io(#[from] std::io::Error),
    #[error("page {0} out of bounds")]
    PageOutOfBounds(PageId),
    #[error("corrupt database image: {0}")]
    Corrupt(String),
    #[error("not a micadb database file")]
    BadMagic,
}

pub type Result<T> = std::result::Result<T, StorageError>;
