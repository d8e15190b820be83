//! An embedded, single-writer/multi-reader, transactional key-value store
//! whose on-disk page and meta-page layout is binary-compatible with
//! libmdbx: the same 20-byte page header, node codec, two-slot meta-page
//! protocol, and copy-on-write B+tree discipline.
//!
//! A process opens one [`env::Environment`], reads through any number of
//! concurrent [`txn::ReadTxn`] snapshots, and writes through the single
//! [`txn::WriteTxn`] at a time the environment allows. Named sub-databases
//! ([`dbi::Dbi`]) are plain or DUPSORT B+trees reached through
//! `open_dbi`/`get`/`put`/`del`, or through a [`cursor::Cursor`] for
//! ordered traversal and duplicate-aware navigation.

pub mod bitmap;
pub mod btree;
pub mod cursor;
pub mod dbi;
pub mod dirty;
pub mod env;
pub mod error;
pub mod flags;
pub mod gc;
pub mod mmap;
pub mod page;
pub mod txn;

pub use btree::Tree;
pub use cursor::{Cursor, Op};
pub use dbi::Dbi;
pub use env::{EnvBuilder, Environment};
pub use error::{Error, Result};
pub use txn::{ReadTxn, WriteTxn};
