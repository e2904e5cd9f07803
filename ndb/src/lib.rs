//!
//! An embedded database for package headers and their secondary indexes.
//!
//! The database home directory contains two files: `Packages.db`, a
//! slot-indexed blob store keyed by a monotonically increasing package id,
//! and `Index.db`, a container of variable-size sub-blobs, each holding one
//! open-addressing hash index. Three engines cooperate:
//!
//! - [`pkgdb::PkgDb`] stores one opaque blob per package id.
//! - [`xdb::Xdb`] stores sub-blobs addressed by a (tag, subtag) pair and
//!   keeps client memory mappings valid across relocations.
//! - [`idxdb::IdxDb`] maps opaque keys to sets of (package id, tag index)
//!   pairs, stored inside one XDB sub-blob.
//!
//! The [`db`] module wraps all three into the cursor-oriented interface
//! that header iteration and tag lookup consume.
//!
//! Handles are single-threaded by design; cross-process coordination uses
//! one advisory file lock on `Packages.db` (see [`pkgdb::PkgDb::lock`]).
//!

pub mod db;
pub mod error;
pub mod idxdb;
mod mmap;
pub mod pkgdb;
pub mod xdb;

pub use db::{Cursor, Db, Env, SearchType};
pub use error::{Error, Result};
