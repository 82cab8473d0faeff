//! # Tanager — MVCC storage-engine core
//!
//! Tanager implements the core storage primitives of an MVCC table/index
//! layer that sits beneath a relational query executor:
//!
//! - **Bulk B-tree builder**: streams a pre-sorted tuple sequence into a
//!   packed on-disk tree, built bottom-up one page at a time with no random
//!   I/O ([`btree::build`]).
//! - **Fixed-stride descent fast path**: a lock-free, allocation-free
//!   in-page search for non-leaf pages with fixed-width keys
//!   ([`btree::fastpath`]).
//! - **Block buffer cache**: a small shared pool mapping `(tag, block)`
//!   identities onto segmented, versioned files with read-time upgrade
//!   callbacks ([`buffers`]).
//!
//! Supporting pieces — page layout with chunked item storage, the two tuple
//! formats, index descriptors, and the external sorter feeding the builder —
//! live in their own modules. The crate is a library hosted inside a larger
//! database process; it has no CLI and no network surface.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tanager::btree::build::BuildState;
//! use tanager::btree::io::SegmentManager;
//! use tanager::buffers::{BufferCache, BufferCacheOptions, BufferTag, FileTemplate, TagConfig};
//! use tanager::descr::{IndexDescriptor, IndexField, IndexKind};
//! use tanager::io::StdVfs;
//! use tanager::types::{ColumnKind, Datum, RelOids, BLCKSZ};
//!
//! # fn main() -> tanager::Result<()> {
//! let cache = Arc::new(BufferCache::new(
//!     BufferCacheOptions {
//!         buffers_count: 64,
//!         single_file_size: 1024 * BLCKSZ as u64,
//!         tags: vec![TagConfig::new(FileTemplate::new("data/rel-%08X%08X"))],
//!     },
//!     Arc::new(StdVfs),
//! )?);
//! let desc = Arc::new(IndexDescriptor::new(
//!     "orders_pkey",
//!     RelOids { datoid: 1, relnode: 1 },
//!     IndexKind::Primary,
//!     vec![IndexField::new(ColumnKind::Int64)],
//!     1,
//! )?);
//! let smgr = SegmentManager::open(Arc::clone(&cache), BufferTag(0), 0);
//! let mut build = BuildState::start(Arc::clone(&desc), smgr, 0, 0);
//! for key in 0..1000i64 {
//!     build.add_tuple(&desc.form_leaf_tuple(&[Datum::from_i64(key)])?)?;
//! }
//! let header = build.finish()?;
//! assert!(header.leaf_pages_num >= 1);
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod buffers;
pub mod descr;
pub mod error;
pub mod io;
pub mod logging;
pub mod page;
pub mod sort;
pub mod tuple;
pub mod types;

pub use crate::error::{EngineError, Result};
