// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A replicated file-index engine for peer-to-peer file synchronisation.
//!
//! Each participating node keeps, per *folder*, authoritative metadata
//! about every file version held by every known peer, including itself.
//! From those per-device views the engine derives the *global* view (the
//! winning version per file name across the cluster) and, for any device,
//! the *need* list (what that device lacks relative to the global view).
//!
//! State lives in an ordered key/value store behind the [`Backend`]
//! contract; an MVCC in-memory implementation ([`MemoryBackend`]) ships
//! with the crate. Writers are serialised per folder, readers get
//! consistent point-in-time [`Snapshot`]s and never block writers.
//!
//! # Example usage
//!
//! ```
//! use std::sync::Arc;
//! use sync_index::{Database, DeviceId, FileInfo, MemoryBackend, Vector};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let db = Database::open(backend)?;
//!
//! // One FileSet per replicated folder
//! let files = db.new_file_set("default")?;
//!
//! let file = FileInfo {
//!     name: "docs/readme.md".into(),
//!     size: 1_024,
//!     version: Vector::new().update(1),
//!     ..FileInfo::default()
//! };
//! files.update(&DeviceId::LOCAL, vec![file])?;
//!
//! // Queries run against a consistent snapshot
//! let snapshot = files.snapshot()?;
//! assert_eq!(1, snapshot.local_size().files);
//! assert!(snapshot.get(&DeviceId::LOCAL, "docs/readme.md")?.is_some());
//! snapshot.release();
//! #
//! # Ok::<(), sync_index::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]

pub mod backend;

mod batch;
mod blockmap;
mod coding;
mod database;
mod device;
mod error;
mod file_info;
mod fileset;
mod keyer;
mod meta;
mod mtimes;
mod schema;
mod small_index;
mod snapshot;
mod transactions;
mod util;
mod vector;
mod version_list;

/// Cheaply cloneable immutable byte buffer, used for backend keys and values
pub type Bytes = byteview::ByteView;

pub use {
    backend::{memory::MemoryBackend, Backend, BatchOp, BoxedIter, KvPair, Reader, ReadView},
    blockmap::BlockFinder,
    coding::{Decode, DecodeError, Encode, EncodeError},
    database::Database,
    device::{DeviceId, ShortId},
    error::{Error, Result},
    file_info::{
        AnyFile, BlockInfo, FileInfo, FileInfoTruncated, FileLike, FileType,
        FLAG_LOCAL_IGNORED, FLAG_LOCAL_MUST_RESCAN, FLAG_LOCAL_RECEIVE_ONLY,
        FLAG_LOCAL_UNSUPPORTED, LOCAL_ALL_FLAGS, LOCAL_INVALID_FLAGS,
    },
    fileset::{FileSet, IndexId},
    meta::Counts,
    mtimes::{Mtime, MtimeFs},
    schema::update_schema,
    snapshot::Snapshot,
    util::RECHECK_INTERVAL_ENV,
    vector::{Causality, Counter, Vector},
    version_list::{FileVersion, VersionList},
};
