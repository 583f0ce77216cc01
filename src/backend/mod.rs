// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod memory;

use crate::Bytes;

/// KV-tuple, typically yielded by an iterator
pub type KvPair = (Bytes, Bytes);

/// Boxed key-order iterator over KV-tuples
pub type BoxedIter<'a> = Box<dyn Iterator<Item = crate::Result<KvPair>> + 'a>;

/// Read-only access to an ordered keyspace
pub trait Reader {
    /// Point lookup.
    ///
    /// A missing key is `Ok(None)`, not an error.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn get(&self, key: &[u8]) -> crate::Result<Option<Bytes>>;

    /// Iterates all keys starting with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn iter_prefix(&self, prefix: &[u8]) -> crate::Result<BoxedIter<'_>>;

    /// Iterates the key range `[start, end)`, in key order.
    ///
    /// `None` for `end` means unbounded.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn iter_range(&self, start: &[u8], end: Option<&[u8]>) -> crate::Result<BoxedIter<'_>>;
}

/// A pinned point-in-time image of the keyspace
///
/// The view is released when dropped. The backend will not finish closing
/// while views are outstanding.
pub trait ReadView: Reader + Send + Sync {}

/// A single buffered write operation
#[derive(Debug)]
pub enum BatchOp {
    /// Insert or replace a key
    Put {
        /// Key bytes
        key: Vec<u8>,
        /// Value bytes
        value: Bytes,
    },

    /// Remove a key
    Delete {
        /// Key bytes
        key: Vec<u8>,
    },
}

/// Contract over an ordered key/value store
///
/// Point reads and iterations observe the latest committed state; use
/// [`Backend::snapshot`] for a stable view. Batches commit atomically:
/// a concurrent reader sees either none or all of a batch.
pub trait Backend: Reader + Send + Sync {
    /// Inserts or replaces a single key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn put(&self, key: &[u8], value: &[u8]) -> crate::Result<()>;

    /// Removes a single key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn delete(&self, key: &[u8]) -> crate::Result<()>;

    /// Pins a point-in-time read view.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn snapshot(&self) -> crate::Result<Box<dyn ReadView>>;

    /// Applies a batch of writes atomically.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    fn commit(&self, ops: Vec<BatchOp>) -> crate::Result<()>;

    /// Shuts the backend down.
    ///
    /// Blocks until all outstanding read views are released; every call
    /// after this returns `Error::Closed`.
    ///
    /// # Errors
    ///
    /// Backend-specific shutdown failures.
    fn close(&self) -> crate::Result<()>;
}
