// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Backend, BatchOp, BoxedIter, Reader, ReadView};
use crate::{util::prefix_upper_bound, Bytes, Error};
use crossbeam_skiplist::SkipMap;
use std::{
    ops::Bound,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering::Acquire, Ordering::Release},
        Arc, Condvar, Mutex,
    },
};

/// Versioned key inside the skiplist
///
/// Multi-sorted by key bytes, then by *descending* sequence number, so the
/// first entry at or past `(key, read_seqno)` is the newest version visible
/// at `read_seqno`.
struct InternalKey {
    key: Bytes,
    seqno: u64,
}

impl InternalKey {
    fn new(key: &[u8], seqno: u64) -> Self {
        Self {
            key: Bytes::new(key),
            seqno,
        }
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.seqno == other.seqno && *self.key == *other.key
    }
}

impl Eq for InternalKey {}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&*self.key, std::cmp::Reverse(self.seqno))
            .cmp(&(&*other.key, std::cmp::Reverse(other.seqno)))
    }
}

struct Inner {
    /// Versioned items; a `None` value is a tombstone.
    items: SkipMap<InternalKey, Option<Bytes>>,

    /// Highest published (visible) sequence number.
    visible: AtomicU64,

    /// Serialises writers; the next seqno is derived under this lock.
    write_lock: Mutex<()>,

    /// Number of outstanding read views (and pinned iterators).
    views: Mutex<usize>,
    views_cv: Condvar,

    closed: AtomicBool,
}

impl Inner {
    fn check_open(&self) -> crate::Result<()> {
        if self.closed.load(Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Returns the newest version of `key` visible at `seqno`.
    ///
    /// `None`: key unknown; `Some(None)`: deleted; `Some(Some(_))`: present.
    fn read_at(&self, key: &[u8], seqno: u64) -> Option<Option<Bytes>> {
        let lower = InternalKey::new(key, seqno);

        self.items
            .range(lower..)
            .take_while(|entry| &*entry.key().key == key)
            .next()
            .map(|entry| entry.value().clone())
    }

    fn commit_at(&self, ops: Vec<BatchOp>) -> crate::Result<()> {
        self.check_open()?;

        let guard = self.write_lock.lock().map_err(|_| Error::Closed)?;
        let seqno = self.visible.load(Acquire) + 1;

        for op in &ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.items
                        .insert(InternalKey::new(key, seqno), Some(value.clone()));
                }
                BatchOp::Delete { key } => {
                    self.items.insert(InternalKey::new(key, seqno), None);
                }
            }
        }

        // Publishing the seqno makes the whole batch visible at once
        self.visible.store(seqno, Release);

        self.reclaim(&ops, seqno);

        drop(guard);
        Ok(())
    }

    /// Drops versions shadowed by `seqno`, when no read view can still
    /// observe them. Holding the views lock keeps new views out while old
    /// versions are unlinked.
    fn reclaim(&self, ops: &[BatchOp], seqno: u64) {
        let Ok(views) = self.views.lock() else {
            return;
        };
        if *views > 0 {
            return;
        }

        for op in ops {
            let (key, tombstone) = match op {
                BatchOp::Put { key, .. } => (key, false),
                BatchOp::Delete { key } => (key, true),
            };

            let stale: Vec<_> = self
                .items
                .range(InternalKey::new(key, seqno - 1)..)
                .take_while(|entry| &*entry.key().key == key.as_slice())
                .map(|entry| InternalKey {
                    key: entry.key().key.clone(),
                    seqno: entry.key().seqno,
                })
                .collect();

            for ikey in stale {
                self.items.remove(&ikey);
            }

            // Nothing shadowed: the tombstone itself can go too
            if tombstone {
                self.items.remove(&InternalKey::new(key, seqno));
            }
        }

        drop(views);
    }

    fn acquire_view(self: &Arc<Self>) -> crate::Result<ViewGuard> {
        self.check_open()?;

        let mut views = self.views.lock().map_err(|_| Error::Closed)?;
        *views += 1;
        drop(views);

        Ok(ViewGuard {
            inner: Arc::clone(self),
        })
    }
}

/// Keeps the view count up while a snapshot or pinned iterator is alive
struct ViewGuard {
    inner: Arc<Inner>,
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        if let Ok(mut views) = self.inner.views.lock() {
            *views = views.saturating_sub(1);
        }
        self.inner.views_cv.notify_all();
    }
}

/// MVCC range iterator: yields the newest visible version per key,
/// hiding tombstones
struct MvccIter<'a> {
    entries: Box<dyn Iterator<Item = (Bytes, u64, Option<Bytes>)> + 'a>,
    read_seqno: u64,
    current_key: Option<Bytes>,
    closed: &'a AtomicBool,
    done: bool,

    /// Keeps the backend from finishing `close` under us.
    _guard: ViewGuard,
}

impl Iterator for MvccIter<'_> {
    type Item = crate::Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.closed.load(Acquire) {
            self.done = true;
            return Some(Err(Error::Closed));
        }

        loop {
            let (key, seqno, value) = self.entries.next()?;

            if seqno > self.read_seqno {
                continue;
            }

            if self
                .current_key
                .as_ref()
                .is_some_and(|current| **current == *key)
            {
                continue;
            }

            self.current_key = Some(key.clone());

            match value {
                // Tombstone: the key does not exist at this seqno
                None => continue,
                Some(value) => return Some(Ok((key, value))),
            }
        }
    }
}

fn range_iter<'a>(
    inner: &'a Inner,
    guard: ViewGuard,
    start: &[u8],
    end: Option<&[u8]>,
    read_seqno: u64,
) -> BoxedIter<'a> {
    let lower = Bound::Included(InternalKey::new(start, u64::MAX));
    let upper = match end {
        Some(end) => Bound::Excluded(InternalKey::new(end, u64::MAX)),
        None => Bound::Unbounded,
    };

    let entries = inner.items.range((lower, upper)).map(|entry| {
        (
            entry.key().key.clone(),
            entry.key().seqno,
            entry.value().clone(),
        )
    });

    Box::new(MvccIter {
        entries: Box::new(entries),
        read_seqno,
        current_key: None,
        closed: &inner.closed,
        done: false,
        _guard: guard,
    })
}

fn prefix_iter<'a>(
    inner: &'a Inner,
    guard: ViewGuard,
    prefix: &[u8],
    read_seqno: u64,
) -> BoxedIter<'a> {
    let end = prefix_upper_bound(prefix);
    range_iter(inner, guard, prefix, end.as_deref(), read_seqno)
}

/// An ordered in-memory key/value store with MVCC snapshots
///
/// Every committed batch publishes one sequence number; read views pin the
/// sequence number current at their creation and stay consistent for their
/// whole lifetime. Intended for tests and as the reference implementation
/// of the [`Backend`] contract.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                items: SkipMap::new(),
                visible: AtomicU64::new(0),
                write_lock: Mutex::new(()),
                views: Mutex::new(0),
                views_cv: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of live (visible) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let seqno = self.inner.visible.load(Acquire);
        let Ok(guard) = self.inner.acquire_view() else {
            return 0;
        };
        range_iter(&self.inner, guard, &[], None, seqno).count()
    }

    /// Returns `true` if no live keys exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Reader for MemoryBackend {
    fn get(&self, key: &[u8]) -> crate::Result<Option<Bytes>> {
        // The guard keeps version reclamation out while we read
        let guard = self.inner.acquire_view()?;
        let seqno = self.inner.visible.load(Acquire);
        let value = self.inner.read_at(key, seqno).flatten();
        drop(guard);
        Ok(value)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> crate::Result<BoxedIter<'_>> {
        let guard = self.inner.acquire_view()?;
        let seqno = self.inner.visible.load(Acquire);
        Ok(prefix_iter(&self.inner, guard, prefix, seqno))
    }

    fn iter_range(&self, start: &[u8], end: Option<&[u8]>) -> crate::Result<BoxedIter<'_>> {
        let guard = self.inner.acquire_view()?;
        let seqno = self.inner.visible.load(Acquire);
        Ok(range_iter(&self.inner, guard, start, end, seqno))
    }
}

impl Backend for MemoryBackend {
    fn put(&self, key: &[u8], value: &[u8]) -> crate::Result<()> {
        self.inner.commit_at(vec![BatchOp::Put {
            key: key.to_vec(),
            value: Bytes::new(value),
        }])
    }

    fn delete(&self, key: &[u8]) -> crate::Result<()> {
        self.inner
            .commit_at(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn snapshot(&self) -> crate::Result<Box<dyn ReadView>> {
        let guard = self.inner.acquire_view()?;
        let seqno = self.inner.visible.load(Acquire);

        Ok(Box::new(MemoryReadView {
            guard,
            seqno,
        }))
    }

    fn commit(&self, ops: Vec<BatchOp>) -> crate::Result<()> {
        self.inner.commit_at(ops)
    }

    fn close(&self) -> crate::Result<()> {
        self.inner.closed.store(true, Release);

        let mut views = self.inner.views.lock().map_err(|_| Error::Closed)?;
        while *views > 0 {
            views = self
                .inner
                .views_cv
                .wait(views)
                .map_err(|_| Error::Closed)?;
        }
        drop(views);

        log::trace!("memory backend closed");
        Ok(())
    }
}

/// Read view pinned at a fixed sequence number
struct MemoryReadView {
    guard: ViewGuard,
    seqno: u64,
}

impl Reader for MemoryReadView {
    fn get(&self, key: &[u8]) -> crate::Result<Option<Bytes>> {
        Ok(self.guard.inner.read_at(key, self.seqno).flatten())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> crate::Result<BoxedIter<'_>> {
        let guard = self.guard.inner.acquire_view()?;
        Ok(prefix_iter(&self.guard.inner, guard, prefix, self.seqno))
    }

    fn iter_range(&self, start: &[u8], end: Option<&[u8]>) -> crate::Result<BoxedIter<'_>> {
        let guard = self.guard.inner.acquire_view()?;
        Ok(range_iter(&self.guard.inner, guard, start, end, self.seqno))
    }
}

impl ReadView for MemoryReadView {}
