// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    backend::{Backend, BatchOp},
    Bytes,
};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

/// Auto-flush after this many buffered records
pub(crate) const BATCH_FLUSH_RECORDS: usize = 64;

/// Auto-flush after this many buffered value bytes
pub(crate) const BATCH_FLUSH_BYTES: usize = 4 * 1024 * 1024;

struct BatchInner {
    /// Pending operations, last write per key wins.
    ops: FxHashMap<Vec<u8>, Option<Bytes>>,
    bytes: usize,
}

/// Buffered puts and deletes, committed atomically
///
/// The batch flushes itself once it exceeds a record or byte threshold
/// ([`WriteBatch::check_flush`]); an explicit [`WriteBatch::commit`] is
/// final. Operations on distinct keys are order-independent; per key the
/// last buffered operation wins.
pub(crate) struct WriteBatch {
    backend: Arc<dyn Backend>,
    inner: Mutex<BatchInner>,
    flush_records: usize,
    flush_bytes: usize,
}

impl WriteBatch {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_thresholds(backend, BATCH_FLUSH_RECORDS, BATCH_FLUSH_BYTES)
    }

    pub fn with_thresholds(
        backend: Arc<dyn Backend>,
        flush_records: usize,
        flush_bytes: usize,
    ) -> Self {
        Self {
            backend,
            inner: Mutex::new(BatchInner {
                ops: FxHashMap::default(),
                bytes: 0,
            }),
            flush_records,
            flush_bytes,
        }
    }

    pub fn put(&self, key: Vec<u8>, value: &[u8]) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.bytes += key.len() + value.len();
            inner.ops.insert(key, Some(Bytes::new(value)));
        }
    }

    pub fn delete(&self, key: Vec<u8>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.bytes += key.len();
            inner.ops.insert(key, None);
        }
    }

    /// Flushes if the batch has grown past its thresholds.
    pub fn check_flush(&self) -> crate::Result<()> {
        let over = self
            .inner
            .lock()
            .map(|inner| inner.ops.len() >= self.flush_records || inner.bytes >= self.flush_bytes)
            .unwrap_or_default();

        if over {
            self.flush()?;
        }
        Ok(())
    }

    /// Commits all buffered operations atomically and clears the batch.
    pub fn flush(&self) -> crate::Result<()> {
        let ops: Vec<BatchOp> = {
            let Ok(mut inner) = self.inner.lock() else {
                return Err(crate::Error::Closed);
            };
            inner.bytes = 0;
            inner
                .ops
                .drain()
                .map(|(key, value)| match value {
                    Some(value) => BatchOp::Put { key, value },
                    None => BatchOp::Delete { key },
                })
                .collect()
        };

        if ops.is_empty() {
            return Ok(());
        }

        log::trace!("flushing batch of {} operations", ops.len());
        self.backend.commit(ops)
    }

    /// Final flush.
    pub fn commit(self) -> crate::Result<()> {
        self.flush()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::{memory::MemoryBackend, Reader};
    use test_log::test;

    #[test]
    fn batch_last_write_per_key_wins() {
        let backend = Arc::new(MemoryBackend::new());
        let batch = WriteBatch::new(backend.clone());

        batch.put(b"a".to_vec(), b"1");
        batch.put(b"a".to_vec(), b"2");
        batch.delete(b"b".to_vec());
        batch.put(b"b".to_vec(), b"3");
        batch.commit().unwrap();

        assert_eq!(b"2", &*backend.get(b"a").unwrap().unwrap());
        assert_eq!(b"3", &*backend.get(b"b").unwrap().unwrap());
    }

    #[test]
    fn batch_check_flush_respects_threshold() {
        let backend = Arc::new(MemoryBackend::new());
        let batch = WriteBatch::with_thresholds(backend.clone(), 4, usize::MAX);

        for i in 0..3u8 {
            batch.put(vec![i], b"x");
            batch.check_flush().unwrap();
        }
        assert!(backend.get(&[0]).unwrap().is_none());

        batch.put(vec![3], b"x");
        batch.check_flush().unwrap();
        assert!(backend.get(&[0]).unwrap().is_some());
        assert!(backend.get(&[3]).unwrap().is_some());
    }
}
