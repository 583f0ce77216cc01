// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{backend::Backend, keyer};
use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

struct IndexInner {
    id_to_val: FxHashMap<u32, Vec<u8>>,
    val_to_id: FxHashMap<Vec<u8>, u32>,
    next_id: u32,
}

/// Two-way mapping between arbitrary byte strings and stable small
/// integer ids, persisted in a dedicated keyspace
///
/// Ids are allocated sequentially and never reused within one database.
/// The in-memory side is rebuilt by a prefix scan at startup. Allocation
/// writes through to the backend immediately, outside any transaction, so
/// ids referenced from batched writes always exist on disk first.
pub(crate) struct SmallIndex {
    backend: Arc<dyn Backend>,
    key_type: u8,
    inner: Mutex<IndexInner>,
}

impl SmallIndex {
    /// Loads the index for `key_type` by scanning its keyspace.
    pub fn load(backend: Arc<dyn Backend>, key_type: u8) -> crate::Result<Self> {
        let mut id_to_val = FxHashMap::default();
        let mut val_to_id = FxHashMap::default();
        let mut next_id = 0;

        {
            let iter = backend.iter_prefix(&[key_type])?;
            for kv in iter {
                let (key, value) = kv?;

                let Some(raw_id) = key.get(1..5) else {
                    log::warn!("skipping malformed index key of length {}", key.len());
                    continue;
                };

                let id = BigEndian::read_u32(raw_id);
                id_to_val.insert(id, value.to_vec());
                val_to_id.insert(value.to_vec(), id);
                next_id = next_id.max(id + 1);
            }
        }

        log::debug!(
            "loaded {} interned values for keyspace {key_type}",
            id_to_val.len()
        );

        Ok(Self {
            backend,
            key_type,
            inner: Mutex::new(IndexInner {
                id_to_val,
                val_to_id,
                next_id,
            }),
        })
    }

    /// Returns the id for `val`, allocating and persisting one if needed.
    pub fn id(&self, val: &[u8]) -> crate::Result<u32> {
        let mut inner = self.inner.lock().map_err(|_| crate::Error::Closed)?;

        if let Some(id) = inner.val_to_id.get(val) {
            return Ok(*id);
        }

        let id = inner.next_id;
        self.backend.put(&keyer::idx_key(self.key_type, id), val)?;

        inner.next_id += 1;
        inner.id_to_val.insert(id, val.to_vec());
        inner.val_to_id.insert(val.to_vec(), id);

        log::trace!("interned value as id {id} in keyspace {}", self.key_type);
        Ok(id)
    }

    /// Returns the id for `val` without allocating.
    pub fn id_if_exists(&self, val: &[u8]) -> Option<u32> {
        let inner = self.inner.lock().ok()?;
        inner.val_to_id.get(val).copied()
    }

    /// Returns the value for `id`, if known.
    pub fn val(&self, id: u32) -> Option<Vec<u8>> {
        let inner = self.inner.lock().ok()?;
        inner.id_to_val.get(&id).cloned()
    }

    /// All interned values.
    pub fn values(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .map(|inner| inner.id_to_val.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets `val`, removing it from memory and the backend.
    ///
    /// Its id is not reused.
    pub fn delete(&self, val: &[u8]) -> crate::Result<()> {
        let mut inner = self.inner.lock().map_err(|_| crate::Error::Closed)?;

        if let Some(id) = inner.val_to_id.remove(val) {
            inner.id_to_val.remove(&id);
            self.backend.delete(&keyer::idx_key(self.key_type, id))?;
        }

        Ok(())
    }
}
