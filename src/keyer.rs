// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bijective encoding of logical tuples into ordered byte keys.
//!
//! Every key starts with a one-byte type tag. Folder and device strings
//! are interned into 4-byte big-endian ids (see [`SmallIndex`]); names are
//! appended raw, so keys within one keyspace sort by `(folder, device,
//! name)`, `(folder, name)`, `(folder, hash, name)` or `(folder, seqno)`
//! respectively.

use crate::{
    backend::Backend,
    device::DeviceId,
    small_index::SmallIndex,
};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

/// Device-file records: `t ∥ folder(4) ∥ device(4) ∥ name`
pub(crate) const KT_DEVICE_FILE: u8 = 0;

/// Global version lists: `t ∥ folder(4) ∥ name`
pub(crate) const KT_GLOBAL: u8 = 1;

/// Block map: `t ∥ folder(4) ∥ hash(32) ∥ name`
pub(crate) const KT_BLOCK_MAP: u8 = 2;

/// Sequence log: `t ∥ folder(4) ∥ seqno(8)`
pub(crate) const KT_SEQUENCE: u8 = 3;

/// Need set (local device): `t ∥ folder(4) ∥ name`
pub(crate) const KT_NEED: u8 = 4;

/// Index ids: `t ∥ device(4) ∥ folder(4)`
pub(crate) const KT_INDEX_ID: u8 = 5;

/// Folder interner: `t ∥ id(4)`
pub(crate) const KT_FOLDER_IDX: u8 = 6;

/// Device interner: `t ∥ id(4)`
pub(crate) const KT_DEVICE_IDX: u8 = 7;

/// Folder metadata (counts set): `t ∥ folder(4)`
pub(crate) const KT_FOLDER_META: u8 = 8;

/// Mtime mappings: `t ∥ folder(4) ∥ name`
pub(crate) const KT_MTIMES: u8 = 9;

/// Free-form singletons: `t ∥ name`
pub(crate) const KT_MISC: u8 = 10;

/// Length of the 32-byte block hashes inside block-map keys.
pub(crate) const BLOCK_HASH_LEN: usize = 32;

fn with_ids(key_type: u8, ids: &[u32], tail: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + ids.len() * 4 + tail.len());
    key.push(key_type);
    for id in ids {
        key.extend_from_slice(&id.to_be_bytes());
    }
    key.extend_from_slice(tail);
    key
}

/// Interner entry key: `t ∥ id(4)`.
pub(crate) fn idx_key(key_type: u8, id: u32) -> Vec<u8> {
    with_ids(key_type, &[id], &[])
}

pub(crate) fn device_file_key(folder: u32, device: u32, name: &[u8]) -> Vec<u8> {
    with_ids(KT_DEVICE_FILE, &[folder, device], name)
}

/// Prefix over all devices and names of a folder.
pub(crate) fn device_file_folder_prefix(folder: u32) -> Vec<u8> {
    with_ids(KT_DEVICE_FILE, &[folder], &[])
}

/// Prefix over all names of one (folder, device).
pub(crate) fn device_file_prefix(folder: u32, device: u32) -> Vec<u8> {
    with_ids(KT_DEVICE_FILE, &[folder, device], &[])
}

pub(crate) fn device_file_key_device(key: &[u8]) -> Option<u32> {
    key.get(5..9).map(BigEndian::read_u32)
}

pub(crate) fn device_file_key_name(key: &[u8]) -> &[u8] {
    key.get(9..).unwrap_or_default()
}

pub(crate) fn global_key(folder: u32, name: &[u8]) -> Vec<u8> {
    with_ids(KT_GLOBAL, &[folder], name)
}

pub(crate) fn global_prefix(folder: u32) -> Vec<u8> {
    with_ids(KT_GLOBAL, &[folder], &[])
}

pub(crate) fn global_key_name(key: &[u8]) -> &[u8] {
    key.get(5..).unwrap_or_default()
}

pub(crate) fn block_map_key(folder: u32, hash: &[u8], name: &[u8]) -> Vec<u8> {
    let mut key = with_ids(KT_BLOCK_MAP, &[folder], hash);
    key.extend_from_slice(name);
    key
}

pub(crate) fn block_map_prefix(folder: u32) -> Vec<u8> {
    with_ids(KT_BLOCK_MAP, &[folder], &[])
}

pub(crate) fn block_map_hash_prefix(folder: u32, hash: &[u8]) -> Vec<u8> {
    with_ids(KT_BLOCK_MAP, &[folder], hash)
}

pub(crate) fn block_map_key_name(key: &[u8]) -> &[u8] {
    key.get(5 + BLOCK_HASH_LEN..).unwrap_or_default()
}

pub(crate) fn sequence_key(folder: u32, seqno: u64) -> Vec<u8> {
    with_ids(KT_SEQUENCE, &[folder], &seqno.to_be_bytes())
}

pub(crate) fn sequence_prefix(folder: u32) -> Vec<u8> {
    with_ids(KT_SEQUENCE, &[folder], &[])
}

pub(crate) fn sequence_key_seqno(key: &[u8]) -> Option<u64> {
    key.get(5..13).map(BigEndian::read_u64)
}

pub(crate) fn need_key(folder: u32, name: &[u8]) -> Vec<u8> {
    with_ids(KT_NEED, &[folder], name)
}

pub(crate) fn need_prefix(folder: u32) -> Vec<u8> {
    with_ids(KT_NEED, &[folder], &[])
}

pub(crate) fn need_key_name(key: &[u8]) -> &[u8] {
    key.get(5..).unwrap_or_default()
}

pub(crate) fn index_id_key(device: u32, folder: u32) -> Vec<u8> {
    with_ids(KT_INDEX_ID, &[device, folder], &[])
}

pub(crate) fn index_id_prefix() -> Vec<u8> {
    vec![KT_INDEX_ID]
}

pub(crate) fn index_id_key_folder(key: &[u8]) -> Option<u32> {
    key.get(5..9).map(BigEndian::read_u32)
}

pub(crate) fn folder_meta_key(folder: u32) -> Vec<u8> {
    with_ids(KT_FOLDER_META, &[folder], &[])
}

pub(crate) fn mtimes_key(folder: u32, name: &[u8]) -> Vec<u8> {
    with_ids(KT_MTIMES, &[folder], name)
}

pub(crate) fn mtimes_prefix(folder: u32) -> Vec<u8> {
    with_ids(KT_MTIMES, &[folder], &[])
}

pub(crate) fn misc_key(name: &[u8]) -> Vec<u8> {
    with_ids(KT_MISC, &[], name)
}

/// Interners for folder and device strings, shared by all folders
pub(crate) struct Keyer {
    folders: SmallIndex,
    devices: SmallIndex,
}

impl Keyer {
    /// Rebuilds both interners by prefix scan.
    pub fn load(backend: &Arc<dyn Backend>) -> crate::Result<Self> {
        Ok(Self {
            folders: SmallIndex::load(backend.clone(), KT_FOLDER_IDX)?,
            devices: SmallIndex::load(backend.clone(), KT_DEVICE_IDX)?,
        })
    }

    pub fn folder_id(&self, folder: &str) -> crate::Result<u32> {
        self.folders.id(folder.as_bytes())
    }

    pub fn folder_id_if_exists(&self, folder: &str) -> Option<u32> {
        self.folders.id_if_exists(folder.as_bytes())
    }

    pub fn folder_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .folders
            .values()
            .into_iter()
            .filter_map(|v| String::from_utf8(v).ok())
            .collect();
        names.sort();
        names
    }

    pub fn forget_folder(&self, folder: &str) -> crate::Result<()> {
        self.folders.delete(folder.as_bytes())
    }

    pub fn device_idx(&self, device: &DeviceId) -> crate::Result<u32> {
        self.devices.id(device.as_bytes())
    }

    pub fn device_idx_if_exists(&self, device: &DeviceId) -> Option<u32> {
        self.devices.id_if_exists(device.as_bytes())
    }

    pub fn device_for(&self, idx: u32) -> Option<DeviceId> {
        self.devices.val(idx).and_then(|v| DeviceId::from_slice(&v))
    }
}
