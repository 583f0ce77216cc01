// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Read and read/write transactions over the backend.
//!
//! A read transaction wraps a pinned backend view. A read/write
//! transaction adds a write batch: reads keep observing the state at
//! transaction start, writes accumulate in the batch and become visible
//! to others only at (checkpoint or final) commit. One logical writer per
//! folder is assumed; each file name is touched at most once per
//! transaction.

use crate::{
    backend::{Backend, BoxedIter, Reader, ReadView},
    batch::WriteBatch,
    coding::{Decode, Encode},
    device::DeviceId,
    file_info::{AnyFile, FileInfo, FileInfoTruncated, FileLike},
    keyer,
    meta::MetadataTracker,
    version_list::{FileVersion, ListChange, VersionList},
    Bytes,
};
use std::sync::Arc;

/// Read-only transaction: a pinned point-in-time view plus typed readers
pub(crate) struct ReadTxn {
    view: Box<dyn ReadView>,
}

impl ReadTxn {
    pub fn new(backend: &Arc<dyn Backend>) -> crate::Result<Self> {
        Ok(Self {
            view: backend.snapshot()?,
        })
    }

    pub fn get(&self, key: &[u8]) -> crate::Result<Option<Bytes>> {
        self.view.get(key)
    }

    pub fn iter_prefix(&self, prefix: &[u8]) -> crate::Result<BoxedIter<'_>> {
        self.view.iter_prefix(prefix)
    }

    pub fn iter_range(&self, start: &[u8], end: Option<&[u8]>) -> crate::Result<BoxedIter<'_>> {
        self.view.iter_range(start, end)
    }

    /// Reads and decodes a device-file entry, full or truncated.
    ///
    /// Undecodable values are logged and reported as absent; the record
    /// will be dropped by the next repair pass.
    pub fn get_file_trunc(&self, key: &[u8], truncate: bool) -> crate::Result<Option<AnyFile>> {
        let Some(raw) = self.view.get(key)? else {
            return Ok(None);
        };

        let decoded = if truncate {
            FileInfoTruncated::decode_from_slice(&raw).map(AnyFile::Truncated)
        } else {
            FileInfo::decode_from_slice(&raw).map(AnyFile::Full)
        };

        match decoded {
            Ok(file) => Ok(Some(file)),
            Err(e) => {
                log::warn!("skipping undecodable file entry: {e}");
                Ok(None)
            }
        }
    }

    /// Reads and decodes a version list.
    pub fn get_version_list(&self, key: &[u8]) -> crate::Result<Option<VersionList>> {
        let Some(raw) = self.view.get(key)? else {
            return Ok(None);
        };

        match VersionList::decode_from_slice(&raw) {
            Ok(vl) => Ok(Some(vl)),
            Err(e) => {
                log::warn!("skipping undecodable version list: {e}");
                Ok(None)
            }
        }
    }
}

/// Whether the local device needs the global head of one name.
///
/// The head is needed iff it is valid, carries a real version, is not a
/// deletion the device never saw, and causally dominates the device's own
/// claim (a concurrent claim lost to the head by construction).
pub(crate) fn need(
    head: &FileVersion,
    head_file: &AnyFile,
    device_fv: Option<&FileVersion>,
) -> bool {
    if head.invalid || head.version.is_empty() {
        return false;
    }

    if head_file.is_deleted() && device_fv.is_none() {
        return false;
    }

    if let Some(fv) = device_fv {
        if fv.version.greater_equal(&head.version) {
            return false;
        }
    }

    true
}

/// Read/write transaction: a pinned view plus a write batch
pub(crate) struct WriteTxn {
    pub read: ReadTxn,
    pub batch: WriteBatch,
}

impl WriteTxn {
    pub fn new(backend: &Arc<dyn Backend>) -> crate::Result<Self> {
        Ok(Self {
            read: ReadTxn::new(backend)?,
            batch: WriteBatch::new(backend.clone()),
        })
    }

    pub fn put(&self, key: Vec<u8>, value: &[u8]) {
        self.batch.put(key, value);
    }

    pub fn delete(&self, key: Vec<u8>) {
        self.batch.delete(key);
    }

    /// Flushes the batch if it has grown past its thresholds.
    pub fn checkpoint(&self) -> crate::Result<()> {
        self.batch.check_flush()
    }

    /// Final, atomic commit of all remaining buffered writes.
    pub fn commit(self) -> crate::Result<()> {
        self.batch.commit()
    }

    /// Buffers deletion of every key starting with `prefix`.
    pub fn delete_prefix(&self, prefix: &[u8]) -> crate::Result<()> {
        for kv in self.read.iter_prefix(prefix)? {
            let (key, _) = kv?;
            self.batch.delete(key.to_vec());
            self.batch.check_flush()?;
        }
        Ok(())
    }

    fn stored_head_file(
        &self,
        folder: u32,
        name: &[u8],
        head: &FileVersion,
    ) -> crate::Result<Option<AnyFile>> {
        let key = keyer::device_file_key(folder, head.device, name);
        self.read.get_file_trunc(&key, true)
    }

    /// Recomputes the local need marker for `name` against the new list
    /// state and updates the need keyspace if the status changed.
    fn update_need(
        &self,
        folder: u32,
        local_idx: u32,
        name: &[u8],
        head: Option<(&FileVersion, &AnyFile)>,
        list: &VersionList,
    ) -> crate::Result<()> {
        let need_key = keyer::need_key(folder, name);
        let need_before = self.read.get(&need_key)?.is_some();

        let need_now = head.is_some_and(|(head, head_file)| {
            need(head, head_file, list.get(local_idx))
        });

        if need_now == need_before {
            return Ok(());
        }

        if need_now {
            log::debug!("need added for {:?}", String::from_utf8_lossy(name));
            self.put(need_key, &[]);
        } else {
            log::debug!("need removed for {:?}", String::from_utf8_lossy(name));
            self.delete(need_key);
        }

        Ok(())
    }

    /// Folds `file`, as announced by `device_idx`, into the global version
    /// list of its name. Adjusts global size counts and the local need set
    /// when the list head changes.
    ///
    /// Returns `false` if the announcement was a no-op.
    pub fn update_global(
        &self,
        folder: u32,
        device_idx: u32,
        local_idx: u32,
        file: &FileInfo,
        meta: &MetadataTracker,
    ) -> crate::Result<bool> {
        let name = file.name.as_bytes();
        let gk = keyer::global_key(folder, name);

        let mut list = self.read.get_version_list(&gk)?.unwrap_or_default();
        let old_head = list.head().cloned();

        let mut fetch = |dev: u32| -> crate::Result<Option<FileInfoTruncated>> {
            let key = keyer::device_file_key(folder, dev, name);
            Ok(self
                .read
                .get_file_trunc(&key, true)?
                .map(AnyFile::into_truncated))
        };

        let change = list.update(device_idx, file, &mut fetch)?;
        let ListChange::Changed { .. } = change else {
            return Ok(false);
        };

        self.put(gk, &list.encode_into_vec());

        // The list is non-empty after an insert
        let Some(new_head) = list.head().cloned() else {
            return Ok(true);
        };

        // Resolve the new head's metadata; reads see the transaction-start
        // state, so the announcing device's own entry comes from `file`.
        let head_file = if new_head.device == device_idx {
            Some(AnyFile::Full(file.clone()))
        } else {
            self.stored_head_file(folder, name, &new_head)?
        };

        if old_head.as_ref() != Some(&new_head) {
            if let Some(old) = &old_head {
                match self.stored_head_file(folder, name, old)? {
                    Some(old_file) => meta.remove_file(&DeviceId::GLOBAL, &old_file),
                    None => log::warn!(
                        "global head of {:?} pointed at a missing entry",
                        String::from_utf8_lossy(name)
                    ),
                }
            }

            match &head_file {
                Some(head_file) => meta.add_file(&DeviceId::GLOBAL, head_file),
                None => log::warn!(
                    "new global head of {:?} points at a missing entry",
                    String::from_utf8_lossy(name)
                ),
            }
        }

        let head = head_file
            .as_ref()
            .map(|head_file| (&new_head, head_file));
        self.update_need(folder, local_idx, name, head, &list)?;

        Ok(true)
    }

    /// Retracts `device_idx`'s claim on `name` from the global list,
    /// adjusting global counts and the local need set.
    pub fn remove_from_global(
        &self,
        folder: u32,
        device_idx: u32,
        local_idx: u32,
        name: &[u8],
        meta: &MetadataTracker,
    ) -> crate::Result<()> {
        let gk = keyer::global_key(folder, name);

        let Some(mut list) = self.read.get_version_list(&gk)? else {
            return Ok(());
        };

        let old_head = list.head().cloned();
        let (removed, removed_at) = list.pop(device_idx);
        if removed.is_none() {
            return Ok(());
        }

        if list.is_empty() {
            self.delete(gk);
            self.delete(keyer::need_key(folder, name));

            if let Some(old) = &old_head {
                if let Some(old_file) = self.stored_head_file(folder, name, old)? {
                    meta.remove_file(&DeviceId::GLOBAL, &old_file);
                }
            }

            return Ok(());
        }

        self.put(gk, &list.encode_into_vec());

        let Some(new_head) = list.head().cloned() else {
            return Ok(());
        };
        let head_file = self.stored_head_file(folder, name, &new_head)?;

        if removed_at == Some(0) {
            if let Some(old) = &old_head {
                if let Some(old_file) = self.stored_head_file(folder, name, old)? {
                    meta.remove_file(&DeviceId::GLOBAL, &old_file);
                }
            }

            match &head_file {
                Some(head_file) => meta.add_file(&DeviceId::GLOBAL, head_file),
                None => log::warn!(
                    "surviving global head of {:?} points at a missing entry",
                    String::from_utf8_lossy(name)
                ),
            }
        }

        let head = head_file
            .as_ref()
            .map(|head_file| (&new_head, head_file));
        self.update_need(folder, local_idx, name, head, &list)?;

        Ok(())
    }

    /// Walks every global list of the folder, drops claims whose
    /// device-file entry is gone, deletes empty lists, and rebuilds the
    /// global counts and the local need set from scratch.
    ///
    /// Used by recovery.
    pub fn check_globals(
        &self,
        folder: u32,
        local_idx: u32,
        meta: &MetadataTracker,
    ) -> crate::Result<()> {
        log::debug!("checking globals for folder id {folder}");

        meta.reset_device(&DeviceId::GLOBAL);

        for kv in self.read.iter_prefix(&keyer::global_prefix(folder))? {
            let (gk, raw) = kv?;
            let name = keyer::global_key_name(&gk).to_vec();

            let Ok(list) = VersionList::decode_from_slice(&raw) else {
                log::warn!(
                    "dropping undecodable version list for {:?}",
                    String::from_utf8_lossy(&name)
                );
                self.delete(gk.to_vec());
                self.delete(keyer::need_key(folder, &name));
                continue;
            };

            // Keep only claims whose device-file entry still exists
            let mut kept = VersionList::default();
            let mut head_file = None;
            for fv in list.versions() {
                let key = keyer::device_file_key(folder, fv.device, &name);
                match self.read.get_file_trunc(&key, true)? {
                    Some(file) => {
                        if kept.is_empty() {
                            head_file = Some(file);
                        }
                        kept.push_back(fv.clone());
                    }
                    None => log::warn!(
                        "dropping claim on {:?} with missing entry",
                        String::from_utf8_lossy(&name)
                    ),
                }
            }

            if kept.is_empty() {
                self.delete(gk.to_vec());
                self.delete(keyer::need_key(folder, &name));
                self.checkpoint()?;
                continue;
            }

            if kept != list {
                self.put(gk.to_vec(), &kept.encode_into_vec());
            }

            if let (Some(new_head), Some(head_file)) = (kept.head().cloned(), head_file) {
                meta.add_file(&DeviceId::GLOBAL, &head_file);
                self.update_need(
                    folder,
                    local_idx,
                    &name,
                    Some((&new_head, &head_file)),
                    &kept,
                )?;
            }

            self.checkpoint()?;
        }

        Ok(())
    }
}
