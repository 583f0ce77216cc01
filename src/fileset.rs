// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, Encode},
    database::DbInner,
    device::DeviceId,
    file_info::{AnyFile, FileInfo, FileLike},
    keyer,
    meta::MetadataTracker,
    mtimes::MtimeFs,
    snapshot::Snapshot,
    transactions::WriteTxn,
    util,
};
use std::sync::{Arc, Mutex};

/// Opaque 8-byte identifier of one device's index stream for one folder
///
/// A fresh random id signals to peers that previously exchanged sequence
/// numbers are void and a full index exchange is required.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexId(pub u64);

impl IndexId {
    /// Whether the id is unset.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for IndexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Per-folder façade over the index database
///
/// All mutations go through [`FileSet::update`] and [`FileSet::drop_device`],
/// serialised by an update mutex; readers use [`FileSet::snapshot`] and do
/// not block writers. Names are canonicalised (NFC, forward slashes) on the
/// way in and mapped back to native separators on the way out.
///
/// One `FileSet` per folder is expected; duplicate names within a single
/// `update` call are the caller's responsibility.
pub struct FileSet {
    folder: String,
    folder_id: u32,
    local_idx: u32,
    db: Arc<DbInner>,
    meta: Arc<MetadataTracker>,
    update_lock: Mutex<()>,
}

impl FileSet {
    pub(crate) fn open(db: Arc<DbInner>, folder: &str) -> crate::Result<Self> {
        let folder_id = db.keyer.folder_id(folder)?;
        let local_idx = db.keyer.device_idx(&DeviceId::LOCAL)?;
        let meta = load_meta(&db, folder, folder_id, local_idx)?;

        Ok(Self {
            folder: folder.to_owned(),
            folder_id,
            local_idx,
            db,
            meta,
            update_lock: Mutex::new(()),
        })
    }

    /// The folder this set belongs to.
    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Folds a batch of file records for `device` into the index.
    ///
    /// Records whose stored counterpart is unchanged (same version, same
    /// invalid bit, same local flags) are skipped. Records with rejected
    /// names (empty, or a first path segment of `""`, `"."` or `".."`) are
    /// dropped with a warning. For the local device, each applied record is
    /// assigned the next sequence number and the sequence log and block map
    /// are maintained alongside.
    ///
    /// # Errors
    ///
    /// On a failed commit the on-disk state is unchanged and the in-memory
    /// counters are reloaded from disk.
    pub fn update(&self, device: &DeviceId, files: Vec<FileInfo>) -> crate::Result<()> {
        let mut normalized = Vec::with_capacity(files.len());
        for mut f in files {
            match util::canonicalize_name(&f.name) {
                Some(name) => {
                    f.name = name;
                    normalized.push(f);
                }
                None => log::warn!("rejecting record with invalid name {:?}", f.name),
            }
        }

        let guard = self.update_lock.lock().map_err(|_| crate::Error::Closed)?;

        let device_idx = self.db.keyer.device_idx(device)?;
        let txn = WriteTxn::new(&self.db.backend)?;

        let applied = if device.is_local() {
            self.update_local(&txn, device_idx, normalized)
        } else {
            self.update_remote(&txn, device, device_idx, normalized)
        };

        let committed = applied.and_then(|()| self.commit_with_meta(txn));
        drop(guard);

        committed.inspect_err(|_| self.reload_meta())
    }

    fn update_local(
        &self,
        txn: &WriteTxn,
        device_idx: u32,
        files: Vec<FileInfo>,
    ) -> crate::Result<()> {
        for mut f in files {
            let name = f.name.clone().into_bytes();
            let dk = keyer::device_file_key(self.folder_id, device_idx, &name);

            let existing = txn.read.get_file_trunc(&dk, false)?.and_then(AnyFile::into_full);

            if let Some(ef) = &existing {
                if f.is_equivalent(ef) {
                    continue;
                }

                if !ef.is_directory() && !ef.is_deleted() && !ef.is_invalid() {
                    for block in &ef.blocks {
                        txn.delete(keyer::block_map_key(self.folder_id, &block.hash, &name));
                    }
                }

                txn.delete(keyer::sequence_key(self.folder_id, ef.sequence));
                self.meta.remove_file(&DeviceId::LOCAL, ef);
            }

            f.sequence = self.meta.next_local_seq();
            self.meta.add_file(&DeviceId::LOCAL, &f);

            txn.put(dk.clone(), &f.encode_into_vec());
            txn.put(keyer::sequence_key(self.folder_id, f.sequence), &dk);
            txn.update_global(self.folder_id, device_idx, self.local_idx, &f, &self.meta)?;

            if !f.is_directory() && !f.is_deleted() && !f.is_invalid() {
                for (i, block) in f.blocks.iter().enumerate() {
                    // NOTE: Truncation is okay, block counts fit in u32
                    #[allow(clippy::cast_possible_truncation)]
                    txn.put(
                        keyer::block_map_key(self.folder_id, &block.hash, &name),
                        &(i as u32).to_be_bytes(),
                    );
                }
            }

            txn.checkpoint()?;
        }

        Ok(())
    }

    fn update_remote(
        &self,
        txn: &WriteTxn,
        device: &DeviceId,
        device_idx: u32,
        files: Vec<FileInfo>,
    ) -> crate::Result<()> {
        for f in files {
            let name = f.name.as_bytes();
            let dk = keyer::device_file_key(self.folder_id, device_idx, name);

            let existing = txn
                .read
                .get_file_trunc(&dk, true)?
                .map(AnyFile::into_truncated);

            if let Some(ef) = &existing {
                if f.is_equivalent(ef) {
                    continue;
                }
                self.meta.remove_file(device, ef);
            }

            self.meta.add_file(device, &f);
            txn.put(dk, &f.encode_into_vec());
            txn.update_global(self.folder_id, device_idx, self.local_idx, &f, &self.meta)?;
            txn.checkpoint()?;
        }

        Ok(())
    }

    /// Forgets everything `device` claims in this folder.
    ///
    /// Dropping the local device also clears the folder's block map and
    /// sequence log, but retains the sequence counter so later delta
    /// exchanges stay monotone. Dropping a remote device resets its counts
    /// and sequence entirely.
    ///
    /// # Errors
    ///
    /// On a failed commit the on-disk state is unchanged and the in-memory
    /// counters are reloaded from disk.
    pub fn drop_device(&self, device: &DeviceId) -> crate::Result<()> {
        let guard = self.update_lock.lock().map_err(|_| crate::Error::Closed)?;

        let device_idx = self.db.keyer.device_idx(device)?;
        let txn = WriteTxn::new(&self.db.backend)?;

        let applied = self.drop_device_inner(&txn, device, device_idx);
        let committed = applied.and_then(|()| self.commit_with_meta(txn));
        drop(guard);

        committed.inspect_err(|_| self.reload_meta())
    }

    fn drop_device_inner(
        &self,
        txn: &WriteTxn,
        device: &DeviceId,
        device_idx: u32,
    ) -> crate::Result<()> {
        let prefix = keyer::device_file_prefix(self.folder_id, device_idx);

        for kv in txn.read.iter_prefix(&prefix)? {
            let (key, _) = kv?;
            let name = keyer::device_file_key_name(&key).to_vec();

            txn.remove_from_global(self.folder_id, device_idx, self.local_idx, &name, &self.meta)?;
            txn.delete(key.to_vec());
            txn.checkpoint()?;
        }

        if device.is_local() {
            txn.delete_prefix(&keyer::block_map_prefix(self.folder_id))?;
            txn.delete_prefix(&keyer::sequence_prefix(self.folder_id))?;
            self.meta.reset_device_keep_seq(device);
        } else {
            self.meta.reset_device(device);
        }

        Ok(())
    }

    fn commit_with_meta(&self, txn: WriteTxn) -> crate::Result<()> {
        if self.meta.is_dirty() {
            txn.put(
                keyer::folder_meta_key(self.folder_id),
                &self.meta.encode_into_vec(),
            );
        }

        txn.commit()?;
        self.meta.take_dirty();
        Ok(())
    }

    /// Re-reads the persisted counters, discarding in-memory drift after a
    /// failed commit.
    fn reload_meta(&self) {
        let fresh = self
            .db
            .backend
            .get(&keyer::folder_meta_key(self.folder_id))
            .ok()
            .flatten()
            .and_then(|raw| MetadataTracker::decode_from_slice(&raw).ok());

        match fresh {
            Some(fresh) => {
                self.meta.overwrite_with(&fresh);
                log::debug!("reloaded metadata for folder {:?} after failed commit", self.folder);
            }
            None => {
                self.meta.mark_dirty();
                log::error!(
                    "could not reload metadata for folder {:?} after failed commit",
                    self.folder
                );
            }
        }
    }

    /// Opens a consistent point-in-time view for queries.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    pub fn snapshot(&self) -> crate::Result<Snapshot> {
        Snapshot::open(
            self.db.clone(),
            self.folder_id,
            self.local_idx,
            self.meta.clone(),
        )
    }

    /// Highest sequence number observed for `device`, from the cached
    /// counters.
    #[must_use]
    pub fn sequence(&self, device: &DeviceId) -> u64 {
        self.meta.sequence(device)
    }

    /// Returns the index id of `device` for this folder.
    ///
    /// For the local device a missing id is generated, persisted and
    /// re-read, so racing callers converge on one value. For a remote
    /// device a missing id is reported as zero.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    pub fn index_id(&self, device: &DeviceId) -> crate::Result<IndexId> {
        let device_idx = self.db.keyer.device_idx(device)?;
        let key = keyer::index_id_key(device_idx, self.folder_id);

        if let Some(id) = parse_index_id(self.db.backend.get(&key)?.as_deref()) {
            return Ok(id);
        }

        if !device.is_local() {
            return Ok(IndexId(0));
        }

        let id = loop {
            let candidate: u64 = rand::random();
            if candidate != 0 {
                break candidate;
            }
        };
        self.db.backend.put(&key, &id.to_be_bytes())?;
        log::debug!("generated index id {} for folder {:?}", IndexId(id), self.folder);

        // Re-read: when two callers race, both settle on the stored value
        Ok(parse_index_id(self.db.backend.get(&key)?.as_deref()).unwrap_or(IndexId(id)))
    }

    /// Stores the index id a remote device advertised for this folder.
    ///
    /// # Panics
    ///
    /// Panics when called for the local device; the local id is generated,
    /// never assigned.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    pub fn set_index_id(&self, device: &DeviceId, id: IndexId) -> crate::Result<()> {
        assert!(!device.is_local(), "the local index id cannot be assigned");

        let device_idx = self.db.keyer.device_idx(device)?;
        let key = keyer::index_id_key(device_idx, self.folder_id);
        self.db.backend.put(&key, &id.0.to_be_bytes())
    }

    /// All devices with tracked state in this folder, excluding the local
    /// and global sentinels.
    #[must_use]
    pub fn list_devices(&self) -> Vec<DeviceId> {
        self.meta.devices()
    }

    /// Handle to the folder's mtime store.
    #[must_use]
    pub fn mtime_fs(&self) -> MtimeFs {
        MtimeFs::new(self.db.clone(), self.folder_id)
    }
}

fn parse_index_id(raw: Option<&[u8]>) -> Option<IndexId> {
    let raw: [u8; 8] = raw?.try_into().ok()?;
    let id = u64::from_be_bytes(raw);
    (id != 0).then_some(IndexId(id))
}

fn load_meta(
    db: &Arc<DbInner>,
    folder: &str,
    folder_id: u32,
    local_idx: u32,
) -> crate::Result<Arc<MetadataTracker>> {
    let stored = db
        .backend
        .get(&keyer::folder_meta_key(folder_id))?
        .and_then(|raw| match MetadataTracker::decode_from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("discarding undecodable metadata for folder {folder:?}: {e}");
                None
            }
        });

    if let Some(meta) = stored {
        if !meta.is_stale(util::recheck_interval()) {
            return Ok(Arc::new(meta));
        }
        log::debug!("metadata for folder {folder:?} is stale");
    }

    recalc_meta(db, folder, folder_id, local_idx)
}

fn recalc_meta(
    db: &Arc<DbInner>,
    folder: &str,
    folder_id: u32,
    local_idx: u32,
) -> crate::Result<Arc<MetadataTracker>> {
    log::debug!("recalculating metadata for folder {folder:?}");

    let meta = MetadataTracker::new();
    let txn = WriteTxn::new(&db.backend)?;

    for kv in txn.read.iter_prefix(&keyer::device_file_folder_prefix(folder_id))? {
        let (key, raw) = kv?;

        let Some(device_idx) = keyer::device_file_key_device(&key) else {
            continue;
        };
        let Some(device) = db.keyer.device_for(device_idx) else {
            log::warn!("file entry references unknown device index {device_idx}");
            continue;
        };

        match crate::file_info::FileInfoTruncated::decode_from_slice(&raw) {
            Ok(f) => meta.add_file(&device, &f),
            Err(e) => log::warn!("skipping undecodable file entry during recalc: {e}"),
        }
    }

    txn.check_globals(folder_id, local_idx, &meta)?;

    meta.stamp_created();
    txn.put(keyer::folder_meta_key(folder_id), &meta.encode_into_vec());
    txn.commit()?;
    meta.take_dirty();

    Ok(Arc::new(meta))
}
