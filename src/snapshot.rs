// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    database::DbInner,
    device::DeviceId,
    file_info::{AnyFile, FileInfo, FileInfoTruncated, FileLike, FLAG_LOCAL_RECEIVE_ONLY},
    keyer,
    meta::{Counts, MetadataTracker},
    transactions::ReadTxn,
    util,
    vector::Causality,
    version_list::VersionList,
};
use std::sync::Arc;

/// A consistent point-in-time view over one folder's index
///
/// All queries observe the same backend snapshot; updates committed after
/// the snapshot was taken are invisible. Emitted names use the platform's
/// native separators. The snapshot must be released (dropped) for the
/// backend to be able to shut down.
pub struct Snapshot {
    db: Arc<DbInner>,
    folder_id: u32,
    local_idx: u32,
    txn: ReadTxn,
    meta: Arc<MetadataTracker>,
}

impl Snapshot {
    pub(crate) fn open(
        db: Arc<DbInner>,
        folder_id: u32,
        local_idx: u32,
        meta: Arc<MetadataTracker>,
    ) -> crate::Result<Self> {
        log::trace!("opening snapshot for folder id {folder_id}");
        let txn = ReadTxn::new(&db.backend)?;

        Ok(Self {
            db,
            folder_id,
            local_idx,
            txn,
            meta,
        })
    }

    /// Releases the snapshot.
    ///
    /// Dropping has the same effect; this form reads better at call sites
    /// that release early.
    pub fn release(self) {
        drop(self);
    }

    // --- have ---

    /// Calls `f` for every file `device` has, in name order, with full
    /// metadata. Iteration stops when `f` returns `false`.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_have(
        &self,
        device: &DeviceId,
        mut f: impl FnMut(FileInfo) -> bool,
    ) -> crate::Result<()> {
        self.iter_have(device, None, false, &mut |file| match file {
            AnyFile::Full(file) => f(file),
            AnyFile::Truncated(_) => true,
        })
    }

    /// Like [`Snapshot::with_have`], with truncated metadata.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_have_truncated(
        &self,
        device: &DeviceId,
        mut f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> crate::Result<()> {
        self.iter_have(device, None, true, &mut |file| f(file.into_truncated()))
    }

    /// Like [`Snapshot::with_have_truncated`], restricted to names equal to
    /// `prefix` or below it in the tree.
    ///
    /// A name that merely continues the prefix string (`"dir.x"` for
    /// prefix `"dir"`) is not included.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_prefixed_have_truncated(
        &self,
        device: &DeviceId,
        prefix: &str,
        mut f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> crate::Result<()> {
        let Some(prefix) = canonical_prefix(prefix) else {
            return Ok(());
        };

        self.iter_have(device, prefix.as_deref(), true, &mut |file| {
            f(file.into_truncated())
        })
    }

    fn iter_have(
        &self,
        device: &DeviceId,
        prefix: Option<&[u8]>,
        truncate: bool,
        f: &mut dyn FnMut(AnyFile) -> bool,
    ) -> crate::Result<()> {
        let Some(device_idx) = self.db.keyer.device_idx_if_exists(device) else {
            return Ok(());
        };

        let mut key_prefix = keyer::device_file_prefix(self.folder_id, device_idx);
        if let Some(prefix) = prefix {
            key_prefix.extend_from_slice(prefix);
        }

        for kv in self.txn.iter_prefix(&key_prefix)? {
            let (key, _) = kv?;
            let name = keyer::device_file_key_name(&key);

            if !within_prefix(name, prefix) {
                continue;
            }

            let Some(file) = self.txn.get_file_trunc(&key, truncate)? else {
                continue;
            };

            if !f(nativized(file)) {
                break;
            }
        }

        Ok(())
    }

    // --- sequence ---

    /// Calls `f` for every local file with a sequence number of at least
    /// `start_seq`, in sequence order, with full metadata.
    ///
    /// Within this one snapshot the emitted sequence numbers are strictly
    /// increasing and gap-free.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_have_sequence(
        &self,
        start_seq: u64,
        mut f: impl FnMut(FileInfo) -> bool,
    ) -> crate::Result<()> {
        let start = keyer::sequence_key(self.folder_id, start_seq);
        let end = util::prefix_upper_bound(&keyer::sequence_prefix(self.folder_id));

        for kv in self.txn.iter_range(&start, end.as_deref())? {
            let (key, value) = kv?;
            let Some(seqno) = keyer::sequence_key_seqno(&key) else {
                continue;
            };

            let Some(file) = self.txn.get_file_trunc(&value, false)? else {
                log::warn!("sequence entry {seqno} points at a missing file entry");
                continue;
            };

            if file.sequence_no() != seqno {
                log::warn!(
                    "sequence index mismatch: log says {seqno}, entry says {}",
                    file.sequence_no()
                );
                continue;
            }

            let AnyFile::Full(file) = nativized(file) else {
                continue;
            };
            if !f(file) {
                break;
            }
        }

        Ok(())
    }

    // --- global ---

    /// Calls `f` for the winning version of every name, in name order,
    /// with full metadata.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_global(&self, mut f: impl FnMut(FileInfo) -> bool) -> crate::Result<()> {
        self.iter_global(None, false, &mut |file| match file {
            AnyFile::Full(file) => f(file),
            AnyFile::Truncated(_) => true,
        })
    }

    /// Like [`Snapshot::with_global`], with truncated metadata.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_global_truncated(
        &self,
        mut f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> crate::Result<()> {
        self.iter_global(None, true, &mut |file| f(file.into_truncated()))
    }

    /// Like [`Snapshot::with_global_truncated`], restricted to names equal
    /// to `prefix` or below it in the tree.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_prefixed_global_truncated(
        &self,
        prefix: &str,
        mut f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> crate::Result<()> {
        let Some(prefix) = canonical_prefix(prefix) else {
            return Ok(());
        };

        self.iter_global(prefix.as_deref(), true, &mut |file| {
            f(file.into_truncated())
        })
    }

    fn iter_global(
        &self,
        prefix: Option<&[u8]>,
        truncate: bool,
        f: &mut dyn FnMut(AnyFile) -> bool,
    ) -> crate::Result<()> {
        let mut key_prefix = keyer::global_prefix(self.folder_id);
        if let Some(prefix) = prefix {
            key_prefix.extend_from_slice(prefix);
        }

        for kv in self.txn.iter_prefix(&key_prefix)? {
            let (key, raw) = kv?;
            let name = keyer::global_key_name(&key);

            if !within_prefix(name, prefix) {
                continue;
            }

            let Some(list) = decode_list(&raw, name) else {
                continue;
            };
            let Some(head) = list.head() else {
                continue;
            };

            let dk = keyer::device_file_key(self.folder_id, head.device, name);
            let Some(file) = self.txn.get_file_trunc(&dk, truncate)? else {
                log::warn!(
                    "global head of {:?} points at a missing entry",
                    String::from_utf8_lossy(name)
                );
                continue;
            };

            if !f(nativized(file)) {
                break;
            }
        }

        Ok(())
    }

    // --- need ---

    /// Calls `f` for every file `device` lacks relative to the global
    /// view, in name order, with full metadata.
    ///
    /// The emitted entry is the newest valid copy matching the winning
    /// version, so it can be fetched from the devices in
    /// [`Snapshot::availability`].
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_need(
        &self,
        device: &DeviceId,
        mut f: impl FnMut(FileInfo) -> bool,
    ) -> crate::Result<()> {
        self.iter_need(device, false, &mut |file| match file {
            AnyFile::Full(file) => f(file),
            AnyFile::Truncated(_) => true,
        })
    }

    /// Like [`Snapshot::with_need`], with truncated metadata.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn with_need_truncated(
        &self,
        device: &DeviceId,
        mut f: impl FnMut(FileInfoTruncated) -> bool,
    ) -> crate::Result<()> {
        self.iter_need(device, true, &mut |file| f(file.into_truncated()))
    }

    fn iter_need(
        &self,
        device: &DeviceId,
        truncate: bool,
        f: &mut dyn FnMut(AnyFile) -> bool,
    ) -> crate::Result<()> {
        if device.is_local() {
            // The need set for the local device is materialised
            for kv in self.txn.iter_prefix(&keyer::need_prefix(self.folder_id))? {
                let (key, _) = kv?;
                let name = keyer::need_key_name(&key).to_vec();

                let gk = keyer::global_key(self.folder_id, &name);
                let Some(list) = self.txn.get_version_list(&gk)? else {
                    log::debug!(
                        "stale need entry for {:?}",
                        String::from_utf8_lossy(&name)
                    );
                    continue;
                };

                if let Some(file) =
                    self.need_emission(&name, &list, self.local_idx, truncate)?
                {
                    if !f(nativized(file)) {
                        break;
                    }
                }
            }

            return Ok(());
        }

        // Remote devices: classify every global list
        let Some(device_idx) = self.db.keyer.device_idx_if_exists(device) else {
            return Ok(());
        };

        for kv in self.txn.iter_prefix(&keyer::global_prefix(self.folder_id))? {
            let (key, raw) = kv?;
            let name = keyer::global_key_name(&key).to_vec();

            let Some(list) = decode_list(&raw, &name) else {
                continue;
            };

            if let Some(file) = self.need_emission(&name, &list, device_idx, truncate)? {
                if !f(nativized(file)) {
                    break;
                }
            }
        }

        Ok(())
    }

    /// Decides whether `device_idx` needs the head of `list` and resolves
    /// the entry to emit: the newest valid copy of the winning version.
    fn need_emission(
        &self,
        name: &[u8],
        list: &VersionList,
        device_idx: u32,
        truncate: bool,
    ) -> crate::Result<Option<AnyFile>> {
        let Some(head) = list.head() else {
            return Ok(None);
        };

        if head.invalid || head.version.is_empty() {
            return Ok(None);
        }

        let device_fv = list.get(device_idx);
        if let Some(fv) = device_fv {
            if fv.version.greater_equal(&head.version) {
                return Ok(None);
            }
        }

        // Copies of the winning version cluster at the front of the list
        for fv in list.versions() {
            if fv.version.compare(&head.version) != Causality::Equal {
                break;
            }
            if fv.invalid {
                continue;
            }

            let dk = keyer::device_file_key(self.folder_id, fv.device, name);
            match self.txn.get_file_trunc(&dk, truncate)? {
                Some(file) => {
                    // A deletion is only needed by devices that have the file
                    if file.is_deleted() && device_fv.is_none() {
                        return Ok(None);
                    }
                    return Ok(Some(file));
                }
                None => {
                    log::warn!(
                        "claim on {:?} points at a missing entry",
                        String::from_utf8_lossy(name)
                    );
                }
            }
        }

        Ok(None)
    }

    // --- point lookups ---

    /// Returns the full entry `device` has for `name`.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn get(&self, device: &DeviceId, name: &str) -> crate::Result<Option<FileInfo>> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(None);
        };
        let Some(device_idx) = self.db.keyer.device_idx_if_exists(device) else {
            return Ok(None);
        };

        let key = keyer::device_file_key(self.folder_id, device_idx, name.as_bytes());
        Ok(self
            .txn
            .get_file_trunc(&key, false)?
            .map(nativized)
            .and_then(AnyFile::into_full))
    }

    /// Returns the truncated entry `device` has for `name`.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn get_truncated(
        &self,
        device: &DeviceId,
        name: &str,
    ) -> crate::Result<Option<FileInfoTruncated>> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(None);
        };
        let Some(device_idx) = self.db.keyer.device_idx_if_exists(device) else {
            return Ok(None);
        };

        let key = keyer::device_file_key(self.folder_id, device_idx, name.as_bytes());
        Ok(self
            .txn
            .get_file_trunc(&key, true)?
            .map(nativized)
            .map(AnyFile::into_truncated))
    }

    /// Returns the full winning entry for `name`.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn get_global(&self, name: &str) -> crate::Result<Option<FileInfo>> {
        Ok(self.get_global_any(name, false)?.and_then(AnyFile::into_full))
    }

    /// Returns the truncated winning entry for `name`.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn get_global_truncated(&self, name: &str) -> crate::Result<Option<FileInfoTruncated>> {
        Ok(self.get_global_any(name, true)?.map(AnyFile::into_truncated))
    }

    fn get_global_any(&self, name: &str, truncate: bool) -> crate::Result<Option<AnyFile>> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(None);
        };
        let name = name.as_bytes();

        let gk = keyer::global_key(self.folder_id, name);
        let Some(list) = self.txn.get_version_list(&gk)? else {
            return Ok(None);
        };
        let Some(head) = list.head() else {
            return Ok(None);
        };

        let dk = keyer::device_file_key(self.folder_id, head.device, name);
        Ok(self.txn.get_file_trunc(&dk, truncate)?.map(nativized))
    }

    /// Returns every device whose claim matches the winning version and is
    /// valid, i.e. the devices the file can be fetched from.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn availability(&self, name: &str) -> crate::Result<Vec<DeviceId>> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(Vec::new());
        };

        let gk = keyer::global_key(self.folder_id, name.as_bytes());
        let Some(list) = self.txn.get_version_list(&gk)? else {
            return Ok(Vec::new());
        };
        let Some(head) = list.head() else {
            return Ok(Vec::new());
        };

        let mut devices = Vec::new();
        for fv in list.versions() {
            if fv.version.compare(&head.version) != Causality::Equal {
                break;
            }
            if fv.invalid {
                continue;
            }
            match self.db.keyer.device_for(fv.device) {
                Some(device) => devices.push(device),
                None => log::warn!("claim references unknown device index {}", fv.device),
            }
        }

        Ok(devices)
    }

    // --- sizes ---

    /// Aggregate counts of what the local device has.
    #[must_use]
    pub fn local_size(&self) -> Counts {
        self.meta
            .counts(&DeviceId::LOCAL, 0)
            .add(&self.meta.counts(&DeviceId::LOCAL, FLAG_LOCAL_RECEIVE_ONLY))
    }

    /// Aggregate counts of the global view.
    #[must_use]
    pub fn global_size(&self) -> Counts {
        self.meta
            .counts(&DeviceId::GLOBAL, 0)
            .add(&self.meta.counts(&DeviceId::GLOBAL, FLAG_LOCAL_RECEIVE_ONLY))
    }

    /// Aggregate counts of locally changed files in a receive-only folder.
    #[must_use]
    pub fn receive_only_changed_size(&self) -> Counts {
        self.meta.counts(&DeviceId::LOCAL, FLAG_LOCAL_RECEIVE_ONLY)
    }

    /// Aggregate counts of what `device` lacks relative to the global view.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn need_size(&self, device: &DeviceId) -> crate::Result<Counts> {
        let mut counts = Counts {
            device: *device,
            ..Counts::default()
        };

        self.with_need_truncated(device, |f| {
            if f.is_deleted() {
                counts.deleted += 1;
            } else if f.is_directory() {
                counts.directories += 1;
            } else if f.is_symlink() {
                counts.symlinks += 1;
            } else {
                counts.files += 1;
            }
            counts.bytes += f.file_size();
            true
        })?;

        Ok(counts)
    }
}

/// Rewrites the entry's name with native separators.
fn nativized(file: AnyFile) -> AnyFile {
    if cfg!(not(windows)) {
        return file;
    }

    match file {
        AnyFile::Full(mut f) => {
            f.name = util::native_name(&f.name);
            AnyFile::Full(f)
        }
        AnyFile::Truncated(mut f) => {
            f.name = util::native_name(&f.name);
            AnyFile::Truncated(f)
        }
    }
}

/// Canonicalises a query prefix; `Ok(None)` means "no restriction".
#[allow(clippy::option_option)]
fn canonical_prefix(prefix: &str) -> Option<Option<Vec<u8>>> {
    if prefix.is_empty() {
        return Some(None);
    }

    let canonical = util::canonicalize_name(prefix)?;
    let trimmed = canonical.trim_end_matches('/');
    Some(Some(trimmed.as_bytes().to_vec()))
}

/// Path-aware prefix restriction: the name must equal the prefix or
/// continue it below a path separator.
fn within_prefix(name: &[u8], prefix: Option<&[u8]>) -> bool {
    let Some(prefix) = prefix else {
        return true;
    };

    name.len() == prefix.len() || name.get(prefix.len()) == Some(&b'/')
}

fn decode_list(raw: &[u8], name: &[u8]) -> Option<VersionList> {
    use crate::coding::Decode;

    match VersionList::decode_from_slice(raw) {
        Ok(list) => Some(list),
        Err(e) => {
            log::warn!(
                "skipping undecodable version list for {:?}: {e}",
                String::from_utf8_lossy(name)
            );
            None
        }
    }
}
