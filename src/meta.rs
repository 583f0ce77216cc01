// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    device::DeviceId,
    file_info::{each_flag_bit, FileLike, LOCAL_ALL_FLAGS},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering::AcqRel, Ordering::Acquire, Ordering::Release},
        RwLock,
    },
    time::Duration,
};
use varint_rs::{VarintReader, VarintWriter};

/// Aggregate item counts for one (device, flag bucket)
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Counts {
    /// Number of regular files
    pub files: u64,

    /// Number of directories
    pub directories: u64,

    /// Number of symlinks
    pub symlinks: u64,

    /// Number of deletion records
    pub deleted: u64,

    /// Accounted bytes
    pub bytes: u64,

    /// Highest observed sequence number
    pub sequence: u64,

    /// Device the counts belong to
    pub device: DeviceId,

    /// Flag bucket the counts belong to (zero for the plain bucket)
    pub local_flags: u32,
}

impl Counts {
    /// Sums two count records field by field.
    #[must_use]
    pub fn add(mut self, other: &Self) -> Self {
        self.files += other.files;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.deleted += other.deleted;
        self.bytes += other.bytes;
        self.sequence += other.sequence;
        self
    }

    /// Total number of items, of any type.
    #[must_use]
    pub fn total_items(&self) -> u64 {
        self.files + self.directories + self.symlinks + self.deleted
    }

    fn add_file(&mut self, f: &impl FileLike) {
        if f.is_deleted() {
            self.deleted += 1;
        } else if f.is_directory() {
            self.directories += 1;
        } else if f.is_symlink() {
            self.symlinks += 1;
        } else {
            self.files += 1;
        }
        self.bytes += f.file_size();
    }

    fn remove_file(&mut self, f: &impl FileLike) {
        if f.is_deleted() {
            self.deleted = self.deleted.saturating_sub(1);
        } else if f.is_directory() {
            self.directories = self.directories.saturating_sub(1);
        } else if f.is_symlink() {
            self.symlinks = self.symlinks.saturating_sub(1);
        } else {
            self.files = self.files.saturating_sub(1);
        }
        self.bytes = self.bytes.saturating_sub(f.file_size());
    }
}

struct MetaInner {
    created_ns: u64,
    counts: Vec<Counts>,
    indexes: FxHashMap<(DeviceId, u32), usize>,
}

impl MetaInner {
    fn counts_mut(&mut self, device: &DeviceId, flag: u32) -> &mut Counts {
        let idx = *self.indexes.entry((*device, flag)).or_insert_with(|| {
            self.counts.push(Counts {
                device: *device,
                local_flags: flag,
                ..Counts::default()
            });
            self.counts.len() - 1
        });

        // The index map only ever points at live entries
        #[allow(clippy::expect_used)]
        self.counts.get_mut(idx).expect("counts index in bounds")
    }
}

/// In-memory per-(device, flag-bucket) counters for one folder, with
/// crash-safe persistence to the folder-meta keyspace
///
/// The tracker is authoritative for size queries at steady state but is
/// treated as a cache for recovery: when missing, corrupt or stale it is
/// recalculated from the device-file keyspace.
pub(crate) struct MetadataTracker {
    inner: RwLock<MetaInner>,
    dirty: AtomicBool,
}

impl MetadataTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MetaInner {
                created_ns: 0,
                counts: Vec::new(),
                indexes: FxHashMap::default(),
            }),
            dirty: AtomicBool::new(false),
        }
    }

    /// Accounts `f` for `device`.
    ///
    /// Remote invalid entries (no local flags) contribute only their
    /// sequence number; flagged entries contribute once per flag bucket.
    pub fn add_file(&self, device: &DeviceId, f: &impl FileLike) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        self.dirty.store(true, Release);

        let seq = f.sequence_no();
        let bucket = inner.counts_mut(device, 0);
        bucket.sequence = bucket.sequence.max(seq);

        let flags = f.local_flags() & LOCAL_ALL_FLAGS;

        if f.is_invalid() && flags == 0 {
            return;
        }

        if flags == 0 {
            inner.counts_mut(device, 0).add_file(f);
        } else {
            each_flag_bit(flags, |flag| {
                inner.counts_mut(device, flag).add_file(f);
            });
        }
    }

    /// Removes the contribution of `f` for `device`.
    pub fn remove_file(&self, device: &DeviceId, f: &impl FileLike) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        self.dirty.store(true, Release);

        let flags = f.local_flags() & LOCAL_ALL_FLAGS;

        if f.is_invalid() && flags == 0 {
            return;
        }

        if flags == 0 {
            inner.counts_mut(device, 0).remove_file(f);
        } else {
            each_flag_bit(flags, |flag| {
                inner.counts_mut(device, flag).remove_file(f);
            });
        }
    }

    /// Returns the counts for one (device, flag bucket).
    pub fn counts(&self, device: &DeviceId, flag: u32) -> Counts {
        self.inner
            .read()
            .ok()
            .and_then(|inner| {
                inner
                    .indexes
                    .get(&(*device, flag))
                    .and_then(|idx| inner.counts.get(*idx))
                    .cloned()
            })
            .unwrap_or_else(|| Counts {
                device: *device,
                local_flags: flag,
                ..Counts::default()
            })
    }

    /// Highest sequence number observed for `device`.
    pub fn sequence(&self, device: &DeviceId) -> u64 {
        self.counts(device, 0).sequence
    }

    /// Allocates the next local sequence number.
    pub fn next_local_seq(&self) -> u64 {
        let Ok(mut inner) = self.inner.write() else {
            return 0;
        };
        self.dirty.store(true, Release);

        let bucket = inner.counts_mut(&DeviceId::LOCAL, 0);
        bucket.sequence += 1;
        bucket.sequence
    }

    /// All devices with tracked counts, excluding the sentinels.
    pub fn devices(&self) -> Vec<DeviceId> {
        let Ok(inner) = self.inner.read() else {
            return Vec::new();
        };

        let mut devices: Vec<_> = inner
            .indexes
            .iter()
            .filter_map(|((device, _), idx)| {
                // A fully reset device is as good as forgotten
                let c = inner.counts.get(*idx)?;
                (c.total_items() > 0 || c.bytes > 0 || c.sequence > 0).then_some(*device)
            })
            .filter(|d| *d != DeviceId::LOCAL && *d != DeviceId::GLOBAL)
            .collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Clears all buckets of `device`, keeping its sequence counter.
    pub fn reset_device_keep_seq(&self, device: &DeviceId) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        self.dirty.store(true, Release);

        let seq = inner
            .indexes
            .get(&(*device, 0))
            .and_then(|idx| inner.counts.get(*idx))
            .map_or(0, |c| c.sequence);

        for (key, idx) in &inner.indexes.clone() {
            if key.0 == *device {
                if let Some(c) = inner.counts.get_mut(*idx) {
                    *c = Counts {
                        device: key.0,
                        local_flags: key.1,
                        ..Counts::default()
                    };
                }
            }
        }

        inner.counts_mut(device, 0).sequence = seq;
    }

    /// Clears all buckets of `device`, including its sequence counter.
    pub fn reset_device(&self, device: &DeviceId) {
        self.reset_device_keep_seq(device);

        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        inner.counts_mut(device, 0).sequence = 0;
    }

    /// Timestamp of the last full (re)calculation.
    pub fn created_ns(&self) -> u64 {
        self.inner.read().map_or(0, |inner| inner.created_ns)
    }

    /// Stamps the tracker as freshly calculated.
    pub fn stamp_created(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.created_ns = crate::util::now_unix_nanos();
        }
        self.dirty.store(true, Release);
    }

    /// Whether the last full calculation is older than `interval`.
    pub fn is_stale(&self, interval: Duration) -> bool {
        let created = self.created_ns();
        if created == 0 {
            return true;
        }

        let age_ns = crate::util::now_unix_nanos().saturating_sub(created);
        Duration::from_nanos(age_ns) > interval
    }

    /// Replaces the whole tracker state with `other`'s.
    ///
    /// Used to discard in-memory drift after a failed commit.
    pub fn overwrite_with(&self, other: &Self) {
        if let (Ok(mut inner), Ok(fresh)) = (self.inner.write(), other.inner.read()) {
            inner.created_ns = fresh.created_ns;
            inner.counts = fresh.counts.clone();
            inner.indexes = fresh.indexes.clone();
        }
        self.dirty.store(false, Release);
    }

    /// Returns and clears the dirty flag.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, AcqRel)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Acquire)
    }
}

impl Encode for MetadataTracker {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| EncodeError::Io(std::io::Error::other("tracker lock poisoned")))?;

        writer.write_u64::<BigEndian>(inner.created_ns)?;

        // NOTE: Truncation is okay, bucket counts are tiny
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(inner.counts.len() as u32)?;

        for c in &inner.counts {
            writer.write_all(c.device.as_bytes())?;
            writer.write_u32::<BigEndian>(c.local_flags)?;
            writer.write_u64_varint(c.files)?;
            writer.write_u64_varint(c.directories)?;
            writer.write_u64_varint(c.symlinks)?;
            writer.write_u64_varint(c.deleted)?;
            writer.write_u64_varint(c.bytes)?;
            writer.write_u64_varint(c.sequence)?;
        }

        Ok(())
    }
}

impl Decode for MetadataTracker {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let created_ns = reader.read_u64::<BigEndian>()?;
        let len = reader.read_u32_varint()? as usize;

        let mut counts = Vec::with_capacity(len.min(1_024));
        let mut indexes = FxHashMap::default();

        for i in 0..len {
            let mut raw = [0u8; 32];
            reader.read_exact(&mut raw)?;
            let device = DeviceId(raw);

            let local_flags = reader.read_u32::<BigEndian>()?;
            let files = reader.read_u64_varint()?;
            let directories = reader.read_u64_varint()?;
            let symlinks = reader.read_u64_varint()?;
            let deleted = reader.read_u64_varint()?;
            let bytes = reader.read_u64_varint()?;
            let sequence = reader.read_u64_varint()?;

            indexes.insert((device, local_flags), i);
            counts.push(Counts {
                files,
                directories,
                symlinks,
                deleted,
                bytes,
                sequence,
                device,
                local_flags,
            });
        }

        Ok(Self {
            inner: RwLock::new(MetaInner {
                created_ns,
                counts,
                indexes,
            }),
            dirty: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::{FileInfo, FileType, FLAG_LOCAL_IGNORED, FLAG_LOCAL_RECEIVE_ONLY};
    use test_log::test;

    fn file(name: &str, size: u64, seq: u64) -> FileInfo {
        FileInfo {
            name: name.into(),
            size,
            sequence: seq,
            ..FileInfo::default()
        }
    }

    #[test]
    fn tracker_counts_by_type() {
        let meta = MetadataTracker::new();
        let dev = DeviceId::LOCAL;

        meta.add_file(&dev, &file("a", 10, 1));
        meta.add_file(
            &dev,
            &FileInfo {
                name: "d".into(),
                file_type: FileType::Directory,
                sequence: 2,
                ..FileInfo::default()
            },
        );
        meta.add_file(
            &dev,
            &FileInfo {
                name: "gone".into(),
                deleted: true,
                sequence: 3,
                ..FileInfo::default()
            },
        );

        let c = meta.counts(&dev, 0);
        assert_eq!(1, c.files);
        assert_eq!(1, c.directories);
        assert_eq!(1, c.deleted);
        assert_eq!(10 + 128, c.bytes);
        assert_eq!(3, c.sequence);
    }

    #[test]
    fn tracker_remove_undoes_add() {
        let meta = MetadataTracker::new();
        let dev = DeviceId::LOCAL;
        let f = file("a", 10, 1);

        meta.add_file(&dev, &f);
        meta.remove_file(&dev, &f);

        let c = meta.counts(&dev, 0);
        assert_eq!(0, c.files);
        assert_eq!(0, c.bytes);
        // Sequence is never lowered
        assert_eq!(1, c.sequence);
    }

    #[test]
    fn tracker_flagged_files_count_in_flag_buckets() {
        let meta = MetadataTracker::new();
        let dev = DeviceId::LOCAL;

        let mut f = file("x", 10, 1);
        f.local_flags = FLAG_LOCAL_IGNORED | FLAG_LOCAL_RECEIVE_ONLY;
        meta.add_file(&dev, &f);

        assert_eq!(0, meta.counts(&dev, 0).files);
        assert_eq!(1, meta.counts(&dev, FLAG_LOCAL_IGNORED).files);
        assert_eq!(1, meta.counts(&dev, FLAG_LOCAL_RECEIVE_ONLY).files);
    }

    #[test]
    fn tracker_remote_invalid_only_tracks_sequence() {
        let meta = MetadataTracker::new();
        let dev = DeviceId([1; 32]);

        let mut f = file("x", 10, 7);
        f.raw_invalid = true;
        meta.add_file(&dev, &f);

        let c = meta.counts(&dev, 0);
        assert_eq!(0, c.files);
        assert_eq!(0, c.bytes);
        assert_eq!(7, c.sequence);
    }

    #[test]
    fn tracker_next_local_seq_increments() {
        let meta = MetadataTracker::new();

        meta.add_file(&DeviceId::LOCAL, &file("a", 1, 5));
        assert_eq!(6, meta.next_local_seq());
        assert_eq!(7, meta.next_local_seq());
        assert_eq!(7, meta.sequence(&DeviceId::LOCAL));
    }

    #[test]
    fn tracker_roundtrip() {
        let meta = MetadataTracker::new();
        meta.add_file(&DeviceId::LOCAL, &file("a", 10, 1));
        meta.add_file(&DeviceId([9; 32]), &file("b", 20, 2));
        meta.stamp_created();

        let bytes = meta.encode_into_vec();
        let back = MetadataTracker::decode_from_slice(&bytes).expect("decode");

        assert_eq!(
            meta.counts(&DeviceId::LOCAL, 0),
            back.counts(&DeviceId::LOCAL, 0)
        );
        assert_eq!(meta.created_ns(), back.created_ns());
        assert_eq!(vec![DeviceId([9; 32])], back.devices());
        assert!(!back.is_dirty());
    }

    #[test]
    fn tracker_reset_keeps_or_drops_sequence() {
        let meta = MetadataTracker::new();
        meta.add_file(&DeviceId::LOCAL, &file("a", 10, 41));

        meta.reset_device_keep_seq(&DeviceId::LOCAL);
        assert_eq!(0, meta.counts(&DeviceId::LOCAL, 0).files);
        assert_eq!(41, meta.sequence(&DeviceId::LOCAL));

        meta.reset_device(&DeviceId::LOCAL);
        assert_eq!(0, meta.sequence(&DeviceId::LOCAL));
    }
}
