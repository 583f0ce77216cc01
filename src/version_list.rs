// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    file_info::{wins_conflict, FileInfo, FileInfoTruncated},
    vector::{Causality, Vector},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// One device's claim on a file name
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileVersion {
    /// Interned device index
    pub device: u32,

    /// Claimed version
    pub version: Vector,

    /// Whether the claim is invalid (not usable as a sync source)
    pub invalid: bool,
}

/// Outcome of a version-list insertion
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ListChange {
    /// The device already claimed exactly this version and validity
    Unchanged,

    /// The list was modified
    Changed {
        /// The device's previous claim, if any
        removed: Option<FileVersion>,

        /// Position the new claim was inserted at
        inserted_at: usize,
    },
}

/// All claims on one file name, ordered head-first by winning version
///
/// The head is the current global winner. Every entry's version/invalid
/// pair mirrors the corresponding device-file record exactly.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VersionList {
    /// Claims, best first
    pub(crate) versions: Vec<FileVersion>,
}

impl VersionList {
    /// Returns the winning claim, if the list is non-empty.
    #[must_use]
    pub fn head(&self) -> Option<&FileVersion> {
        self.versions.first()
    }

    /// Returns all claims, best first.
    #[must_use]
    pub fn versions(&self) -> &[FileVersion] {
        &self.versions
    }

    /// Returns `true` if no device claims the name.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Returns the claim of `device`, if present.
    #[must_use]
    pub fn get(&self, device: u32) -> Option<&FileVersion> {
        self.versions.iter().find(|fv| fv.device == device)
    }

    /// Appends a claim, preserving existing order.
    ///
    /// Only for rebuilding a filtered list whose relative order is known
    /// to be valid.
    pub(crate) fn push_back(&mut self, fv: FileVersion) {
        self.versions.push(fv);
    }

    /// Removes the claim of `device`, returning it and its old position.
    pub(crate) fn pop(&mut self, device: u32) -> (Option<FileVersion>, Option<usize>) {
        match self.versions.iter().position(|fv| fv.device == device) {
            Some(idx) => (Some(self.versions.remove(idx)), Some(idx)),
            None => (None, None),
        }
    }

    /// Inserts or moves the claim of `device` for `file`.
    ///
    /// Scans from the head and inserts in front of the first claim the new
    /// one beats. Claims with a concurrent version are decided by the full
    /// conflict rule, which needs the competitor's stored metadata; `fetch`
    /// resolves a device index to its stored entry for this name. A claim
    /// whose metadata is missing loses by default.
    pub(crate) fn update<F>(
        &mut self,
        device: u32,
        file: &FileInfo,
        fetch: &mut F,
    ) -> crate::Result<ListChange>
    where
        F: FnMut(u32) -> crate::Result<Option<FileInfoTruncated>>,
    {
        let new = FileVersion {
            device,
            version: file.version.clone(),
            invalid: crate::file_info::FileLike::is_invalid(file),
        };

        // Same version and validity: the list (and its order) is unchanged
        if self
            .get(device)
            .is_some_and(|old| old.version == new.version && old.invalid == new.invalid)
        {
            return Ok(ListChange::Unchanged);
        }

        let (removed, _) = self.pop(device);

        let mut inserted_at = self.versions.len();
        for (i, entry) in self.versions.iter().enumerate() {
            match entry.version.compare(&new.version) {
                Causality::Equal => {
                    // An invalid claim must not displace a valid claim of
                    // the same version
                    if new.invalid {
                        continue;
                    }
                    inserted_at = i;
                    break;
                }
                Causality::Lesser => {
                    // The claim here is older than ours
                    inserted_at = i;
                    break;
                }
                Causality::Greater => {}
                Causality::ConcurrentGreater | Causality::ConcurrentLesser => {
                    // Conflict: consult the competitor's stored metadata
                    let wins = match fetch(entry.device)? {
                        Some(other) => wins_conflict(file, &other),
                        None => true,
                    };
                    if wins {
                        inserted_at = i;
                        break;
                    }
                }
            }
        }

        self.versions.insert(inserted_at, new);

        Ok(ListChange::Changed {
            removed,
            inserted_at,
        })
    }
}

impl Encode for VersionList {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Truncation is okay, a list never holds 2^32 devices
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.versions.len() as u32)?;

        for fv in &self.versions {
            writer.write_u32::<BigEndian>(fv.device)?;
            writer.write_u8(u8::from(fv.invalid))?;
            fv.version.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for VersionList {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let len = reader.read_u32_varint()? as usize;
        let mut versions = Vec::with_capacity(len.min(1_024));

        for _ in 0..len {
            let device = reader.read_u32::<BigEndian>()?;
            let invalid = reader.read_u8()? != 0;
            let version = Vector::decode_from(reader)?;
            versions.push(FileVersion {
                device,
                version,
                invalid,
            });
        }

        Ok(Self { versions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn file_at(version: Vector) -> FileInfo {
        FileInfo {
            name: "f".into(),
            version,
            modified_s: 1_000,
            ..FileInfo::default()
        }
    }

    fn no_fetch(_: u32) -> crate::Result<Option<FileInfoTruncated>> {
        Ok(None)
    }

    #[test]
    fn list_insert_orders_by_version() {
        let mut vl = VersionList::default();

        let v1 = Vector::new().with(1, 1);
        let v2 = Vector::new().with(1, 2);

        vl.update(10, &file_at(v1.clone()), &mut no_fetch).expect("update");
        vl.update(11, &file_at(v2.clone()), &mut no_fetch).expect("update");

        assert_eq!(11, vl.head().expect("head").device);
        assert_eq!(2, vl.versions().len());

        // Same version on a third device joins behind the head
        vl.update(12, &file_at(v2), &mut no_fetch).expect("update");
        assert_eq!(11, vl.head().expect("head").device);
    }

    #[test]
    fn list_same_tuple_is_noop() {
        let mut vl = VersionList::default();
        let v = Vector::new().with(1, 1);

        let r = vl.update(10, &file_at(v.clone()), &mut no_fetch).expect("update");
        assert!(matches!(r, ListChange::Changed { .. }));

        let r = vl.update(10, &file_at(v), &mut no_fetch).expect("update");
        assert_eq!(ListChange::Unchanged, r);
        assert_eq!(1, vl.versions().len());
    }

    #[test]
    fn list_invalid_does_not_displace_equal_valid() {
        let mut vl = VersionList::default();
        let v = Vector::new().with(1, 1);

        vl.update(10, &file_at(v.clone()), &mut no_fetch).expect("update");

        let mut invalid = file_at(v);
        invalid.raw_invalid = true;
        vl.update(11, &invalid, &mut no_fetch).expect("update");

        assert_eq!(10, vl.head().expect("head").device);
        assert!(vl.versions().get(1).expect("second").invalid);
    }

    #[test]
    fn list_valid_displaces_equal_invalid() {
        let mut vl = VersionList::default();
        let v = Vector::new().with(1, 1);

        let mut invalid = file_at(v.clone());
        invalid.raw_invalid = true;
        vl.update(10, &invalid, &mut no_fetch).expect("update");

        vl.update(11, &file_at(v), &mut no_fetch).expect("update");
        assert_eq!(11, vl.head().expect("head").device);
    }

    #[test]
    fn list_concurrent_resolved_by_mod_time() {
        let mut vl = VersionList::default();

        let mut older = file_at(Vector::new().with(1, 2).with(2, 1));
        older.modified_s = 1_000;
        vl.update(10, &older, &mut no_fetch).expect("update");

        // Concurrent, newer mod time: wins against the stored entry
        let mut newer = file_at(Vector::new().with(1, 1).with(2, 2));
        newer.modified_s = 2_000;

        let older_clone = older.truncated();
        let mut fetch = move |_dev: u32| Ok(Some(older_clone.clone()));
        vl.update(11, &newer, &mut fetch).expect("update");

        assert_eq!(11, vl.head().expect("head").device);
    }

    #[test]
    fn list_concurrent_missing_loser_wins() {
        let mut vl = VersionList::default();

        vl.update(10, &file_at(Vector::new().with(1, 1)), &mut no_fetch)
            .expect("update");

        // Concurrent against device 10, whose record is gone
        let other = file_at(Vector::new().with(2, 1));
        vl.update(11, &other, &mut no_fetch).expect("update");

        assert_eq!(11, vl.head().expect("head").device);
    }

    #[test]
    fn list_pop_removes() {
        let mut vl = VersionList::default();
        vl.update(10, &file_at(Vector::new().with(1, 1)), &mut no_fetch)
            .expect("update");

        let (removed, at) = vl.pop(10);
        assert!(removed.is_some());
        assert_eq!(Some(0), at);
        assert!(vl.is_empty());

        let (removed, at) = vl.pop(10);
        assert!(removed.is_none());
        assert!(at.is_none());
    }

    #[test]
    fn list_roundtrip() {
        let mut vl = VersionList::default();
        vl.update(10, &file_at(Vector::new().with(1, 1)), &mut no_fetch)
            .expect("update");
        vl.update(11, &file_at(Vector::new().with(1, 2)), &mut no_fetch)
            .expect("update");

        let back = VersionList::decode_from_slice(&vl.encode_into_vec()).expect("decode");
        assert_eq!(vl, back);
    }
}
