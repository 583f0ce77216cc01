// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{read_bytes, write_bytes, Decode, DecodeError, Encode, EncodeError},
    device::ShortId,
    vector::Vector,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use enum_dispatch::enum_dispatch;
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Entry was scanned on a platform that cannot represent it (e.g. an
/// unsupported file type)
pub const FLAG_LOCAL_UNSUPPORTED: u32 = 1 << 31;

/// Entry matches an ignore pattern on this device
pub const FLAG_LOCAL_IGNORED: u32 = 1 << 30;

/// Entry must be rescanned before it can be synced again
pub const FLAG_LOCAL_MUST_RESCAN: u32 = 1 << 29;

/// Entry was changed locally in a receive-only folder
pub const FLAG_LOCAL_RECEIVE_ONLY: u32 = 1 << 28;

/// All individually meaningful local flag bits
pub const LOCAL_ALL_FLAGS: u32 =
    FLAG_LOCAL_UNSUPPORTED | FLAG_LOCAL_IGNORED | FLAG_LOCAL_MUST_RESCAN | FLAG_LOCAL_RECEIVE_ONLY;

/// Local flag bits that make an entry invalid as a sync source
pub const LOCAL_INVALID_FLAGS: u32 = LOCAL_ALL_FLAGS;

/// Nominal byte cost accounted for directories and symlinks
const SYNTHETIC_DIRECTORY_SIZE: u64 = 128;

/// Invokes `f` once per set bit in `flags`, restricted to the
/// individually meaningful flag set.
pub(crate) fn each_flag_bit(flags: u32, mut f: impl FnMut(u32)) {
    let mut rest = flags & LOCAL_ALL_FLAGS;
    while rest != 0 {
        let bit = 1 << rest.trailing_zeros();
        f(bit);
        rest &= !bit;
    }
}

/// File system entry type
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FileType {
    /// Regular file
    #[default]
    File,

    /// Directory
    Directory,

    /// Symbolic link
    Symlink,
}

impl TryFrom<u8> for FileType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::File),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Symlink),
            _ => Err(()),
        }
    }
}

impl From<FileType> for u8 {
    fn from(value: FileType) -> Self {
        match value {
            FileType::File => 0,
            FileType::Directory => 1,
            FileType::Symlink => 2,
        }
    }
}

/// A single content block of a file
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockInfo {
    /// Byte offset of the block within the file
    pub offset: u64,

    /// Block length in bytes
    pub size: u32,

    /// Content hash of the block
    pub hash: Vec<u8>,
}

impl Encode for BlockInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.offset)?;
        writer.write_u32_varint(self.size)?;
        write_bytes(writer, &self.hash)?;
        Ok(())
    }
}

impl Decode for BlockInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offset = reader.read_u64_varint()?;
        let size = reader.read_u32_varint()?;
        let hash = read_bytes(reader)?;
        Ok(Self { offset, size, hash })
    }
}

/// Common view over full and truncated file metadata
#[enum_dispatch]
pub trait FileLike {
    /// Canonical file name.
    fn file_name(&self) -> &str;

    /// Accounted file size in bytes.
    ///
    /// Deleted entries account zero bytes; directories and symlinks a
    /// small nominal cost.
    fn file_size(&self) -> u64;

    /// Whether the entry is a deletion record.
    fn is_deleted(&self) -> bool;

    /// Whether the entry must not be used as a sync source, either because
    /// the peer says so or because a local flag excludes it.
    fn is_invalid(&self) -> bool;

    /// Whether the entry is a directory.
    fn is_directory(&self) -> bool;

    /// Whether the entry is a symbolic link.
    fn is_symlink(&self) -> bool;

    /// Whether the entry matches an ignore pattern.
    fn is_ignored(&self) -> bool;

    /// Whether the entry carries local-only changes in a receive-only folder.
    fn is_receive_only_changed(&self) -> bool;

    /// Raw local flag bits.
    fn local_flags(&self) -> u32;

    /// Per-device change sequence number.
    fn sequence_no(&self) -> u64;

    /// Version vector of the entry.
    fn file_version(&self) -> &Vector;

    /// Modification time as (seconds, nanoseconds).
    fn mod_time(&self) -> (i64, u32);
}

/// Full metadata for one file version as held by one device
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    /// Canonical name: UTF-8, NFC-normalised, forward-slash separated
    pub name: String,

    /// Entry type
    pub file_type: FileType,

    /// File size in bytes (zero for directories and deletions)
    pub size: u64,

    /// Unix permission bits
    pub permissions: u32,

    /// Modification time, seconds since epoch
    pub modified_s: i64,

    /// Modification time, nanosecond remainder
    pub modified_ns: u32,

    /// Short id of the device that last changed the entry
    pub modified_by: ShortId,

    /// Whether this is a deletion record
    pub deleted: bool,

    /// Peer-declared invalid marker
    pub raw_invalid: bool,

    /// Whether permission bits should be ignored when comparing
    pub no_permissions: bool,

    /// Version vector
    pub version: Vector,

    /// Per-device monotonic change counter
    pub sequence: u64,

    /// Block size used to cut the content into blocks
    pub block_size: u32,

    /// Content blocks; empty for directories, symlinks and deletions
    pub blocks: Vec<BlockInfo>,

    /// Symlink target, if the entry is a symlink
    pub symlink_target: String,

    /// Local-only flag bits, never sent over the wire
    pub local_flags: u32,
}

impl FileInfo {
    /// Returns the truncated variant, dropping blocks and symlink target.
    #[must_use]
    pub fn truncated(&self) -> FileInfoTruncated {
        FileInfoTruncated {
            name: self.name.clone(),
            file_type: self.file_type,
            size: self.size,
            permissions: self.permissions,
            modified_s: self.modified_s,
            modified_ns: self.modified_ns,
            modified_by: self.modified_by,
            deleted: self.deleted,
            raw_invalid: self.raw_invalid,
            no_permissions: self.no_permissions,
            version: self.version.clone(),
            sequence: self.sequence,
            block_size: self.block_size,
            local_flags: self.local_flags,
        }
    }

    /// Returns `true` if `other` describes the same observable state:
    /// equal version, equal invalid bit and equal local flags.
    ///
    /// Entries that are equivalent in this sense are skipped by `update`;
    /// in particular an identical version re-announced with a different
    /// block list does not replace the stored entry.
    #[must_use]
    pub fn is_equivalent<F: FileLike>(&self, other: &F) -> bool {
        self.version == *other.file_version()
            && self.is_invalid() == other.is_invalid()
            && self.local_flags == other.local_flags()
    }
}

impl FileLike for FileInfo {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        if self.deleted {
            return 0;
        }
        match self.file_type {
            FileType::File => self.size,
            FileType::Directory | FileType::Symlink => SYNTHETIC_DIRECTORY_SIZE,
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn is_invalid(&self) -> bool {
        self.raw_invalid || self.local_flags & LOCAL_INVALID_FLAGS != 0
    }

    fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    fn is_ignored(&self) -> bool {
        self.local_flags & FLAG_LOCAL_IGNORED != 0
    }

    fn is_receive_only_changed(&self) -> bool {
        self.local_flags & FLAG_LOCAL_RECEIVE_ONLY != 0
    }

    fn local_flags(&self) -> u32 {
        self.local_flags
    }

    fn sequence_no(&self) -> u64 {
        self.sequence
    }

    fn file_version(&self) -> &Vector {
        &self.version
    }

    fn mod_time(&self) -> (i64, u32) {
        (self.modified_s, self.modified_ns)
    }
}

/// Truncated metadata: everything but the block list and symlink target
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileInfoTruncated {
    /// Canonical name
    pub name: String,

    /// Entry type
    pub file_type: FileType,

    /// File size in bytes
    pub size: u64,

    /// Unix permission bits
    pub permissions: u32,

    /// Modification time, seconds since epoch
    pub modified_s: i64,

    /// Modification time, nanosecond remainder
    pub modified_ns: u32,

    /// Short id of the device that last changed the entry
    pub modified_by: ShortId,

    /// Whether this is a deletion record
    pub deleted: bool,

    /// Peer-declared invalid marker
    pub raw_invalid: bool,

    /// Whether permission bits should be ignored when comparing
    pub no_permissions: bool,

    /// Version vector
    pub version: Vector,

    /// Per-device monotonic change counter
    pub sequence: u64,

    /// Block size used to cut the content into blocks
    pub block_size: u32,

    /// Local-only flag bits
    pub local_flags: u32,
}

impl FileLike for FileInfoTruncated {
    fn file_name(&self) -> &str {
        &self.name
    }

    fn file_size(&self) -> u64 {
        if self.deleted {
            return 0;
        }
        match self.file_type {
            FileType::File => self.size,
            FileType::Directory | FileType::Symlink => SYNTHETIC_DIRECTORY_SIZE,
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn is_invalid(&self) -> bool {
        self.raw_invalid || self.local_flags & LOCAL_INVALID_FLAGS != 0
    }

    fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }

    fn is_ignored(&self) -> bool {
        self.local_flags & FLAG_LOCAL_IGNORED != 0
    }

    fn is_receive_only_changed(&self) -> bool {
        self.local_flags & FLAG_LOCAL_RECEIVE_ONLY != 0
    }

    fn local_flags(&self) -> u32 {
        self.local_flags
    }

    fn sequence_no(&self) -> u64 {
        self.sequence
    }

    fn file_version(&self) -> &Vector {
        &self.version
    }

    fn mod_time(&self) -> (i64, u32) {
        (self.modified_s, self.modified_ns)
    }
}

/// Either a full or a truncated file entry, as produced by queries
#[enum_dispatch(FileLike)]
#[derive(Clone, Debug)]
pub enum AnyFile {
    /// Full metadata including blocks
    Full(FileInfo),

    /// Truncated metadata
    Truncated(FileInfoTruncated),
}

impl AnyFile {
    /// Unwraps the full variant.
    #[must_use]
    pub fn into_full(self) -> Option<FileInfo> {
        match self {
            Self::Full(f) => Some(f),
            Self::Truncated(_) => None,
        }
    }

    /// Unwraps the truncated variant, truncating a full entry if needed.
    #[must_use]
    pub fn into_truncated(self) -> FileInfoTruncated {
        match self {
            Self::Full(f) => f.truncated(),
            Self::Truncated(t) => t,
        }
    }
}

/// Decides a conflict between two concurrent file versions.
///
/// Returns `true` if `a` wins over `b`: a valid entry beats an invalid
/// one, then the later modification time wins, then the lexicographically
/// greater version-vector serialisation as the final tiebreak.
pub(crate) fn wins_conflict<A: FileLike, B: FileLike>(a: &A, b: &B) -> bool {
    if a.is_invalid() != b.is_invalid() {
        return !a.is_invalid();
    }

    match a.mod_time().cmp(&b.mod_time()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => {
            a.file_version().encode_into_vec() > b.file_version().encode_into_vec()
        }
    }
}

// Shared field layout: both variants decode from the same byte stream,
// the truncated decoder discards blocks and symlink target.

/// Packed boolean field bits
mod field_bits {
    pub const DELETED: u8 = 1;
    pub const RAW_INVALID: u8 = 1 << 1;
    pub const NO_PERMISSIONS: u8 = 1 << 2;
}

#[allow(clippy::struct_excessive_bools)]
struct Header {
    name: String,
    file_type: FileType,
    size: u64,
    permissions: u32,
    modified_s: i64,
    modified_ns: u32,
    modified_by: ShortId,
    deleted: bool,
    raw_invalid: bool,
    no_permissions: bool,
    version: Vector,
    sequence: u64,
    block_size: u32,
    local_flags: u32,
}

fn encode_header<W: Write>(
    writer: &mut W,
    file: &FileInfo,
) -> Result<(), EncodeError> {
    write_bytes(writer, file.name.as_bytes())?;
    writer.write_u8(u8::from(file.file_type))?;
    writer.write_u64_varint(file.size)?;
    writer.write_u32::<BigEndian>(file.permissions)?;

    // NOTE: Two's complement round-trips through u64
    #[allow(clippy::cast_sign_loss)]
    writer.write_u64::<BigEndian>(file.modified_s as u64)?;
    writer.write_u32::<BigEndian>(file.modified_ns)?;
    writer.write_u32::<BigEndian>(file.modified_by)?;

    let mut bits = 0u8;
    if file.deleted {
        bits |= field_bits::DELETED;
    }
    if file.raw_invalid {
        bits |= field_bits::RAW_INVALID;
    }
    if file.no_permissions {
        bits |= field_bits::NO_PERMISSIONS;
    }
    writer.write_u8(bits)?;

    writer.write_u32::<BigEndian>(file.local_flags)?;
    file.version.encode_into(writer)?;
    writer.write_u64_varint(file.sequence)?;
    writer.write_u32_varint(file.block_size)?;

    Ok(())
}

fn decode_header<R: Read>(reader: &mut R) -> Result<Header, DecodeError> {
    let name = String::from_utf8(read_bytes(reader)?)
        .map_err(|_| DecodeError::InvalidUtf8("name"))?;

    let file_type = reader.read_u8()?;
    let file_type = file_type
        .try_into()
        .map_err(|()| DecodeError::InvalidTag(("FileType", file_type)))?;

    let size = reader.read_u64_varint()?;
    let permissions = reader.read_u32::<BigEndian>()?;

    // NOTE: Two's complement round-trips through u64
    #[allow(clippy::cast_possible_wrap)]
    let modified_s = reader.read_u64::<BigEndian>()? as i64;
    let modified_ns = reader.read_u32::<BigEndian>()?;
    let modified_by = reader.read_u32::<BigEndian>()?;

    let bits = reader.read_u8()?;
    let local_flags = reader.read_u32::<BigEndian>()?;
    let version = Vector::decode_from(reader)?;
    let sequence = reader.read_u64_varint()?;
    let block_size = reader.read_u32_varint()?;

    Ok(Header {
        name,
        file_type,
        size,
        permissions,
        modified_s,
        modified_ns,
        modified_by,
        deleted: bits & field_bits::DELETED != 0,
        raw_invalid: bits & field_bits::RAW_INVALID != 0,
        no_permissions: bits & field_bits::NO_PERMISSIONS != 0,
        version,
        sequence,
        block_size,
        local_flags,
    })
}

impl Encode for FileInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        encode_header(writer, self)?;

        // NOTE: Truncation is okay, block counts are bounded by file size
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.blocks.len() as u32)?;
        for block in &self.blocks {
            block.encode_into(writer)?;
        }

        write_bytes(writer, self.symlink_target.as_bytes())?;

        Ok(())
    }
}

impl Decode for FileInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let h = decode_header(reader)?;

        let block_count = reader.read_u32_varint()? as usize;
        let mut blocks = Vec::with_capacity(block_count.min(4_096));
        for _ in 0..block_count {
            blocks.push(BlockInfo::decode_from(reader)?);
        }

        let symlink_target = String::from_utf8(read_bytes(reader)?)
            .map_err(|_| DecodeError::InvalidUtf8("symlink_target"))?;

        Ok(Self {
            name: h.name,
            file_type: h.file_type,
            size: h.size,
            permissions: h.permissions,
            modified_s: h.modified_s,
            modified_ns: h.modified_ns,
            modified_by: h.modified_by,
            deleted: h.deleted,
            raw_invalid: h.raw_invalid,
            no_permissions: h.no_permissions,
            version: h.version,
            sequence: h.sequence,
            block_size: h.block_size,
            blocks,
            symlink_target,
            local_flags: h.local_flags,
        })
    }
}

impl Decode for FileInfoTruncated {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let h = decode_header(reader)?;

        // Skip blocks and symlink target without materialising them
        let block_count = reader.read_u32_varint()? as usize;
        for _ in 0..block_count {
            let _ = BlockInfo::decode_from(reader)?;
        }
        let _ = read_bytes(reader)?;

        Ok(Self {
            name: h.name,
            file_type: h.file_type,
            size: h.size,
            permissions: h.permissions,
            modified_s: h.modified_s,
            modified_ns: h.modified_ns,
            modified_by: h.modified_by,
            deleted: h.deleted,
            raw_invalid: h.raw_invalid,
            no_permissions: h.no_permissions,
            version: h.version,
            sequence: h.sequence,
            block_size: h.block_size,
            local_flags: h.local_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sample() -> FileInfo {
        FileInfo {
            name: "docs/readme.md".into(),
            file_type: FileType::File,
            size: 1_234,
            permissions: 0o644,
            modified_s: 1_700_000_000,
            modified_ns: 999,
            modified_by: 42,
            version: Vector::new().with(42, 7),
            sequence: 3,
            block_size: 128 * 1024,
            blocks: vec![BlockInfo {
                offset: 0,
                size: 1_234,
                hash: vec![0xaa; 32],
            }],
            ..FileInfo::default()
        }
    }

    #[test]
    fn file_info_roundtrip() {
        let f = sample();
        let bytes = f.encode_into_vec();
        let back = FileInfo::decode_from_slice(&bytes).expect("decode");
        assert_eq!(f, back);
    }

    #[test]
    fn file_info_truncated_decode() {
        let f = sample();
        let bytes = f.encode_into_vec();
        let t = FileInfoTruncated::decode_from_slice(&bytes).expect("decode");
        assert_eq!(f.truncated(), t);
        assert_eq!(f.file_version(), t.file_version());
    }

    #[test]
    fn file_info_negative_mtime_roundtrip() {
        let mut f = sample();
        f.modified_s = -12_345;
        let back = FileInfo::decode_from_slice(&f.encode_into_vec()).expect("decode");
        assert_eq!(-12_345, back.modified_s);
    }

    #[test]
    fn invalid_by_flag_or_marker() {
        let mut f = sample();
        assert!(!f.is_invalid());

        f.raw_invalid = true;
        assert!(f.is_invalid());

        f.raw_invalid = false;
        f.local_flags = FLAG_LOCAL_IGNORED;
        assert!(f.is_invalid());
        assert!(f.is_ignored());
    }

    #[test]
    fn accounted_size() {
        let mut f = sample();
        assert_eq!(1_234, f.file_size());

        f.deleted = true;
        assert_eq!(0, f.file_size());

        f.deleted = false;
        f.file_type = FileType::Directory;
        assert_eq!(128, f.file_size());
    }

    #[test]
    fn conflict_invalid_loses() {
        let mut a = sample();
        let mut b = sample();
        b.modified_s += 100; // newer, but...
        b.raw_invalid = true; // ...invalid loses regardless

        assert!(wins_conflict(&a, &b));
        assert!(!wins_conflict(&b, &a));

        // Both valid: later mod time wins
        b.raw_invalid = false;
        assert!(wins_conflict(&b, &a));

        // Same mod time: serialised version tiebreak
        a.modified_s = b.modified_s;
        a.modified_ns = b.modified_ns;
        a.version = Vector::new().with(42, 9);
        b.version = Vector::new().with(42, 7);
        assert!(wins_conflict(&a, &b));
    }

    #[test]
    fn flag_bit_iteration() {
        let mut seen = vec![];
        each_flag_bit(FLAG_LOCAL_IGNORED | FLAG_LOCAL_RECEIVE_ONLY, |bit| {
            seen.push(bit);
        });
        assert_eq!(vec![FLAG_LOCAL_RECEIVE_ONLY, FLAG_LOCAL_IGNORED], seen);
    }
}
