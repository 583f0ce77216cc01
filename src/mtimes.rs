// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{database::DbInner, keyer, util};
use byteorder::{BigEndian, ByteOrder};
use std::{
    sync::Arc,
    time::SystemTime,
};

/// A file timestamp with nanosecond precision
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Mtime {
    /// Seconds since the Unix epoch (may be negative)
    pub secs: i64,

    /// Nanosecond remainder
    pub nanos: u32,
}

impl From<SystemTime> for Mtime {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                secs: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nanos: d.subsec_nanos(),
            },
            // Pre-epoch timestamps
            Err(e) => {
                let d = e.duration();
                Self {
                    secs: -i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                    nanos: d.subsec_nanos(),
                }
            }
        }
    }
}

/// Per-folder store mapping file names to a pair of timestamps: the
/// modification time as stored on disk and the actual one to report
///
/// Used by callers on filesystems that cannot persist the wanted mtime.
/// The store is keyed by canonical names, like everything else.
pub struct MtimeFs {
    db: Arc<DbInner>,
    folder_id: u32,
}

impl MtimeFs {
    pub(crate) fn new(db: Arc<DbInner>, folder_id: u32) -> Self {
        Self { db, folder_id }
    }

    /// Returns the stored `(on disk, actual)` pair for `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    pub fn get(&self, name: &str) -> crate::Result<Option<(Mtime, Mtime)>> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(None);
        };

        let key = keyer::mtimes_key(self.folder_id, name.as_bytes());
        let Some(raw) = self.db.backend.get(&key)? else {
            return Ok(None);
        };

        if raw.len() != 24 {
            log::warn!("skipping malformed mtime entry for {name:?}");
            return Ok(None);
        }

        Ok(Some((decode_mtime(&raw[0..12]), decode_mtime(&raw[12..24]))))
    }

    /// Stores the `(on disk, actual)` pair for `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    pub fn insert(&self, name: &str, on_disk: Mtime, actual: Mtime) -> crate::Result<()> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(());
        };

        let mut value = [0u8; 24];
        encode_mtime(&mut value[0..12], on_disk);
        encode_mtime(&mut value[12..24], actual);

        let key = keyer::mtimes_key(self.folder_id, name.as_bytes());
        self.db.backend.put(&key, &value)
    }

    /// Removes the pair stored for `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after the backend has shut down.
    pub fn remove(&self, name: &str) -> crate::Result<()> {
        let Some(name) = util::canonicalize_name(name) else {
            return Ok(());
        };

        let key = keyer::mtimes_key(self.folder_id, name.as_bytes());
        self.db.backend.delete(&key)
    }
}

fn encode_mtime(buf: &mut [u8], t: Mtime) {
    // NOTE: Two's complement round-trips through u64
    #[allow(clippy::cast_sign_loss)]
    BigEndian::write_u64(&mut buf[0..8], t.secs as u64);
    BigEndian::write_u32(&mut buf[8..12], t.nanos);
}

fn decode_mtime(buf: &[u8]) -> Mtime {
    // NOTE: Two's complement round-trips through u64
    #[allow(clippy::cast_possible_wrap)]
    Mtime {
        secs: BigEndian::read_u64(&buf[0..8]) as i64,
        nanos: BigEndian::read_u32(&buf[8..12]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn mtime_from_system_time() {
        let t = SystemTime::UNIX_EPOCH + std::time::Duration::new(12, 34);
        assert_eq!(Mtime { secs: 12, nanos: 34 }, Mtime::from(t));

        let t = SystemTime::UNIX_EPOCH - std::time::Duration::new(12, 0);
        assert_eq!(Mtime { secs: -12, nanos: 0 }, Mtime::from(t));
    }

    #[test]
    fn mtime_codec_roundtrip() {
        let t = Mtime {
            secs: -1_234,
            nanos: 567,
        };
        let mut buf = [0u8; 12];
        encode_mtime(&mut buf, t);
        assert_eq!(t, decode_mtime(&buf));
    }
}
