// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{database::DbInner, keyer, util};
use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

/// Inverted index from block hash to the local files containing the block
///
/// Answers "which local file has a block with this hash, and at which
/// index", so reusable content can be copied instead of fetched. The
/// index is maintained by [`crate::FileSet::update`] for local,
/// non-deleted, non-directory, valid files; the finder itself never
/// writes.
#[derive(Clone)]
pub struct BlockFinder {
    db: Arc<DbInner>,
}

impl BlockFinder {
    pub(crate) fn new(db: Arc<DbInner>) -> Self {
        Self { db }
    }

    /// Calls `f` with `(folder, native file name, block index)` for every
    /// hit of `hash` in the given folders, until `f` returns `false` or
    /// the hits are exhausted.
    ///
    /// Hits arrive per folder in name order; there is no ordering across
    /// folders beyond the order of `folders` itself.
    ///
    /// # Errors
    ///
    /// Backend errors terminate the iteration and are surfaced.
    pub fn iterate(
        &self,
        folders: &[&str],
        hash: &[u8],
        mut f: impl FnMut(&str, &str, u32) -> bool,
    ) -> crate::Result<()> {
        for folder in folders {
            let Some(folder_id) = self.db.keyer.folder_id_if_exists(folder) else {
                continue;
            };

            let prefix = keyer::block_map_hash_prefix(folder_id, hash);
            for kv in self.db.backend.iter_prefix(&prefix)? {
                let (key, value) = kv?;

                let name = keyer::block_map_key_name(&key);
                let Ok(name) = std::str::from_utf8(name) else {
                    log::warn!("skipping block map entry with non-UTF-8 name");
                    continue;
                };

                if value.len() != 4 {
                    log::warn!("skipping malformed block map entry for {name:?}");
                    continue;
                }
                let index = BigEndian::read_u32(&value);

                if !f(folder, &util::native_name(name), index) {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
