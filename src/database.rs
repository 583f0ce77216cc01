// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    backend::Backend,
    blockmap::BlockFinder,
    fileset::FileSet,
    keyer::{self, Keyer},
    schema,
    transactions::WriteTxn,
};
use std::sync::Arc;

pub(crate) struct DbInner {
    pub backend: Arc<dyn Backend>,
    pub keyer: Keyer,
}

/// The index database: folders, devices and their file metadata atop an
/// ordered key/value backend
///
/// Folders are independent of each other; each gets its own [`FileSet`].
/// The database handle is cheap to clone and shared by all folders.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens the database on `backend`, rebuilding the in-memory interners
    /// and checking the stored schema version.
    ///
    /// # Errors
    ///
    /// `Error::Downgrade` if the store was written by a newer engine;
    /// backend errors otherwise.
    pub fn open(backend: Arc<dyn Backend>) -> crate::Result<Self> {
        let keyer = Keyer::load(&backend)?;
        let db = Self {
            inner: Arc::new(DbInner { backend, keyer }),
        };

        schema::update_schema(&db)?;
        Ok(db)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// All folders known to the database, sorted by name.
    #[must_use]
    pub fn list_folders(&self) -> Vec<String> {
        self.inner.keyer.folder_names()
    }

    /// Opens the per-folder façade, creating the folder on first use.
    ///
    /// Loads the folder's cached counters, triggering a full recalculation
    /// when they are missing, undecodable or stale.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn new_file_set(&self, folder: &str) -> crate::Result<FileSet> {
        FileSet::open(self.inner.clone(), folder)
    }

    /// The block finder over this database.
    #[must_use]
    pub fn block_finder(&self) -> BlockFinder {
        BlockFinder::new(self.inner.clone())
    }

    /// Removes every trace of `folder`: file entries, version lists, block
    /// map, sequence log, need set, counters, mtimes and index ids.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn drop_folder(&self, folder: &str) -> crate::Result<()> {
        let Some(folder_id) = self.inner.keyer.folder_id_if_exists(folder) else {
            return Ok(());
        };

        log::debug!("dropping folder {folder:?}");
        let txn = WriteTxn::new(&self.inner.backend)?;

        for prefix in [
            keyer::device_file_folder_prefix(folder_id),
            keyer::global_prefix(folder_id),
            keyer::block_map_prefix(folder_id),
            keyer::sequence_prefix(folder_id),
            keyer::need_prefix(folder_id),
            keyer::mtimes_prefix(folder_id),
        ] {
            txn.delete_prefix(&prefix)?;
        }

        txn.delete(keyer::folder_meta_key(folder_id));

        // Index-id keys are device-first; filter by folder
        for kv in txn.read.iter_prefix(&keyer::index_id_prefix())? {
            let (key, _) = kv?;
            if keyer::index_id_key_folder(&key) == Some(folder_id) {
                txn.delete(key.to_vec());
            }
        }

        txn.commit()?;
        self.inner.keyer.forget_folder(folder)
    }

    /// Removes the mtime store of `folder`.
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn drop_mtimes(&self, folder: &str) -> crate::Result<()> {
        let Some(folder_id) = self.inner.keyer.folder_id_if_exists(folder) else {
            return Ok(());
        };

        let txn = WriteTxn::new(&self.inner.backend)?;
        txn.delete_prefix(&keyer::mtimes_prefix(folder_id))?;
        txn.commit()
    }

    /// Removes the cached counters of `folder`, forcing a recalculation on
    /// the next [`Database::new_file_set`].
    ///
    /// # Errors
    ///
    /// Backend errors are surfaced.
    pub fn drop_folder_meta(&self, folder: &str) -> crate::Result<()> {
        let Some(folder_id) = self.inner.keyer.folder_id_if_exists(folder) else {
            return Ok(());
        };

        self.inner
            .backend
            .delete(&keyer::folder_meta_key(folder_id))
    }
}
