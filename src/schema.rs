// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{keyer, Database, Error};
use byteorder::{BigEndian, ByteOrder};

/// Current on-disk schema version
pub(crate) const SCHEMA_VERSION: u64 = 1;

const SCHEMA_VERSION_KEY: &[u8] = b"schemaVersion";
const MIN_ENGINE_VERSION_KEY: &[u8] = b"minEngineVersion";

/// Brings the stored schema up to the current version.
///
/// A fresh database is stamped with the current version. A database
/// written by an older engine is migrated in place (the current layout has
/// no predecessors, so this is a re-stamp). A database written by a
/// *newer* engine is rejected with [`Error::Downgrade`] naming the minimum
/// engine version able to read it.
///
/// Runs automatically in [`Database::open`].
///
/// # Errors
///
/// `Error::Downgrade` on a too-new schema; backend errors otherwise.
pub fn update_schema(db: &Database) -> crate::Result<()> {
    let backend = db.backend();
    let version_key = keyer::misc_key(SCHEMA_VERSION_KEY);

    let stored = backend
        .get(&version_key)?
        .filter(|raw| raw.len() == 8)
        .map(|raw| BigEndian::read_u64(&raw));

    match stored {
        Some(version) if version == SCHEMA_VERSION => return Ok(()),
        Some(version) if version > SCHEMA_VERSION => {
            let required = backend
                .get(&keyer::misc_key(MIN_ENGINE_VERSION_KEY))?
                .map_or_else(
                    || "unknown".to_owned(),
                    |raw| String::from_utf8_lossy(&raw).into_owned(),
                );

            log::error!(
                "stored schema version {version} exceeds supported {SCHEMA_VERSION}; \
                 engine {required} or newer is required"
            );
            return Err(Error::Downgrade { required });
        }
        Some(version) => {
            log::debug!("migrating schema version {version} -> {SCHEMA_VERSION}");
        }
        None => {
            log::debug!("stamping fresh database with schema version {SCHEMA_VERSION}");
        }
    }

    let mut raw = [0u8; 8];
    BigEndian::write_u64(&mut raw, SCHEMA_VERSION);
    backend.put(&version_key, &raw)?;

    backend.put(
        &keyer::misc_key(MIN_ENGINE_VERSION_KEY),
        env!("CARGO_PKG_VERSION").as_bytes(),
    )?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{backend::memory::MemoryBackend, backend::Backend};
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn schema_stamped_on_open() {
        let backend = Arc::new(MemoryBackend::new());
        let db = Database::open(backend).unwrap();

        let raw = db
            .backend()
            .get(&keyer::misc_key(SCHEMA_VERSION_KEY))
            .unwrap()
            .unwrap();
        assert_eq!(SCHEMA_VERSION, BigEndian::read_u64(&raw));
    }

    #[test]
    fn newer_schema_is_rejected() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());

        let mut raw = [0u8; 8];
        BigEndian::write_u64(&mut raw, SCHEMA_VERSION + 1);
        backend
            .put(&keyer::misc_key(SCHEMA_VERSION_KEY), &raw)
            .unwrap();
        backend
            .put(&keyer::misc_key(MIN_ENGINE_VERSION_KEY), b"99.0.0")
            .unwrap();

        let err = Database::open(backend).unwrap_err();
        match err {
            Error::Downgrade { required } => assert_eq!("99.0.0", required),
            other => panic!("expected downgrade error, got {other:?}"),
        }
    }
}
