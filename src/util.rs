// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::time::{Duration, SystemTime};
use unicode_normalization::{is_nfc, UnicodeNormalization};

/// Environment override for the metadata recheck interval, a duration
/// string such as `"720h"` or `"30days"`.
pub const RECHECK_INTERVAL_ENV: &str = "SYNC_INDEX_RECHECK_INTERVAL";

const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// `None` if no such key exists (the prefix is empty or all `0xff`).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();

    while let Some(last) = end.last().copied() {
        if last < 0xff {
            if let Some(slot) = end.last_mut() {
                *slot = last + 1;
            }
            return Some(end);
        }
        end.pop();
    }

    None
}

/// Canonicalises a file name: native separators to forward slashes, NFC
/// normalisation.
///
/// Returns `None` for names that must be rejected: empty names and names
/// whose first path segment is `""`, `"."` or `".."`.
pub(crate) fn canonicalize_name(name: &str) -> Option<String> {
    let name = if cfg!(windows) {
        name.replace('\\', "/")
    } else {
        name.to_owned()
    };

    let name = if is_nfc(&name) {
        name
    } else {
        name.nfc().collect()
    };

    match name.split('/').next() {
        None | Some("" | "." | "..") => None,
        Some(_) => Some(name),
    }
}

/// Maps a canonical name back to the platform's native separators.
pub(crate) fn native_name(name: &str) -> String {
    if cfg!(windows) {
        name.replace('/', "\\")
    } else {
        name.to_owned()
    }
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
pub(crate) fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// The metadata recheck interval, honouring the environment override.
pub(crate) fn recheck_interval() -> Duration {
    let Ok(raw) = std::env::var(RECHECK_INTERVAL_ENV) else {
        return DEFAULT_RECHECK_INTERVAL;
    };

    match humantime::parse_duration(&raw) {
        Ok(interval) => interval,
        Err(e) => {
            log::warn!("invalid {RECHECK_INTERVAL_ENV} value {raw:?}: {e}; using default");
            DEFAULT_RECHECK_INTERVAL
        }
    }
}
