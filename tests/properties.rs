mod common;

use common::{dev, new_db, v};
use proptest::prelude::*;
use std::collections::BTreeMap;
use sync_index::{DeviceId, FileInfo, FileLike, FLAG_LOCAL_IGNORED};

const NAMES: [&str; 8] = [
    "a", "b", "dir/one", "dir/two", "dir/sub/three", "x.bin", "y.bin", "z",
];

/// (counter, deleted, ignored, size) per name index
type LocalSpec = BTreeMap<usize, (u64, bool, bool, u64)>;

/// (counter, deleted, invalid) per name index
type RemoteSpec = BTreeMap<usize, (u64, bool, bool)>;

fn local_batch(spec: &LocalSpec) -> Vec<FileInfo> {
    spec.iter()
        .map(|(idx, (counter, deleted, ignored, size))| FileInfo {
            name: NAMES[*idx % NAMES.len()].into(),
            size: *size,
            deleted: *deleted,
            local_flags: if *ignored { FLAG_LOCAL_IGNORED } else { 0 },
            version: v(&[(1, *counter)]),
            modified_s: 1_000,
            ..FileInfo::default()
        })
        .collect()
}

fn remote_batch(spec: &RemoteSpec) -> Vec<FileInfo> {
    spec.iter()
        .map(|(idx, (counter, deleted, invalid))| FileInfo {
            name: NAMES[*idx % NAMES.len()].into(),
            size: 50,
            deleted: *deleted,
            raw_invalid: *invalid,
            version: v(&[(1, *counter)]),
            modified_s: 1_000,
            ..FileInfo::default()
        })
        .collect()
}

fn local_spec() -> impl Strategy<Value = LocalSpec> {
    proptest::collection::btree_map(
        0usize..NAMES.len(),
        (1u64..6, any::<bool>(), any::<bool>(), 0u64..1_000),
        0..NAMES.len(),
    )
}

fn remote_spec() -> impl Strategy<Value = RemoteSpec> {
    proptest::collection::btree_map(
        0usize..NAMES.len(),
        (1u64..6, any::<bool>(), any::<bool>()),
        0..NAMES.len(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Local counts match a direct model of the batch; entries round-trip
    /// through point lookups; the sequence log is dense.
    #[test]
    fn local_sizes_and_roundtrip(spec in local_spec()) {
        let db = new_db();
        let files = db.new_file_set("default").expect("file set");

        let batch = local_batch(&spec);
        files.update(&DeviceId::LOCAL, batch.clone()).expect("update");

        let live: Vec<_> = batch
            .iter()
            .filter(|f| !f.deleted && f.local_flags == 0)
            .collect();
        let expected_bytes: u64 = live.iter().map(|f| f.size).sum();

        let snap = files.snapshot().expect("snapshot");

        let local = snap.local_size();
        prop_assert_eq!(live.len() as u64, local.files);
        prop_assert_eq!(expected_bytes, local.bytes);

        let global = snap.global_size();
        prop_assert_eq!(live.len() as u64, global.files);

        for f in &batch {
            let got = snap
                .get(&DeviceId::LOCAL, &f.name)
                .expect("get")
                .expect("stored entry");
            prop_assert_eq!(&f.version, &got.version);
            prop_assert_eq!(f.deleted, got.deleted);
            prop_assert_eq!(f.size, got.size);
            prop_assert_eq!(f.local_flags, got.local_flags);
        }

        // Dense, strictly increasing sequence log covering every entry
        let mut sequences = vec![];
        snap.with_have_sequence(0, |f| {
            sequences.push(f.sequence);
            true
        })
        .expect("with_have_sequence");

        let expected: Vec<u64> = (1..=batch.len() as u64).collect();
        prop_assert_eq!(expected, sequences);

        snap.release();
    }

    /// Applying the same batch twice changes nothing, including the
    /// sequence counter.
    #[test]
    fn update_is_idempotent(spec in local_spec()) {
        let db = new_db();
        let files = db.new_file_set("default").expect("file set");

        let batch = local_batch(&spec);
        files.update(&DeviceId::LOCAL, batch.clone()).expect("update");

        let seq_before = files.sequence(&DeviceId::LOCAL);
        let snap = files.snapshot().expect("snapshot");
        let local_before = snap.local_size();
        let global_before = snap.global_size();
        snap.release();

        files.update(&DeviceId::LOCAL, batch).expect("update");

        prop_assert_eq!(seq_before, files.sequence(&DeviceId::LOCAL));
        let snap = files.snapshot().expect("snapshot");
        prop_assert_eq!(local_before, snap.local_size());
        prop_assert_eq!(global_before, snap.global_size());
        snap.release();
    }

    /// The need list matches a direct model over totally ordered versions.
    #[test]
    fn need_matches_model(local in local_spec(), remote in remote_spec()) {
        let db = new_db();
        let files = db.new_file_set("default").expect("file set");
        let peer = dev(9);

        files.update(&DeviceId::LOCAL, local_batch(&local)).expect("update");
        files.update(&peer, remote_batch(&remote)).expect("update");

        let mut expected: Vec<&str> = vec![];
        for (idx, (r_counter, r_deleted, r_invalid)) in &remote {
            if *r_invalid {
                continue;
            }
            let l = local.get(idx);
            let have = l.is_some();
            let l_counter = l.map_or(0, |(c, _, _, _)| *c);

            if *r_counter > l_counter && !(*r_deleted && !have) {
                expected.push(NAMES[*idx % NAMES.len()]);
            }
        }
        expected.sort_unstable();

        let snap = files.snapshot().expect("snapshot");
        let mut got = vec![];
        snap.with_need_truncated(&DeviceId::LOCAL, |f| {
            got.push(f.name);
            true
        })
        .expect("with_need_truncated");
        got.sort_unstable();

        prop_assert_eq!(expected, got.iter().map(String::as_str).collect::<Vec<_>>());

        // Needed entries are always valid, with a real version
        snap.with_need_truncated(&DeviceId::LOCAL, |f| {
            assert!(!f.is_invalid());
            assert!(!f.file_version().is_empty());
            true
        })
        .expect("with_need_truncated");

        snap.release();
    }
}
