mod common;

use common::{deleted, dev, directory, file, need_files, need_names, new_db, v};
use sync_index::{DeviceId, FileLike, FLAG_LOCAL_RECEIVE_ONLY};
use test_log::test;

/// A deletion is needed only by devices that have the file.
#[test]
fn deletions_needed_only_when_file_is_held() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;
    let remote = dev(1);

    files.update(&DeviceId::LOCAL, vec![file("held", v(&[(1, 1)]))])?;
    files.update(
        &remote,
        vec![
            deleted("held", v(&[(1, 2)])),
            deleted("never-seen", v(&[(1, 1)])),
        ],
    )?;

    let snap = files.snapshot()?;

    // The deletion of "held" must be propagated; "never-seen" not
    assert_eq!(vec!["held"], need_names(&snap, &DeviceId::LOCAL));

    let needed = need_files(&snap, &DeviceId::LOCAL);
    assert!(needed.first().expect("one entry").deleted);

    snap.release();
    Ok(())
}

/// The emitted need entry is a valid copy of the winning version, even
/// when an invalid claim shares that version.
#[test]
fn need_emission_skips_invalid_copies() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;
    let r1 = dev(1);
    let r2 = dev(2);

    files.update(&r1, vec![file("f", v(&[(1, 5)]))])?;

    let mut shadow = file("f", v(&[(1, 5)]));
    shadow.raw_invalid = true;
    files.update(&r2, vec![shadow])?;

    let snap = files.snapshot()?;
    let needed = need_files(&snap, &DeviceId::LOCAL);
    assert_eq!(1, needed.len());

    let entry = needed.first().expect("one entry");
    assert!(!entry.is_invalid());
    assert_eq!(v(&[(1, 5)]), entry.version);

    // Only the valid holder is a source
    assert_eq!(vec![r1], snap.availability("f")?);

    snap.release();
    Ok(())
}

/// Prefixed queries are path-aware: "dir" matches "dir" and "dir/...",
/// never "dir.x" or "dirx".
#[test]
fn prefixed_queries_are_path_aware() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    files.update(
        &DeviceId::LOCAL,
        vec![
            directory("dir", v(&[(1, 1)])),
            file("dir/inside", v(&[(1, 1)])),
            file("dir/sub/deep", v(&[(1, 1)])),
            file("dir.file", v(&[(1, 1)])),
            file("dirx", v(&[(1, 1)])),
        ],
    )?;

    let snap = files.snapshot()?;

    let mut have = vec![];
    snap.with_prefixed_have_truncated(&DeviceId::LOCAL, "dir", |f| {
        have.push(f.name);
        true
    })?;
    assert_eq!(vec!["dir", "dir/inside", "dir/sub/deep"], have);

    let mut global = vec![];
    snap.with_prefixed_global_truncated("dir", |f| {
        global.push(f.name);
        true
    })?;
    assert_eq!(vec!["dir", "dir/inside", "dir/sub/deep"], global);

    // The empty prefix is no restriction
    let mut all = vec![];
    snap.with_prefixed_global_truncated("", |f| {
        all.push(f.name);
        true
    })?;
    assert_eq!(5, all.len());

    snap.release();
    Ok(())
}

/// Point lookups return the stored entry, or nothing for unknown names
/// and rejected names.
#[test]
fn point_lookups() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    files.update(&DeviceId::LOCAL, vec![file("a/b", v(&[(1, 1)]))])?;

    let snap = files.snapshot()?;

    let got = snap.get(&DeviceId::LOCAL, "a/b")?.expect("entry");
    assert_eq!("a/b", got.name);
    assert_eq!(v(&[(1, 1)]), got.version);

    let trunc = snap.get_global_truncated("a/b")?.expect("entry");
    assert_eq!(got.version, trunc.version);
    assert_eq!(got.size, trunc.size);

    assert!(snap.get(&DeviceId::LOCAL, "missing")?.is_none());
    assert!(snap.get(&DeviceId::LOCAL, "../escape")?.is_none());
    assert!(snap.get(&dev(9), "a/b")?.is_none());

    snap.release();
    Ok(())
}

/// Need sizes classify entries by type.
#[test]
fn need_size_classifies() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;
    let remote = dev(1);

    files.update(&DeviceId::LOCAL, vec![file("doomed", v(&[(1, 1)]))])?;

    files.update(
        &remote,
        vec![
            file("f1", v(&[(1, 1)])),
            file("f2", v(&[(1, 1)])),
            directory("d", v(&[(1, 1)])),
            deleted("doomed", v(&[(1, 2)])),
        ],
    )?;

    let snap = files.snapshot()?;
    let needs = snap.need_size(&DeviceId::LOCAL)?;

    assert_eq!(2, needs.files);
    assert_eq!(1, needs.directories);
    assert_eq!(1, needs.deleted);
    assert_eq!(0, needs.symlinks);
    assert_eq!(100 + 100 + 128, needs.bytes);

    // The remote needs nothing
    assert_eq!(0, snap.need_size(&remote)?.total_items());

    snap.release();
    Ok(())
}

/// Receive-only changed files count into the local and global aggregates
/// through their own bucket.
#[test]
fn receive_only_sizes() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    let mut changed = file("ro", v(&[(1, 1)]));
    changed.local_flags = FLAG_LOCAL_RECEIVE_ONLY;

    files.update(&DeviceId::LOCAL, vec![changed, file("plain", v(&[(1, 1)]))])?;

    let snap = files.snapshot()?;
    assert_eq!(2, snap.local_size().files);
    assert_eq!(1, snap.receive_only_changed_size().files);
    assert_eq!(2, snap.global_size().files);
    snap.release();

    Ok(())
}

/// Iteration stops as soon as the callback returns false.
#[test]
fn iteration_stops_on_false() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    files.update(
        &DeviceId::LOCAL,
        vec![
            file("a", v(&[(1, 1)])),
            file("b", v(&[(1, 1)])),
            file("c", v(&[(1, 1)])),
        ],
    )?;

    let snap = files.snapshot()?;

    let mut seen = 0;
    snap.with_have(&DeviceId::LOCAL, |_| {
        seen += 1;
        false
    })?;
    assert_eq!(1, seen);

    let mut seen = 0;
    snap.with_global(|_| {
        seen += 1;
        seen < 2
    })?;
    assert_eq!(2, seen);

    snap.release();
    Ok(())
}
