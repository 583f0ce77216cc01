mod common;

use common::{dev, file, need_files, need_names, new_db, v};
use sync_index::{DeviceId, FLAG_LOCAL_IGNORED};
use test_log::test;

/// An invalid claim of the same version does not displace a valid one,
/// and the claiming device is not a source for the file.
#[test]
fn invalid_claim_does_not_displace_valid() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;
    let remote = dev(1);

    files.update(&DeviceId::LOCAL, vec![file("a", v(&[(1, 1000)]))])?;

    let mut claim = file("a", v(&[(1, 1000)]));
    claim.raw_invalid = true;
    files.update(&remote, vec![claim])?;

    let snap = files.snapshot()?;

    let global = snap.get_global("a")?.expect("global");
    assert!(!global.raw_invalid);

    assert_eq!(vec![DeviceId::LOCAL], snap.availability("a")?);

    // The local copy satisfies the global version
    assert!(need_names(&snap, &DeviceId::LOCAL).is_empty());

    snap.release();
    Ok(())
}

/// An ignored local file is accounted in neither the local nor the global
/// size; clearing the flag makes it count again.
#[test]
fn ignored_file_roundtrip() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    let mut ignored = file("x", v(&[(1, 1)]));
    ignored.local_flags = FLAG_LOCAL_IGNORED;
    files.update(&DeviceId::LOCAL, vec![ignored.clone()])?;

    let snap = files.snapshot()?;
    assert_eq!(0, snap.local_size().files);
    assert_eq!(0, snap.global_size().files);
    snap.release();

    ignored.local_flags = 0;
    files.update(&DeviceId::LOCAL, vec![ignored])?;

    let snap = files.snapshot()?;
    assert_eq!(1, snap.local_size().files);
    assert_eq!(1, snap.global_size().files);
    snap.release();

    Ok(())
}

/// Need after un-ignoring with a concurrent remote change: the remote
/// claim wins the conflict and ends up on the local need list.
#[test]
fn need_after_unignore_with_concurrent_remote() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;
    let remote = dev(1);

    // Local ignores foo@{L:1, R:1}; the remote has the same version
    let mut local_foo = file("foo", v(&[(1, 1), (2, 1)]));
    local_foo.local_flags = FLAG_LOCAL_IGNORED;
    local_foo.modified_s = 1_000;
    files.update(&DeviceId::LOCAL, vec![local_foo])?;

    let mut remote_foo = file("foo", v(&[(1, 1), (2, 1)]));
    remote_foo.modified_s = 1_000;
    files.update(&remote, vec![remote_foo])?;

    assert!(need_names(&files.snapshot()?, &DeviceId::LOCAL).is_empty());

    // Local clears the ignore with a local-only version bump
    let mut unignored = file("foo", v(&[(1, 2), (2, 1)]));
    unignored.modified_s = 1_500;
    files.update(&DeviceId::LOCAL, vec![unignored])?;

    assert!(need_names(&files.snapshot()?, &DeviceId::LOCAL).is_empty());

    // The remote changes the file concurrently, and wins the conflict by
    // modification time
    let mut remote_change = file("foo", v(&[(1, 1), (2, 2)]));
    remote_change.modified_s = 2_000;
    files.update(&remote, vec![remote_change])?;

    let snap = files.snapshot()?;
    let needed = need_files(&snap, &DeviceId::LOCAL);
    assert_eq!(1, needed.len());
    assert_eq!("foo", needed.first().expect("one entry").name);
    assert_eq!(v(&[(1, 1), (2, 2)]), needed.first().expect("one entry").version);
    snap.release();

    Ok(())
}

/// A peer-declared invalid file still occupies its slot in the version
/// list and resurfaces once a valid claim arrives.
#[test]
fn valid_claim_displaces_invalid_of_same_version() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;
    let r1 = dev(1);
    let r2 = dev(2);

    let mut claim = file("a", v(&[(1, 1)]));
    claim.raw_invalid = true;
    files.update(&r1, vec![claim])?;

    let snap = files.snapshot()?;
    // The only claim is invalid: nothing is available, nothing is needed
    assert!(snap.availability("a")?.is_empty());
    assert!(need_names(&snap, &DeviceId::LOCAL).is_empty());
    snap.release();

    files.update(&r2, vec![file("a", v(&[(1, 1)]))])?;

    let snap = files.snapshot()?;
    assert_eq!(vec![r2], snap.availability("a")?);
    assert_eq!(vec!["a"], need_names(&snap, &DeviceId::LOCAL));
    snap.release();

    Ok(())
}
