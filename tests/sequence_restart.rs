mod common;

use common::{file, new_db, v};
use std::sync::Arc;
use sync_index::{Database, DeviceId, MemoryBackend};
use test_log::test;

/// Sequence numbers continue after the database is reopened over the same
/// backend; they never restart from one.
#[test]
fn sequence_monotone_across_reopen() -> sync_index::Result<()> {
    let backend = Arc::new(MemoryBackend::new());

    {
        let db = Database::open(backend.clone())?;
        let files = db.new_file_set("default")?;

        let batch: Vec<_> = (0..100)
            .map(|i| file(&format!("file-{i:03}"), v(&[(1, 1)])))
            .collect();
        files.update(&DeviceId::LOCAL, batch)?;

        assert_eq!(100, files.sequence(&DeviceId::LOCAL));
    }

    // Reopen over the same backend
    let db = Database::open(backend)?;
    let files = db.new_file_set("default")?;
    assert_eq!(100, files.sequence(&DeviceId::LOCAL));

    files.update(&DeviceId::LOCAL, vec![file("one-more", v(&[(1, 1)]))])?;

    let snap = files.snapshot()?;
    let mut last = None;
    snap.with_have_sequence(101, |f| {
        assert_eq!("one-more", f.name);
        last = Some(f.sequence);
        true
    })?;
    assert_eq!(Some(101), last);
    snap.release();

    Ok(())
}

/// Within one snapshot the sequence iteration is strictly increasing and
/// gap-free, and updating a file moves it to the end of the log.
#[test]
fn have_sequence_is_gap_free() -> sync_index::Result<()> {
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

    // Touch b again: its old sequence slot disappears
    files.update(&DeviceId::LOCAL, vec![file("b", v(&[(1, 2)]))])?;

    let snap = files.snapshot()?;

    let mut seen = vec![];
    snap.with_have_sequence(0, |f| {
        seen.push((f.sequence, f.name));
        true
    })?;

    assert_eq!(
        vec![
            (1, "a".to_owned()),
            (3, "c".to_owned()),
            (4, "b".to_owned()),
        ],
        seen
    );

    // Strictly increasing with no snapshot-visible sequence skipped
    let sequences: Vec<_> = seen.iter().map(|(s, _)| *s).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));

    // Delta iteration from a midpoint
    let mut from_three = vec![];
    snap.with_have_sequence(3, |f| {
        from_three.push(f.sequence);
        true
    })?;
    assert_eq!(vec![3, 4], from_three);

    snap.release();
    Ok(())
}

/// An unchanged record does not burn a sequence number.
#[test]
fn equivalent_update_keeps_sequence() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    files.update(&DeviceId::LOCAL, vec![file("a", v(&[(1, 1)]))])?;
    assert_eq!(1, files.sequence(&DeviceId::LOCAL));

    files.update(&DeviceId::LOCAL, vec![file("a", v(&[(1, 1)]))])?;
    assert_eq!(1, files.sequence(&DeviceId::LOCAL));

    Ok(())
}

/// A snapshot taken before an update does not see it; one taken after
/// sees all of it.
#[test]
fn snapshot_isolation() -> sync_index::Result<()> {
    let db = new_db();
    let files = db.new_file_set("default")?;

    files.update(&DeviceId::LOCAL, vec![file("a", v(&[(1, 1)]))])?;
    let before = files.snapshot()?;

    files.update(&DeviceId::LOCAL, vec![file("b", v(&[(1, 1)]))])?;
    let after = files.snapshot()?;

    assert_eq!(vec!["a"], common::have_names(&before, &DeviceId::LOCAL));
    assert_eq!(
        vec!["a", "b"],
        common::have_names(&after, &DeviceId::LOCAL)
    );

    before.release();
    after.release();
    Ok(())
}
