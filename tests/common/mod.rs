#![allow(dead_code)]

use std::sync::Arc;
use sync_index::{
    Database, DeviceId, FileInfo, FileInfoTruncated, FileType, MemoryBackend, Snapshot, Vector,
};

pub fn new_db() -> Database {
    Database::open(Arc::new(MemoryBackend::new())).expect("open database")
}

pub fn dev(n: u8) -> DeviceId {
    DeviceId([n; 32])
}

pub fn file(name: &str, version: Vector) -> FileInfo {
    FileInfo {
        name: name.into(),
        size: 100,
        modified_s: 1_000,
        version,
        ..FileInfo::default()
    }
}

pub fn deleted(name: &str, version: Vector) -> FileInfo {
    FileInfo {
        name: name.into(),
        deleted: true,
        modified_s: 1_000,
        version,
        ..FileInfo::default()
    }
}

pub fn directory(name: &str, version: Vector) -> FileInfo {
    FileInfo {
        name: name.into(),
        file_type: FileType::Directory,
        modified_s: 1_000,
        version,
        ..FileInfo::default()
    }
}

pub fn v(counters: &[(u32, u64)]) -> Vector {
    let mut vector = Vector::new();
    for (id, value) in counters {
        vector = vector.with(*id, *value);
    }
    vector
}

pub fn have_names(snap: &Snapshot, device: &DeviceId) -> Vec<String> {
    let mut names = vec![];
    snap.with_have(device, |f| {
        names.push(f.name);
        true
    })
    .expect("with_have");
    names
}

pub fn global_names(snap: &Snapshot) -> Vec<String> {
    let mut names = vec![];
    snap.with_global_truncated(|f| {
        names.push(f.name);
        true
    })
    .expect("with_global_truncated");
    names
}

pub fn need_names(snap: &Snapshot, device: &DeviceId) -> Vec<String> {
    let mut names = vec![];
    snap.with_need_truncated(device, |f| {
        names.push(f.name);
        true
    })
    .expect("with_need_truncated");
    names
}

pub fn need_files(snap: &Snapshot, device: &DeviceId) -> Vec<FileInfoTruncated> {
    let mut files = vec![];
    snap.with_need_truncated(device, |f| {
        files.push(f);
        true
    })
    .expect("with_need_truncated");
    files
}
