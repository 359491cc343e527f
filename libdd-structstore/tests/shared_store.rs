// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared-segment lifecycle tests. Every test maps real POSIX shared memory
//! (or a temp file) and uses a process-unique object name so parallel test
//! runs cannot collide.

#![cfg(unix)]

use libdd_structstore::{CleanupMode, Error, List, OpenOptions, Str, StructStoreShared};
use std::sync::atomic::{AtomicU32, Ordering};

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_name(tag: &str) -> String {
    format!(
        "/libdd-structstore-{tag}-{}-{}",
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[test]
#[cfg_attr(miri, ignore)]
fn create_write_read_roundtrip() {
    let name = unique_name("basic");
    let mut shared = OpenOptions::new().bufsize(2048).open(&name).unwrap();
    assert!(shared.valid());
    assert_eq!(shared.store().unwrap().to_string(), "{}");

    shared.store_mut().unwrap().set("num", 52).unwrap();
    {
        let guard = shared.store().unwrap().lock_read().unwrap();
        assert_eq!(*guard.get::<i32>("num").unwrap(), 52);
        guard.unlock();
    }
    shared.close().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn two_mappings_observe_the_same_store() {
    let name = unique_name("twomap");
    let mut writer = OpenOptions::new().bufsize(4096).open(&name).unwrap();
    let reader = StructStoreShared::open(&name).unwrap();
    assert!(writer.valid());
    assert!(reader.valid());
    assert_eq!(writer.usage_count().unwrap(), 2);

    // the same physical segment, mapped twice, lands at different base
    // addresses; everything must still resolve through both views
    assert_ne!(writer.addr().unwrap(), reader.addr().unwrap());

    {
        let mut guard = writer.store_mut().unwrap().lock_write();
        guard.set("num", 52).unwrap();
        guard.set("msg", "hello across mappings").unwrap();
        {
            let list = guard.get_or_create::<List>("list").unwrap();
            list.push_back_value(5).unwrap();
            list.push_back_value(42).unwrap();
        }
        guard.unlock();
    }

    {
        let guard = reader.store().unwrap().lock_read().unwrap();
        assert_eq!(*guard.get::<i32>("num").unwrap(), 52);
        assert_eq!(guard.get::<Str>("msg").unwrap().as_str(), "hello across mappings");
        let list = guard.get::<List>("list").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(*list.get(1).unwrap().get_ref::<i32>().unwrap(), 42);
        guard.unlock();
    }

    reader.check().unwrap();
    drop(reader);
    writer.close().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn nested_stores_survive_remapping() {
    let name = unique_name("nested");
    let mut creator = OpenOptions::new().bufsize(8192).open(&name).unwrap();
    {
        let store = creator.store_mut().unwrap();
        store.set("num", 5).unwrap();
        let sub = store.substore("subsettings").unwrap();
        sub.set("subnum", 43).unwrap();
        sub.set("substr", "bar").unwrap();
    }

    let other = StructStoreShared::open(&name).unwrap();
    let yaml = other.store().unwrap().to_yaml_string().unwrap();
    assert_eq!(yaml, "num: 5\nsubsettings:\n  subnum: 43\n  substr: bar\n");
    assert!(creator.equals(&other).unwrap());

    drop(other);
    creator.close().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn cleanup_if_last_unlinks_segment() {
    let name = unique_name("iflast");
    let mut shared = StructStoreShared::open(&name).unwrap();
    shared.store_mut().unwrap().set("num", 1).unwrap();
    assert_eq!(shared.usage_count().unwrap(), 1);
    shared.close().unwrap();

    // the backing object is gone; a fresh open becomes the creator again
    // and starts from an empty store
    let reopened = StructStoreShared::open(&name).unwrap();
    assert!(reopened.store().unwrap().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn reserved_segment_is_not_ready() {
    let name = unique_name("notready");
    let cname = std::ffi::CString::new(name.clone()).unwrap();
    // reserve the name by hand: created 0600, header never written
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_EXCL | libc::O_CREAT | libc::O_RDWR,
            0o600,
        )
    };
    assert!(fd != -1);
    unsafe {
        libc::ftruncate(fd, 1024);
    }

    match StructStoreShared::open(&name) {
        Err(Error::NotReady) => {}
        other => panic!("expected NotReady, got {:?}", other.map(|_| ())),
    }

    unsafe {
        libc::close(fd);
        libc::shm_unlink(cname.as_ptr());
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn reinit_replaces_existing_segment() {
    let name = unique_name("reinit");
    let mut first = OpenOptions::new()
        .cleanup(CleanupMode::Never)
        .open(&name)
        .unwrap();
    first.store_mut().unwrap().set("stale", 1).unwrap();
    drop(first);

    let second = OpenOptions::new().reinit(true).open(&name).unwrap();
    assert!(second.valid());
    assert!(second.store().unwrap().is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn invalidation_and_revalidate() {
    let name = unique_name("revalidate");
    let mut creator = OpenOptions::new()
        .cleanup(CleanupMode::Always)
        .open(&name)
        .unwrap();
    creator.store_mut().unwrap().set("num", 1).unwrap();

    let mut late = OpenOptions::new()
        .cleanup(CleanupMode::Never)
        .open(&name)
        .unwrap();
    assert!(late.valid());

    // Always-cleanup close retires the segment under the attacher
    creator.store_mut().unwrap().clear().unwrap();
    creator.close().unwrap();
    assert!(!late.valid());

    // nothing republished yet: the non-blocking probe reports not-ready
    assert!(!late.revalidate(false).unwrap());

    // republish under the same name, then revalidate picks it up
    let mut publisher = OpenOptions::new()
        .cleanup(CleanupMode::Never)
        .open(&name)
        .unwrap();
    publisher.store_mut().unwrap().set("num", 2).unwrap();
    assert!(late.revalidate(true).unwrap());
    assert!(late.valid());
    assert_eq!(*late.store().unwrap().get::<i32>("num").unwrap(), 2);
}

#[test]
#[cfg_attr(miri, ignore)]
fn close_reports_leaks_are_absent_after_clear() {
    let name = unique_name("clean");
    let mut shared = OpenOptions::new().bufsize(4096).open(&name).unwrap();
    {
        let store = shared.store_mut().unwrap();
        store.set("num", 5).unwrap();
        store.set("str", "payload").unwrap();
        let list = store.get_or_create::<List>("list").unwrap();
        list.push_back_value(1).unwrap();
    }
    // the store is torn down during retirement; no leaked blocks expected
    shared.close().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn allocate_until_exhaustion_then_recover() {
    let name = unique_name("exhaust");
    let mut shared = OpenOptions::new().bufsize(64 * 1024).open(&name).unwrap();
    let store = shared.store_mut().unwrap();

    // fill with 1 KiB strings until the region runs dry
    let payload = "x".repeat(1024);
    let mut count = 0;
    loop {
        match store.set(&format!("blob_{count}"), payload.as_str()) {
            Ok(()) => count += 1,
            Err(e) => {
                assert!(matches!(
                    e,
                    Error::Alloc(libdd_structstore::alloc::Error::OutOfRegionMemory { .. })
                ));
                break;
            }
        }
    }
    assert!(count > 2);

    // freeing everything restores capacity for the same sequence
    store.clear().unwrap();
    for i in 0..count {
        store.set(&format!("blob_{i}"), payload.as_str()).unwrap();
    }
    store.clear().unwrap();
    shared.close().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn snapshot_roundtrip() {
    let name = unique_name("snapshot");
    let mut shared = StructStoreShared::open(&name).unwrap();
    shared.store_mut().unwrap().set("num", 5).unwrap();

    let snapshot = shared.to_bytes().unwrap();
    shared.store_mut().unwrap().set("num", 9).unwrap();
    shared.store_mut().unwrap().set("extra", true).unwrap();

    shared.from_bytes(&snapshot).unwrap();
    let store = shared.store().unwrap();
    assert_eq!(*store.get::<i32>("num").unwrap(), 5);
    assert!(store.get::<bool>("extra").is_err());
    shared.close().unwrap();
}

#[test]
#[cfg_attr(miri, ignore)]
fn attach_from_fd_handoff() {
    // anonymous segment: reserve a name, unlink immediately, keep the fd
    let name = std::ffi::CString::new(unique_name("anon")).unwrap();
    let raw = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_EXCL | libc::O_CREAT | libc::O_RDWR,
            0o600,
        )
    };
    assert!(raw != -1);
    unsafe {
        libc::shm_unlink(name.as_ptr());
        libc::ftruncate(raw, 16 * 1024);
    }
    let dup = unsafe { libc::dup(raw) };
    assert!(dup != -1);

    use std::os::unix::io::FromRawFd;
    let mut owner =
        StructStoreShared::from_fd(unsafe { std::os::unix::io::OwnedFd::from_raw_fd(raw) }, true)
            .unwrap();
    owner.store_mut().unwrap().set("handoff", 7).unwrap();

    let receiver =
        StructStoreShared::from_fd(unsafe { std::os::unix::io::OwnedFd::from_raw_fd(dup) }, false)
            .unwrap();
    assert_eq!(*receiver.store().unwrap().get::<i32>("handoff").unwrap(), 7);
    assert_eq!(receiver.usage_count().unwrap(), 2);
}

#[test]
#[cfg_attr(miri, ignore)]
fn file_backed_segment() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.bin");
    let path = path.to_str().unwrap();

    let mut creator = OpenOptions::new()
        .use_file(true)
        .cleanup(CleanupMode::Never)
        .bufsize(8192)
        .open(path)
        .unwrap();
    creator.store_mut().unwrap().set("kind", "file").unwrap();

    let attached = OpenOptions::new()
        .use_file(true)
        .cleanup(CleanupMode::Never)
        .open(path)
        .unwrap();
    assert_eq!(
        attached.store().unwrap().get::<Str>("kind").unwrap().as_str(),
        "file"
    );
    drop(attached);
    drop(creator);
    assert!(std::path::Path::new(path).exists());
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_writers_through_two_mappings() {
    let name = unique_name("concurrent");
    let mut a = OpenOptions::new().bufsize(32 * 1024).open(&name).unwrap();
    let mut b = StructStoreShared::open(&name).unwrap();
    a.store_mut().unwrap().set("counter", 0i64).unwrap();

    let handle = std::thread::spawn(move || {
        for _ in 0..500 {
            let mut guard = b.store_mut().unwrap().lock_write();
            *guard.get_mut::<i64>("counter").unwrap() += 1;
            guard.unlock();
        }
        b
    });
    for _ in 0..500 {
        let mut guard = a.store_mut().unwrap().lock_write();
        *guard.get_mut::<i64>("counter").unwrap() += 1;
        guard.unlock();
    }
    let b = handle.join().unwrap();

    assert_eq!(*a.store().unwrap().get::<i64>("counter").unwrap(), 1000);
    drop(b);
    a.close().unwrap();
}
