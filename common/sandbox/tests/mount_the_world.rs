// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exercises the mount composer end-to-end inside a disposable user+mount
//! namespace. Requires either root or
//! `/proc/sys/kernel/unprivileged_userns_clone` enabled, so every test here
//! is `#[ignore]`d by default.

use std::fs;
use std::path::Path;

use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid, Gid, Uid};
use pathutil::SafeTempDir;
use sandbox::{mount_the_world, MountKind, MountRequest};

fn enter_unprivileged_namespace() {
    let uid = getuid();
    let gid = getgid();
    unshare(CloneFlags::CLONE_NEWUSER).expect("unshare(CLONE_NEWUSER)");
    fs::write("/proc/self/setgroups", "deny").expect("writing setgroups");
    fs::write("/proc/self/uid_map", format!("0 {uid} 1\n")).expect("writing uid_map");
    fs::write("/proc/self/gid_map", format!("0 {gid} 1\n")).expect("writing gid_map");
    unshare(CloneFlags::CLONE_NEWNS).expect("unshare(CLONE_NEWNS)");
}

#[test]
#[ignore = "requires an unprivileged user namespace to be permitted"]
fn root_overlay_is_writable_and_shadows_the_lower_image() {
    enter_unprivileged_namespace();

    let lower = SafeTempDir::new().unwrap();
    fs::write(lower.path().join("marker"), b"from-lower").unwrap();
    let persist = SafeTempDir::new().unwrap();

    mount_the_world(
        lower.path(),
        &[],
        Uid::from_raw(0),
        Gid::from_raw(0),
        Some(persist.path()),
        "64M",
        false,
    )
    .unwrap();

    // The lower image's contents are visible through the overlay...
    assert_eq!(
        fs::read_to_string(lower.path().join("marker")).unwrap(),
        "from-lower"
    );

    // ...and writes land without touching the original lower directory's
    // backing store (verified by reading it back from the same path, since
    // the lower dir is now shadowed and no longer directly reachable).
    fs::write(lower.path().join("new-file"), b"from-upper").unwrap();
    assert_eq!(
        fs::read_to_string(lower.path().join("new-file")).unwrap(),
        "from-upper"
    );
}

#[test]
#[ignore = "requires an unprivileged user namespace to be permitted"]
fn read_only_mount_rejects_writes() {
    enter_unprivileged_namespace();

    let lower = SafeTempDir::new().unwrap();
    let persist = SafeTempDir::new().unwrap();
    let ro_source = SafeTempDir::new().unwrap();
    fs::write(ro_source.path().join("existing"), b"x").unwrap();

    let mounts = vec![MountRequest {
        outside_path: ro_source.path().to_path_buf(),
        sandbox_path: Path::new("/ro").to_path_buf(),
        kind: MountKind::ReadOnly,
    }];

    mount_the_world(
        lower.path(),
        &mounts,
        Uid::from_raw(0),
        Gid::from_raw(0),
        Some(persist.path()),
        "64M",
        false,
    )
    .unwrap();

    let target = lower.path().join("ro/new-file");
    let err = fs::write(&target, b"nope").unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ReadOnlyFilesystem);
}

#[test]
#[ignore = "requires an unprivileged user namespace to be permitted"]
fn overlayed_mount_persists_writes_across_invocations_with_same_persist_dir() {
    enter_unprivileged_namespace();

    let lower = SafeTempDir::new().unwrap();
    let persist = SafeTempDir::new().unwrap();
    let ov_source = SafeTempDir::new().unwrap();

    let mounts = vec![MountRequest {
        outside_path: ov_source.path().to_path_buf(),
        sandbox_path: Path::new("/ov").to_path_buf(),
        kind: MountKind::Overlayed,
    }];

    mount_the_world(
        lower.path(),
        &mounts,
        Uid::from_raw(0),
        Gid::from_raw(0),
        Some(persist.path()),
        "64M",
        false,
    )
    .unwrap();

    fs::write(lower.path().join("ov/seen"), b"1").unwrap();
    assert_eq!(fs::read_to_string(lower.path().join("ov/seen")).unwrap(), "1");

    // The source directory on the host is untouched.
    assert!(!ov_source.path().join("seen").exists());
}
