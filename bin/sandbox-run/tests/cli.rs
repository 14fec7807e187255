// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end checks of the launcher's argument handling that don't
//! require creating a namespace. Scenarios that actually run a sandboxed
//! command live in `common/sandbox`'s integration tests, gated behind
//! `#[ignore]` since they need `CAP_SYS_ADMIN` (or an unprivileged user
//! namespace sysctl enabled) to pass.

use std::process::Command;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sandbox-run"))
}

#[test]
fn help_exits_zero() {
    let output = bin().arg("--help").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("--rootfs"));
}

#[test]
fn missing_required_rootfs_exits_one() {
    let output = bin().args(["--", "/bin/true"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn missing_command_exits_one() {
    let output = bin().args(["--rootfs", "/tmp"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn relative_rootfs_is_rejected() {
    let output = bin()
        .args(["--rootfs", "relative/path", "--", "/bin/true"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("FATAL"));
}

#[test]
fn non_absolute_mount_host_path_is_rejected() {
    let output = bin()
        .args([
            "--rootfs",
            "/tmp",
            "--mount",
            "relative:/guest",
            "--",
            "/bin/true",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn unknown_flag_exits_one() {
    let output = bin()
        .args(["--rootfs", "/tmp", "--bogus-flag", "--", "/bin/true"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
