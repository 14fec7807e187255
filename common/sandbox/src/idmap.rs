// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::Write;

use anyhow::{Context, Result};
use nix::unistd::{Gid, Pid, Uid};
use tracing::instrument;

/// Writes the UID and GID translation tables and the setgroups-denial
/// flag into `/proc/<pid>/{uid_map,setgroups,gid_map}` for `pid`,
/// establishing a one-entry identity mapping from `(src_uid, src_gid)` on
/// the host to `(dst_uid, dst_gid)` inside `pid`'s user namespace.
///
/// Must be called after `pid`'s user namespace exists (i.e. after its
/// `clone(CLONE_NEWUSER)` has returned) and before `pid` attempts anything
/// that requires capabilities in that namespace. Each of the three writes
/// is the file descriptor's single permitted write, so each file is opened
/// fresh rather than reused. Order (uid_map, then setgroups, then
/// gid_map) is mandatory: an unprivileged caller's write to `gid_map`
/// without first denying `setgroups` is rejected by the kernel.
#[instrument(skip_all, fields(pid = pid.as_raw()))]
pub fn configure_user_namespace(
    pid: Pid,
    src_uid: Uid,
    src_gid: Gid,
    dst_uid: Uid,
    dst_gid: Gid,
) -> Result<()> {
    let base = format!("/proc/{}", pid.as_raw());

    write_exact(
        &format!("{base}/uid_map"),
        format!("{dst_uid}\t{src_uid}\t1\n").as_bytes(),
    )?;
    write_exact(&format!("{base}/setgroups"), b"deny\0")?;
    write_exact(
        &format!("{base}/gid_map"),
        format!("{dst_gid}\t{src_gid}\t1").as_bytes(),
    )?;

    Ok(())
}

fn write_exact(path: &str, contents: &[u8]) -> Result<()> {
    File::create(path)
        .with_context(|| format!("opening {path}"))?
        .write_all(contents)
        .with_context(|| format!("writing {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires writing to `/proc/self/{uid_map,setgroups,gid_map}`, which
    /// only makes sense from inside a freshly `unshare(CLONE_NEWUSER)`'d
    /// process — exercised here against our own PID to check the wire
    /// format without needing to clone a real child.
    #[test]
    #[ignore = "requires CAP_SYS_ADMIN / a fresh user namespace"]
    fn writes_identity_map_to_self() {
        nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWUSER).unwrap();
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        configure_user_namespace(nix::unistd::getpid(), uid, gid, Uid::from_raw(0), Gid::from_raw(0))
            .unwrap();
        let uid_map = std::fs::read_to_string("/proc/self/uid_map").unwrap();
        assert!(uid_map.contains(&format!("0\t{uid}\t1")));
    }
}
