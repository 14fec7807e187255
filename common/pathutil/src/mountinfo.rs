// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// The subset of mount flags that, once applied, cannot be cleared by a
/// later `MS_REMOUNT` of a bind mount on the same device ("locked" flags).
/// Mirrors the kernel's `MNT_LOCK_*` set that matters for bind-mount
/// remounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockedFlags {
    pub noatime: bool,
    pub nodiratime: bool,
    pub noexec: bool,
    pub nodev: bool,
    pub nosuid: bool,
    pub relatime: bool,
}

impl LockedFlags {
    fn from_mount_options(opts: &str) -> Self {
        let has = |name: &str| opts.split(',').any(|o| o == name);
        Self {
            noatime: has("noatime"),
            nodiratime: has("nodiratime"),
            noexec: has("noexec"),
            nodev: has("nodev"),
            nosuid: has("nosuid"),
            relatime: has("relatime"),
        }
    }
}

/// Scans `/proc/self/mountinfo` for the entry whose device number matches
/// `path`'s, and returns the locked mount flags currently in effect there.
///
/// Used before remounting a bind mount read-only: the kernel refuses to
/// clear these flags during a remount, so they must be carried forward
/// explicitly. Fatal if no matching entry is found, since that means the
/// mount table is in a state this implementation does not understand.
pub fn locked_flags(path: &Path) -> Result<LockedFlags> {
    let target_dev = std::fs::metadata(path)
        .with_context(|| format!("stat({}) failed", path.display()))?
        .dev();

    let file = File::open("/proc/self/mountinfo").context("opening /proc/self/mountinfo")?;
    for line in BufReader::new(file).lines() {
        let line = line.context("reading /proc/self/mountinfo")?;
        // Format (man 5 proc_pid_mountinfo):
        // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
        //                        ^^^^^^^^^^ mount options (field 6, before the "-" separator)
        let mut fields = line.splitn(2, " - ");
        let Some(left) = fields.next() else {
            continue;
        };
        let parts: Vec<&str> = left.split(' ').collect();
        if parts.len() < 7 {
            continue;
        }
        let major_minor = parts[2];
        let mount_point_opts = parts[5];
        let Some((major, minor)) = major_minor.split_once(':') else {
            continue;
        };
        let (Ok(major), Ok(minor)) = (major.parse::<u64>(), minor.parse::<u64>()) else {
            continue;
        };
        let dev = libc::makedev(major as libc::c_uint, minor as libc::c_uint);
        if dev == target_dev {
            return Ok(LockedFlags::from_mount_options(mount_point_opts));
        }
    }

    bail!(
        "no /proc/self/mountinfo entry found for device of {}",
        path.display()
    )
}
