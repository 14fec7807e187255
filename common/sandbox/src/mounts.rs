// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::{mount, MsFlags};
use nix::unistd::{chown, Gid, Uid};
use pathutil::{hashed_basename, locked_flags, mkpath, resolve_symlink_tolerant, touch};
use tracing::{instrument, warn};

use crate::config::{MountKind, MountRequest};

const BIND_REC: MsFlags = MsFlags::MS_BIND.union(MsFlags::MS_REC);
const NONE: Option<&str> = None;

/// Host device/special files bind-mounted verbatim into every sandbox by
/// [`mount_dev`]. `/sys` is read-only; the rest are read-write.
const DEV_NODES_RW: &[&str] = &[
    "/dev/null",
    "/dev/tty",
    "/dev/zero",
    "/dev/random",
    "/dev/urandom",
    "/dev/shm",
];

/// Mounts a stacked copy-on-write filesystem at `dest`, with `work_dir/upper/<name>`
/// as the writable layer, `work_dir/work/<name>` as overlayfs's internal
/// scratch directory, and `lower` as the sole read-only layer.
///
/// Does not abort on failure: the overlay probe calls this to test whether
/// a host's kernel/filesystem combination supports the mount at all, and a
/// failure there is informational rather than fatal.
#[instrument(skip_all, fields(lower = %lower.display(), dest = %dest.display(), name))]
pub fn mount_overlay(
    lower: &Path,
    dest: &Path,
    name: &str,
    work_dir: &Path,
    use_userxattr: bool,
) -> bool {
    let lower = if lower.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        lower.to_path_buf()
    };
    let dest = if dest.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        dest.to_path_buf()
    };

    let upper_dir = work_dir.join("upper").join(name);
    let work_subdir = work_dir.join("work").join(name);
    for dir in [&upper_dir, &work_subdir] {
        if let Err(e) = mkpath(dir) {
            warn!(dir = %dir.display(), error = %e, "mount_overlay: failed to create scratch directory");
            return false;
        }
    }

    let mut options = format!(
        "upperdir={},workdir={},lowerdir={}",
        upper_dir.display(),
        work_subdir.display(),
        lower.display(),
    );
    if use_userxattr {
        options.push_str(",userxattr");
    } else {
        // Ubuntu's kernel patches flip overlayfs's default xattr behavior
        // relative to upstream. Ask for upstream's default explicitly; if
        // this kernel doesn't understand the option (EINVAL), fall back to
        // mounting without it.
        let with_nouserxattr = format!("{options},nouserxattr");
        match mount(
            Some("overlay"),
            &dest,
            Some("overlay"),
            MsFlags::empty(),
            Some(with_nouserxattr.as_str()),
        ) {
            Ok(()) => return true,
            Err(nix::Error::EINVAL) => {}
            Err(e) => {
                warn!(dest = %dest.display(), options = with_nouserxattr, error = %e, "mount_overlay: mount(2) failed");
                return false;
            }
        }
    }

    match mount(
        Some("overlay"),
        &dest,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    ) {
        Ok(()) => true,
        Err(e) => {
            warn!(dest = %dest.display(), options, error = %e, "mount_overlay: mount(2) failed");
            false
        }
    }
}

/// Mounts a fresh procfs at `root_dir/proc` and best-effort `chown`s it to
/// `(uid, gid)`. Chown failure (the caller may lack `CAP_CHOWN` in the
/// target namespace) is logged and ignored.
#[instrument(skip_all, fields(root_dir = %root_dir.display()))]
pub fn mount_procfs(root_dir: &Path, uid: Uid, gid: Gid) -> Result<()> {
    let proc_dir = root_dir.join("proc");
    mkpath(&proc_dir)?;
    mount(Some("proc"), &proc_dir, Some("proc"), MsFlags::empty(), NONE)
        .with_context(|| format!("mounting procfs at {}", proc_dir.display()))?;
    if let Err(e) = chown(&proc_dir, Some(uid), Some(gid)) {
        warn!(dir = %proc_dir.display(), error = %e, "mount_procfs: chown failed, ignoring");
    }
    Ok(())
}

/// Recursively bind-mounts `src` (resolved through any symlinks, tolerating
/// a missing tail) onto `dest`, creating `dest` first as a directory or a
/// plain file to match `src`'s type. If `read_only`, remounts with the
/// locked mount flags already in effect on `src`'s device carried forward,
/// since the kernel refuses to clear them during a remount.
#[instrument(skip_all, fields(src = %src.display(), dest = %dest.display(), read_only))]
pub fn bind_mount(src: &Path, dest: &Path, read_only: bool) -> Result<()> {
    let resolved_src = resolve_symlink_tolerant(src);

    let src_is_dir = std::fs::metadata(&resolved_src)
        .map(|m| m.is_dir())
        .unwrap_or(true);
    if src_is_dir {
        mkpath(dest)?;
    } else {
        if let Some(parent) = dest.parent() {
            mkpath(parent)?;
        }
        touch(dest)?;
    }

    mount(Some(&resolved_src), dest, NONE, BIND_REC, NONE)
        .with_context(|| format!("bind-mounting {} to {}", resolved_src.display(), dest.display()))?;

    if read_only {
        let locked = locked_flags(&resolved_src)
            .with_context(|| format!("discovering locked mount flags for {}", resolved_src.display()))?;
        let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
        if locked.noatime {
            flags |= MsFlags::MS_NOATIME;
        }
        if locked.nodiratime {
            flags |= MsFlags::MS_NODIRATIME;
        }
        if locked.noexec {
            flags |= MsFlags::MS_NOEXEC;
        }
        if locked.nodev {
            flags |= MsFlags::MS_NODEV;
        }
        if locked.nosuid {
            flags |= MsFlags::MS_NOSUID;
        }
        if locked.relatime {
            flags |= MsFlags::MS_RELATIME;
        }
        mount(NONE, dest, NONE, flags, NONE)
            .with_context(|| format!("remounting {} read-only", dest.display()))?;
    }

    Ok(())
}

/// Bind-mounts `/<name>` at `root_dir/<name>` if the host has it, otherwise
/// skips silently. Used for device nodes and `/sys`, which are absent on
/// some minimal hosts (containers-in-containers, stripped CI images).
#[instrument(skip_all, fields(root_dir = %root_dir.display(), name, read_only))]
pub fn bind_host_node(root_dir: &Path, name: &str, read_only: bool) -> Result<()> {
    let host_path = PathBuf::from("/").join(name);
    if !host_path.exists() {
        return Ok(());
    }
    let dest = root_dir.join(name);
    bind_mount(&host_path, &dest, read_only)
}

/// Bind-mounts the standard device nodes, then sets up a fresh devpts
/// filesystem and its ptmx alias, so the sandbox gets working pseudo
/// terminals without exposing the host's `/dev` wholesale.
#[instrument(skip_all, fields(root_dir = %root_dir.display()))]
pub fn mount_dev(root_dir: &Path) -> Result<()> {
    for name in DEV_NODES_RW {
        bind_host_node(root_dir, name.trim_start_matches('/'), false)?;
    }
    bind_host_node(root_dir, "sys", true)?;

    let pts_dir = root_dir.join("dev/pts");
    mkpath(&pts_dir)?;
    mount(
        Some("devpts"),
        &pts_dir,
        Some("devpts"),
        MsFlags::empty(),
        Some("ptmxmode=0666"),
    )
    .with_context(|| format!("mounting devpts at {}", pts_dir.display()))?;

    bind_mount(&pts_dir.join("ptmx"), &root_dir.join("dev/ptmx"), false)
}

/// Parses a human size string like `"1G"`, `"512M"`, `"256k"`, or a bare
/// byte count, returning the `tmpfs` `size=` mount option value unchanged
/// (the kernel accepts the same suffixes `mount(8)` does). Rejected only if
/// the string is empty or contains characters `mount(2)` could never
/// accept.
fn tmpfs_size_option(tmpfs_size: &str) -> Result<String> {
    anyhow::ensure!(!tmpfs_size.is_empty(), "tmpfs size must not be empty");
    anyhow::ensure!(
        tmpfs_size
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '%' || c == '.'),
        "invalid tmpfs size {:?}",
        tmpfs_size
    );
    Ok(format!("size={tmpfs_size}"))
}

/// High-level composition of every mount a sandbox needs: the root
/// overlay, each requested mount in order, procfs, and `/dev`.
///
/// Ordering is load-bearing. The root overlay must precede everything else
/// so later mount points can be created inside it without touching the
/// read-only lower image. Proc and `/dev` must come last because earlier
/// bind mounts may replace directories that would otherwise contain them.
#[instrument(skip_all, fields(root_dir = %root_dir.display(), persist_dir = ?persist_dir))]
pub fn mount_the_world(
    root_dir: &Path,
    mounts: &[MountRequest],
    uid: Uid,
    gid: Gid,
    persist_dir: Option<&Path>,
    tmpfs_size: &str,
    use_userxattr: bool,
) -> Result<()> {
    let workspace = match persist_dir {
        Some(dir) => {
            mkpath(dir)?;
            dir.to_path_buf()
        }
        None => {
            // A path guaranteed to exist on any Linux host, whose contents
            // will be shadowed entirely by the root overlay mounted next.
            let workspace = PathBuf::from("/bin");
            let size_opt = tmpfs_size_option(tmpfs_size)?;
            mount(
                Some("tmpfs"),
                &workspace,
                Some("tmpfs"),
                MsFlags::empty(),
                Some(size_opt.as_str()),
            )
            .with_context(|| format!("mounting ephemeral tmpfs workspace at {}", workspace.display()))?;
            workspace
        }
    };

    anyhow::ensure!(
        mount_overlay(root_dir, root_dir, "rootfs", &workspace, use_userxattr),
        "mounting the root overlay at {} failed",
        root_dir.display()
    );
    if let Err(e) = chown(root_dir, Some(uid), Some(gid)) {
        warn!(root_dir = %root_dir.display(), error = %e, "mount_the_world: chown of root failed, ignoring");
    }

    for req in mounts {
        let stripped = req
            .sandbox_path
            .strip_prefix("/")
            .unwrap_or(&req.sandbox_path);
        let path = root_dir.join(stripped);
        bind_mount(&req.outside_path, &path, req.kind != MountKind::ReadWrite)?;
        if req.kind == MountKind::Overlayed {
            let name = hashed_basename(&req.sandbox_path);
            anyhow::ensure!(
                mount_overlay(&path, &path, &name, &workspace, use_userxattr),
                "mounting overlay for {} at {} failed",
                req.sandbox_path.display(),
                path.display()
            );
            if let Err(e) = chown(&path, Some(uid), Some(gid)) {
                warn!(path = %path.display(), error = %e, "mount_the_world: chown of overlay mount failed, ignoring");
            }
        }
    }

    mount_procfs(root_dir, uid, gid)?;
    mount_dev(root_dir)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmpfs_size_option_formats_size_flag() {
        assert_eq!(tmpfs_size_option("1G").unwrap(), "size=1G");
        assert_eq!(tmpfs_size_option("512M").unwrap(), "size=512M");
    }

    #[test]
    fn tmpfs_size_option_rejects_empty() {
        assert!(tmpfs_size_option("").is_err());
    }

    #[test]
    fn tmpfs_size_option_rejects_shell_metacharacters() {
        assert!(tmpfs_size_option("1G;rm -rf /").is_err());
    }

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN to call mount(2)"]
    fn mount_overlay_normalizes_empty_paths() {
        let scratch = tempfile::tempdir().unwrap();
        // An empty `lower`/`dest` normalize to "/", which will fail to
        // mount in a test sandbox, but must not panic on the empty path.
        assert!(!mount_overlay(Path::new(""), Path::new(""), "x", scratch.path(), false));
    }
}
