// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::instrument;

/// Recursively creates `p` with mode 0777, tolerating `EEXIST`.
///
/// If `p` already exists as a directory, returns immediately. Any other
/// failure (including `p` existing as a non-directory) is fatal.
#[instrument(skip_all, fields(path = %p.display()))]
pub fn mkpath(p: &Path) -> Result<()> {
    if p.is_dir() {
        return Ok(());
    }
    match std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o777)
        .create(p)
    {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("mkpath({}) failed", p.display())),
    }
}

/// Creates `p` with mode 0444 if it does not already exist, otherwise opens
/// it for reading. `EISDIR` is silently tolerated: callers may ask to
/// "touch" a path that turns out to be a directory already created by a
/// previous mount operation.
#[instrument(skip_all, fields(path = %p.display()))]
pub fn touch(p: &Path) -> Result<()> {
    match std::fs::OpenOptions::new()
        .read(true)
        .create(true)
        .mode(0o444)
        .open(p)
    {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EISDIR) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("touch({}) failed", p.display())),
    }
}

/// Best-effort recursive removal of `p`, post-order (children before
/// parents). Errors removing individual entries are ignored: this is used
/// to clean up ephemeral workspace directories where some entries may have
/// already vanished because they lived on a namespace-scoped tmpfs.
#[instrument(skip_all, fields(path = %p.display()))]
pub fn rmrf(p: &Path) {
    if !p.exists() && !p.is_symlink() {
        return;
    }
    for entry in walkdir::WalkDir::new(p).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(path)
        } else {
            std::fs::remove_file(path)
        };
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %e, "rmrf: failed to remove entry");
        }
    }
}
