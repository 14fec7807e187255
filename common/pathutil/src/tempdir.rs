// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use lazy_static::lazy_static;
use tracing::info_span;

use crate::rmrf;

lazy_static! {
    static ref DEFAULT_PREFIX: String = {
        let current_exe = std::env::current_exe().unwrap_or_default();
        let name = current_exe
            .file_name()
            .unwrap_or(OsStr::new("__unknown__"))
            .to_string_lossy();
        format!("sandbox.{name}.")
    };
}

/// A temporary directory that removes itself (best-effort, tolerating
/// partially-inaccessible trees) on drop.
///
/// Distinct from a bare [`tempfile::TempDir`] in that directory names are
/// prefixed with the current program's name to aid debugging, and removal
/// uses [`rmrf`] rather than [`std::fs::remove_dir_all`] so directories
/// left behind with unusual permissions by a sandboxed child are still
/// cleaned up.
pub struct SafeTempDir {
    dir: Option<PathBuf>,
}

impl SafeTempDir {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&*DEFAULT_PREFIX)
            .tempdir()?
            .into_path();
        Ok(Self { dir: Some(dir) })
    }

    /// Takes ownership of an already-existing directory, which will be
    /// removed on drop just like one created by [`SafeTempDir::new`].
    pub fn take(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().expect("SafeTempDir used after into_path")
    }

    /// Converts into a bare [`PathBuf`]. The caller becomes responsible for
    /// removing the directory.
    pub fn into_path(mut self) -> PathBuf {
        self.dir.take().expect("SafeTempDir used after into_path")
    }
}

impl Drop for SafeTempDir {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            let _span = info_span!("SafeTempDir::drop", dir = %dir.display()).entered();
            rmrf(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_directory_on_drop() {
        let dir = SafeTempDir::new().unwrap();
        let path = dir.path().to_owned();
        assert!(path.is_dir());
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn pretty_named() {
        let dir = SafeTempDir::new().unwrap();
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sandbox."), "name = {name}");
    }

    #[test]
    fn into_path_disowns_cleanup() {
        let dir = SafeTempDir::new().unwrap();
        let path = dir.into_path();
        assert!(path.is_dir());
        std::fs::remove_dir_all(&path).unwrap();
    }
}
