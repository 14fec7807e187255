// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Result};
use nix::unistd::{getgid, getuid, Gid, Uid};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Name of the environment variable that overrides [`ExecutionMode`]
/// resolution. The launcher always sets this to `"unprivileged"` in the
/// child's environment so nested sandboxes always take the unprivileged
/// path, regardless of the nested invocation's effective UID.
pub const FORCE_SANDBOX_MODE_ENV: &str = "FORCE_SANDBOX_MODE";

/// One requested mount, in the order it was specified on the command line.
/// Order is significant and preserved — later requests can shadow earlier
/// ones at overlapping sandbox paths, just as later `--mount` flags would
/// on the command line.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRequest {
    /// Absolute host-side path. Invariant: must be absolute.
    pub outside_path: PathBuf,
    /// Path inside the guest. Leading slashes are stripped before
    /// concatenation with the new root.
    pub sandbox_path: PathBuf,
    pub kind: MountKind,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum MountKind {
    #[strum(serialize = "rw")]
    ReadWrite,
    #[strum(serialize = "ro")]
    ReadOnly,
    #[strum(serialize = "ov")]
    Overlayed,
}

impl MountRequest {
    /// Parses a `--mount HOST:GUEST[:MODE]` command-line argument.
    /// `MODE` is one of `{ro, rw, ov}`, defaulting to `rw`.
    pub fn parse_spec(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.splitn(3, ':').collect();
        ensure!(
            parts.len() == 2 || parts.len() == 3,
            "invalid --mount spec {:?}, expected HOST:GUEST[:MODE]",
            spec
        );
        let outside_path = PathBuf::from(parts[0]);
        ensure!(
            outside_path.is_absolute(),
            "--mount host path must be absolute: {:?}",
            outside_path
        );
        let kind = match parts.get(2) {
            Some(mode) => MountKind::from_str(mode)
                .with_context(|| format!("invalid mount mode {:?} in spec {:?}", mode, spec))?,
            None => MountKind::ReadWrite,
        };
        Ok(Self {
            outside_path,
            sandbox_path: PathBuf::from(parts[1]),
            kind,
        })
    }
}

/// Which branch of the launcher's state machine to follow. Resolved from
/// the effective UID (0 ⇒ `Privileged`) unless [`FORCE_SANDBOX_MODE_ENV`]
/// overrides it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Unprivileged,
    Privileged,
}

impl ExecutionMode {
    pub fn resolve() -> Self {
        match std::env::var(FORCE_SANDBOX_MODE_ENV).ok().as_deref() {
            Some("privileged") => ExecutionMode::Privileged,
            Some("unprivileged") => ExecutionMode::Unprivileged,
            _ => {
                if nix::unistd::geteuid().is_root() {
                    ExecutionMode::Privileged
                } else {
                    ExecutionMode::Unprivileged
                }
            }
        }
    }
}

/// The full configuration for one sandbox invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    pub rootfs: PathBuf,
    #[serde(default)]
    pub mounts: Vec<MountRequest>,
    pub chdir: Option<PathBuf>,
    pub persist_dir: Option<PathBuf>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    pub entrypoint: Option<PathBuf>,
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size: String,
    pub hostname: Option<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub userxattr: bool,
    pub command: Vec<String>,
}

fn default_tmpfs_size() -> String {
    "1G".to_string()
}

impl Configuration {
    /// Validates invariants that must hold before any namespace is
    /// created: the root path is absolute, there are no duplicate
    /// `sandbox_path` entries, and every mount's host path is absolute.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.rootfs.is_absolute(),
            "--rootfs must be an absolute path: {:?}",
            self.rootfs
        );
        ensure!(!self.command.is_empty(), "no command given to run");

        let mut seen: HashSet<&Path> = HashSet::new();
        for m in &self.mounts {
            ensure!(
                m.outside_path.is_absolute(),
                "mount host path must be absolute: {:?}",
                m.outside_path
            );
            if !seen.insert(&m.sandbox_path) {
                bail!("duplicate sandbox_path in mount requests: {:?}", m.sandbox_path);
            }
        }
        Ok(())
    }

    /// The full argv to execute inside the sandbox: the entrypoint (if
    /// any) followed by the user command.
    pub fn full_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.command.len() + 1);
        if let Some(entrypoint) = &self.entrypoint {
            argv.push(entrypoint.to_string_lossy().into_owned());
        }
        argv.extend(self.command.iter().cloned());
        argv
    }
}

/// Returns the host UID/GID to use as the source of the ID-map's one
/// identity entry: `SUDO_UID`/`SUDO_GID` if both are present and
/// non-empty, otherwise the process's real UID/GID.
pub fn host_identity() -> (Uid, Gid) {
    let sudo_uid = std::env::var("SUDO_UID").ok().filter(|s| !s.is_empty());
    let sudo_gid = std::env::var("SUDO_GID").ok().filter(|s| !s.is_empty());
    match (sudo_uid, sudo_gid) {
        (Some(uid), Some(gid)) => {
            match (uid.parse::<u32>(), gid.parse::<u32>()) {
                (Ok(uid), Ok(gid)) => (Uid::from_raw(uid), Gid::from_raw(gid)),
                _ => (getuid(), getgid()),
            }
        }
        _ => (getuid(), getgid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_rw_mode() {
        let m = MountRequest::parse_spec("/host/data:/data").unwrap();
        assert_eq!(m.kind, MountKind::ReadWrite);
        assert_eq!(m.outside_path, PathBuf::from("/host/data"));
        assert_eq!(m.sandbox_path, PathBuf::from("/data"));
    }

    #[test]
    fn parses_explicit_mode() {
        let m = MountRequest::parse_spec("/host/data:/data:ro").unwrap();
        assert_eq!(m.kind, MountKind::ReadOnly);
    }

    #[test]
    fn rejects_relative_host_path() {
        assert!(MountRequest::parse_spec("data:/data:ro").is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(MountRequest::parse_spec("/host/data:/data:bogus").is_err());
    }

    fn base_config() -> Configuration {
        Configuration {
            rootfs: PathBuf::from("/rootfs"),
            mounts: Vec::new(),
            chdir: None,
            persist_dir: None,
            uid: 0,
            gid: 0,
            entrypoint: None,
            tmpfs_size: default_tmpfs_size(),
            hostname: None,
            verbose: false,
            userxattr: false,
            command: vec!["/bin/sh".to_string()],
        }
    }

    #[test]
    fn rejects_relative_rootfs() {
        let mut cfg = base_config();
        cfg.rootfs = PathBuf::from("rootfs");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_sandbox_paths() {
        let mut cfg = base_config();
        cfg.mounts.push(MountRequest {
            outside_path: PathBuf::from("/a"),
            sandbox_path: PathBuf::from("/mnt"),
            kind: MountKind::ReadWrite,
        });
        cfg.mounts.push(MountRequest {
            outside_path: PathBuf::from("/b"),
            sandbox_path: PathBuf::from("/mnt"),
            kind: MountKind::ReadOnly,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn full_argv_prepends_entrypoint() {
        let mut cfg = base_config();
        cfg.entrypoint = Some(PathBuf::from("/sbin/entry"));
        cfg.command = vec!["echo".to_string(), "hi".to_string()];
        assert_eq!(cfg.full_argv(), vec!["/sbin/entry", "echo", "hi"]);
    }

    #[test]
    fn execution_mode_env_override() {
        std::env::set_var(FORCE_SANDBOX_MODE_ENV, "unprivileged");
        assert_eq!(ExecutionMode::resolve(), ExecutionMode::Unprivileged);
        std::env::set_var(FORCE_SANDBOX_MODE_ENV, "privileged");
        assert_eq!(ExecutionMode::resolve(), ExecutionMode::Privileged);
        std::env::remove_var(FORCE_SANDBOX_MODE_ENV);
    }
}
