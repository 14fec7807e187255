// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Checks whether the overlay mount the launcher would perform actually
//! works on a given root filesystem and scratch directory, without
//! touching either of them for longer than the check takes. Used by the
//! calling layer to pick a workable scratch location out of a preference
//! list, or by falling back to scanning the host's mount table.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cliutil::{current_process_name, handle_top_level_result, log_current_command_line, LoggingConfig};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{Gid, Uid};
use pathutil::mkpath;
use sandbox::{configure_user_namespace, host_identity, mount_overlay, Handshake};

/// Probes whether a directory supports being used as an overlay mount
/// destination with the given scratch directory as its workspace.
#[derive(Parser, Debug)]
#[command(name = "overlay-probe")]
struct Cli {
    #[arg(short, long)]
    verbose: bool,

    /// Mount an ephemeral in-memory filesystem at `<scratch_parent_dir>/.probe`
    /// before probing.
    #[arg(long)]
    tmpfs: bool,

    #[arg(long)]
    userxattr: bool,

    #[arg(long, default_value_t = 0)]
    uid: u32,

    #[arg(long, default_value_t = 0)]
    gid: u32,

    rootfs_dir: PathBuf,
    scratch_parent_dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.exit_code() == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };
    let _guard = LoggingConfig { verbose: cli.verbose }.setup();
    log_current_command_line();
    handle_top_level_result(run(cli))
}

fn run(cli: Cli) -> Result<ExitCode> {
    let scratch_dir = if cli.tmpfs {
        let probe_dir = cli.scratch_parent_dir.join(".probe");
        mkpath(&probe_dir)?;
        mount(
            Some("tmpfs"),
            &probe_dir,
            Some("tmpfs"),
            MsFlags::empty(),
            Some("size=64M"),
        )
        .context("mounting ephemeral tmpfs scratch directory")?;
        probe_dir
    } else {
        cli.scratch_parent_dir.clone()
    };
    mkpath(&scratch_dir)?;

    let (host_uid, host_gid) = host_identity();
    let dst_uid = Uid::from_raw(cli.uid);
    let dst_gid = Gid::from_raw(cli.gid);

    let handshake = Handshake::create().context("creating handshake pipes")?;
    let rootfs_dir = cli.rootfs_dir.clone();
    let userxattr = cli.userxattr;

    let mut stack = vec![0u8; 1024 * 1024];
    let child_pid = {
        let handshake = &handshake;
        let rootfs_dir = &rootfs_dir;
        let scratch_dir = &scratch_dir;
        unsafe {
            nix::sched::clone(
                Box::new(move || {
                    probe_child(handshake, rootfs_dir, scratch_dir, userxattr)
                }),
                &mut stack,
                CloneFlags::CLONE_NEWPID
                    | CloneFlags::CLONE_NEWNS
                    | CloneFlags::CLONE_NEWUSER
                    | CloneFlags::CLONE_NEWUTS,
                Some(libc::SIGCHLD),
            )
        }
        .context("clone(NEWPID|NEWNS|NEWUSER|NEWUTS)")?
    };

    handshake.close_for_outside().context("closing inside-only handshake ends")?;
    handshake
        .wait_child_ready()
        .context("waiting for probe child readiness")?;
    configure_user_namespace(child_pid, host_uid, host_gid, dst_uid, dst_gid)
        .context("configure_user_namespace")?;
    handshake
        .signal_child_mapped()
        .context("signaling probe child that the ID map is ready")?;

    let status = waitpid(child_pid, None).context("waitpid(probe child)")?;
    match status {
        WaitStatus::Exited(_, 0) => {}
        other => bail!("probe child exited abnormally: {:?}", other),
    }

    let code = handshake.collect_exit_code().context("collecting probe result")?;
    handshake.close_outside_ends().context("closing outside handshake ends")?;

    Ok(if code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Runs entirely inside the disposable namespace: waits for the ID map,
/// attempts the overlay mount and a rename-liveness check on it, then
/// reports 0 (works) or 1 (doesn't) back over the handshake pipe. Always
/// exits 0 itself — the probe result is the payload, not the process exit
/// status, matching the launcher's own child/outside split.
fn probe_child(handshake: &Handshake, rootfs_dir: &Path, scratch_dir: &Path, userxattr: bool) -> isize {
    match probe_child_inner(handshake, rootfs_dir, scratch_dir, userxattr) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("FATAL: {}: {:?}", current_process_name(), e);
            std::process::exit(1);
        }
    }
}

fn probe_child_inner(
    handshake: &Handshake,
    rootfs_dir: &Path,
    scratch_dir: &Path,
    userxattr: bool,
) -> Result<()> {
    handshake.close_for_inside().context("closing outside-only handshake ends")?;
    Errno::result(unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) })
        .context("prctl(PR_SET_DUMPABLE, 1)")?;

    handshake.signal_ready().context("signaling readiness to outside")?;
    handshake.wait_for_map().context("waiting for ID map installation")?;

    let works = run_overlay_and_rename_check(rootfs_dir, scratch_dir, userxattr);
    handshake
        .send_exit_code(if works { 0 } else { 1 })
        .context("sending probe result to outside")?;
    Ok(())
}

/// Mounts the overlay, then renames a fresh directory within it as a
/// liveness test for kernel bugs that surface specifically on overlay
/// rename (some `apt`-style package installers trip on these). Any
/// failure anywhere in the process counts as "doesn't work"; this never
/// aborts the probe itself.
fn run_overlay_and_rename_check(rootfs_dir: &Path, scratch_dir: &Path, userxattr: bool) -> bool {
    if !mount_overlay(rootfs_dir, rootfs_dir, "probe", scratch_dir, userxattr) {
        return false;
    }

    let works = (|| -> Result<()> {
        let from = rootfs_dir.join(".overlay-probe-rename-src");
        let to = rootfs_dir.join(".overlay-probe-rename-dst");
        mkpath(&from)?;
        std::fs::rename(&from, &to).context("rename on overlay failed")?;
        std::fs::remove_dir(&to).context("removing rename-test directory")?;
        Ok(())
    })()
    .is_ok();

    let _ = umount2(rootfs_dir, MntFlags::MNT_DETACH);
    works
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN to call mount(2)"]
    fn run_overlay_and_rename_check_reports_failure_on_bogus_paths() {
        let bogus = Path::new("/nonexistent/does/not/exist");
        let scratch = tempfile::tempdir().unwrap();
        assert!(!run_overlay_and_rename_check(bogus, scratch.path(), false));
    }
}
