// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Launches a command inside an isolated PID/mount/user/UTS namespace
//! sandbox, composing a copy-on-write root filesystem view out of a
//! directory image plus a list of additional bind/overlay mounts.
//!
//! This binary does its own logging/handshake bootstrap rather than using
//! [`cliutil::cli_main`]: the outside process must stay single-threaded up
//! to its `clone(2)` call, and `tracing-subscriber`'s fmt layer is safe to
//! install before that point, but routing through the shared helper would
//! obscure exactly where the single-threaded requirement ends.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use cliutil::{current_process_name, handle_top_level_result, log_current_command_line, LoggingConfig};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{raise, signal, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    chdir, chroot, fork, getpgrp, pivot_root, sethostname, setgid, setuid, tcsetpgrp, execvpe,
    ForkResult, Gid, Pid, Uid,
};
use pathutil::mkpath;
use processes::{encode_handshake_exit, SignalForwarder};
use sandbox::{
    configure_user_namespace, host_identity, mount_procfs, mount_the_world, Configuration,
    ExecutionMode, Handshake, MountRequest, FORCE_SANDBOX_MODE_ENV,
};

/// Runs a command inside an isolated namespace sandbox with a copy-on-write
/// root filesystem view.
#[derive(Parser, Debug)]
#[command(name = "sandbox-run")]
struct Cli {
    /// Enable progress logging to stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Root filesystem image to use as the sandbox's lower layer.
    #[arg(long, required_unless_present = "config_json")]
    rootfs: Option<PathBuf>,

    /// Working directory inside the guest after pivot.
    #[arg(long = "cd")]
    cd: Option<PathBuf>,

    /// Additional mount: HOST:GUEST[:MODE], MODE in {ro, rw, ov}, default rw.
    #[arg(long = "mount", value_name = "HOST:GUEST[:MODE]")]
    mount: Vec<String>,

    /// Overlay workspace host path. Enables persistence across invocations.
    #[arg(long)]
    persist: Option<PathBuf>,

    /// Prepended to the command vector.
    #[arg(long)]
    entrypoint: Option<PathBuf>,

    /// In-namespace UID.
    #[arg(long, default_value_t = 0)]
    uid: u32,

    /// In-namespace GID.
    #[arg(long, default_value_t = 0)]
    gid: u32,

    /// Size option for the ephemeral workspace filesystem.
    #[arg(long = "tmpfs-size", default_value = "1G")]
    tmpfs_size: String,

    /// Use the unprivileged-xattr option when stacking overlays.
    #[arg(long)]
    userxattr: bool,

    /// Set the UTS hostname inside the sandbox.
    #[arg(long)]
    hostname: Option<String>,

    /// Load a serialized Configuration from this path instead of building
    /// one from the flags above. When given, every other configuration
    /// flag is rejected. Intended for orchestration-layer callers, not
    /// interactive use.
    #[arg(long = "config-json", hide = true, conflicts_with_all = [
        "rootfs", "cd", "mount", "persist", "entrypoint", "uid", "gid",
        "tmpfs_size", "userxattr", "hostname",
    ])]
    config_json: Option<PathBuf>,

    /// The command (and its arguments) to run inside the sandbox.
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn build_configuration(cli: Cli) -> Result<Configuration> {
    if let Some(path) = &cli.config_json {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading --config-json {}", path.display()))?;
        let cfg: Configuration = serde_json::from_str(&data)
            .with_context(|| format!("parsing --config-json {}", path.display()))?;
        cfg.validate()?;
        return Ok(cfg);
    }
    ensure!(!cli.command.is_empty(), "no command given to run");

    let rootfs = cli.rootfs.context("--rootfs is required")?;
    let rootfs_str = rootfs.to_string_lossy();
    let trimmed = rootfs_str.trim_end_matches('/');
    let rootfs = PathBuf::from(if trimmed.is_empty() { "/" } else { trimmed });

    let mounts = cli
        .mount
        .iter()
        .map(|spec| MountRequest::parse_spec(spec))
        .collect::<Result<Vec<_>>>()?;

    let cfg = Configuration {
        rootfs,
        mounts,
        chdir: cli.cd,
        persist_dir: cli.persist,
        uid: cli.uid,
        gid: cli.gid,
        entrypoint: cli.entrypoint,
        tmpfs_size: cli.tmpfs_size,
        hostname: cli.hostname,
        verbose: cli.verbose,
        userxattr: cli.userxattr,
        command: cli.command,
    };
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap's default usage-error exit code is 2; this tool's
            // convention is 1 for every configuration error, 0 for --help.
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
    let cfg = build_configuration(cli)?;
    let mode = ExecutionMode::resolve();
    let (host_uid, host_gid) = host_identity();

    if mode == ExecutionMode::Privileged {
        nix::sched::unshare(CloneFlags::CLONE_NEWNS).context("unshare(CLONE_NEWNS)")?;
        mount(
            Some(""),
            "/",
            Some(""),
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            Some(""),
        )
        .context("marking / MS_PRIVATE|MS_REC")?;
        mount_the_world(
            &cfg.rootfs,
            &cfg.mounts,
            host_uid,
            host_gid,
            cfg.persist_dir.as_deref(),
            &cfg.tmpfs_size,
            cfg.userxattr,
        )
        .context("mount_the_world (privileged, pre-clone)")?;
    }

    // Nested sandboxes always take the unprivileged path, and must not
    // inherit our SUDO_*-derived host identity.
    std::env::set_var(FORCE_SANDBOX_MODE_ENV, "unprivileged");
    std::env::remove_var("SUDO_UID");
    std::env::remove_var("SUDO_GID");

    let forwarder = SignalForwarder::install().context("installing signal forwarder")?;
    let handshake = Handshake::create().context("creating handshake pipes")?;

    let dst_uid = Uid::from_raw(cfg.uid);
    let dst_gid = Gid::from_raw(cfg.gid);

    let mut stack = vec![0u8; 1024 * 1024];
    let child_pid = {
        let cfg = &cfg;
        let handshake = &handshake;
        unsafe {
            clone(
                Box::new(move || namespace_init(cfg, mode, host_uid, host_gid, handshake)),
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

    handshake
        .close_for_outside()
        .context("closing inside-only handshake ends")?;
    forwarder.set_target(child_pid.as_raw());

    handshake
        .wait_child_ready()
        .context("waiting for namespace-init readiness")?;
    configure_user_namespace(child_pid, host_uid, host_gid, dst_uid, dst_gid)
        .context("configure_user_namespace")?;
    handshake
        .signal_child_mapped()
        .context("signaling namespace-init that the ID map is ready")?;

    let status = waitpid(child_pid, None).context("waitpid(namespace-init)")?;
    match status {
        WaitStatus::Exited(_, 0) => {}
        other => bail!("namespace-init child exited abnormally: {:?}", other),
    }

    let code = handshake
        .collect_exit_code()
        .context("collecting inner exit code")?;
    handshake
        .close_outside_ends()
        .context("closing outside handshake ends")?;

    // Best-effort: we may not have a controlling terminal at all.
    let _ = tcsetpgrp(libc::STDIN_FILENO, getpgrp());

    if code >= 256 {
        let signum = (code - 256) as i32;
        let sig = Signal::try_from(signum)
            .with_context(|| format!("inner command died of unrecognized signal {signum}"))?;
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
        let _ = raise(sig);
        // If the signal was somehow not fatal to us, fall back to the
        // conventional 128+signum convention rather than hang.
        std::process::exit(128 + signum);
    }

    Ok(ExitCode::from(code as u8))
}

/// The namespace-init child's entire lifetime, from just after `clone(2)`
/// returns in this process to the moment it hands off to the user command
/// and eventually reaps it. Never returns to its caller: every exit path
/// terminates the process directly, matching the outside's assertion that
/// a clean namespace-init exit is always code 0.
fn namespace_init(
    cfg: &Configuration,
    mode: ExecutionMode,
    host_uid: Uid,
    host_gid: Gid,
    handshake: &Handshake,
) -> isize {
    match namespace_init_inner(cfg, mode, host_uid, host_gid, handshake) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("FATAL: {}: {:?}", current_process_name(), e);
            std::process::exit(1);
        }
    }
}

fn namespace_init_inner(
    cfg: &Configuration,
    mode: ExecutionMode,
    host_uid: Uid,
    host_gid: Gid,
    handshake: &Handshake,
) -> Result<()> {
    handshake
        .close_for_inside()
        .context("closing outside-only handshake ends")?;

    // So the outside process is permitted to read/write /proc/<pid>/*_map;
    // a non-dumpable process denies that regardless of ownership.
    Errno::result(unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0) })
        .context("prctl(PR_SET_DUMPABLE, 1)")?;

    handshake
        .signal_ready()
        .context("signaling readiness to outside")?;
    handshake
        .wait_for_map()
        .context("waiting for ID map installation")?;

    let dst_uid = Uid::from_raw(cfg.uid);
    let dst_gid = Gid::from_raw(cfg.gid);

    match mode {
        ExecutionMode::Privileged => {
            setgid(dst_gid).context("setgid")?;
            setuid(dst_uid).context("setuid")?;
            // The pre-clone proc mount lives in the wrong PID namespace.
            mount_procfs(&cfg.rootfs, dst_uid, dst_gid).context("mount_procfs (post-setuid)")?;
        }
        ExecutionMode::Unprivileged => {
            mount_the_world(
                &cfg.rootfs,
                &cfg.mounts,
                dst_uid,
                dst_gid,
                cfg.persist_dir.as_deref(),
                &cfg.tmpfs_size,
                cfg.userxattr,
            )
            .context("mount_the_world (unprivileged, in-namespace)")?;
            let _ = (host_uid, host_gid);
        }
    }

    if let Some(hostname) = &cfg.hostname {
        sethostname(hostname).context("sethostname")?;
    }

    chdir(&cfg.rootfs).context("chdir(rootfs)")?;
    match pivot_root(".", ".") {
        Ok(()) => {
            umount2(".", MntFlags::MNT_DETACH).context("umount2(old root, MNT_DETACH)")?;
            chdir("/").context("chdir(/) after pivot_root")?;
        }
        Err(e) => {
            tracing::warn!(error = %e, "pivot_root failed, falling back to chroot");
            chroot(&cfg.rootfs).context("chroot fallback")?;
            chdir("/").context("chdir(/) after chroot")?;
        }
    }

    let pwd = cfg.chdir.clone().unwrap_or_else(|| PathBuf::from("/"));
    mkpath(&pwd).context("creating working directory inside sandbox")?;
    chdir(&pwd).context("chdir(pwd)")?;

    match unsafe { fork() }.context("fork (user command)")? {
        ForkResult::Child => {
            let argv = cfg.full_argv();
            exec_user_command(&argv);
            // exec_user_command never returns on success.
            std::process::exit(1);
        }
        ForkResult::Parent { child } => init_loop(child, handshake),
    }
}

/// `execve`s the user command, replacing this process image. On failure,
/// prints a diagnostic and exits 1 — this runs in the forked grandchild, so
/// there is no caller left to propagate an error to.
fn exec_user_command(argv: &[String]) {
    let cstrings: Vec<std::ffi::CString> = argv
        .iter()
        .map(|s| std::ffi::CString::new(s.as_str()).expect("argv entry contains a NUL byte"))
        .collect();
    let env: Vec<std::ffi::CString> = std::env::vars()
        .map(|(k, v)| std::ffi::CString::new(format!("{k}={v}")).expect("env entry contains a NUL byte"))
        .collect();
    match execvpe(&cstrings[0], &cstrings, &env) {
        Ok(infallible) => match infallible {},
        Err(e) => {
            eprintln!("FATAL: exec({}): {}", argv.join(" "), e);
        }
    }
}

/// The namespace-init's reaper loop: blocks on `SIGCHLD`, drains zombies,
/// and forwards the user command's exit status back to the outside process
/// once it is reaped. PID 1 of a PID namespace inherits every orphan, so
/// zombies belonging to processes other than `user_command` are reaped and
/// discarded without being reported anywhere.
fn init_loop(user_command: Pid, handshake: &Handshake) -> Result<()> {
    let inner_forwarder = SignalForwarder::install().context("installing inner signal forwarder")?;
    inner_forwarder.set_target(user_command.as_raw());

    let mut sigset = SigSet::empty();
    sigset.add(Signal::SIGCHLD);
    sigset.thread_block().context("blocking SIGCHLD")?;

    let exit_code = loop {
        sigset.wait().context("sigwait(SIGCHLD)")?;

        let mut reaped_user_command: Option<WaitStatus> = None;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if status.pid() == Some(user_command) {
                        reaped_user_command = Some(status);
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e).context("waitpid(-1, WNOHANG)"),
            }
        }

        if let Some(status) = reaped_user_command {
            break encode_handshake_exit(status).context("encoding inner exit status")?;
        }
    };

    handshake
        .send_exit_code(exit_code)
        .context("sending inner exit code to outside")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli {
            verbose: false,
            rootfs: Some(PathBuf::from("/rootfs/")),
            cd: None,
            mount: vec![],
            persist: None,
            entrypoint: None,
            uid: 0,
            gid: 0,
            tmpfs_size: "1G".to_string(),
            userxattr: false,
            hostname: None,
            config_json: None,
            command: vec!["/bin/sh".to_string()],
        }
    }

    #[test]
    fn strips_trailing_slash_from_rootfs() {
        let cfg = build_configuration(base_cli()).unwrap();
        assert_eq!(cfg.rootfs, PathBuf::from("/rootfs"));
    }

    #[test]
    fn parses_mount_flags_in_order() {
        let mut cli = base_cli();
        cli.mount = vec![
            "/host/a:/a:ro".to_string(),
            "/host/b:/b".to_string(),
        ];
        let cfg = build_configuration(cli).unwrap();
        assert_eq!(cfg.mounts.len(), 2);
        assert_eq!(cfg.mounts[0].sandbox_path, PathBuf::from("/a"));
        assert_eq!(cfg.mounts[1].sandbox_path, PathBuf::from("/b"));
    }

    #[test]
    fn rejects_missing_command() {
        let mut cli = base_cli();
        cli.command = vec![];
        assert!(build_configuration(cli).is_err());
    }

    #[test]
    fn clap_parses_documented_flags() {
        let cli = Cli::parse_from([
            "sandbox-run",
            "--rootfs",
            "/rootfs",
            "--mount",
            "/host:/guest:ov",
            "--uid",
            "1000",
            "--gid",
            "1000",
            "--hostname",
            "sandboxed",
            "--",
            "/bin/sh",
            "-c",
            "true",
        ]);
        assert_eq!(cli.uid, 1000);
        assert_eq!(cli.hostname.as_deref(), Some("sandboxed"));
        assert_eq!(cli.command, vec!["/bin/sh", "-c", "true"]);
    }
}
