// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Startup/shutdown plumbing common to the launcher and probe binaries:
//! logging setup, top-level error reporting, and the fatal-syscall
//! diagnostic format the sandbox launcher's design calls for.

mod abort;
mod logging;

pub use abort::ResultExt;
pub use logging::{LogGuard, LoggingConfig};

use std::ffi::OsStr;
use std::fmt::Debug;
use std::process::{ExitCode, Termination};

use itertools::Itertools;

/// Wraps a CLI `main` with the common startup/cleanup logic: sets up
/// logging, logs the command line, runs `main`, and converts the result
/// into an [`ExitCode`] via [`handle_top_level_result`].
///
/// Programs that must stay single-threaded before they finish their own
/// namespace setup (the sandbox launcher calls `clone(2)` directly) should
/// not use this helper for their first-stage entry point; call
/// [`LoggingConfig::setup`] and [`handle_top_level_result`] directly once
/// it is safe to do so.
pub fn cli_main<F, T, E>(main: F, verbose: bool) -> ExitCode
where
    F: FnOnce() -> Result<T, E>,
    T: Termination,
    E: Debug,
{
    let _guard = LoggingConfig { verbose }.setup();
    log_current_command_line();
    handle_top_level_result(main())
}

/// Logs the current process's command line at INFO.
pub fn log_current_command_line() {
    let escaped = std::env::args().map(|s| shell_escape::escape(s.into())).join(" ");
    tracing::info!("COMMAND: {}", escaped);
}

/// Converts a top-level [`Result`] into an [`ExitCode`], printing
/// `FATAL: <prog>: <error>` to stderr on failure.
pub fn handle_top_level_result<T: Termination, E: Debug>(result: Result<T, E>) -> ExitCode {
    match result {
        Err(error) => {
            eprintln!("FATAL: {}: {:?}", current_process_name(), error);
            ExitCode::FAILURE
        }
        Ok(value) => value.report(),
    }
}

/// The current executable's file name, or `__unknown__` if it could not be
/// determined.
pub fn current_process_name() -> String {
    std::env::current_exe()
        .unwrap_or_default()
        .file_name()
        .unwrap_or(OsStr::new("__unknown__"))
        .to_string_lossy()
        .into_owned()
}

/// Prints a verbose-mode progress line at the top indent level (`--> `).
pub fn progress(msg: &str) {
    eprintln!("--> {msg}");
}

/// Prints a verbose-mode progress line at the second indent level
/// (`----> `).
pub fn progress2(msg: &str) {
    eprintln!("----> {msg}");
}
