// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implements the `check(expr)` pattern from the original sandbox tool as
//! an extension trait: on failure it logs
//! `<file>:<line>, ABORTED (<errno>: <strerror>)!` to stderr in the exact
//! format scripts grep for, then converts the error to [`anyhow::Error`] so
//! the caller can propagate it with `?` and let [`crate::handle_top_level_result`]
//! exit non-zero. Fatal setup paths never return to the caller in an
//! inconsistent state: the log line is emitted at the point of failure, not
//! reconstructed later from a generic error chain.

use std::panic::Location;

/// Things that carry an OS error number and description, so the `ABORTED`
/// diagnostic can be formatted uniformly for `nix::Error` and
/// `std::io::Error`.
pub trait OsError {
    fn errno(&self) -> i32;
    fn strerror(&self) -> String;
}

impl OsError for nix::Error {
    fn errno(&self) -> i32 {
        *self as i32
    }
    fn strerror(&self) -> String {
        self.desc().to_string()
    }
}

impl OsError for std::io::Error {
    fn errno(&self) -> i32 {
        self.raw_os_error().unwrap_or(0)
    }
    fn strerror(&self) -> String {
        self.to_string()
    }
}

pub trait ResultExt<T> {
    /// On `Err`, logs the `<file>:<line>, ABORTED (<errno>: <strerror>)!`
    /// diagnostic and returns an [`anyhow::Error`] annotated with `what`.
    fn or_abort(self, what: &str) -> anyhow::Result<T>;
}

impl<T, E: OsError> ResultExt<T> for Result<T, E> {
    #[track_caller]
    fn or_abort(self, what: &str) -> anyhow::Result<T> {
        self.map_err(|e| {
            let loc = Location::caller();
            eprintln!(
                "{}:{}, ABORTED ({}: {})!",
                loc.file(),
                loc.line(),
                e.errno(),
                e.strerror()
            );
            anyhow::anyhow!("{what}: errno {} ({})", e.errno(), e.strerror())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_nix_error() {
        let result: Result<(), nix::Error> = Err(nix::Error::EPERM);
        let err = result.or_abort("unshare").unwrap_err();
        assert!(err.to_string().contains("EPERM") || err.to_string().contains("errno 1"));
    }
}
