// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

/// RAII guard returned by [`LoggingConfig::setup`]. Dropping it ends the
/// `main` span that was entered during setup.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

/// Configuration for the console logger.
///
/// `RUST_LOG` (standard `tracing-subscriber` `EnvFilter` syntax) always
/// takes precedence; `verbose` only changes the *default* directive used
/// when `RUST_LOG` is unset, from `WARN` to `INFO`.
pub struct LoggingConfig {
    pub verbose: bool,
}

impl LoggingConfig {
    /// Installs the global tracing subscriber and enters a `main` span.
    /// Panics if a subscriber is already installed, which indicates a bug
    /// (this should be called exactly once, at the top of `main`).
    pub fn setup(self) -> LogGuard {
        let default_level = if self.verbose {
            LevelFilter::INFO
        } else {
            LevelFilter::WARN
        };
        let filter = EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy();

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .try_init()
            .expect("logging already initialized");

        let span_guard = tracing::info_span!("main").entered();
        LogGuard {
            _span_guard: span_guard,
        }
    }
}
