// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Signal forwarding and exit-status encoding shared between the outside
//! launcher process and the namespace-init child.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGPIPE, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tracing::debug;

/// The fixed set of signals forwarded from a process to its designated
/// child, per the sandbox launcher's signal-forwarding contract.
///
/// `SIGSTOP` is deliberately absent: `signal-hook`'s registry refuses to
/// register it (the kernel never lets a handler catch it anyway), so
/// registering it would make `Signals::new` fail on every startup.
pub const FORWARDED_SIGNALS: [libc::c_int; 6] =
    [SIGHUP, SIGPIPE, SIGINT, SIGTERM, SIGUSR1, SIGUSR2];

/// Forwards a fixed set of signals received by the current process to
/// whatever PID is currently stored in `target`.
///
/// `target` starts at 0 (no child yet, meaning "drop the signal"); update
/// it with [`Ordering::SeqCst`] at each fork/clone point. Receiving one of
/// these signals re-sends the identical signal number to the target with
/// the kernel's default semantics; the forwarding thread itself never
/// terminates in response to a forwarded signal.
pub struct SignalForwarder {
    target: Arc<AtomicI32>,
    _handle: JoinHandle<()>,
}

impl SignalForwarder {
    /// Installs the forwarder. Must be called before the process that will
    /// own `target`'s child is spawned, so no signal is missed.
    pub fn install() -> anyhow::Result<Self> {
        let target = Arc::new(AtomicI32::new(0));
        let mut signals = Signals::new(FORWARDED_SIGNALS)?;

        let thread_target = Arc::clone(&target);
        let handle = std::thread::spawn(move || {
            for signal in signals.forever() {
                let pid = thread_target.load(Ordering::SeqCst);
                if pid <= 0 {
                    debug!(signal, "no forwarding target yet, dropping signal");
                    continue;
                }
                if let Ok(sig) = Signal::try_from(signal) {
                    let _ = kill(Pid::from_raw(pid), sig);
                }
            }
        });

        Ok(Self {
            target,
            _handle: handle,
        })
    }

    /// Updates the PID that received signals are forwarded to.
    pub fn set_target(&self, pid: i32) {
        self.target.store(pid, Ordering::SeqCst);
    }
}

/// Encodes a [`WaitStatus`] the way the sandbox handshake pipe expects:
/// the raw exit code if the process exited normally, or `256 + signum` if
/// it died of a signal. This differs from the POSIX-shell `128 + signum`
/// convention on purpose — it keeps the two cases disjoint (exit codes are
/// `0..=255`) so the receiving end of the pipe can tell them apart without
/// extra framing.
pub fn encode_handshake_exit(status: WaitStatus) -> anyhow::Result<u32> {
    match status {
        WaitStatus::Exited(_, code) => Ok(code as u32),
        WaitStatus::Signaled(_, signal, _) => Ok(256 + signal as u32),
        other => anyhow::bail!("unexpected wait status for inner command: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn encodes_normal_exit() {
        let status = WaitStatus::Exited(Pid::from_raw(1234), 7);
        assert_eq!(encode_handshake_exit(status).unwrap(), 7);
    }

    #[test]
    fn encodes_signal_death() {
        let status = WaitStatus::Signaled(Pid::from_raw(1234), Signal::SIGTERM, false);
        assert_eq!(
            encode_handshake_exit(status).unwrap(),
            256 + Signal::SIGTERM as u32
        );
    }
}
