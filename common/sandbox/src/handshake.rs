// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::RawFd;

use anyhow::{ensure, Context, Result};
use nix::unistd::{close, pipe, read, write};

/// The two handshake pipes shared between the outside launcher process and
/// its namespace-init child across `clone(2)`.
///
/// `child_pipe` carries readiness bytes from the outside to the child;
/// `parent_pipe` carries readiness bytes (and, at the end, the inner exit
/// code) from the child to the outside. Both pipes are created before
/// `clone(2)`, so both processes inherit every file descriptor; each side
/// must close the two ends it does not use via [`Handshake::close_for_outside`]
/// / [`Handshake::close_for_inside`] immediately after `clone` returns.
///
/// All reads and writes are exact-byte-count and synchronous: a short
/// transfer is treated as a protocol violation and is fatal, since it can
/// only mean the peer died mid-handshake.
pub struct Handshake {
    child_read: RawFd,
    child_write: RawFd,
    parent_read: RawFd,
    parent_write: RawFd,
}

impl Handshake {
    pub fn create() -> Result<Self> {
        let (child_read, child_write) = pipe().context("creating child_pipe")?;
        let (parent_read, parent_write) = pipe().context("creating parent_pipe")?;
        Ok(Self {
            child_read,
            child_write,
            parent_read,
            parent_write,
        })
    }

    /// Closes the ends only the namespace-init child uses. Call this in
    /// the outside process immediately after `clone(2)` returns.
    pub fn close_for_outside(&self) -> Result<()> {
        close(self.child_read).context("closing child_pipe read end")?;
        close(self.parent_write).context("closing parent_pipe write end")?;
        Ok(())
    }

    /// Closes the ends only the outside process uses. Call this in the
    /// namespace-init child immediately after `clone(2)` returns.
    pub fn close_for_inside(&self) -> Result<()> {
        close(self.child_write).context("closing child_pipe write end")?;
        close(self.parent_read).context("closing parent_pipe read end")?;
        Ok(())
    }

    // --- Outside-process operations ---

    /// Blocks until the namespace-init child signals it exists and is
    /// ready to have its ID map installed.
    pub fn wait_child_ready(&self) -> Result<()> {
        read_exact_byte(self.parent_read).context("waiting for child readiness")
    }

    /// Signals the namespace-init child that its ID map has been
    /// installed and it may proceed.
    pub fn signal_child_mapped(&self) -> Result<()> {
        write_exact_byte(self.child_write).context("signaling child that ID map is ready")
    }

    /// Reads the inner command's 4-byte little-endian encoded exit code,
    /// written by the namespace-init child after reaping the user command.
    pub fn collect_exit_code(&self) -> Result<u32> {
        let mut buf = [0u8; 4];
        read_exact(self.parent_read, &mut buf).context("collecting inner exit code")?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn close_outside_ends(&self) -> Result<()> {
        close(self.child_write).context("closing child_pipe write end")?;
        close(self.parent_read).context("closing parent_pipe read end")?;
        Ok(())
    }

    // --- Namespace-init (inside) operations ---

    /// Signals the outside process that the namespace-init child exists.
    pub fn signal_ready(&self) -> Result<()> {
        write_exact_byte(self.parent_write).context("signaling readiness to outside")
    }

    /// Blocks until the outside process has installed the ID map.
    pub fn wait_for_map(&self) -> Result<()> {
        read_exact_byte(self.child_read).context("waiting for ID map")
    }

    /// Writes the inner command's exit code back to the outside process.
    pub fn send_exit_code(&self, code: u32) -> Result<()> {
        write_exact(self.parent_write, &code.to_le_bytes()).context("sending inner exit code")
    }
}

fn read_exact(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    let n = read(fd, buf)?;
    ensure!(
        n == buf.len(),
        "short read on handshake pipe: got {} of {} bytes",
        n,
        buf.len()
    );
    Ok(())
}

fn read_exact_byte(fd: RawFd) -> Result<()> {
    let mut buf = [0u8; 1];
    read_exact(fd, &mut buf)
}

fn write_exact(fd: RawFd, buf: &[u8]) -> Result<()> {
    let n = write(fd, buf)?;
    ensure!(
        n == buf.len(),
        "short write on handshake pipe: wrote {} of {} bytes",
        n,
        buf.len()
    );
    Ok(())
}

fn write_exact_byte(fd: RawFd) -> Result<()> {
    write_exact(fd, &[1u8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_readiness_bytes_and_exit_code() {
        let hs = Handshake::create().unwrap();

        // Exercise the protocol within a single process: both "sides" of
        // the handshake share the same fds here, which is fine for
        // checking the wire format without a real clone(2).
        hs.signal_ready().unwrap();
        hs.wait_child_ready().unwrap();

        hs.signal_child_mapped().unwrap();
        hs.wait_for_map().unwrap();

        hs.send_exit_code(42).unwrap();
        assert_eq!(hs.collect_exit_code().unwrap(), 42);
    }

    #[test]
    fn encodes_signal_death_in_handshake_wire_format() {
        let hs = Handshake::create().unwrap();
        let code: u32 = 256 + 15; // SIGTERM
        hs.send_exit_code(code).unwrap();
        assert_eq!(hs.collect_exit_code().unwrap(), code);
    }
}
