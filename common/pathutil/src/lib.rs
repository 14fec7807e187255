// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filesystem primitives shared by the sandbox launcher and the overlay
//! probe: recursive directory creation, best-effort recursive removal, a
//! tolerant symlink resolver, a deterministic path hash used to derive
//! overlay workspace names, and a locked-mount-flag reader used when
//! remounting bind mounts read-only.

mod fsops;
mod hash;
mod mountinfo;
mod symlink;
mod tempdir;

pub use fsops::{mkpath, rmrf, touch};
pub use hash::hashed_basename;
pub use mountinfo::locked_flags;
pub use symlink::resolve_symlink_tolerant;
pub use tempdir::SafeTempDir;
