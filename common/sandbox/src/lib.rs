// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Core of the sandbox launcher: configuration types, the UID/GID mapping
//! configurator, the mount composer, and the handshake pipe protocol used
//! between the outside launcher process and its namespace-init child.

mod config;
mod handshake;
mod idmap;
mod mounts;

pub use config::{host_identity, Configuration, ExecutionMode, MountKind, MountRequest, FORCE_SANDBOX_MODE_ENV};
pub use handshake::Handshake;
pub use idmap::configure_user_namespace;
pub use mounts::{
    bind_host_node, bind_mount, mount_dev, mount_overlay, mount_procfs, mount_the_world,
};
