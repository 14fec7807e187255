// Copyright 2024 The Sandbox Runtime Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::{Component, Path, PathBuf};

/// Resolves symlinks in `path`, component by component, tolerating a tail
/// that does not exist on disk.
///
/// Unlike [`std::fs::canonicalize`], which fails if any component is
/// missing, this stops following symlinks as soon as it hits a component
/// that does not exist and appends the remaining, unresolved components
/// verbatim. This lets callers pass a `sandbox_path` whose mount point has
/// not been created yet.
pub fn resolve_symlink_tolerant(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    let mut components = path.components().peekable();

    while let Some(component) = components.next() {
        match component {
            Component::RootDir => resolved.push(Component::RootDir),
            Component::Prefix(p) => resolved.push(p.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                match std::fs::symlink_metadata(&resolved) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        match std::fs::read_link(&resolved) {
                            Ok(target) => {
                                resolved.pop();
                                let target = if target.is_absolute() {
                                    target
                                } else {
                                    resolved.join(target)
                                };
                                resolved = resolve_symlink_tolerant(&target);
                            }
                            Err(_) => {
                                // Raced with a removal; treat as non-symlink.
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        // Component does not exist: stop resolving and
                        // append whatever is left verbatim.
                        for remaining in components {
                            resolved.push(remaining.as_os_str());
                        }
                        break;
                    }
                }
            }
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn nonexistent_tail_is_appended_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does/not/exist");
        let resolved = resolve_symlink_tolerant(&missing);
        assert_eq!(resolved, missing);
    }

    #[test]
    fn follows_symlink_to_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();

        let resolved = resolve_symlink_tolerant(&link);
        assert_eq!(std::fs::canonicalize(resolved).unwrap(), std::fs::canonicalize(&real).unwrap());
    }

    #[test]
    fn follows_symlink_then_tolerates_missing_tail() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        symlink(&real, &link).unwrap();

        let resolved = resolve_symlink_tolerant(&link.join("missing/child"));
        assert_eq!(
            resolved,
            std::fs::canonicalize(&real).unwrap().join("missing/child")
        );
    }
}
