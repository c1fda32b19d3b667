//! Root filesystem assembly.
//!
//! The root is built from the configured host directories, lowest priority
//! first:
//!
//! ```text
//!   tmpfs (writable)            <- outermost
//!   synthetic /dev /sys /proc /tmp
//!   dir[n-1]
//!   ...
//!   dir[0]                      <- innermost
//! ```
//!
//! The two outer layers are always present, in that order, however many
//! directories are configured.

use crate::config::types::{Result, RunkError};
use crate::vfs::filesystem::{FilesystemRegistry, MountSourceFlags, HOSTFS, PROCFS, TMPFS};
use crate::vfs::namespace::{MountNamespace, MAX_SYMLINK_TRAVERSALS};
use crate::vfs::node::{MemDir, OverlayNode};
use std::path::{Path, PathBuf};

/// Directories that always exist in the sandbox root and shadow any host
/// directory of the same name.
pub const SYNTHETIC_MOUNT_POINTS: [&str; 4] = ["/dev", "/sys", "/proc", "/tmp"];

pub const PROC_MOUNT_POINT: &str = "/proc";

/// Make every directory absolute against `cwd`. Order is preserved.
pub fn resolve_root_directories(dirs: &[PathBuf], cwd: &Path) -> Vec<PathBuf> {
    dirs.iter()
        .map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                cwd.join(dir)
            }
        })
        .collect()
}

/// `hostfs` mount data for a host directory. The option string is comma
/// separated, so a directory whose path contains a comma cannot be named
/// in it.
pub fn host_mount_data(dir: &Path) -> Result<String> {
    let path = dir.to_str().ok_or_else(|| RunkError::RootMountFailed {
        path: dir.to_path_buf(),
        reason: "path is not valid UTF-8".to_string(),
    })?;
    if path.contains(',') || path.trim() != path {
        return Err(RunkError::RootMountFailed {
            path: dir.to_path_buf(),
            reason: "path cannot contain ',' or surrounding whitespace".to_string(),
        });
    }
    Ok(format!("root={}", path))
}

/// Compose the root node.
///
/// Every host directory is mounted eagerly, so a missing one fails here
/// with `RootMountFailed` rather than on first access.
pub fn build_root_mount(
    registry: &FilesystemRegistry,
    dirs: &[PathBuf],
    cwd: &Path,
) -> Result<OverlayNode> {
    if dirs.is_empty() {
        return Err(RunkError::NoRootDirectories);
    }

    let hostfs = registry.require(HOSTFS)?;
    let flags = MountSourceFlags { read_only: true };

    let mut folded: Option<OverlayNode> = None;
    for dir in resolve_root_directories(dirs, cwd) {
        let data = host_mount_data(&dir)?;
        let layer = hostfs.mount("", flags, &data)?;
        log::info!("Root layer: {}", dir.display());

        folded = Some(match folded {
            None => layer,
            Some(lower) => OverlayNode::overlay(layer, lower),
        });
    }
    let folded = folded.ok_or(RunkError::NoRootDirectories)?;

    let synthetic = MemDir::with_opaque_directories(SYNTHETIC_MOUNT_POINTS)?;
    let with_synthetic = OverlayNode::overlay(OverlayNode::synthetic(synthetic), folded);

    let upper = registry
        .require(TMPFS)?
        .mount("upper", MountSourceFlags::default(), "")?;

    Ok(OverlayNode::overlay(upper, with_synthetic))
}

/// Build the root and a namespace around it, with proc mounted at
/// `/proc`. `remaining` is the symlink budget used to locate the mount
/// point.
pub fn create_mount_namespace(
    registry: &FilesystemRegistry,
    dirs: &[PathBuf],
    cwd: &Path,
    remaining: &mut u32,
) -> Result<MountNamespace> {
    let root = build_root_mount(registry, dirs, cwd)?;
    let namespace = MountNamespace::new(root);

    let proc_dir = namespace.find_inode(Path::new(PROC_MOUNT_POINT), remaining)?;
    let proc_node = registry
        .require(PROCFS)?
        .mount("proc", MountSourceFlags::default(), "")?;
    namespace.mount(&proc_dir.path, proc_node)?;

    Ok(namespace)
}

/// [`create_mount_namespace`] with the default symlink budget.
pub fn create_default_mount_namespace(
    registry: &FilesystemRegistry,
    dirs: &[PathBuf],
    cwd: &Path,
) -> Result<MountNamespace> {
    let mut remaining = MAX_SYMLINK_TRAVERSALS;
    create_mount_namespace(registry, dirs, cwd, &mut remaining)
}
