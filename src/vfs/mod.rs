//! Sandbox filesystem: overlay nodes, filesystem types, the mount
//! namespace and root assembly.

pub mod filesystem;
pub mod namespace;
pub mod node;
pub mod root;

pub use filesystem::{Filesystem, FilesystemRegistry, MountSourceFlags, ProcInfo};
pub use namespace::{Location, MountNamespace, MAX_SYMLINK_TRAVERSALS};
pub use node::{EntryKind, MemDir, OverlayNode};
pub use root::{build_root_mount, create_mount_namespace, SYNTHETIC_MOUNT_POINTS};
