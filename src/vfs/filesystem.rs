//! Named filesystem types and the registry they are looked up in.
use crate::config::types::{Result, RunkError};
use crate::vfs::node::{MemDir, OverlayNode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const HOSTFS: &str = "hostfs";
pub const TMPFS: &str = "tmpfs";
pub const PROCFS: &str = "proc";

/// Flags describing the mount source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountSourceFlags {
    pub read_only: bool,
}

/// A filesystem type that can produce a mountable tree.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce the root node of a new mount. `data` carries
    /// filesystem-specific options as comma separated `key=value` pairs.
    fn mount(&self, device: &str, flags: MountSourceFlags, data: &str) -> Result<OverlayNode>;
}

fn mount_option<'a>(data: &'a str, key: &str) -> Option<&'a str> {
    data.split(',')
        .filter_map(|opt| opt.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}

/// Read-only pass-through of one host directory. Always read-only, whatever
/// the flags say.
#[derive(Debug, Default)]
pub struct HostFilesystem;

impl Filesystem for HostFilesystem {
    fn name(&self) -> &'static str {
        HOSTFS
    }

    fn mount(&self, _device: &str, _flags: MountSourceFlags, data: &str) -> Result<OverlayNode> {
        let root = mount_option(data, "root").ok_or_else(|| RunkError::RootMountFailed {
            path: PathBuf::new(),
            reason: format!("missing root= option in {:?}", data),
        })?;
        let root = PathBuf::from(root);

        let md = std::fs::metadata(&root).map_err(|e| RunkError::RootMountFailed {
            path: root.clone(),
            reason: e.to_string(),
        })?;
        if !md.is_dir() {
            return Err(RunkError::RootMountFailed {
                path: root,
                reason: "not a directory".to_string(),
            });
        }

        log::debug!("hostfs: mounted {}", root.display());
        Ok(OverlayNode::host(root))
    }
}

/// Empty in-memory tree.
#[derive(Debug, Default)]
pub struct TmpFilesystem;

impl Filesystem for TmpFilesystem {
    fn name(&self) -> &'static str {
        TMPFS
    }

    fn mount(&self, _device: &str, flags: MountSourceFlags, _data: &str) -> Result<OverlayNode> {
        if flags.read_only {
            return Err(RunkError::Config(
                "tmpfs cannot be mounted read-only".to_string(),
            ));
        }
        Ok(OverlayNode::synthetic(MemDir::new()))
    }
}

/// Values the proc tree exposes about the sandbox.
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub hostname: String,
    pub boot_id: String,
}

/// Synthetic process-information tree.
#[derive(Debug)]
pub struct ProcFilesystem {
    info: ProcInfo,
    filesystem_names: Vec<&'static str>,
}

impl ProcFilesystem {
    pub fn new(info: ProcInfo) -> Self {
        Self {
            info,
            filesystem_names: vec![HOSTFS, TMPFS, PROCFS],
        }
    }
}

impl Filesystem for ProcFilesystem {
    fn name(&self) -> &'static str {
        PROCFS
    }

    fn mount(&self, _device: &str, _flags: MountSourceFlags, _data: &str) -> Result<OverlayNode> {
        let tree = MemDir::with_directories(["sys/kernel/random"])?;

        let filesystems: String = self
            .filesystem_names
            .iter()
            .map(|name| {
                if *name == HOSTFS {
                    format!("\t{}\n", name)
                } else {
                    format!("nodev\t{}\n", name)
                }
            })
            .collect();

        tree.write_file(Path::new("filesystems"), filesystems.as_bytes())?;
        tree.write_file(
            Path::new("sys/kernel/hostname"),
            format!("{}\n", self.info.hostname).as_bytes(),
        )?;
        tree.write_file(Path::new("sys/kernel/ostype"), b"Linux\n")?;
        tree.write_file(
            Path::new("sys/kernel/random/boot_id"),
            format!("{}\n", self.info.boot_id).as_bytes(),
        )?;

        Ok(OverlayNode::synthetic(tree))
    }
}

/// Filesystem types by tag.
#[derive(Default)]
pub struct FilesystemRegistry {
    filesystems: BTreeMap<&'static str, Arc<dyn Filesystem>>,
}

impl FilesystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `hostfs`, `tmpfs` and `proc`.
    pub fn with_defaults(proc_info: ProcInfo) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HostFilesystem));
        registry.register(Arc::new(TmpFilesystem));
        registry.register(Arc::new(ProcFilesystem::new(proc_info)));
        registry
    }

    /// Later registrations replace earlier ones with the same name.
    pub fn register(&mut self, fs: Arc<dyn Filesystem>) {
        self.filesystems.insert(fs.name(), fs);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Filesystem>> {
        self.filesystems.get(name).cloned()
    }

    /// Like [`find`](Self::find) but a missing tag is an error.
    pub fn require(&self, name: &str) -> Result<Arc<dyn Filesystem>> {
        self.find(name)
            .ok_or_else(|| RunkError::Config(format!("filesystem {:?} is not registered", name)))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filesystems.keys().copied().collect()
    }
}

impl std::fmt::Debug for FilesystemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemRegistry")
            .field("filesystems", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::node::EntryKind;

    fn info() -> ProcInfo {
        ProcInfo {
            hostname: "runk".to_string(),
            boot_id: "00000000-0000-4000-8000-000000000000".to_string(),
        }
    }

    #[test]
    fn test_registry_defaults() {
        let registry = FilesystemRegistry::with_defaults(info());
        assert_eq!(registry.names(), vec![HOSTFS, PROCFS, TMPFS]);
        assert!(registry.find("ext4").is_none());
        assert!(registry.require("ext4").is_err());
    }

    #[test]
    fn test_hostfs_mount_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello"), "world").unwrap();

        let data = format!("root={}", dir.path().display());
        let node = HostFilesystem
            .mount("", MountSourceFlags::default(), &data)
            .unwrap();
        assert_eq!(node.read(Path::new("hello")).unwrap(), b"world");
    }

    #[test]
    fn test_hostfs_missing_dir_fails_at_mount() {
        let err = HostFilesystem
            .mount("", MountSourceFlags::default(), "root=/definitely/not/here")
            .unwrap_err();
        assert!(matches!(err, RunkError::RootMountFailed { .. }));
    }

    #[test]
    fn test_hostfs_rejects_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let data = format!("root={}", file.path().display());
        let err = HostFilesystem
            .mount("", MountSourceFlags::default(), &data)
            .unwrap_err();
        assert!(matches!(err, RunkError::RootMountFailed { .. }));
    }

    #[test]
    fn test_hostfs_requires_root_option() {
        assert!(HostFilesystem
            .mount("", MountSourceFlags::default(), "mode=0755")
            .is_err());
    }

    #[test]
    fn test_tmpfs_is_empty_and_writable() {
        let node = TmpFilesystem
            .mount("", MountSourceFlags::default(), "")
            .unwrap();
        assert!(node.read_dir(Path::new("")).unwrap().is_empty());
        node.write_file(Path::new("scratch"), b"x").unwrap();
        assert_eq!(node.lookup(Path::new("scratch")).unwrap(), Some(EntryKind::File));
    }

    #[test]
    fn test_proc_contents() {
        let node = ProcFilesystem::new(info())
            .mount("proc", MountSourceFlags::default(), "")
            .unwrap();

        assert_eq!(node.read(Path::new("sys/kernel/hostname")).unwrap(), b"runk\n");
        assert_eq!(node.read(Path::new("sys/kernel/ostype")).unwrap(), b"Linux\n");
        let filesystems = String::from_utf8(node.read(Path::new("filesystems")).unwrap()).unwrap();
        assert!(filesystems.contains("nodev\tproc"));
        assert!(filesystems.contains("\thostfs"));
    }

    #[test]
    fn test_mount_option_parsing() {
        assert_eq!(mount_option("root=/a,mode=1", "root"), Some("/a"));
        assert_eq!(mount_option("mode=1, root = /b", "root"), Some("/b"));
        assert_eq!(mount_option("", "root"), None);
    }
}
