//! Mount namespace: a root node plus filesystems mounted at directories
//! inside it, with symlink-aware path resolution.
use crate::config::types::{Result, RunkError};
use crate::vfs::node::{EntryKind, OverlayNode};
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

/// Upper bound on symlinks followed while resolving one path.
pub const MAX_SYMLINK_TRAVERSALS: u32 = 40;

/// A resolved, existing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Absolute path with no symlinks, `.` or `..` left in it
    pub path: PathBuf,
    pub kind: EntryKind,
}

enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> impl Iterator<Item = Step> + '_ {
    path.components().filter_map(|comp| match comp {
        Component::Normal(name) => Some(Step::Name(name.to_os_string())),
        Component::ParentDir => Some(Step::Parent),
        Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
    })
}

fn absolute(rel: &Path) -> PathBuf {
    Path::new("/").join(rel)
}

fn relative(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

#[derive(Debug)]
pub struct MountNamespace {
    root: OverlayNode,
    /// Keyed by canonical path relative to the namespace root
    mounts: RwLock<BTreeMap<PathBuf, OverlayNode>>,
}

impl MountNamespace {
    pub fn new(root: OverlayNode) -> Self {
        Self {
            root,
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    fn mounts(&self) -> RwLockReadGuard<'_, BTreeMap<PathBuf, OverlayNode>> {
        self.mounts.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Node owning `canon` and the path inside that node.
    fn node_for(&self, canon: &Path) -> (OverlayNode, PathBuf) {
        let mounts = self.mounts();
        let best = mounts
            .iter()
            .filter(|(point, _)| canon.starts_with(point))
            .max_by_key(|(point, _)| point.components().count());

        match best {
            Some((point, node)) => {
                let rel = canon.strip_prefix(point).unwrap_or(canon).to_path_buf();
                (node.clone(), rel)
            }
            None => (self.root.clone(), canon.to_path_buf()),
        }
    }

    fn kind_at(&self, canon: &Path) -> Result<Option<EntryKind>> {
        let (node, rel) = self.node_for(canon);
        node.lookup(&rel)
    }

    fn link_target(&self, canon: &Path) -> Result<PathBuf> {
        let (node, rel) = self.node_for(canon);
        node.read_link(&rel)
    }

    /// Walk `path` component by component from the root. Returns the
    /// canonical path and the kind of the final entry, `None` if only the
    /// final component is missing.
    fn resolve(
        &self,
        path: &Path,
        follow_final: bool,
        remaining: &mut u32,
    ) -> Result<(PathBuf, Option<EntryKind>)> {
        let mut pending: VecDeque<Step> = steps(path).collect();
        let mut current = PathBuf::new();
        let mut kind = Some(EntryKind::Directory);

        while let Some(step) = pending.pop_front() {
            let name = match step {
                Step::Parent => {
                    current.pop();
                    kind = Some(EntryKind::Directory);
                    continue;
                }
                Step::Name(name) => name,
            };

            let candidate = current.join(&name);
            let is_last = pending.is_empty();

            match self.kind_at(&candidate)? {
                None if is_last => return Ok((candidate, None)),
                None => return Err(RunkError::NotFound(absolute(&candidate))),
                Some(EntryKind::Symlink) if !is_last || follow_final => {
                    if *remaining == 0 {
                        return Err(RunkError::TooManySymlinks(absolute(&candidate)));
                    }
                    *remaining -= 1;

                    let target = self.link_target(&candidate)?;
                    if target.is_absolute() {
                        current = PathBuf::new();
                    }
                    for step in steps(&target).collect::<Vec<_>>().into_iter().rev() {
                        pending.push_front(step);
                    }
                    kind = Some(EntryKind::Directory);
                }
                Some(EntryKind::Directory) => {
                    current = candidate;
                    kind = Some(EntryKind::Directory);
                }
                Some(other) if is_last => {
                    current = candidate;
                    kind = Some(other);
                }
                Some(_) => return Err(RunkError::NotADirectory(absolute(&candidate))),
            }
        }

        Ok((current, kind))
    }

    /// Locate an existing entry, following symlinks (including a final one)
    /// against the shared `remaining` traversal budget.
    pub fn find_inode(&self, path: &Path, remaining: &mut u32) -> Result<Location> {
        match self.resolve(path, true, remaining)? {
            (canon, Some(kind)) => Ok(Location {
                path: absolute(&canon),
                kind,
            }),
            (canon, None) => Err(RunkError::NotFound(absolute(&canon))),
        }
    }

    /// [`find_inode`](Self::find_inode) with a fresh budget.
    pub fn lookup(&self, path: &Path) -> Result<Location> {
        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        self.find_inode(path, &mut remaining)
    }

    /// Mount `node` on the directory at `target`.
    pub fn mount(&self, target: &Path, node: OverlayNode) -> Result<()> {
        let location = self.lookup(target)?;
        if location.kind != EntryKind::Directory {
            return Err(RunkError::NotADirectory(location.path));
        }
        let key = relative(&location.path).to_path_buf();

        log::debug!("Mounting at {}", location.path.display());
        self.mounts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, node);
        Ok(())
    }

    pub fn mount_points(&self) -> Vec<PathBuf> {
        self.mounts().keys().map(|k| absolute(k)).collect()
    }

    pub fn root(&self) -> &OverlayNode {
        &self.root
    }

    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let location = self.lookup(path)?;
        let (node, rel) = self.node_for(relative(&location.path));
        node.read(&rel)
    }

    pub fn read_dir(&self, path: &Path) -> Result<Vec<String>> {
        let location = self.lookup(path)?;
        let canon = relative(&location.path).to_path_buf();
        let (node, rel) = self.node_for(&canon);
        let mut names = node.read_dir(&rel)?;

        // Mount points directly under this directory are visible even if the
        // underlying tree has no entry for them.
        for point in self.mounts().keys() {
            if point.parent() == Some(canon.as_path()) {
                if let Some(name) = point.file_name() {
                    names.push(name.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Symlink target at `path` (the final component is not followed).
    pub fn read_link(&self, path: &Path) -> Result<PathBuf> {
        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        let (canon, kind) = self.resolve(path, false, &mut remaining)?;
        if kind.is_none() {
            return Err(RunkError::NotFound(absolute(&canon)));
        }
        self.link_target(&canon)
    }

    /// Create or replace a file. The parent directory must exist.
    pub fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        let (canon, _) = self.resolve(path, true, &mut remaining)?;
        let (node, rel) = self.node_for(&canon);
        node.write_file(&rel, data)
    }

    pub fn create_dir(&self, path: &Path) -> Result<()> {
        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        let (canon, kind) = self.resolve(path, false, &mut remaining)?;
        if kind.is_some() {
            return Err(RunkError::AlreadyExists(absolute(&canon)));
        }
        let (node, rel) = self.node_for(&canon);
        node.create_dir(&rel)
    }

    pub fn remove(&self, path: &Path) -> Result<()> {
        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        let (canon, kind) = self.resolve(path, false, &mut remaining)?;
        if kind.is_none() {
            return Err(RunkError::NotFound(absolute(&canon)));
        }
        if self.mounts().contains_key(&canon) {
            return Err(RunkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("mount point busy: {}", absolute(&canon).display()),
            )));
        }
        let (node, rel) = self.node_for(&canon);
        node.remove(&rel)
    }

    /// Host file backing `path`, if any.
    pub fn host_path(&self, path: &Path) -> Result<Option<PathBuf>> {
        let location = self.lookup(path)?;
        let canon = relative(&location.path).to_path_buf();
        let (node, rel) = self.node_for(&canon);
        node.host_path(&rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::node::MemDir;

    fn namespace() -> (MountNamespace, MemDir) {
        let tree = MemDir::with_directories(["bin", "etc", "proc", "usr/lib"]).unwrap();
        tree.write_file(Path::new("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();
        tree.write_file(Path::new("usr/lib/libc"), b"elf").unwrap();
        (MountNamespace::new(OverlayNode::synthetic(tree.clone())), tree)
    }

    #[test]
    fn test_lookup_plain_paths() {
        let (ns, _) = namespace();
        let loc = ns.lookup(Path::new("/etc/hosts")).unwrap();
        assert_eq!(loc.path, PathBuf::from("/etc/hosts"));
        assert_eq!(loc.kind, EntryKind::File);

        let loc = ns.lookup(Path::new("/usr/./lib/../lib")).unwrap();
        assert_eq!(loc.path, PathBuf::from("/usr/lib"));
        assert_eq!(ns.lookup(Path::new("/../..")).unwrap().path, PathBuf::from("/"));
    }

    #[test]
    fn test_relative_and_absolute_symlinks() {
        let (ns, tree) = namespace();
        tree.symlink(Path::new("lib"), Path::new("usr/lib")).unwrap();
        tree.symlink(Path::new("bin/hosts"), Path::new("/etc/hosts")).unwrap();
        tree.symlink(Path::new("bin/up"), Path::new("../etc")).unwrap();

        assert_eq!(ns.read_file(Path::new("/lib/libc")).unwrap(), b"elf");
        assert_eq!(
            ns.lookup(Path::new("/bin/hosts")).unwrap().path,
            PathBuf::from("/etc/hosts")
        );
        assert_eq!(
            ns.lookup(Path::new("/bin/up/hosts")).unwrap().path,
            PathBuf::from("/etc/hosts")
        );
        assert_eq!(ns.read_link(Path::new("/lib")).unwrap(), PathBuf::from("usr/lib"));
    }

    #[test]
    fn test_symlink_loop_is_bounded() {
        let (ns, tree) = namespace();
        tree.symlink(Path::new("a"), Path::new("b")).unwrap();
        tree.symlink(Path::new("b"), Path::new("a")).unwrap();

        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        let err = ns.find_inode(Path::new("/a"), &mut remaining).unwrap_err();
        assert!(matches!(err, RunkError::TooManySymlinks(_)));
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_budget_is_shared_by_caller() {
        let (ns, tree) = namespace();
        tree.symlink(Path::new("l1"), Path::new("etc")).unwrap();

        let mut remaining = 1;
        ns.find_inode(Path::new("/l1/hosts"), &mut remaining).unwrap();
        assert_eq!(remaining, 0);
        assert!(matches!(
            ns.find_inode(Path::new("/l1"), &mut remaining),
            Err(RunkError::TooManySymlinks(_))
        ));
    }

    #[test]
    fn test_file_in_the_middle_is_not_a_directory() {
        let (ns, _) = namespace();
        assert!(matches!(
            ns.lookup(Path::new("/etc/hosts/more")),
            Err(RunkError::NotADirectory(_))
        ));
        assert!(matches!(
            ns.lookup(Path::new("/nope/more")),
            Err(RunkError::NotFound(_))
        ));
    }

    #[test]
    fn test_mount_shadows_directory() {
        let (ns, _) = namespace();
        let proc_tree = MemDir::new();
        proc_tree.write_file(Path::new("version"), b"6.0").unwrap();

        ns.mount(Path::new("/proc"), OverlayNode::synthetic(proc_tree)).unwrap();

        assert_eq!(ns.read_file(Path::new("/proc/version")).unwrap(), b"6.0");
        assert_eq!(ns.read_dir(Path::new("/proc")).unwrap(), vec!["version"]);
        assert_eq!(ns.mount_points(), vec![PathBuf::from("/proc")]);
        assert!(ns.remove(Path::new("/proc")).is_err());
    }

    #[test]
    fn test_mount_requires_directory() {
        let (ns, _) = namespace();
        assert!(matches!(
            ns.mount(Path::new("/etc/hosts"), OverlayNode::synthetic(MemDir::new())),
            Err(RunkError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_write_create_remove() {
        let (ns, _) = namespace();
        ns.create_dir(Path::new("/work")).unwrap();
        ns.write_file(Path::new("/work/out"), b"done").unwrap();
        assert_eq!(ns.read_file(Path::new("/work/out")).unwrap(), b"done");
        assert!(matches!(
            ns.create_dir(Path::new("/work")),
            Err(RunkError::AlreadyExists(_))
        ));

        ns.remove(Path::new("/work/out")).unwrap();
        assert!(ns.read_dir(Path::new("/work")).unwrap().is_empty());
    }
}
