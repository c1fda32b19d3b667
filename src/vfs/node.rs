//! Filesystem tree nodes.
//!
//! A node is a read-only view of one host directory, an in-memory directory
//! tree, or an overlay of an upper node on a lower node. Paths given to a
//! node are relative to that node's root and never contain `..`; symlinks
//! are reported, not followed (following is the mount namespace's job).
//!
//! Overlay rules:
//! - reads resolve in the upper node first and fall through to the lower
//!   node on a miss;
//! - writes always land in the upper node, copying up the parent directory
//!   chain when it exists only below;
//! - removing an entry that exists below leaves a whiteout in the upper node;
//! - a directory recreated over a whiteout is opaque and hides the lower
//!   directory's contents.

use crate::config::types::{Result, RunkError};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
}

/// Result of looking up one path in one node without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Found(EntryKind),
    /// Directory that hides whatever lies below it
    OpaqueDir,
    Missing,
    /// Deleted in this layer; hides lower layers
    Whiteout,
}

impl Presence {
    pub fn kind(self) -> Option<EntryKind> {
        match self {
            Presence::Found(kind) => Some(kind),
            Presence::OpaqueDir => Some(EntryKind::Directory),
            Presence::Missing | Presence::Whiteout => None,
        }
    }
}

/// Strip root and `.` components and apply `..` lexically.
pub fn clean_relative(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn is_a_directory(path: &Path) -> RunkError {
    RunkError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("is a directory: {}", path.display()),
    ))
}

fn not_a_symlink(path: &Path) -> RunkError {
    RunkError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("not a symbolic link: {}", path.display()),
    ))
}

fn directory_not_empty(path: &Path) -> RunkError {
    RunkError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("directory not empty: {}", path.display()),
    ))
}

// ============================================================================
// Host-backed leaf
// ============================================================================

/// Read-only view of a host directory.
#[derive(Debug, Clone)]
pub struct HostLeaf {
    root: PathBuf,
}

impl HostLeaf {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, rel: &Path) -> PathBuf {
        if rel.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    /// Walks one component at a time so a host symlink in the middle of
    /// `rel` is never followed on the host side.
    fn presence(&self, rel: &Path) -> Result<Presence> {
        let comps: Vec<Component<'_>> = rel.components().collect();
        let mut path = self.root.clone();

        for (i, comp) in comps.iter().enumerate() {
            path.push(comp);
            let md = match fs::symlink_metadata(&path) {
                Ok(md) => md,
                Err(e)
                    if e.kind() == io::ErrorKind::NotFound
                        || e.raw_os_error() == Some(libc::ENOTDIR) =>
                {
                    return Ok(Presence::Missing)
                }
                Err(e) => return Err(e.into()),
            };
            let kind = kind_of(md.file_type());
            if i + 1 == comps.len() {
                return Ok(Presence::Found(kind));
            }
            if kind != EntryKind::Directory {
                return Ok(Presence::Missing);
            }
        }

        Ok(Presence::Found(EntryKind::Directory))
    }

    fn entries(&self, rel: &Path) -> Result<BTreeMap<String, Presence>> {
        let mut out = BTreeMap::new();
        if self.presence(rel)? != Presence::Found(EntryKind::Directory) {
            return Ok(out);
        }
        for entry in fs::read_dir(self.host_path(rel))? {
            let entry = entry?;
            let kind = kind_of(entry.file_type()?);
            out.insert(entry.file_name().to_string_lossy().into_owned(), Presence::Found(kind));
        }
        Ok(out)
    }
}

fn kind_of(ft: fs::FileType) -> EntryKind {
    if ft.is_dir() {
        EntryKind::Directory
    } else if ft.is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

// ============================================================================
// In-memory directory tree
// ============================================================================

#[derive(Debug, Clone)]
enum MemEntry {
    Dir { opaque: bool },
    File(Vec<u8>),
    Symlink(PathBuf),
    Whiteout,
}

/// Writable in-memory directory tree. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemDir {
    entries: Arc<RwLock<BTreeMap<PathBuf, MemEntry>>>,
}

impl MemDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree containing the given directories (and their parents).
    pub fn with_directories<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let dir = Self::new();
        for p in paths {
            dir.create_dir_all(&clean_relative(p.as_ref()))?;
        }
        Ok(dir)
    }

    /// Like [`MemDir::with_directories`], but each named directory is
    /// opaque: nothing below it shows through from a lower layer.
    pub fn with_opaque_directories<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let dir = Self::new();
        for p in paths {
            let rel = clean_relative(p.as_ref());
            dir.create_dir_all(&rel)?;
            if !rel.as_os_str().is_empty() {
                dir.write_guard()
                    .insert(rel, MemEntry::Dir { opaque: true });
            }
        }
        Ok(dir)
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, BTreeMap<PathBuf, MemEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, BTreeMap<PathBuf, MemEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn presence(&self, rel: &Path) -> Presence {
        if rel.as_os_str().is_empty() {
            return Presence::Found(EntryKind::Directory);
        }
        match self.read_guard().get(rel) {
            Some(MemEntry::Dir { opaque: true }) => Presence::OpaqueDir,
            Some(MemEntry::Dir { opaque: false }) => Presence::Found(EntryKind::Directory),
            Some(MemEntry::File(_)) => Presence::Found(EntryKind::File),
            Some(MemEntry::Symlink(_)) => Presence::Found(EntryKind::Symlink),
            Some(MemEntry::Whiteout) => Presence::Whiteout,
            None => Presence::Missing,
        }
    }

    fn entries(&self, rel: &Path) -> BTreeMap<String, Presence> {
        let guard = self.read_guard();
        let mut out = BTreeMap::new();
        for (path, entry) in guard.iter() {
            if path.parent() != Some(rel) {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let presence = match entry {
                MemEntry::Dir { opaque: true } => Presence::OpaqueDir,
                MemEntry::Dir { opaque: false } => Presence::Found(EntryKind::Directory),
                MemEntry::File(_) => Presence::Found(EntryKind::File),
                MemEntry::Symlink(_) => Presence::Found(EntryKind::Symlink),
                MemEntry::Whiteout => Presence::Whiteout,
            };
            out.insert(name.to_string_lossy().into_owned(), presence);
        }
        out
    }

    fn check_parent(&self, rel: &Path) -> Result<()> {
        let parent = rel.parent().unwrap_or_else(|| Path::new(""));
        match self.presence(parent).kind() {
            Some(EntryKind::Directory) => Ok(()),
            Some(_) => Err(RunkError::NotADirectory(parent.to_path_buf())),
            None => Err(RunkError::NotFound(parent.to_path_buf())),
        }
    }

    pub fn read(&self, rel: &Path) -> Result<Vec<u8>> {
        match self.read_guard().get(rel) {
            Some(MemEntry::File(data)) => Ok(data.clone()),
            Some(MemEntry::Dir { .. }) => Err(is_a_directory(rel)),
            Some(MemEntry::Symlink(_)) => Err(RunkError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("symbolic link: {}", rel.display()),
            ))),
            Some(MemEntry::Whiteout) | None if rel.as_os_str().is_empty() => Err(is_a_directory(rel)),
            Some(MemEntry::Whiteout) | None => Err(RunkError::NotFound(rel.to_path_buf())),
        }
    }

    pub fn read_link(&self, rel: &Path) -> Result<PathBuf> {
        match self.read_guard().get(rel) {
            Some(MemEntry::Symlink(target)) => Ok(target.clone()),
            Some(MemEntry::Whiteout) | None => Err(RunkError::NotFound(rel.to_path_buf())),
            Some(_) => Err(not_a_symlink(rel)),
        }
    }

    pub fn write_file(&self, rel: &Path, data: &[u8]) -> Result<()> {
        if rel.as_os_str().is_empty() {
            return Err(is_a_directory(rel));
        }
        self.check_parent(rel)?;
        let mut guard = self.write_guard();
        if let Some(MemEntry::Dir { .. }) = guard.get(rel) {
            return Err(is_a_directory(rel));
        }
        guard.insert(rel.to_path_buf(), MemEntry::File(data.to_vec()));
        Ok(())
    }

    /// Creating over a whiteout produces an opaque directory.
    pub fn create_dir(&self, rel: &Path) -> Result<()> {
        if rel.as_os_str().is_empty() {
            return Err(RunkError::AlreadyExists(rel.to_path_buf()));
        }
        self.check_parent(rel)?;
        let mut guard = self.write_guard();
        let opaque = match guard.get(rel) {
            None => false,
            Some(MemEntry::Whiteout) => true,
            Some(_) => return Err(RunkError::AlreadyExists(rel.to_path_buf())),
        };
        guard.insert(rel.to_path_buf(), MemEntry::Dir { opaque });
        Ok(())
    }

    pub fn create_dir_all(&self, rel: &Path) -> Result<()> {
        let mut prefix = PathBuf::new();
        for comp in rel.components() {
            prefix.push(comp);
            match self.presence(&prefix) {
                Presence::Found(EntryKind::Directory) | Presence::OpaqueDir => {}
                Presence::Missing | Presence::Whiteout => self.create_dir(&prefix)?,
                Presence::Found(_) => return Err(RunkError::NotADirectory(prefix)),
            }
        }
        Ok(())
    }

    pub fn symlink(&self, rel: &Path, target: &Path) -> Result<()> {
        self.check_parent(rel)?;
        let mut guard = self.write_guard();
        match guard.get(rel) {
            None | Some(MemEntry::Whiteout) => {
                guard.insert(rel.to_path_buf(), MemEntry::Symlink(target.to_path_buf()));
                Ok(())
            }
            Some(_) => Err(RunkError::AlreadyExists(rel.to_path_buf())),
        }
    }

    /// Remove an entry and everything below it.
    pub fn remove(&self, rel: &Path) -> Result<()> {
        let mut guard = self.write_guard();
        match guard.get(rel) {
            None | Some(MemEntry::Whiteout) => return Err(RunkError::NotFound(rel.to_path_buf())),
            Some(_) => {}
        }
        guard.retain(|path, _| !path.starts_with(rel));
        Ok(())
    }

    fn put_whiteout(&self, rel: &Path) -> Result<()> {
        self.check_parent(rel)?;
        let mut guard = self.write_guard();
        guard.retain(|path, _| !path.starts_with(rel));
        guard.insert(rel.to_path_buf(), MemEntry::Whiteout);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }
}

// ============================================================================
// Overlay node
// ============================================================================

#[derive(Debug, Clone)]
pub enum OverlayNode {
    Host(HostLeaf),
    Synthetic(MemDir),
    Overlay {
        upper: Arc<OverlayNode>,
        lower: Arc<OverlayNode>,
    },
}

enum Shadow {
    Open,
    Hidden(Presence),
}

/// Decide whether something in `upper` above `rel` cuts off the lower node.
fn shadowing(upper: &OverlayNode, rel: &Path) -> Result<Shadow> {
    let comps: Vec<Component<'_>> = rel.components().collect();
    let mut prefix = PathBuf::new();
    for comp in comps.iter().take(comps.len().saturating_sub(1)) {
        prefix.push(comp);
        match upper.presence(&prefix)? {
            Presence::Found(EntryKind::Directory) | Presence::Missing => {}
            Presence::OpaqueDir => return Ok(Shadow::Hidden(upper.presence(rel)?)),
            Presence::Whiteout => return Ok(Shadow::Hidden(Presence::Whiteout)),
            Presence::Found(_) => return Ok(Shadow::Hidden(Presence::Missing)),
        }
    }
    Ok(Shadow::Open)
}

impl OverlayNode {
    pub fn host(root: PathBuf) -> Self {
        OverlayNode::Host(HostLeaf::new(root))
    }

    pub fn synthetic(dir: MemDir) -> Self {
        OverlayNode::Synthetic(dir)
    }

    /// `upper` shadows `lower`.
    pub fn overlay(upper: OverlayNode, lower: OverlayNode) -> Self {
        OverlayNode::Overlay {
            upper: Arc::new(upper),
            lower: Arc::new(lower),
        }
    }

    pub fn presence(&self, rel: &Path) -> Result<Presence> {
        match self {
            OverlayNode::Host(leaf) => leaf.presence(rel),
            OverlayNode::Synthetic(dir) => Ok(dir.presence(rel)),
            OverlayNode::Overlay { upper, lower } => {
                if let Shadow::Hidden(presence) = shadowing(upper, rel)? {
                    return Ok(presence);
                }
                match upper.presence(rel)? {
                    Presence::Missing => lower.presence(rel),
                    presence => Ok(presence),
                }
            }
        }
    }

    /// Kind of the entry at `rel`, or `None` if it does not exist.
    pub fn lookup(&self, rel: &Path) -> Result<Option<EntryKind>> {
        Ok(self.presence(&clean_relative(rel))?.kind())
    }

    /// The leaf node that serves `rel`.
    fn serving_leaf(&self, rel: &Path) -> Result<Option<&OverlayNode>> {
        match self {
            OverlayNode::Host(_) | OverlayNode::Synthetic(_) => {
                Ok(self.presence(rel)?.kind().map(|_| self))
            }
            OverlayNode::Overlay { upper, lower } => {
                if let Shadow::Hidden(_) = shadowing(upper, rel)? {
                    return upper.serving_leaf(rel);
                }
                match upper.presence(rel)? {
                    Presence::Missing => lower.serving_leaf(rel),
                    Presence::Whiteout => Ok(None),
                    _ => upper.serving_leaf(rel),
                }
            }
        }
    }

    fn entries(&self, rel: &Path) -> Result<BTreeMap<String, Presence>> {
        match self {
            OverlayNode::Host(leaf) => leaf.entries(rel),
            OverlayNode::Synthetic(dir) => Ok(dir.entries(rel)),
            OverlayNode::Overlay { upper, lower } => {
                if let Shadow::Hidden(_) = shadowing(upper, rel)? {
                    return upper.entries(rel);
                }
                let up = upper.entries(rel)?;
                match upper.presence(rel)? {
                    Presence::OpaqueDir | Presence::Whiteout => return Ok(up),
                    Presence::Found(kind) if kind != EntryKind::Directory => return Ok(up),
                    _ => {}
                }
                let mut merged = lower.entries(rel)?;
                merged.extend(up);
                Ok(merged)
            }
        }
    }

    /// Names in the directory at `rel`, sorted.
    pub fn read_dir(&self, rel: &Path) -> Result<Vec<String>> {
        let rel = clean_relative(rel);
        match self.presence(&rel)?.kind() {
            Some(EntryKind::Directory) => {}
            Some(_) => return Err(RunkError::NotADirectory(rel)),
            None => return Err(RunkError::NotFound(rel)),
        }
        Ok(self
            .entries(&rel)?
            .into_iter()
            .filter(|(_, presence)| presence.kind().is_some())
            .map(|(name, _)| name)
            .collect())
    }

    pub fn read(&self, rel: &Path) -> Result<Vec<u8>> {
        let rel = clean_relative(rel);
        match self.serving_leaf(&rel)? {
            Some(OverlayNode::Host(leaf)) => match leaf.presence(&rel)?.kind() {
                Some(EntryKind::File) => Ok(fs::read(leaf.host_path(&rel))?),
                Some(EntryKind::Directory) => Err(is_a_directory(&rel)),
                _ => Err(RunkError::NotFound(rel)),
            },
            Some(OverlayNode::Synthetic(dir)) => dir.read(&rel),
            _ => Err(RunkError::NotFound(rel)),
        }
    }

    pub fn read_link(&self, rel: &Path) -> Result<PathBuf> {
        let rel = clean_relative(rel);
        match self.serving_leaf(&rel)? {
            Some(OverlayNode::Host(leaf)) => match leaf.presence(&rel)?.kind() {
                Some(EntryKind::Symlink) => Ok(fs::read_link(leaf.host_path(&rel))?),
                _ => Err(not_a_symlink(&rel)),
            },
            Some(OverlayNode::Synthetic(dir)) => dir.read_link(&rel),
            _ => Err(RunkError::NotFound(rel)),
        }
    }

    /// Host file backing `rel`, or `None` when it lives in memory.
    pub fn host_path(&self, rel: &Path) -> Result<Option<PathBuf>> {
        let rel = clean_relative(rel);
        match self.serving_leaf(&rel)? {
            Some(OverlayNode::Host(leaf)) => Ok(Some(leaf.host_path(&rel))),
            Some(_) => Ok(None),
            None => Err(RunkError::NotFound(rel)),
        }
    }

    fn read_only(&self, rel: &Path) -> RunkError {
        let root = match self {
            OverlayNode::Host(leaf) => leaf.root().join(rel),
            _ => rel.to_path_buf(),
        };
        RunkError::ReadOnlyFilesystem(root)
    }

    /// Make sure the parent of `rel` exists as a directory in the upper node.
    fn copy_up_parent(&self, upper: &OverlayNode, rel: &Path) -> Result<()> {
        let Some(parent) = rel.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        match self.presence(parent)?.kind() {
            Some(EntryKind::Directory) => upper.copy_up_dirs(parent),
            Some(_) => Err(RunkError::NotADirectory(parent.to_path_buf())),
            None => Err(RunkError::NotFound(parent.to_path_buf())),
        }
    }

    fn copy_up_dirs(&self, rel: &Path) -> Result<()> {
        match self {
            OverlayNode::Host(_) => Err(self.read_only(rel)),
            OverlayNode::Synthetic(dir) => dir.create_dir_all(rel),
            OverlayNode::Overlay { upper, .. } => upper.copy_up_dirs(rel),
        }
    }

    pub fn write_file(&self, rel: &Path, data: &[u8]) -> Result<()> {
        let rel = clean_relative(rel);
        match self {
            OverlayNode::Host(_) => Err(self.read_only(&rel)),
            OverlayNode::Synthetic(dir) => dir.write_file(&rel, data),
            OverlayNode::Overlay { upper, .. } => {
                if self.presence(&rel)?.kind() == Some(EntryKind::Directory) {
                    return Err(is_a_directory(&rel));
                }
                self.copy_up_parent(upper, &rel)?;
                upper.write_file(&rel, data)
            }
        }
    }

    pub fn create_dir(&self, rel: &Path) -> Result<()> {
        let rel = clean_relative(rel);
        match self {
            OverlayNode::Host(_) => Err(self.read_only(&rel)),
            OverlayNode::Synthetic(dir) => dir.create_dir(&rel),
            OverlayNode::Overlay { upper, .. } => {
                if self.presence(&rel)?.kind().is_some() {
                    return Err(RunkError::AlreadyExists(rel));
                }
                self.copy_up_parent(upper, &rel)?;
                upper.create_dir(&rel)
            }
        }
    }

    pub fn symlink(&self, rel: &Path, target: &Path) -> Result<()> {
        let rel = clean_relative(rel);
        match self {
            OverlayNode::Host(_) => Err(self.read_only(&rel)),
            OverlayNode::Synthetic(dir) => dir.symlink(&rel, target),
            OverlayNode::Overlay { upper, .. } => {
                if self.presence(&rel)?.kind().is_some() {
                    return Err(RunkError::AlreadyExists(rel));
                }
                self.copy_up_parent(upper, &rel)?;
                upper.symlink(&rel, target)
            }
        }
    }

    /// Remove a file, symlink or empty directory.
    pub fn remove(&self, rel: &Path) -> Result<()> {
        let rel = clean_relative(rel);
        match self {
            OverlayNode::Host(_) => Err(self.read_only(&rel)),
            OverlayNode::Synthetic(dir) => {
                if dir.presence(&rel).kind() == Some(EntryKind::Directory)
                    && !self.read_dir(&rel)?.is_empty()
                {
                    return Err(directory_not_empty(&rel));
                }
                dir.remove(&rel)
            }
            OverlayNode::Overlay { upper, lower } => {
                match self.presence(&rel)?.kind() {
                    None => return Err(RunkError::NotFound(rel)),
                    Some(EntryKind::Directory) if !self.read_dir(&rel)?.is_empty() => {
                        return Err(directory_not_empty(&rel))
                    }
                    Some(_) => {}
                }
                let lower_visible = matches!(shadowing(upper, &rel)?, Shadow::Open)
                    && lower.presence(&rel)?.kind().is_some();
                if lower_visible {
                    self.copy_up_parent(upper, &rel)?;
                    upper.whiteout(&rel)
                } else {
                    upper.remove(&rel)
                }
            }
        }
    }

    fn whiteout(&self, rel: &Path) -> Result<()> {
        match self {
            OverlayNode::Host(_) => Err(self.read_only(rel)),
            OverlayNode::Synthetic(dir) => dir.put_whiteout(rel),
            OverlayNode::Overlay { upper, .. } => upper.whiteout(rel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host_dir(files: &[(&str, &str)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn read_str(node: &OverlayNode, path: &str) -> String {
        String::from_utf8(node.read(Path::new(path)).unwrap()).unwrap()
    }

    #[test]
    fn test_clean_relative() {
        assert_eq!(clean_relative(Path::new("/a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(clean_relative(Path::new("/")), PathBuf::new());
        assert_eq!(clean_relative(Path::new("../../x")), PathBuf::from("x"));
    }

    #[test]
    fn test_upper_wins_lower_falls_through() {
        let lower = host_dir(&[("etc/conf", "lower"), ("only-lower", "L")]);
        let upper = host_dir(&[("etc/conf", "upper"), ("only-upper", "U")]);
        let node = OverlayNode::overlay(
            OverlayNode::host(upper.path().to_path_buf()),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        assert_eq!(read_str(&node, "etc/conf"), "upper");
        assert_eq!(read_str(&node, "only-lower"), "L");
        assert_eq!(read_str(&node, "only-upper"), "U");
        assert_eq!(
            node.read_dir(Path::new("")).unwrap(),
            vec!["etc", "only-lower", "only-upper"]
        );
    }

    #[test]
    fn test_host_leaf_is_read_only() {
        let dir = host_dir(&[("f", "x")]);
        let node = OverlayNode::host(dir.path().to_path_buf());

        assert!(matches!(
            node.write_file(Path::new("f"), b"y"),
            Err(RunkError::ReadOnlyFilesystem(_))
        ));
        assert!(matches!(
            node.create_dir(Path::new("d")),
            Err(RunkError::ReadOnlyFilesystem(_))
        ));
        assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "x");
    }

    #[test]
    fn test_write_lands_in_upper_with_copy_up() {
        let lower = host_dir(&[("etc/conf", "lower")]);
        let top = MemDir::new();
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(top.clone()),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        node.write_file(Path::new("etc/conf"), b"changed").unwrap();
        node.write_file(Path::new("etc/new"), b"fresh").unwrap();

        assert_eq!(read_str(&node, "etc/conf"), "changed");
        assert_eq!(read_str(&node, "etc/new"), "fresh");
        assert_eq!(top.presence(Path::new("etc")), Presence::Found(EntryKind::Directory));
        assert_eq!(fs::read_to_string(lower.path().join("etc/conf")).unwrap(), "lower");
        assert!(!lower.path().join("etc/new").exists());
    }

    #[test]
    fn test_write_requires_parent() {
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(MemDir::new()),
            OverlayNode::synthetic(MemDir::new()),
        );
        assert!(matches!(
            node.write_file(Path::new("missing/file"), b"x"),
            Err(RunkError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_leaves_whiteout() {
        let lower = host_dir(&[("etc/conf", "lower"), ("etc/keep", "k")]);
        let top = MemDir::new();
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(top.clone()),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        node.remove(Path::new("etc/conf")).unwrap();

        assert_eq!(node.lookup(Path::new("etc/conf")).unwrap(), None);
        assert_eq!(node.read_dir(Path::new("etc")).unwrap(), vec!["keep"]);
        assert_eq!(top.presence(Path::new("etc/conf")), Presence::Whiteout);
        assert!(lower.path().join("etc/conf").exists());
    }

    #[test]
    fn test_recreated_directory_is_opaque() {
        let lower = host_dir(&[("data/old", "o")]);
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(MemDir::new()),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        node.remove(Path::new("data/old")).unwrap();
        node.remove(Path::new("data")).unwrap();
        node.create_dir(Path::new("data")).unwrap();

        assert_eq!(node.lookup(Path::new("data")).unwrap(), Some(EntryKind::Directory));
        assert!(node.read_dir(Path::new("data")).unwrap().is_empty());
        assert_eq!(node.lookup(Path::new("data/old")).unwrap(), None);
    }

    #[test]
    fn test_opaque_directories_hide_lower_contents() {
        let lower = host_dir(&[("tmp/stale", "s"), ("dev/sda", "disk"), ("etc/conf", "c")]);
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(MemDir::with_opaque_directories(["/tmp", "/dev"]).unwrap()),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        assert_eq!(node.lookup(Path::new("tmp")).unwrap(), Some(EntryKind::Directory));
        assert!(node.read_dir(Path::new("tmp")).unwrap().is_empty());
        assert_eq!(node.lookup(Path::new("tmp/stale")).unwrap(), None);
        assert_eq!(node.lookup(Path::new("dev/sda")).unwrap(), None);
        assert_eq!(read_str(&node, "etc/conf"), "c");
        assert_eq!(node.read_dir(Path::new("")).unwrap(), vec!["dev", "etc", "tmp"]);
    }

    #[test]
    fn test_remove_non_empty_directory_fails() {
        let lower = host_dir(&[("dir/file", "x")]);
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(MemDir::new()),
            OverlayNode::host(lower.path().to_path_buf()),
        );
        assert!(node.remove(Path::new("dir")).is_err());
    }

    #[test]
    fn test_upper_file_hides_lower_subtree() {
        let lower = host_dir(&[("x/inner", "lower")]);
        let top = MemDir::new();
        top.write_file(Path::new("x"), b"file").unwrap();
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(top),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        assert_eq!(node.lookup(Path::new("x")).unwrap(), Some(EntryKind::File));
        assert_eq!(node.lookup(Path::new("x/inner")).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_host_symlinks_reported_not_followed() {
        let dir = host_dir(&[("real/file", "x")]);
        std::os::unix::fs::symlink("/", dir.path().join("escape")).unwrap();
        let node = OverlayNode::host(dir.path().to_path_buf());

        assert_eq!(node.lookup(Path::new("escape")).unwrap(), Some(EntryKind::Symlink));
        assert_eq!(node.lookup(Path::new("escape/etc")).unwrap(), None);
        assert_eq!(node.read_link(Path::new("escape")).unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn test_host_path_only_for_host_entries() {
        let lower = host_dir(&[("bin/tool", "#!")]);
        let node = OverlayNode::overlay(
            OverlayNode::synthetic(MemDir::with_directories(["tmp"]).unwrap()),
            OverlayNode::host(lower.path().to_path_buf()),
        );

        assert_eq!(
            node.host_path(Path::new("bin/tool")).unwrap(),
            Some(lower.path().join("bin/tool"))
        );
        assert_eq!(node.host_path(Path::new("tmp")).unwrap(), None);
        assert!(node.host_path(Path::new("nope")).is_err());
    }

    #[test]
    fn test_memdir_with_directories() {
        let dir = MemDir::with_directories(["/dev", "/sys/kernel"]).unwrap();
        assert_eq!(dir.presence(Path::new("dev")), Presence::Found(EntryKind::Directory));
        assert_eq!(dir.presence(Path::new("sys")), Presence::Found(EntryKind::Directory));
        assert_eq!(dir.presence(Path::new("sys/kernel")), Presence::Found(EntryKind::Directory));
    }
}
