//! Import of the invoking process's standard descriptors.
//!
//! Each host descriptor is duplicated into a sandbox file object. In
//! terminal mode all three standard descriptors share one terminal object,
//! so foreground process group changes made through any of them are seen
//! through the others.

use crate::config::types::{Result, RunkError};
use crate::kernel::ProcessGroupId;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::isatty;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

/// Standard input, output and error.
pub const STDIO_FDS: [RawFd; 3] = [0, 1, 2];

#[derive(Debug)]
pub struct HostFile {
    fd: OwnedFd,
    host_fd: RawFd,
}

impl HostFile {
    /// Descriptor number this file was imported from.
    pub fn host_fd(&self) -> RawFd {
        self.host_fd
    }
}

/// Terminal-backed file with job-control state.
#[derive(Debug)]
pub struct TerminalFile {
    fd: OwnedFd,
    host_fd: RawFd,
    foreground: Mutex<Option<ProcessGroupId>>,
}

impl TerminalFile {
    pub fn host_fd(&self) -> RawFd {
        self.host_fd
    }

    /// Install the first foreground process group.
    pub fn init_foreground_process_group(&self, pgid: ProcessGroupId) {
        let mut fg = self.foreground.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = fg.replace(pgid) {
            log::warn!(
                "Terminal foreground group re-initialised ({} -> {})",
                previous,
                pgid
            );
        }
    }

    pub fn set_foreground_process_group(&self, pgid: ProcessGroupId) {
        *self.foreground.lock().unwrap_or_else(|e| e.into_inner()) = Some(pgid);
    }

    pub fn foreground_process_group(&self) -> Option<ProcessGroupId> {
        *self.foreground.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
pub enum SandboxFile {
    Host(HostFile),
    Terminal(TerminalFile),
}

impl SandboxFile {
    pub fn terminal(&self) -> Option<&TerminalFile> {
        match self {
            SandboxFile::Terminal(t) => Some(t),
            SandboxFile::Host(_) => None,
        }
    }

    pub fn host_fd(&self) -> RawFd {
        match self {
            SandboxFile::Host(f) => f.host_fd,
            SandboxFile::Terminal(t) => t.host_fd,
        }
    }

    /// Fresh descriptor for handing to a child process.
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.as_fd().try_clone_to_owned()
    }
}

impl AsFd for SandboxFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            SandboxFile::Host(f) => f.fd.as_fd(),
            SandboxFile::Terminal(t) => t.fd.as_fd(),
        }
    }
}

/// Sandbox descriptor number to file object.
#[derive(Debug, Default)]
pub struct DescriptorTable {
    files: BTreeMap<i32, Arc<SandboxFile>>,
}

impl DescriptorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, fd: i32, file: Arc<SandboxFile>) -> Option<Arc<SandboxFile>> {
        self.files.insert(fd, file)
    }

    pub fn get(&self, fd: i32) -> Option<&Arc<SandboxFile>> {
        self.files.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &Arc<SandboxFile>)> {
        self.files.iter().map(|(fd, file)| (*fd, file))
    }

    /// The shared terminal, if any descriptor is terminal-backed.
    pub fn terminal(&self) -> Option<&Arc<SandboxFile>> {
        self.files.values().find(|f| f.terminal().is_some())
    }
}

fn import_error(fd: RawFd, reason: impl Into<String>) -> RunkError {
    RunkError::DescriptorImport {
        fd,
        reason: reason.into(),
    }
}

/// Duplicate host descriptor `fd` into a sandbox file.
pub fn import_file(fd: RawFd, is_tty: bool) -> Result<SandboxFile> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(|e| import_error(fd, e.to_string()))?;

    // SAFETY: fcntl above proved `fd` is open; the borrow does not outlive
    // this function and the duplicate is owned separately.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = borrowed
        .try_clone_to_owned()
        .map_err(|e| import_error(fd, format!("dup failed: {}", e)))?;

    if is_tty {
        if !isatty(owned.as_raw_fd()).unwrap_or(false) {
            return Err(import_error(fd, "not a terminal"));
        }
        log::debug!("Imported fd {} as terminal", fd);
        return Ok(SandboxFile::Terminal(TerminalFile {
            fd: owned,
            host_fd: fd,
            foreground: Mutex::new(None),
        }));
    }

    log::debug!("Imported fd {}", fd);
    Ok(SandboxFile::Host(HostFile {
        fd: owned,
        host_fd: fd,
    }))
}

/// Import exactly three descriptors as sandbox fds 0, 1 and 2.
///
/// Descriptors are processed in index order. In terminal mode index 0
/// creates the terminal object and indices 1 and 2 reuse it without
/// importing their own host descriptor.
pub fn import_stdio(terminal_mode: bool, fds: &[RawFd]) -> Result<DescriptorTable> {
    if fds.len() != STDIO_FDS.len() {
        return Err(RunkError::InvalidDescriptorCount(fds.len()));
    }

    let mut table = DescriptorTable::new();
    let mut terminal: Option<Arc<SandboxFile>> = None;

    for (index, &host_fd) in fds.iter().enumerate() {
        let file = if terminal_mode {
            match &terminal {
                Some(shared) => Arc::clone(shared),
                None => {
                    let created = Arc::new(import_file(host_fd, true)?);
                    terminal = Some(Arc::clone(&created));
                    created
                }
            }
        } else {
            Arc::new(import_file(host_fd, false)?)
        };
        table.insert(index as i32, file);
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use std::os::fd::AsRawFd;

    fn temp_fds() -> Vec<std::fs::File> {
        (0..3).map(|_| tempfile::tempfile().unwrap()).collect()
    }

    #[test]
    fn test_wrong_count_rejected() {
        for fds in [&[][..], &[0, 1][..], &[0, 1, 2, 3][..]] {
            let err = import_stdio(false, fds).unwrap_err();
            assert!(matches!(err, RunkError::InvalidDescriptorCount(n) if n == fds.len()));
        }
    }

    #[test]
    fn test_non_tty_mode_imports_each() {
        let files = temp_fds();
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();

        let table = import_stdio(false, &raw).unwrap();
        assert_eq!(table.len(), 3);
        assert!(table.terminal().is_none());

        let f0 = table.get(0).unwrap();
        let f1 = table.get(1).unwrap();
        assert!(!Arc::ptr_eq(f0, f1));
        assert_eq!(f0.host_fd(), raw[0]);
        assert_eq!(table.get(2).unwrap().host_fd(), raw[2]);
    }

    #[test]
    fn test_same_host_fd_still_distinct_objects() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let table = import_stdio(false, &[fd, fd, fd]).unwrap();
        assert!(!Arc::ptr_eq(table.get(0).unwrap(), table.get(2).unwrap()));
    }

    #[test]
    fn test_tty_mode_shares_one_terminal() {
        let pty = openpty(None, None).unwrap();
        let slave = pty.slave.as_raw_fd();

        let table = import_stdio(true, &[slave, slave, slave]).unwrap();
        let t0 = table.get(0).unwrap();
        assert!(Arc::ptr_eq(t0, table.get(1).unwrap()));
        assert!(Arc::ptr_eq(t0, table.get(2).unwrap()));

        t0.terminal()
            .unwrap()
            .init_foreground_process_group(ProcessGroupId(1));
        let t2 = table.get(2).unwrap().terminal().unwrap();
        assert_eq!(t2.foreground_process_group(), Some(ProcessGroupId(1)));
    }

    #[test]
    fn test_tty_mode_only_imports_index_zero() {
        let pty = openpty(None, None).unwrap();
        let files = temp_fds();
        // Indices 1 and 2 are regular files; they are never inspected.
        let fds = [pty.slave.as_raw_fd(), files[1].as_raw_fd(), files[2].as_raw_fd()];

        let table = import_stdio(true, &fds).unwrap();
        assert_eq!(table.get(2).unwrap().host_fd(), fds[0]);
    }

    #[test]
    fn test_tty_mode_requires_terminal() {
        let files = temp_fds();
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
        let err = import_stdio(true, &raw).unwrap_err();
        assert!(
            matches!(err, RunkError::DescriptorImport { fd, ref reason } if fd == raw[0] && reason == "not a terminal")
        );
    }

    #[test]
    fn test_closed_descriptor_fails() {
        let err = import_file(987_654, false).unwrap_err();
        assert!(
            matches!(err, RunkError::DescriptorImport { fd: 987_654, ref reason } if reason.contains("EBADF"))
        );
    }

    #[test]
    fn test_clone_for_child() {
        let file = tempfile::tempfile().unwrap();
        let imported = import_file(file.as_raw_fd(), false).unwrap();
        let dup = imported.try_clone_fd().unwrap();
        assert_ne!(dup.as_raw_fd(), file.as_raw_fd());
    }
}
