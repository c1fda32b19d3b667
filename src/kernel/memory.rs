/// Anonymous memory file backing guest memory
use crate::config::types::{Result, RunkError};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};

#[derive(Debug)]
pub struct MemoryFile {
    file: File,
    size: u64,
}

impl MemoryFile {
    /// Create an empty memfd named `name` (visible in `/proc/<pid>/fd`).
    pub fn create(name: &str) -> Result<Self> {
        let cname = CString::new(name)
            .map_err(|_| RunkError::KernelInit(format!("invalid memfd name {:?}", name)))?;

        // SAFETY: cname is a valid NUL-terminated string for the duration of
        // the call; the flags are a constant.
        let raw = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(RunkError::KernelInit(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: memfd_create returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            file: File::from(fd),
            size: 0,
        })
    }

    /// Grow the file by `len` bytes and return the offset of the new region.
    pub fn allocate(&mut self, len: u64) -> Result<u64> {
        let offset = self.size;
        let new_size = offset
            .checked_add(len)
            .ok_or_else(|| RunkError::KernelInit("memory file size overflow".to_string()))?;
        self.file.set_len(new_size)?;
        self.size = new_size;
        Ok(offset)
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl AsFd for MemoryFile {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
