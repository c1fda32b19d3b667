/// Core types and structures for the runk bootstrap
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Network stack selection for the sandbox
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Self-contained emulated TCP/IP stack, no host connectivity
    #[default]
    None,
    /// Pass-through to host networking
    Host,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Host => write!(f, "host"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(NetworkMode::None),
            "host" => Ok(NetworkMode::Host),
            other => Err(format!("unknown network mode: {}", other)),
        }
    }
}

/// Execution backend preference
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformPreference {
    /// Check for the accelerated backend, fall back to trap-based
    #[default]
    Auto,
    /// Hardware virtualization only
    Kvm,
    /// Syscall interception only
    Ptrace,
}

impl fmt::Display for PlatformPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformPreference::Auto => write!(f, "auto"),
            PlatformPreference::Kvm => write!(f, "kvm"),
            PlatformPreference::Ptrace => write!(f, "ptrace"),
        }
    }
}

impl FromStr for PlatformPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(PlatformPreference::Auto),
            "kvm" => Ok(PlatformPreference::Kvm),
            "ptrace" => Ok(PlatformPreference::Ptrace),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Immutable bootstrap input, owned by the caller
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Host directories composed into the root filesystem, lowest priority first
    pub mounts: Vec<PathBuf>,
    /// Share one terminal object across stdin/stdout/stderr
    pub tty: bool,
    /// Network stack selection
    pub network: NetworkMode,
    /// Argument vector of the sandboxed process
    pub args: Vec<String>,
    /// Environment of the sandboxed process as KEY=VALUE entries
    pub env: Vec<String>,
    /// Execution backend preference
    pub platform: PlatformPreference,
    /// UTS hostname and domainname inside the sandbox
    pub hostname: String,
    /// Container identifier reported to the guest kernel
    pub container_id: String,
}

pub const DEFAULT_HOSTNAME: &str = "runk";
pub const DEFAULT_MOUNT: &str = "rootfs";

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            mounts: vec![PathBuf::from(DEFAULT_MOUNT)],
            tty: false,
            network: NetworkMode::None,
            args: Vec::new(),
            env: Vec::new(),
            platform: PlatformPreference::Auto,
            hostname: DEFAULT_HOSTNAME.to_string(),
            container_id: DEFAULT_HOSTNAME.to_string(),
        }
    }
}

impl BootstrapConfig {
    /// Create a config for the given mount list and argument vector
    pub fn new(mounts: Vec<PathBuf>, args: Vec<String>) -> Self {
        Self {
            mounts,
            args,
            ..Default::default()
        }
    }
}

/// Parse a comma-delimited mount list. Empty segments are dropped.
pub fn parse_mount_list(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Custom error types for runk
#[derive(Error, Debug)]
pub enum RunkError {
    #[error("No usable execution platform: {0}")]
    PlatformUnavailable(String),

    #[error("Network stack configuration failed: {0}")]
    NetworkConfig(String),

    #[error("No root directories configured")]
    NoRootDirectories,

    #[error("Failed to mount root directory {}: {reason}", .path.display())]
    RootMountFailed { path: PathBuf, reason: String },

    #[error("Too many levels of symbolic links resolving {}", .0.display())]
    TooManySymlinks(PathBuf),

    #[error("Expected exactly 3 stdio descriptors (stdin, stdout, stderr), got {0}")]
    InvalidDescriptorCount(usize),

    #[error("Failed to import host descriptor {fd}: {reason}")]
    DescriptorImport { fd: RawFd, reason: String },

    #[error("Kernel initialization failed: {0}")]
    KernelInit(String),

    #[error("Failed to create root process: {0}")]
    ProcessCreate(String),

    #[error("No such file or directory: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Read-only filesystem: {}", .0.display())]
    ReadOnlyFilesystem(PathBuf),

    #[error("File exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for runk operations
pub type Result<T> = std::result::Result<T, RunkError>;

impl From<nix::errno::Errno> for RunkError {
    fn from(err: nix::errno::Errno) -> Self {
        RunkError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}
