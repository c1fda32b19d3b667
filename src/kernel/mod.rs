//! Guest kernel collaborator interface.
//!
//! The bootstrap drives a [`GuestKernel`] through a fixed sequence of calls;
//! the kernel owns everything it is handed (platform, memory backing,
//! network stack, descriptors, mount namespace). [`native`] holds the
//! bundled implementation.

pub mod memory;
pub mod native;
pub mod time;

pub use memory::MemoryFile;
pub use time::{CalibratedClocks, Timekeeper};

use crate::config::types::{Result, RunkError};
use crate::exec::fd_import::DescriptorTable;
use crate::net::{NetworkStack, UniqueIdSource};
use crate::platform::ExecutionPlatform;
use crate::vfs::MountNamespace;
use nix::sys::resource::{getrlimit, Resource};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Default file mode creation mask for the root process.
pub const DEFAULT_UMASK: u32 = 0o022;

pub trait GuestKernel: Send {
    fn platform(&self) -> &dyn ExecutionPlatform;

    fn set_memory_backing(&mut self, file: MemoryFile) -> Result<()>;

    fn prepare_vdso(&mut self) -> Result<Vdso>;

    fn new_timekeeper(&mut self, vdso: &Vdso) -> Result<Timekeeper>;

    /// Identifier source for the network stack.
    fn unique_ids(&self) -> Arc<dyn UniqueIdSource>;

    fn initialize(&mut self, args: InitKernelArgs) -> Result<()>;

    fn create_process(&mut self, args: CreateProcessArgs) -> Result<ProcessHandle>;

    /// Process group of the init process, once it exists.
    fn global_init_process_group(&self) -> Option<ProcessGroupId>;

    fn start(&mut self) -> Result<()>;

    /// Block until no process in the root process group can run.
    fn wait_for_no_runnable_processes(&mut self) -> Result<ExitStatus>;
}

/// Produces a kernel bound to an execution platform.
pub trait KernelAllocator {
    fn allocate_kernel(&self, platform: Box<dyn ExecutionPlatform>)
        -> Result<Box<dyn GuestKernel>>;
}

/// Location of the vDSO parameter page inside the memory backing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vdso {
    pub param_page_offset: u64,
    pub param_page_len: u64,
}

/// Host CPU identity exposed to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub vendor: String,
    pub flags: BTreeSet<String>,
}

impl FeatureSet {
    pub fn host() -> Self {
        match std::fs::read_to_string("/proc/cpuinfo") {
            Ok(cpuinfo) => Self::from_cpuinfo(&cpuinfo),
            Err(e) => {
                log::warn!("Cannot read /proc/cpuinfo, using empty feature set: {}", e);
                Self::default()
            }
        }
    }

    /// Uses the first processor block only.
    pub fn from_cpuinfo(cpuinfo: &str) -> Self {
        let mut features = Self::default();
        for line in cpuinfo.lines() {
            if line.trim().is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "vendor_id" => features.vendor = value.trim().to_string(),
                "flags" | "Features" => {
                    features.flags = value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }
        features
    }

    pub fn has(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    /// Root in the sandbox's own user namespace.
    pub fn root() -> Self {
        Self { uid: 0, gid: 0 }
    }
}

/// Namespaces the init process starts in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootNamespaces {
    pub credentials: Credentials,
    pub hostname: String,
    pub domainname: String,
}

impl RootNamespaces {
    pub fn new(hostname: &str) -> Self {
        Self {
            credentials: Credentials::root(),
            hostname: hostname.to_string(),
            domainname: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

/// Resource limits for the root process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitSet {
    limits: Vec<Limit>,
}

const INHERITED_LIMITS: [Resource; 6] = [
    Resource::RLIMIT_AS,
    Resource::RLIMIT_CORE,
    Resource::RLIMIT_CPU,
    Resource::RLIMIT_FSIZE,
    Resource::RLIMIT_NOFILE,
    Resource::RLIMIT_STACK,
];

impl LimitSet {
    /// Snapshot the invoking process's limits.
    pub fn from_host() -> Result<Self> {
        let mut limits = Vec::with_capacity(INHERITED_LIMITS.len());
        for resource in INHERITED_LIMITS {
            let (soft, hard) = getrlimit(resource).map_err(|e| {
                RunkError::ProcessCreate(format!("getrlimit({:?}) failed: {}", resource, e))
            })?;
            limits.push(Limit {
                resource,
                soft: soft as u64,
                hard: hard as u64,
            });
        }
        Ok(Self { limits })
    }

    pub fn get(&self, resource: Resource) -> Option<&Limit> {
        self.limits.iter().find(|l| l.resource == resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Limit> {
        self.limits.iter()
    }
}

pub struct InitKernelArgs {
    pub feature_set: FeatureSet,
    pub timekeeper: Arc<Timekeeper>,
    pub namespaces: RootNamespaces,
    pub network: NetworkStack,
    pub core_count: usize,
    pub vdso: Vdso,
}

/// Everything needed to create the init process.
pub struct CreateProcessArgs {
    pub argv: Vec<String>,
    pub envv: Vec<String>,
    pub working_directory: PathBuf,
    pub credentials: Credentials,
    pub umask: u32,
    pub limits: LimitSet,
    pub max_symlink_traversals: u32,
    pub fd_table: DescriptorTable,
    pub mount_namespace: Arc<MountNamespace>,
    pub container_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessGroupId(pub i32);

impl std::fmt::Display for ProcessGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Thread id inside the sandbox
    pub tid: i32,
    pub argv0: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

impl ExitStatus {
    /// Shell-style code: signal deaths are `128 + signo`.
    pub fn code(&self) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signo) => 128 + signo,
        }
    }

    pub fn success(&self) -> bool {
        *self == ExitStatus::Exited(0)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exited with code {}", code),
            ExitStatus::Signaled(signo) => write!(f, "killed by signal {}", signo),
        }
    }
}
