//! Bootstrap orchestration.
//!
//! The sandbox comes up through a fixed sequence of stages:
//!
//! ```text
//! Uninitialized -> RandomnessReady -> UsageAccountingReady -> PlatformReady
//!   -> KernelAllocated -> MemoryBackingReady -> VdsoReady -> TimekeeperReady
//!   -> NetworkReady -> KernelInitialized -> DescriptorsImported
//!   -> MountNamespaceReady -> RootProcessCreated -> ForegroundAssigned
//!   -> Started -> (exit status)
//! ```
//!
//! Each state is a type and each transition consumes the previous state, so
//! stages cannot be skipped, reordered or repeated. A failing transition
//! returns a [`BootstrapFailure`] naming the stage and drops everything
//! acquired so far; nothing is started on partially built state.
//!
//! Starting is only possible after the root process exists:
//!
//! ```compile_fail
//! use runk::exec::bootstrap::{Bootstrap, Uninitialized};
//! fn skip_ahead(b: Bootstrap<'_, Uninitialized>) {
//!     let _ = b.start();
//! }
//! ```
//!
//! The kernel cannot be initialised before the network stack is built:
//!
//! ```compile_fail
//! use runk::exec::bootstrap::{Bootstrap, TimekeeperReady};
//! fn skip_network(b: Bootstrap<'_, TimekeeperReady>) {
//!     let _ = b.initialize_kernel();
//! }
//! ```
//!
//! A consumed state cannot be reused:
//!
//! ```compile_fail
//! use runk::exec::bootstrap::{Bootstrap, Uninitialized};
//! fn twice(b: Bootstrap<'_, Uninitialized>) {
//!     let _ = b.init_randomness();
//!     let _ = b.init_randomness();
//! }
//! ```

use crate::config::types::{BootstrapConfig, Result, RunkError};
use crate::config::validator;
use crate::exec::fd_import::{import_stdio, DescriptorTable, SandboxFile, STDIO_FDS};
use crate::exec::process_state;
use crate::kernel::native::NativeAllocator;
use crate::kernel::{
    CalibratedClocks, CreateProcessArgs, Credentials, ExitStatus, FeatureSet, GuestKernel,
    InitKernelArgs, KernelAllocator, LimitSet, MemoryFile, ProcessHandle, RootNamespaces,
    Timekeeper, Vdso, DEFAULT_UMASK,
};
use crate::net::{build_network_stack, Clock, NetworkStack};
use crate::observability::audit::AuditLog;
use crate::platform::{select_platform, ExecutionPlatform, HostPlatformProvider, PlatformKind, PlatformProvider};
use crate::vfs::{
    create_mount_namespace, FilesystemRegistry, MountNamespace, ProcInfo, MAX_SYMLINK_TRAVERSALS,
};
use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Name of the memory file backing guest memory.
const MEMORY_FILE_NAME: &str = "runk-memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootstrapStage {
    Randomness,
    UsageAccounting,
    Platform,
    KernelAllocation,
    MemoryBacking,
    Vdso,
    Timekeeper,
    Network,
    KernelInit,
    Descriptors,
    MountNamespace,
    RootProcess,
    Foreground,
    Start,
    Wait,
}

impl BootstrapStage {
    pub const ALL: [BootstrapStage; 15] = [
        BootstrapStage::Randomness,
        BootstrapStage::UsageAccounting,
        BootstrapStage::Platform,
        BootstrapStage::KernelAllocation,
        BootstrapStage::MemoryBacking,
        BootstrapStage::Vdso,
        BootstrapStage::Timekeeper,
        BootstrapStage::Network,
        BootstrapStage::KernelInit,
        BootstrapStage::Descriptors,
        BootstrapStage::MountNamespace,
        BootstrapStage::RootProcess,
        BootstrapStage::Foreground,
        BootstrapStage::Start,
        BootstrapStage::Wait,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BootstrapStage::Randomness => "randomness",
            BootstrapStage::UsageAccounting => "usage_accounting",
            BootstrapStage::Platform => "platform",
            BootstrapStage::KernelAllocation => "kernel_allocation",
            BootstrapStage::MemoryBacking => "memory_backing",
            BootstrapStage::Vdso => "vdso",
            BootstrapStage::Timekeeper => "timekeeper",
            BootstrapStage::Network => "network",
            BootstrapStage::KernelInit => "kernel_init",
            BootstrapStage::Descriptors => "descriptors",
            BootstrapStage::MountNamespace => "mount_namespace",
            BootstrapStage::RootProcess => "root_process",
            BootstrapStage::Foreground => "foreground",
            BootstrapStage::Start => "start",
            BootstrapStage::Wait => "wait",
        }
    }
}

impl fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The first error of a bootstrap run and the stage it happened in.
#[derive(Debug, Error)]
#[error("bootstrap failed at stage {stage}: {cause}")]
pub struct BootstrapFailure {
    pub stage: BootstrapStage,
    #[source]
    pub cause: RunkError,
}

impl BootstrapFailure {
    pub fn new(stage: BootstrapStage, cause: RunkError) -> Self {
        Self { stage, cause }
    }
}

/// A run that reached the end of the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub run_id: String,
    pub platform: PlatformKind,
    pub exit_status: ExitStatus,
}

/// Host-facing collaborators used by the stages.
pub struct Collaborators {
    pub platforms: Box<dyn PlatformProvider>,
    pub kernels: Box<dyn KernelAllocator>,
    pub filesystems: FilesystemRegistry,
    /// Host descriptors imported as sandbox fds 0, 1 and 2
    pub stdio: Vec<RawFd>,
    /// Base for relative mount directories
    pub cwd: PathBuf,
}

impl Collaborators {
    /// Real host platforms, the bundled native kernel, the default
    /// filesystems and this process's stdio.
    pub fn host(config: &BootstrapConfig) -> Result<Self> {
        Ok(Self {
            platforms: Box::new(HostPlatformProvider),
            kernels: Box::new(NativeAllocator),
            filesystems: FilesystemRegistry::with_defaults(ProcInfo {
                hostname: config.hostname.clone(),
                boot_id: uuid::Uuid::new_v4().to_string(),
            }),
            stdio: STDIO_FDS.to_vec(),
            cwd: std::env::current_dir()?,
        })
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("filesystems", &self.filesystems)
            .field("stdio", &self.stdio)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// States
// ============================================================================

pub struct Uninitialized;

pub struct RandomnessReady;

pub struct UsageAccountingReady;

pub struct PlatformReady {
    platform: Box<dyn ExecutionPlatform>,
}

pub struct KernelAllocated {
    kernel: Box<dyn GuestKernel>,
}

pub struct MemoryBackingReady {
    kernel: Box<dyn GuestKernel>,
}

pub struct VdsoReady {
    kernel: Box<dyn GuestKernel>,
    vdso: Vdso,
}

pub struct TimekeeperReady {
    kernel: Box<dyn GuestKernel>,
    vdso: Vdso,
    timekeeper: Arc<Timekeeper>,
}

pub struct NetworkReady {
    kernel: Box<dyn GuestKernel>,
    vdso: Vdso,
    timekeeper: Arc<Timekeeper>,
    network: NetworkStack,
}

pub struct KernelInitialized {
    kernel: Box<dyn GuestKernel>,
}

pub struct DescriptorsImported {
    kernel: Box<dyn GuestKernel>,
    fd_table: DescriptorTable,
}

pub struct MountNamespaceReady {
    kernel: Box<dyn GuestKernel>,
    fd_table: DescriptorTable,
    namespace: Arc<MountNamespace>,
}

pub struct RootProcessCreated {
    kernel: Box<dyn GuestKernel>,
    terminal: Option<Arc<SandboxFile>>,
    process: ProcessHandle,
}

pub struct ForegroundAssigned {
    kernel: Box<dyn GuestKernel>,
    process: ProcessHandle,
}

pub struct Started {
    kernel: Box<dyn GuestKernel>,
    process: ProcessHandle,
}

/// A bootstrap run in state `S`.
pub struct Bootstrap<'a, S> {
    config: &'a BootstrapConfig,
    collaborators: &'a Collaborators,
    audit: AuditLog,
    state: S,
}

impl<'a, S> Bootstrap<'a, S> {
    fn advance<N>(self, state: N) -> Bootstrap<'a, N> {
        Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state,
        }
    }

    /// Audit the result of one stage and attach the stage to an error.
    fn record<T>(
        &self,
        stage: BootstrapStage,
        result: Result<T>,
        detail: impl FnOnce(&T) -> Option<String>,
    ) -> std::result::Result<T, BootstrapFailure> {
        match result {
            Ok(value) => {
                self.audit.completed(stage, detail(&value));
                Ok(value)
            }
            Err(cause) => {
                self.audit.failed(stage, &cause);
                Err(BootstrapFailure::new(stage, cause))
            }
        }
    }

    pub fn run_id(&self) -> &str {
        self.audit.run_id()
    }
}

type StageResult<'a, S> = std::result::Result<Bootstrap<'a, S>, BootstrapFailure>;

impl<'a> Bootstrap<'a, Uninitialized> {
    pub fn new(config: &'a BootstrapConfig, collaborators: &'a Collaborators) -> Self {
        Self {
            config,
            collaborators,
            audit: AuditLog::new(&config.container_id),
            state: Uninitialized,
        }
    }

    pub fn init_randomness(self) -> StageResult<'a, RandomnessReady> {
        let result = process_state::randomness().map(|_| ());
        self.record(BootstrapStage::Randomness, result, |_| None)?;
        Ok(self.advance(RandomnessReady))
    }
}

impl<'a> Bootstrap<'a, RandomnessReady> {
    pub fn init_usage_accounting(self) -> StageResult<'a, UsageAccountingReady> {
        let result = process_state::usage_accounting().map(|u| u.total_memory_bytes);
        self.record(BootstrapStage::UsageAccounting, result, |total| {
            Some(format!("{} bytes", total))
        })?;
        Ok(self.advance(UsageAccountingReady))
    }
}

impl<'a> Bootstrap<'a, UsageAccountingReady> {
    pub fn select_platform(self) -> StageResult<'a, PlatformReady> {
        let result = select_platform(
            self.config.platform,
            self.collaborators.platforms.as_ref(),
        );
        let platform = self.record(BootstrapStage::Platform, result, |p| Some(p.describe()))?;
        Ok(self.advance(PlatformReady { platform }))
    }
}

impl<'a> Bootstrap<'a, PlatformReady> {
    pub fn allocate_kernel(self) -> StageResult<'a, KernelAllocated> {
        let Bootstrap {
            config,
            collaborators,
            audit,
            state,
        } = self;
        let this = Bootstrap {
            config,
            collaborators,
            audit,
            state: (),
        };
        let result = collaborators.kernels.allocate_kernel(state.platform);
        let kernel = this.record(BootstrapStage::KernelAllocation, result, |_| None)?;
        Ok(this.advance(KernelAllocated { kernel }))
    }
}

impl<'a> Bootstrap<'a, KernelAllocated> {
    pub fn set_memory_backing(mut self) -> StageResult<'a, MemoryBackingReady> {
        let result = MemoryFile::create(MEMORY_FILE_NAME)
            .and_then(|file| self.state.kernel.set_memory_backing(file));
        self.record(BootstrapStage::MemoryBacking, result, |_| None)?;
        let KernelAllocated { kernel } = self.state;
        let next = MemoryBackingReady { kernel };
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: next,
        })
    }
}

impl<'a> Bootstrap<'a, MemoryBackingReady> {
    pub fn prepare_vdso(mut self) -> StageResult<'a, VdsoReady> {
        let result = self.state.kernel.prepare_vdso();
        let vdso = self.record(BootstrapStage::Vdso, result, |_| None)?;
        let MemoryBackingReady { kernel } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: VdsoReady { kernel, vdso },
        })
    }
}

impl<'a> Bootstrap<'a, VdsoReady> {
    pub fn create_timekeeper(mut self) -> StageResult<'a, TimekeeperReady> {
        let result = self.state.kernel.new_timekeeper(&self.state.vdso).map(|mut tk| {
            tk.set_clocks(CalibratedClocks::new());
            Arc::new(tk)
        });
        let timekeeper = self.record(BootstrapStage::Timekeeper, result, |_| None)?;
        let VdsoReady { kernel, vdso } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: TimekeeperReady {
                kernel,
                vdso,
                timekeeper,
            },
        })
    }
}

impl<'a> Bootstrap<'a, TimekeeperReady> {
    pub fn build_network(self) -> StageResult<'a, NetworkReady> {
        let clock: Arc<dyn Clock> = self.state.timekeeper.clone();
        let result = build_network_stack(self.config.network, clock, self.state.kernel.unique_ids());
        let network = self.record(BootstrapStage::Network, result, |n| {
            Some(n.mode().to_string())
        })?;
        let TimekeeperReady {
            kernel,
            vdso,
            timekeeper,
        } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: NetworkReady {
                kernel,
                vdso,
                timekeeper,
                network,
            },
        })
    }
}

impl<'a> Bootstrap<'a, NetworkReady> {
    pub fn initialize_kernel(self) -> StageResult<'a, KernelInitialized> {
        let Bootstrap {
            config,
            collaborators,
            audit,
            state,
        } = self;
        let NetworkReady {
            mut kernel,
            vdso,
            timekeeper,
            network,
        } = state;

        let core_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let args = InitKernelArgs {
            feature_set: FeatureSet::host(),
            timekeeper,
            namespaces: RootNamespaces::new(&config.hostname),
            network,
            core_count,
            vdso,
        };
        let result = kernel.initialize(args);

        let this = Bootstrap {
            config,
            collaborators,
            audit,
            state: KernelInitialized { kernel },
        };
        this.record(BootstrapStage::KernelInit, result, |_| {
            Some(format!("{} cores", core_count))
        })?;
        Ok(this)
    }
}

impl<'a> Bootstrap<'a, KernelInitialized> {
    pub fn import_descriptors(self) -> StageResult<'a, DescriptorsImported> {
        let result = import_stdio(self.config.tty, &self.collaborators.stdio);
        let fd_table = self.record(BootstrapStage::Descriptors, result, |t| {
            Some(format!("{} descriptors, tty={}", t.len(), t.terminal().is_some()))
        })?;
        let KernelInitialized { kernel } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: DescriptorsImported { kernel, fd_table },
        })
    }
}

impl<'a> Bootstrap<'a, DescriptorsImported> {
    pub fn create_mount_namespace(self) -> StageResult<'a, MountNamespaceReady> {
        let mut remaining = MAX_SYMLINK_TRAVERSALS;
        let result = create_mount_namespace(
            &self.collaborators.filesystems,
            &self.config.mounts,
            &self.collaborators.cwd,
            &mut remaining,
        )
        .map(Arc::new);
        let namespace = self.record(BootstrapStage::MountNamespace, result, |ns| {
            Some(format!("{} layers, mounts {:?}", self.config.mounts.len(), ns.mount_points()))
        })?;
        let DescriptorsImported { kernel, fd_table } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: MountNamespaceReady {
                kernel,
                fd_table,
                namespace,
            },
        })
    }
}

impl<'a> Bootstrap<'a, MountNamespaceReady> {
    pub fn create_root_process(self) -> StageResult<'a, RootProcessCreated> {
        let Bootstrap {
            config,
            collaborators,
            audit,
            state,
        } = self;
        let MountNamespaceReady {
            mut kernel,
            fd_table,
            namespace,
        } = state;

        let terminal = fd_table.terminal().cloned();
        let result = LimitSet::from_host().and_then(|limits| {
            kernel.create_process(CreateProcessArgs {
                argv: config.args.clone(),
                envv: config.env.clone(),
                working_directory: PathBuf::from("/"),
                credentials: Credentials::root(),
                umask: DEFAULT_UMASK,
                limits,
                max_symlink_traversals: MAX_SYMLINK_TRAVERSALS,
                fd_table,
                mount_namespace: namespace,
                container_id: config.container_id.clone(),
            })
        });

        let this = Bootstrap {
            config,
            collaborators,
            audit,
            state: (),
        };
        let process = this.record(BootstrapStage::RootProcess, result, |p| {
            Some(p.argv0.clone())
        })?;
        Ok(this.advance(RootProcessCreated {
            kernel,
            terminal,
            process,
        }))
    }
}

impl<'a> Bootstrap<'a, RootProcessCreated> {
    /// Give the init process group the terminal. A no-op outside terminal
    /// mode.
    pub fn assign_foreground(self) -> StageResult<'a, ForegroundAssigned> {
        let result = if self.config.tty {
            match (&self.state.terminal, self.state.kernel.global_init_process_group()) {
                (Some(file), Some(pgid)) => match file.terminal() {
                    Some(terminal) => {
                        terminal.init_foreground_process_group(pgid);
                        Ok(Some(format!("pgid {}", pgid)))
                    }
                    None => Err(RunkError::ProcessCreate(
                        "descriptor table has no terminal".to_string(),
                    )),
                },
                (None, _) => Err(RunkError::ProcessCreate(
                    "descriptor table has no terminal".to_string(),
                )),
                (_, None) => Err(RunkError::ProcessCreate(
                    "kernel has no init process group".to_string(),
                )),
            }
        } else {
            Ok(Some("not a terminal session".to_string()))
        };
        self.record(BootstrapStage::Foreground, result, |d| d.clone())?;

        let RootProcessCreated { kernel, process, .. } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: ForegroundAssigned { kernel, process },
        })
    }
}

impl<'a> Bootstrap<'a, ForegroundAssigned> {
    pub fn start(mut self) -> StageResult<'a, Started> {
        let result = self.state.kernel.start();
        self.record(BootstrapStage::Start, result, |_| None)?;
        let ForegroundAssigned { kernel, process } = self.state;
        Ok(Bootstrap {
            config: self.config,
            collaborators: self.collaborators,
            audit: self.audit,
            state: Started { kernel, process },
        })
    }
}

impl<'a> Bootstrap<'a, Started> {
    /// Block until nothing in the sandbox can run. This is the only
    /// blocking call of the sequence and has no timeout.
    pub fn wait(mut self) -> std::result::Result<BootstrapOutcome, BootstrapFailure> {
        log::info!("Waiting for {} (tid {})", self.state.process.argv0, self.state.process.tid);
        let result = self.state.kernel.wait_for_no_runnable_processes();
        let exit_status = self.record(BootstrapStage::Wait, result, |s| Some(s.to_string()))?;

        Ok(BootstrapOutcome {
            run_id: self.audit.run_id().to_string(),
            platform: self.state.kernel.platform().kind(),
            exit_status,
        })
    }
}

/// Validate `config` and drive every stage in order, stopping at the first
/// failure.
pub fn run(
    config: &BootstrapConfig,
    collaborators: &Collaborators,
) -> std::result::Result<BootstrapOutcome, BootstrapFailure> {
    validator::validate(config)?;

    let started = Bootstrap::new(config, collaborators)
        .init_randomness()?
        .init_usage_accounting()?
        .select_platform()?
        .allocate_kernel()?
        .set_memory_backing()?
        .prepare_vdso()?
        .create_timekeeper()?
        .build_network()?
        .initialize_kernel()?
        .import_descriptors()?
        .create_mount_namespace()?
        .create_root_process()?
        .assign_foreground()?
        .start()?;

    log::info!("Sandbox {} started (run {})", config.container_id, started.run_id());
    started.wait()
}
