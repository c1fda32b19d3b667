//! Bundled guest kernel that runs the root process as a host child.
//!
//! The executable is resolved through the sandbox mount namespace to the
//! host file backing it. The child runs in its own process group with the
//! imported descriptors as stdio, a cleared environment, the configured
//! umask and the snapshotted resource limits.
//!
//! When sandbox stdin is this process's controlling terminal and this
//! process holds its foreground, the child takes the terminal before it
//! execs and the terminal is handed back once the child has been reaped.

use crate::config::types::{Result, RunkError};
use crate::exec::fd_import::{DescriptorTable, STDIO_FDS};
use crate::kernel::{
    CreateProcessArgs, ExitStatus, GuestKernel, InitKernelArgs, KernelAllocator, LimitSet,
    MemoryFile, ProcessGroupId, ProcessHandle, Timekeeper, Vdso,
};
use crate::net::UniqueIdSource;
use crate::platform::ExecutionPlatform;
use crate::vfs::{EntryKind, MountNamespace, MAX_SYMLINK_TRAVERSALS};
use nix::sys::resource::setrlimit;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{getpgrp, getpid, isatty, tcgetpgrp, tcsetpgrp, Pid};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const VDSO_PARAM_PAGE: u64 = 4096;
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Process group and thread id of the init process inside the sandbox.
const INIT_PID: i32 = 1;

#[derive(Debug, Default)]
pub struct NativeAllocator;

impl KernelAllocator for NativeAllocator {
    fn allocate_kernel(
        &self,
        platform: Box<dyn ExecutionPlatform>,
    ) -> Result<Box<dyn GuestKernel>> {
        log::debug!("Allocating native kernel on {}", platform.describe());
        Ok(Box::new(NativeKernel::new(platform)))
    }
}

#[derive(Debug, Default)]
struct KernelIds(AtomicU64);

impl UniqueIdSource for KernelIds {
    fn unique_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Allocated,
    MemoryBacked,
    Initialized,
    ProcessCreated,
    Started,
    Exited,
}

/// Root process ready to spawn.
struct PreparedProcess {
    executable: PathBuf,
    argv: Vec<String>,
    envv: Vec<(String, String)>,
    host_cwd: Option<PathBuf>,
    umask: u32,
    limits: LimitSet,
    fd_table: DescriptorTable,
}

pub struct NativeKernel {
    platform: Box<dyn ExecutionPlatform>,
    phase: Phase,
    memory: Option<MemoryFile>,
    init: Option<InitKernelArgs>,
    prepared: Option<PreparedProcess>,
    child: Option<Child>,
    terminal: Option<TerminalHandoff>,
    ids: Arc<KernelIds>,
}

/// Host terminal lent to the root process.
struct TerminalHandoff {
    tty: OwnedFd,
    /// Foreground group to restore
    previous: Pid,
    /// SIGTTOU disposition to restore
    ttou: SigHandler,
}

impl TerminalHandoff {
    fn reclaim(self) {
        if let Err(e) = tcsetpgrp(&self.tty, self.previous) {
            log::warn!("Failed to take back terminal foreground: {}", e);
        }
        // SAFETY: restores the disposition saved before the handoff.
        if let Err(e) = unsafe { signal(Signal::SIGTTOU, self.ttou) } {
            log::warn!("Failed to restore SIGTTOU handler: {}", e);
        }
    }
}

impl NativeKernel {
    pub fn new(platform: Box<dyn ExecutionPlatform>) -> Self {
        Self {
            platform,
            phase: Phase::Allocated,
            memory: None,
            init: None,
            prepared: None,
            child: None,
            terminal: None,
            ids: Arc::new(KernelIds::default()),
        }
    }

    fn require(&self, at_least: Phase, what: &str) -> Result<()> {
        if self.phase < at_least {
            return Err(RunkError::KernelInit(format!(
                "{} called before {:?} (kernel is {:?})",
                what, at_least, self.phase
            )));
        }
        Ok(())
    }

    pub fn timekeeper(&self) -> Option<&Arc<Timekeeper>> {
        self.init.as_ref().map(|init| &init.timekeeper)
    }
}

fn parse_env(envv: &[String]) -> Result<Vec<(String, String)>> {
    envv.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| RunkError::ProcessCreate(format!("malformed env entry {:?}", entry)))
        })
        .collect()
}

/// Resolve `argv0` inside the namespace: paths with a slash are taken as
/// is (relative to `cwd`), bare names are searched in `PATH`.
fn resolve_executable(
    ns: &MountNamespace,
    argv0: &str,
    cwd: &Path,
    path_var: &str,
    max_traversals: u32,
) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = if argv0.contains('/') {
        vec![cwd.join(argv0)]
    } else {
        path_var
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(argv0))
            .collect()
    };

    for candidate in &candidates {
        let mut remaining = max_traversals;
        match ns.find_inode(candidate, &mut remaining) {
            Ok(location) if location.kind == EntryKind::File => {
                return ns.host_path(&location.path)?.ok_or_else(|| {
                    RunkError::ProcessCreate(format!(
                        "{} is not backed by a host file",
                        location.path.display()
                    ))
                });
            }
            Ok(_) | Err(RunkError::NotFound(_)) | Err(RunkError::NotADirectory(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(RunkError::ProcessCreate(format!(
        "executable {:?} not found in sandbox",
        argv0
    )))
}

/// The terminal behind sandbox stdin, if it is this process's controlling
/// terminal and this process is in its foreground group. A shared terminal
/// object must also have been given to the init process group.
fn foreground_terminal(table: &DescriptorTable) -> Option<(OwnedFd, Pid)> {
    let stdin = table.get(STDIO_FDS[0])?;
    if let Some(terminal) = stdin.terminal() {
        if terminal.foreground_process_group() != Some(ProcessGroupId(INIT_PID)) {
            return None;
        }
    }
    let tty = stdin.try_clone_fd().ok()?;
    if !isatty(tty.as_raw_fd()).unwrap_or(false) {
        return None;
    }
    let foreground = tcgetpgrp(&tty).ok()?;
    (foreground == getpgrp()).then_some((tty, foreground))
}

fn stdio_for(table: &DescriptorTable, fd: i32) -> Result<Stdio> {
    match table.get(fd) {
        Some(file) => {
            let owned = file.try_clone_fd().map_err(|e| {
                RunkError::ProcessCreate(format!("cannot duplicate sandbox fd {}: {}", fd, e))
            })?;
            Ok(Stdio::from(owned))
        }
        None => Ok(Stdio::null()),
    }
}

impl GuestKernel for NativeKernel {
    fn platform(&self) -> &dyn ExecutionPlatform {
        self.platform.as_ref()
    }

    fn set_memory_backing(&mut self, file: MemoryFile) -> Result<()> {
        if self.memory.is_some() {
            return Err(RunkError::KernelInit("memory backing already set".to_string()));
        }
        self.memory = Some(file);
        self.phase = Phase::MemoryBacked;
        Ok(())
    }

    fn prepare_vdso(&mut self) -> Result<Vdso> {
        self.require(Phase::MemoryBacked, "prepare_vdso")?;
        let memory = self
            .memory
            .as_mut()
            .ok_or_else(|| RunkError::KernelInit("no memory backing".to_string()))?;
        let offset = memory.allocate(VDSO_PARAM_PAGE)?;
        Ok(Vdso {
            param_page_offset: offset,
            param_page_len: VDSO_PARAM_PAGE,
        })
    }

    fn new_timekeeper(&mut self, vdso: &Vdso) -> Result<Timekeeper> {
        self.require(Phase::MemoryBacked, "new_timekeeper")?;
        Ok(Timekeeper::new(*vdso))
    }

    fn unique_ids(&self) -> Arc<dyn UniqueIdSource> {
        self.ids.clone()
    }

    fn initialize(&mut self, args: InitKernelArgs) -> Result<()> {
        self.require(Phase::MemoryBacked, "initialize")?;
        if self.phase >= Phase::Initialized {
            return Err(RunkError::KernelInit("kernel already initialised".to_string()));
        }
        if !args.timekeeper.has_clocks() {
            return Err(RunkError::KernelInit("timekeeper has no clocks".to_string()));
        }
        if args.core_count == 0 {
            return Err(RunkError::KernelInit("core count must be positive".to_string()));
        }

        log::info!(
            "Kernel initialised: platform={}, cores={}, hostname={}, network={}",
            self.platform.describe(),
            args.core_count,
            args.namespaces.hostname,
            args.network.mode()
        );
        self.init = Some(args);
        self.phase = Phase::Initialized;
        Ok(())
    }

    fn create_process(&mut self, args: CreateProcessArgs) -> Result<ProcessHandle> {
        if self.phase < Phase::Initialized {
            return Err(RunkError::ProcessCreate("kernel not initialised".to_string()));
        }
        if self.phase > Phase::Initialized {
            return Err(RunkError::ProcessCreate("root process already exists".to_string()));
        }
        let argv0 = args
            .argv
            .first()
            .cloned()
            .ok_or_else(|| RunkError::ProcessCreate("empty argument vector".to_string()))?;

        let envv = parse_env(&args.envv)?;
        let path_var = envv
            .iter()
            .find(|(k, _)| k == "PATH")
            .map_or(DEFAULT_PATH, |(_, v)| v.as_str());

        let max = args.max_symlink_traversals.min(MAX_SYMLINK_TRAVERSALS);
        let executable = resolve_executable(
            &args.mount_namespace,
            &argv0,
            &args.working_directory,
            path_var,
            max,
        )?;
        let host_cwd = args
            .mount_namespace
            .host_path(&args.working_directory)
            .map_err(|e| RunkError::ProcessCreate(format!("working directory: {}", e)))?;

        log::info!(
            "Root process for container {}: {} -> {}",
            args.container_id,
            argv0,
            executable.display()
        );

        self.prepared = Some(PreparedProcess {
            executable,
            argv: args.argv,
            envv,
            host_cwd,
            umask: args.umask,
            limits: args.limits,
            fd_table: args.fd_table,
        });
        self.phase = Phase::ProcessCreated;

        Ok(ProcessHandle {
            tid: INIT_PID,
            argv0,
        })
    }

    fn global_init_process_group(&self) -> Option<ProcessGroupId> {
        (self.phase >= Phase::ProcessCreated).then_some(ProcessGroupId(INIT_PID))
    }

    fn start(&mut self) -> Result<()> {
        self.require(Phase::ProcessCreated, "start")?;
        let prepared = self
            .prepared
            .take()
            .ok_or_else(|| RunkError::KernelInit("kernel already started".to_string()))?;

        let mut cmd = Command::new(&prepared.executable);
        if let Some(arg0) = prepared.argv.first() {
            cmd.arg0(arg0);
        }
        cmd.args(prepared.argv.iter().skip(1))
            .env_clear()
            .envs(prepared.envv.iter().map(|(k, v)| (k, v)))
            .stdin(stdio_for(&prepared.fd_table, STDIO_FDS[0])?)
            .stdout(stdio_for(&prepared.fd_table, STDIO_FDS[1])?)
            .stderr(stdio_for(&prepared.fd_table, STDIO_FDS[2])?)
            .process_group(0);
        if let Some(cwd) = &prepared.host_cwd {
            cmd.current_dir(cwd);
        }

        let handoff = match foreground_terminal(&prepared.fd_table) {
            Some((tty, previous)) => {
                // SAFETY: SIG_IGN installs no handler code. This process
                // leaves the foreground while the child runs.
                let ttou = unsafe { signal(Signal::SIGTTOU, SigHandler::SigIgn) }?;
                Some(TerminalHandoff { tty, previous, ttou })
            }
            None => None,
        };
        let take_terminal = handoff.is_some();

        let mask = Mode::from_bits_truncate(prepared.umask as libc::mode_t);
        let limits = prepared.limits.clone();
        // SAFETY: the hook only calls umask, setrlimit, getpid, tcsetpgrp and
        // sigaction, which are async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || {
                let _ = umask(mask);
                for limit in limits.iter() {
                    setrlimit(limit.resource, limit.soft, limit.hard)
                        .map_err(std::io::Error::from)?;
                }
                if take_terminal {
                    // Still a background group here, so SIGTTOU must stay
                    // ignored until the terminal is ours.
                    let stdin = BorrowedFd::borrow_raw(libc::STDIN_FILENO);
                    tcsetpgrp(stdin, getpid())?;
                    signal(Signal::SIGTTOU, SigHandler::SigDfl)?;
                }
                Ok(())
            });
        }

        let spawned = cmd.spawn();
        // The pre_exec hook may have taken the terminal before exec failed.
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                if let Some(handoff) = handoff {
                    handoff.reclaim();
                }
                return Err(RunkError::KernelInit(format!(
                    "failed to start {}: {}",
                    prepared.executable.display(),
                    e
                )));
            }
        };
        if take_terminal {
            log::info!(
                "Terminal foreground: host pgid {} (sandbox pgid {})",
                child.id(),
                INIT_PID
            );
        }
        log::debug!("Root process running as host pid {}", child.id());

        self.terminal = handoff;
        self.child = Some(child);
        self.phase = Phase::Started;
        Ok(())
    }

    fn wait_for_no_runnable_processes(&mut self) -> Result<ExitStatus> {
        self.require(Phase::Started, "wait")?;
        let mut child = self
            .child
            .take()
            .ok_or_else(|| RunkError::KernelInit("no running root process".to_string()))?;

        let status = child.wait();
        if let Some(handoff) = self.terminal.take() {
            handoff.reclaim();
        }
        let status = status?;
        self.phase = Phase::Exited;

        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(ExitStatus::Exited(code)),
            (None, Some(signo)) => Ok(ExitStatus::Signaled(signo)),
            (None, None) => Err(RunkError::KernelInit(format!(
                "unrecognised wait status {:?}",
                status
            ))),
        }
    }
}

impl Drop for NativeKernel {
    fn drop(&mut self) {
        if let Some(handoff) = self.terminal.take() {
            handoff.reclaim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fd_import::import_stdio;
    use crate::platform::PlatformKind;
    use crate::vfs::{MemDir, OverlayNode};

    #[derive(Debug)]
    struct TestPlatform;

    impl ExecutionPlatform for TestPlatform {
        fn kind(&self) -> PlatformKind {
            PlatformKind::Ptrace
        }

        fn describe(&self) -> String {
            "test".to_string()
        }
    }

    fn kernel() -> NativeKernel {
        NativeKernel::new(Box::new(TestPlatform))
    }

    #[test]
    fn test_vdso_requires_memory_backing() {
        let mut k = kernel();
        assert!(k.prepare_vdso().is_err());

        k.set_memory_backing(MemoryFile::create("runk-test").unwrap())
            .unwrap();
        let vdso = k.prepare_vdso().unwrap();
        assert_eq!(vdso.param_page_len, VDSO_PARAM_PAGE);
        assert!(k.new_timekeeper(&vdso).is_ok());
    }

    #[test]
    fn test_start_requires_process() {
        let mut k = kernel();
        assert!(k.start().is_err());
        assert!(k.global_init_process_group().is_none());
        assert!(k.wait_for_no_runnable_processes().is_err());
    }

    #[test]
    fn test_unique_ids_increase() {
        let k = kernel();
        let ids = k.unique_ids();
        let a = ids.unique_id();
        assert!(ids.unique_id() > a);
    }

    #[test]
    fn test_terminal_handoff_needs_controlling_terminal() {
        let files: Vec<std::fs::File> = (0..3).map(|_| tempfile::tempfile().unwrap()).collect();
        let raw: Vec<i32> = files.iter().map(|f| f.as_raw_fd()).collect();
        let table = import_stdio(false, &raw).unwrap();
        assert!(foreground_terminal(&table).is_none());

        // A fresh pty is a terminal, but not this process's controlling one.
        let pty = nix::pty::openpty(None, None).unwrap();
        let slave = pty.slave.as_raw_fd();
        let table = import_stdio(true, &[slave, slave, slave]).unwrap();
        assert!(foreground_terminal(&table).is_none());

        table
            .terminal()
            .and_then(|file| file.terminal())
            .unwrap()
            .init_foreground_process_group(ProcessGroupId(INIT_PID));
        assert!(foreground_terminal(&table).is_none());
    }

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(env[1], ("B".to_string(), "x=y".to_string()));
        assert!(parse_env(&["NOEQUALS".to_string()]).is_err());
        assert!(parse_env(&["=v".to_string()]).is_err());
    }

    #[test]
    fn test_resolve_executable_needs_host_file() {
        let tree = MemDir::with_directories(["bin"]).unwrap();
        tree.write_file(Path::new("bin/tool"), b"#!/bin/sh\n").unwrap();
        let ns = MountNamespace::new(OverlayNode::synthetic(tree));

        let err = resolve_executable(&ns, "tool", Path::new("/"), "/bin", 40).unwrap_err();
        assert!(matches!(err, RunkError::ProcessCreate(_)));
        let err = resolve_executable(&ns, "missing", Path::new("/"), "/bin", 40).unwrap_err();
        assert!(matches!(err, RunkError::ProcessCreate(_)));
    }

    #[test]
    fn test_resolve_executable_in_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/tool"), "#!/bin/sh\n").unwrap();
        let ns = MountNamespace::new(OverlayNode::host(dir.path().to_path_buf()));

        assert_eq!(
            resolve_executable(&ns, "tool", Path::new("/"), "/sbin:/bin", 40).unwrap(),
            dir.path().join("bin/tool")
        );
        assert_eq!(
            resolve_executable(&ns, "./bin/tool", Path::new("/"), "", 40).unwrap(),
            dir.path().join("bin/tool")
        );
    }
}
