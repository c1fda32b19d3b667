/// Trap-based execution backend (syscall interception via ptrace)
use crate::config::types::{Result, RunkError};
use crate::platform::{ExecutionPlatform, PlatformKind};
use std::path::Path;

pub const YAMA_PTRACE_SCOPE: &str = "/proc/sys/kernel/yama/ptrace_scope";

/// Yama scope at which ptrace is disabled for everyone.
const PTRACE_SCOPE_DISABLED: u32 = 3;

#[derive(Debug)]
pub struct PtracePlatform {
    ptrace_scope: Option<u32>,
}

impl PtracePlatform {
    pub fn new() -> Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(RunkError::PlatformUnavailable(
                "ptrace platform requires Linux".to_string(),
            ));
        }

        let ptrace_scope = read_ptrace_scope(Path::new(YAMA_PTRACE_SCOPE))?;
        if ptrace_scope == Some(PTRACE_SCOPE_DISABLED) {
            return Err(RunkError::PlatformUnavailable(format!(
                "ptrace disabled by {} = {}",
                YAMA_PTRACE_SCOPE, PTRACE_SCOPE_DISABLED
            )));
        }

        log::debug!("ptrace platform ready, yama scope={:?}", ptrace_scope);
        Ok(Self { ptrace_scope })
    }

    pub fn ptrace_scope(&self) -> Option<u32> {
        self.ptrace_scope
    }
}

/// Missing file means Yama is not built in.
fn read_ptrace_scope(path: &Path) -> Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => content.trim().parse::<u32>().map(Some).map_err(|e| {
            RunkError::PlatformUnavailable(format!(
                "cannot parse {}: {}",
                path.display(),
                e
            ))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RunkError::PlatformUnavailable(format!(
            "cannot read {}: {}",
            path.display(),
            e
        ))),
    }
}

impl ExecutionPlatform for PtracePlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Ptrace
    }

    fn describe(&self) -> String {
        match self.ptrace_scope {
            Some(scope) => format!("ptrace (yama scope {})", scope),
            None => "ptrace".to_string(),
        }
    }
}
