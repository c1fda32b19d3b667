//! Execution platform selection
//!
//! Abstraction over the accelerated (KVM) and trap-based (ptrace) execution
//! backends with automatic selection: accelerated preferred when the host
//! exposes it, trap-based fallback otherwise.

pub mod kvm;
pub mod ptrace;

use crate::config::types::{PlatformPreference, Result, RunkError};
use std::fmt;
use std::fs::File;

/// An instantiated execution backend. Exactly one exists per bootstrap and
/// it is owned by the guest kernel for the kernel's lifetime.
pub trait ExecutionPlatform: Send + Sync + fmt::Debug {
    fn kind(&self) -> PlatformKind;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    Kvm,
    Ptrace,
}

impl PlatformKind {
    pub fn name(self) -> &'static str {
        match self {
            PlatformKind::Kvm => "kvm",
            PlatformKind::Ptrace => "ptrace",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host-side collaborator that knows how to find and build backends.
pub trait PlatformProvider {
    /// Open the accelerated backend's host resource, if the host has one.
    fn detect_accelerated_available(&self) -> Option<File>;

    /// Build a backend. `handle` is the host resource returned by the detection
    /// and is only meaningful for [`PlatformKind::Kvm`]; its ownership moves
    /// into the returned platform.
    fn instantiate(
        &self,
        kind: PlatformKind,
        handle: Option<File>,
    ) -> Result<Box<dyn ExecutionPlatform>>;
}

/// Outcome of the two-step platform decision.
#[derive(Debug)]
pub enum PlatformDecision {
    Accelerated(Box<dyn ExecutionPlatform>),
    TrapBased(Box<dyn ExecutionPlatform>),
    Unavailable(String),
}

impl PlatformDecision {
    pub fn into_platform(self) -> Result<Box<dyn ExecutionPlatform>> {
        match self {
            PlatformDecision::Accelerated(p) | PlatformDecision::TrapBased(p) => Ok(p),
            PlatformDecision::Unavailable(reason) => Err(RunkError::PlatformUnavailable(reason)),
        }
    }
}

/// Decide which backend to run on.
///
/// An explicit preference is attempted exactly once. `Auto` instantiates the
/// accelerated backend only when detection finds its host resource and falls
/// back to the trap-based backend on absence or instantiation failure. There
/// is no fallback after the trap-based backend.
pub fn decide_platform(
    preference: PlatformPreference,
    provider: &dyn PlatformProvider,
) -> PlatformDecision {
    match preference {
        PlatformPreference::Kvm => {
            let Some(handle) = provider.detect_accelerated_available() else {
                return PlatformDecision::Unavailable(format!(
                    "{} requested but {} is not available",
                    PlatformKind::Kvm,
                    kvm::KVM_DEVICE
                ));
            };
            match provider.instantiate(PlatformKind::Kvm, Some(handle)) {
                Ok(p) => PlatformDecision::Accelerated(p),
                Err(e) => PlatformDecision::Unavailable(format!("{}: {}", PlatformKind::Kvm, e)),
            }
        }
        PlatformPreference::Ptrace => trap_based(provider),
        PlatformPreference::Auto => {
            match provider.detect_accelerated_available() {
                Some(handle) => match provider.instantiate(PlatformKind::Kvm, Some(handle)) {
                    Ok(p) => {
                        log::info!("Using kvm platform (accelerated)");
                        return PlatformDecision::Accelerated(p);
                    }
                    Err(e) => {
                        log::warn!("kvm platform unavailable, falling back to ptrace: {}", e);
                    }
                },
                None => {
                    log::info!("{} not present, using ptrace platform", kvm::KVM_DEVICE);
                }
            }
            trap_based(provider)
        }
    }
}

fn trap_based(provider: &dyn PlatformProvider) -> PlatformDecision {
    match provider.instantiate(PlatformKind::Ptrace, None) {
        Ok(p) => PlatformDecision::TrapBased(p),
        Err(e) => PlatformDecision::Unavailable(format!("{}: {}", PlatformKind::Ptrace, e)),
    }
}

/// Select and instantiate the execution platform.
pub fn select_platform(
    preference: PlatformPreference,
    provider: &dyn PlatformProvider,
) -> Result<Box<dyn ExecutionPlatform>> {
    log::debug!("Platform selection: preference={}", preference);
    decide_platform(preference, provider).into_platform()
}

/// Production provider backed by the host kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatformProvider;

impl PlatformProvider for HostPlatformProvider {
    fn detect_accelerated_available(&self) -> Option<File> {
        kvm::open_device()
    }

    fn instantiate(
        &self,
        kind: PlatformKind,
        handle: Option<File>,
    ) -> Result<Box<dyn ExecutionPlatform>> {
        match kind {
            PlatformKind::Kvm => {
                let device = match handle {
                    Some(device) => device,
                    None => kvm::open_device().ok_or_else(|| {
                        RunkError::PlatformUnavailable(format!(
                            "cannot open {}",
                            kvm::KVM_DEVICE
                        ))
                    })?,
                };
                Ok(Box::new(kvm::KvmPlatform::new(device)?))
            }
            PlatformKind::Ptrace => Ok(Box::new(ptrace::PtracePlatform::new()?)),
        }
    }
}
