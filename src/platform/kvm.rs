/// Accelerated execution backend (hardware virtualization via /dev/kvm)
use crate::config::types::{Result, RunkError};
use crate::platform::{ExecutionPlatform, PlatformKind};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

pub const KVM_DEVICE: &str = "/dev/kvm";

/// The only stable KVM API version.
pub const KVM_API_VERSION: i32 = 12;

const KVMIO: u8 = 0xAE;

nix::ioctl_none!(kvm_get_api_version, KVMIO, 0x00);

/// Open the KVM device read-write, or `None` if the host does not expose it.
pub fn open_device() -> Option<File> {
    match OpenOptions::new().read(true).write(true).open(KVM_DEVICE) {
        Ok(f) => Some(f),
        Err(e) => {
            log::debug!("Cannot open {}: {}", KVM_DEVICE, e);
            None
        }
    }
}

#[derive(Debug)]
pub struct KvmPlatform {
    device: File,
    api_version: i32,
}

impl KvmPlatform {
    /// Take ownership of an open KVM device and verify its API version.
    pub fn new(device: File) -> Result<Self> {
        // SAFETY: KVM_GET_API_VERSION takes no argument and only reads the fd.
        let api_version = unsafe { kvm_get_api_version(device.as_raw_fd()) }.map_err(|e| {
            RunkError::PlatformUnavailable(format!("KVM_GET_API_VERSION failed: {}", e))
        })?;

        if api_version != KVM_API_VERSION {
            return Err(RunkError::PlatformUnavailable(format!(
                "unsupported KVM API version {} (expected {})",
                api_version, KVM_API_VERSION
            )));
        }

        log::debug!("KVM device ready, api_version={}", api_version);
        Ok(Self {
            device,
            api_version,
        })
    }

    pub fn api_version(&self) -> i32 {
        self.api_version
    }

    pub fn device(&self) -> &File {
        &self.device
    }
}

impl ExecutionPlatform for KvmPlatform {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Kvm
    }

    fn describe(&self) -> String {
        format!("kvm (api {}, fd {})", self.api_version, self.device.as_raw_fd())
    }
}
