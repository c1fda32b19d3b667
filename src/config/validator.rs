//! Pre-flight validation of a bootstrap configuration.
//!
//! Runs before any platform, kernel or network resource is acquired so that
//! configuration mistakes never leave half-built state behind. Each problem
//! is attributed to the stage that would otherwise have hit it.

use crate::config::types::{BootstrapConfig, RunkError};
use crate::exec::bootstrap::{BootstrapFailure, BootstrapStage};
use crate::vfs::root::host_mount_data;

pub fn validate(config: &BootstrapConfig) -> std::result::Result<(), BootstrapFailure> {
    if config.mounts.is_empty() {
        return Err(BootstrapFailure::new(
            BootstrapStage::MountNamespace,
            RunkError::NoRootDirectories,
        ));
    }

    for dir in &config.mounts {
        host_mount_data(dir).map_err(|e| BootstrapFailure::new(BootstrapStage::MountNamespace, e))?;
    }

    if config.args.is_empty() {
        return Err(BootstrapFailure::new(
            BootstrapStage::RootProcess,
            RunkError::ProcessCreate("empty argument vector".to_string()),
        ));
    }

    for entry in &config.env {
        validate_env_entry(entry).map_err(|e| BootstrapFailure::new(BootstrapStage::RootProcess, e))?;
    }

    if config.hostname.is_empty() || config.hostname.len() > 64 {
        return Err(BootstrapFailure::new(
            BootstrapStage::KernelInit,
            RunkError::Config(format!(
                "hostname must be 1..=64 bytes, got {}",
                config.hostname.len()
            )),
        ));
    }

    Ok(())
}

fn validate_env_entry(entry: &str) -> crate::config::types::Result<()> {
    match entry.split_once('=') {
        Some((key, _)) if !key.is_empty() && !entry.contains('\0') => Ok(()),
        _ => Err(RunkError::Config(format!(
            "environment entry must be KEY=VALUE: {:?}",
            entry
        ))),
    }
}
