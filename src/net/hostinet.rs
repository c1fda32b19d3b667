/// Host pass-through network stack
use crate::config::types::{Result, RunkError};
use nix::ifaddrs::getifaddrs;
use std::collections::BTreeSet;

/// Sockets created by the sandbox map directly onto host sockets. The host
/// owns protocol configuration; this only records what it exposes.
#[derive(Debug, Default)]
pub struct HostStack {
    interfaces: BTreeSet<String>,
    configured: bool,
}

impl HostStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the host's network interfaces.
    pub fn configure(&mut self) -> Result<()> {
        let addrs = getifaddrs().map_err(|e| {
            RunkError::NetworkConfig(format!("failed to enumerate host interfaces: {}", e))
        })?;

        self.interfaces = addrs.map(|ifa| ifa.interface_name).collect();
        self.configured = true;
        log::debug!("Host interfaces: {:?}", self.interfaces);
        Ok(())
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }
}
