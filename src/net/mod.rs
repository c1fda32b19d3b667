//! Network stack construction
//!
//! Builds either a host pass-through stack or a self-contained emulated
//! TCP/IP stack for the guest kernel.

pub mod hostinet;
pub mod netstack;

use crate::config::types::{NetworkMode, Result};
use std::sync::Arc;

pub use hostinet::HostStack;
pub use netstack::{EmulatedStack, NetworkProtocol, TransportProtocol};

/// Time source for protocol timers.
pub trait Clock: Send + Sync {
    /// Wall-clock time in nanoseconds since the Unix epoch.
    fn now_nanoseconds(&self) -> i64;
    /// Monotonic time in nanoseconds since an arbitrary origin.
    fn now_monotonic(&self) -> i64;
}

/// Source of stack-wide unique identifiers (e.g. IP fragment ids).
pub trait UniqueIdSource: Send + Sync {
    fn unique_id(&self) -> u64;
}

/// Network stack handed to the guest kernel.
pub enum NetworkStack {
    Host(HostStack),
    Emulated(EmulatedStack),
}

impl NetworkStack {
    pub fn mode(&self) -> NetworkMode {
        match self {
            NetworkStack::Host(_) => NetworkMode::Host,
            NetworkStack::Emulated(_) => NetworkMode::None,
        }
    }
}

impl std::fmt::Debug for NetworkStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkStack::Host(s) => f.debug_tuple("Host").field(s).finish(),
            NetworkStack::Emulated(s) => f.debug_tuple("Emulated").field(s).finish(),
        }
    }
}

/// Build the network stack for `mode`.
///
/// Host mode is configured by the host already; only an interface snapshot is
/// taken. The emulated stack must accept every protocol option or the whole
/// build fails.
pub fn build_network_stack(
    mode: NetworkMode,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UniqueIdSource>,
) -> Result<NetworkStack> {
    match mode {
        NetworkMode::Host => {
            let mut stack = HostStack::new();
            stack.configure()?;
            log::info!(
                "Using host network stack ({} interfaces)",
                stack.interfaces().len()
            );
            Ok(NetworkStack::Host(stack))
        }
        NetworkMode::None => {
            let stack = netstack::build_emulated_stack(clock, ids)?;
            log::info!("Using emulated network stack");
            Ok(NetworkStack::Emulated(stack))
        }
    }
}
