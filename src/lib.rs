//! runk: bootstraps a single sandboxed process on a guest kernel runtime
//!
//! # Architecture
//!
//! ## Execution Platforms ([`platform`])
//! - [`platform::kvm`]: hardware-virtualization backend (`/dev/kvm`)
//! - [`platform::ptrace`]: trap-based backend
//! - [`platform::select_platform`]: detect, prefer acceleration, fall back
//!
//! ## Network ([`net`])
//! - [`net::hostinet`]: host pass-through stack
//! - [`net::netstack`]: emulated TCP/IP stack configuration
//!
//! ## Filesystem ([`vfs`])
//! - [`vfs::node`]: host-backed, in-memory and overlay nodes
//! - [`vfs::filesystem`]: `hostfs`, `tmpfs` and `proc` filesystem types
//! - [`vfs::namespace`]: mount namespace with bounded symlink resolution
//! - [`vfs::root`]: root filesystem assembly
//!
//! ## Guest Kernel ([`kernel`])
//! - [`kernel::GuestKernel`]: the interface the bootstrap drives
//! - [`kernel::native`]: bundled kernel running the root process on the host
//!
//! ## Execution Control ([`exec`])
//! - [`exec::process_state`]: one-time process-wide initialisation
//! - [`exec::fd_import`]: stdio import with shared-terminal semantics
//! - [`exec::bootstrap`]: type-state enforced bootstrap sequence
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: structured per-stage audit events
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: configuration and error types
//! - [`config::loader`]: JSON configuration files
//! - [`config::validator`]: pre-flight validation

pub mod config;
pub mod exec;
pub mod kernel;
pub mod net;
pub mod observability;
pub mod platform;
pub mod vfs;

// CLI entrypoint wiring for the runk binary.
pub mod cli;

pub use config::types::*;
