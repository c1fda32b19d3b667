//! Execution control
//!
//! Drives the guest kernel from an empty process to a running sandbox with
//! type-state enforced stage ordering.

pub mod bootstrap;
pub mod fd_import;
pub mod process_state;

pub use bootstrap::{run, BootstrapFailure, BootstrapOutcome, BootstrapStage, Collaborators};
