//! Observability
//!
//! Structured audit events for bootstrap runs.

pub mod audit;
