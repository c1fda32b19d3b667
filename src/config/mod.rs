//! Configuration
//!
//! Bootstrap input, file loading, and pre-flight validation.

pub mod loader;
pub mod types;
pub mod validator;
