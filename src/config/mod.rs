//! Configuration
//!
//! Config file structure, loading with environment overrides, and startup
//! validation.

pub mod loader;
pub mod types;
pub mod validator;
