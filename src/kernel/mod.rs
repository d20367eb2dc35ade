//! Kernel primitives
//!
//! Thin wrappers over the process and signal syscalls the supervisor relies
//! on, plus `/proc` inspection.

pub mod process;
pub mod procfs;
pub mod signal;
