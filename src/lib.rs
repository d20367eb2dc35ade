//! enclave-init: container entrypoint for enclave-backed data processing
//! images. Prepares the container once, then runs the workload under a
//! minimal PID-1 supervisor that relays signals and reaps orphans.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Blocked-set signal collection and forwarding
//! - [`kernel::process`]: Subreaper, parent-death signal, process groups
//! - [`kernel::procfs`]: `/proc` process table inspection
//!
//! ## Preparation ([`prepare`])
//! - [`prepare::Startup`]: Type-state enforced `Loaded -> Prepared -> launch`
//! - [`prepare::layout`]: Required paths, directories, framework/java layout
//! - [`prepare::identity`]: passwd entry for arbitrary uids
//! - [`prepare::environment`]: Workload environment and classpath
//! - [`prepare::enclave`]: Enclave runtime instance directory
//! - [`prepare::hooks`]: External preparation commands
//!
//! ## Execution ([`exec`], [`core`](crate::core))
//! - [`exec::spawn`]: Fork and the fixed child-side pre-exec sequence
//! - [`core::supervisor`](crate::core::supervisor): Signal relay and reaping loop
//! - [`core::types`](crate::core::types): Exit status and supervisor report
//!
//! ## Observability ([`observability`])
//! - [`observability::events`]: Lifecycle events (log + JSON lines)
//!
//! ## Configuration ([`config`])
//! - [`config::loader`]: JSON file plus `ENCLAVE_INIT_*` overrides
//! - [`config::validator`]: Startup validation
//! - [`config::types`]: Configuration and error types
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: Inherited descriptor hygiene
//! - [`utils::env_hygiene`]: Environment and permission hygiene

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// PID-1 supervision core
pub mod core;

// Preparation stage
pub mod prepare;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring shared by the enclave-init/entrypoint/prepare binaries.
pub mod cli;

pub use crate::config::types::{Result, ShimConfig, StartupError};
pub use crate::core::types::{ChildExit, SupervisorReport};
pub use crate::prepare::Startup;
