//! PID-1 supervision core.
//!
//! Owns the workload lifecycle after preparation: signal relay, reaping of
//! the workload and any re-parented descendants, and the final report.

pub mod supervisor;
pub mod types;
