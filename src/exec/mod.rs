//! Workload launch
//!
//! Fork plus the fixed child-side sequence ending in exec.

pub mod spawn;
