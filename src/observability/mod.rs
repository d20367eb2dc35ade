//! Observability
//!
//! Structured lifecycle events for the startup sequence.

pub mod events;
