//! Per-user lab desktop orchestration.
//!
//! Each user gets at most one containerized desktop with a pair of host
//! ports. Sessions expire after inactivity, are signalled to back up their
//! data before teardown, and are reconciled against the engine on access.

pub mod api;
pub mod audit;
pub mod backup;
pub mod container;
pub mod observability;
pub mod ports;
pub mod session;
pub mod settings;
