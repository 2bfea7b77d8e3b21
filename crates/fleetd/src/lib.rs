//! fleetd: the fleet control plane daemon.
//!
//! Single process assembling the fleet subsystems:
//! - State store (redb) and entity ledgers
//! - Scheduler
//! - Execution engine, runtime driver and operation orchestrator
//! - Rollout controller

pub mod daemon;

pub use daemon::{Fleet, run};
