//! fleet-rollout: turns pending deployments into running instances.
//!
//! The [`RolloutController`] polls active deployment plans. For each
//! deployment due to roll out it creates or re-tags meta-instances up to
//! the deployment's instance count, emits one operation per
//! meta-instance, runs those operations concurrently as child workflows
//! and records the deployment Completed or Failed.

pub mod controller;
pub mod error;

pub use controller::{ROLLOUT_WORKFLOW, RolloutController, RolloutParams};
pub use error::{RolloutError, RolloutResult};
