//! fleet-scheduler: places runtime instances onto nodes.
//!
//! Given a meta-instance, the [`Scheduler`] sums what its deployment plan
//! needs, asks the node ledger for Allocated nodes with enough remaining
//! capacity that do not already run any of the plan's payloads, and
//! takes the first one. There is no ranking beyond first-fit.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── Ledger<MetaInstance> (read instance, add runtime instance)
//!   ├── Ledger<DeploymentPlan> (read applications)
//!   ├── Ledger<Node> (list candidates)
//!   └── placement (requirements, candidate filter, first-fit)
//! ```
//!
//! Oversubscription is prevented by the ledger, not here: the runtime
//! instance insert re-checks the node's capacity in the same transaction
//! and fails with a conflict if a concurrent allocation got there first.

pub mod error;
pub mod placement;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use placement::{Requirements, first_fit};
pub use scheduler::Scheduler;
