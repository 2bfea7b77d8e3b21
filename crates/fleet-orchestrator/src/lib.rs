//! fleet-orchestrator: carries operations from request to infrastructure.
//!
//! - [`ExecutionEngine`] runs workflows as checkpointed steps in the
//!   state store, retrying transient failures and resuming after a crash.
//! - [`RuntimeDriver`] is the backend seam; [`DryRunDriver`] only
//!   records state transitions.
//! - [`Orchestrator`] runs the operation protocol: allocate, request
//!   approval, wait, act on each runtime instance, complete.

pub mod driver;
pub mod engine;
pub mod error;
pub mod operation;

pub use driver::{DryRunDriver, RuntimeDriver};
pub use engine::{ExecutionEngine, StepOptions, WorkflowContext};
pub use error::{
    DriverError, DriverResult, EngineError, EngineResult, OperationError, OperationResult,
    StepError,
};
pub use operation::{OPERATION_WORKFLOW, OperationParams, Orchestrator};
