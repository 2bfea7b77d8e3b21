//! Orchestration error types.

use std::fmt::Display;
use std::time::Duration;

use fleet_scheduler::SchedulerError;
use fleet_state::StateError;
use thiserror::Error;

/// Errors surfaced by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow ID is executing in this process or already finished.
    #[error("workflow {0} is already running or finished")]
    DuplicateWorkflow(String),

    #[error("step {step} of workflow {workflow_id} failed after {attempts} attempt(s): {message}")]
    StepFailed {
        workflow_id: String,
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("step {step} of workflow {workflow_id} timed out after {after:?}")]
    StepTimedOut {
        workflow_id: String,
        step: String,
        after: Duration,
    },

    #[error("workflow {workflow_id} failed: {message}")]
    WorkflowFailed { workflow_id: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Outcome of one failed step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Transient; the engine retries with backoff.
    #[error("{0}")]
    Retryable(String),

    /// Permanent; the step fails immediately.
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    pub fn retryable(msg: impl Display) -> Self {
        Self::Retryable(msg.to_string())
    }

    pub fn fatal(msg: impl Display) -> Self {
        Self::Fatal(msg.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<StateError> for StepError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::RecordInsertConflict(_) | StateError::RepositoryInternal(_) => {
                Self::retryable(e)
            }
            StateError::RequestInvalid(_) | StateError::RecordNotFound(_) => Self::fatal(e),
        }
    }
}

impl From<SchedulerError> for StepError {
    fn from(e: SchedulerError) -> Self {
        if e.is_retryable() {
            Self::retryable(e)
        } else {
            Self::fatal(e)
        }
    }
}

impl From<DriverError> for StepError {
    fn from(e: DriverError) -> Self {
        if e.is_retryable() {
            Self::retryable(e)
        } else {
            Self::fatal(e)
        }
    }
}

/// Errors raised by a runtime driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("meta-instance {meta_instance_id} has no runtime instance {runtime_instance_id}")]
    UnknownRuntimeInstance {
        meta_instance_id: String,
        runtime_instance_id: String,
    },

    /// The backend could not carry out the request.
    #[error("substrate error: {0}")]
    Substrate(String),

    #[error("gave up reporting status of {0} after repeated version conflicts")]
    ConflictRetriesExhausted(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::UnknownRuntimeInstance { .. } => false,
            DriverError::Substrate(_) | DriverError::ConflictRetriesExhausted(_) => true,
            DriverError::State(e) => e.is_conflict(),
        }
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors from submitting, approving, or running operations.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("meta-instance {meta_instance_id} has no operation {operation_id}")]
    UnknownOperation {
        meta_instance_id: String,
        operation_id: String,
    },

    #[error("operation {operation_id} is {state}, expected {expected}")]
    UnexpectedState {
        operation_id: String,
        state: String,
        expected: String,
    },

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("runtime driver error: {0}")]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type OperationResult<T> = Result<T, OperationError>;
