//! Scheduler error types.

use fleet_state::{Resources, StateError};
use thiserror::Error;

/// Errors that can occur while allocating a runtime instance.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no nodes available for meta-instance {meta_instance_id} (needs {required:?}, payloads {payloads:?})")]
    NoNodesAvailable {
        meta_instance_id: String,
        required: Resources,
        payloads: Vec<String>,
    },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl SchedulerError {
    /// Whether a later attempt may succeed without outside intervention.
    ///
    /// A lost placement race surfaces as a ledger conflict; retrying
    /// re-reads the nodes and picks another candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::State(e) if e.is_conflict())
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
