//! Rollout error types.

use fleet_orchestrator::EngineError;
use fleet_state::StateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("deployment plan {plan_id} has no deployment {deployment_id}")]
    UnknownDeployment {
        plan_id: String,
        deployment_id: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;
