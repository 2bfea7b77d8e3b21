//! Runtime drivers: the plug point for infrastructure backends.
//!
//! A driver carries out start and stop requests for runtime instances
//! and reflects what the substrate reports into the ledger. It polls the
//! substrate itself until the instance is ready or gone, so callers see
//! a single call that returns the updated meta-instance.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use fleet_core::DriverConfig;
use fleet_state::{Ledger, MetaInstance, RuntimeState, Status};

use crate::error::{DriverError, DriverResult};

/// Version conflicts tolerated while reporting one status change.
const REPORT_CONFLICT_RETRIES: u32 = 5;

#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Start the runtime instance and wait until it is running.
    async fn start_instance(
        &self,
        meta_instance_id: &str,
        runtime_instance_id: &str,
    ) -> DriverResult<MetaInstance>;

    /// Stop the runtime instance and wait until it has terminated.
    async fn stop_instance(
        &self,
        meta_instance_id: &str,
        runtime_instance_id: &str,
    ) -> DriverResult<MetaInstance>;
}

/// Driver that touches no infrastructure.
///
/// Walks runtime instances through Starting and Running (or to
/// Terminated) in the ledger, pausing between readiness polls as a real
/// backend would.
#[derive(Clone)]
pub struct DryRunDriver {
    instances: Ledger<MetaInstance>,
    ready_polls: u32,
    ready_poll_interval: Duration,
}

impl DryRunDriver {
    pub fn new(instances: Ledger<MetaInstance>, config: &DriverConfig) -> Self {
        Self {
            instances,
            ready_polls: config.ready_polls,
            ready_poll_interval: config.ready_poll_interval,
        }
    }

    /// Record `state` for the runtime instance, re-reading on conflicts.
    ///
    /// Returns the current record unchanged when the state is already
    /// recorded.
    fn report(
        &self,
        meta_instance_id: &str,
        runtime_instance_id: &str,
        state: RuntimeState,
    ) -> DriverResult<MetaInstance> {
        for _ in 0..REPORT_CONFLICT_RETRIES {
            let instance = self.instances.get_by_id(meta_instance_id)?;
            let current = current_state(&instance, runtime_instance_id)?;
            if current == state {
                return Ok(instance);
            }
            match self.instances.update_runtime_status(
                &instance.metadata,
                runtime_instance_id,
                Status::new(state),
            ) {
                Ok(updated) => return Ok(updated),
                Err(e) if e.is_conflict() => {
                    debug!(
                        %meta_instance_id,
                        %runtime_instance_id,
                        ?state,
                        "status report lost a race, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DriverError::ConflictRetriesExhausted(
            runtime_instance_id.to_string(),
        ))
    }
}

#[async_trait]
impl RuntimeDriver for DryRunDriver {
    async fn start_instance(
        &self,
        meta_instance_id: &str,
        runtime_instance_id: &str,
    ) -> DriverResult<MetaInstance> {
        let instance = self.instances.get_by_id(meta_instance_id)?;
        if current_state(&instance, runtime_instance_id)? == RuntimeState::Running {
            debug!(%meta_instance_id, %runtime_instance_id, "already running");
            return Ok(instance);
        }

        self.report(meta_instance_id, runtime_instance_id, RuntimeState::Starting)?;
        for poll in 1..=self.ready_polls {
            tokio::time::sleep(self.ready_poll_interval).await;
            debug!(%meta_instance_id, %runtime_instance_id, poll, "readiness poll");
        }
        let instance = self.report(meta_instance_id, runtime_instance_id, RuntimeState::Running)?;
        info!(%meta_instance_id, %runtime_instance_id, "runtime instance running (dry run)");
        Ok(instance)
    }

    async fn stop_instance(
        &self,
        meta_instance_id: &str,
        runtime_instance_id: &str,
    ) -> DriverResult<MetaInstance> {
        let instance =
            self.report(meta_instance_id, runtime_instance_id, RuntimeState::Terminated)?;
        info!(%meta_instance_id, %runtime_instance_id, "runtime instance terminated (dry run)");
        Ok(instance)
    }
}

fn current_state(instance: &MetaInstance, runtime_instance_id: &str) -> DriverResult<RuntimeState> {
    instance
        .runtime_instance(runtime_instance_id)
        .map(|ri| ri.status.state)
        .ok_or_else(|| DriverError::UnknownRuntimeInstance {
            meta_instance_id: instance.metadata.id.clone(),
            runtime_instance_id: runtime_instance_id.to_string(),
        })
}
