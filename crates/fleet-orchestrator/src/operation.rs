//! Operation orchestration.
//!
//! An operation runs as the `operation` workflow, keyed by
//! `{meta_instance_id}:{operation_id}`:
//!
//! 1. `allocate` (Create and Relocate only) places a new runtime
//!    instance, active for Create and passive for Relocate.
//! 2. `request-approval` moves the operation to PendingApproval.
//! 3. `await-approval` polls until an approver moves it to Approved.
//! 4. One step per runtime instance action: `start:`, `stop:`,
//!    `remove:`, `activate:`. Active instances go first, so a relocation
//!    stops and removes the old instance before the replacement becomes
//!    active.
//! 5. `complete` moves the operation to Succeeded.
//!
//! Any failure records the operation as Failed with the error message
//! and returns the error.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_core::OperationsConfig;
use fleet_scheduler::Scheduler;
use fleet_state::{
    Ledger, MetaInstance, Operation, OperationState, OperationType, RuntimeInstance, Status,
};

use crate::driver::RuntimeDriver;
use crate::engine::{ExecutionEngine, StepOptions, WorkflowContext};
use crate::error::{EngineError, EngineResult, OperationError, OperationResult, StepError};

/// Workflow kind of operation executions.
pub const OPERATION_WORKFLOW: &str = "operation";

/// Version conflicts tolerated by a single ledger update.
const CONFLICT_RETRIES: u32 = 5;

/// Serialized parameters of an operation workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationParams {
    pub meta_instance_id: String,
    pub operation_id: String,
}

impl OperationParams {
    pub fn new(meta_instance_id: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            meta_instance_id: meta_instance_id.into(),
            operation_id: operation_id.into(),
        }
    }

    pub fn workflow_id(&self) -> String {
        format!("{}:{}", self.meta_instance_id, self.operation_id)
    }
}

/// A runtime instance the post-approval phase acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PlannedInstance {
    runtime_instance_id: String,
    is_active: bool,
}

/// Submits, approves and runs operations on meta-instances.
#[derive(Clone)]
pub struct Orchestrator {
    instances: Ledger<MetaInstance>,
    scheduler: Scheduler,
    driver: Arc<dyn RuntimeDriver>,
    engine: ExecutionEngine,
    config: OperationsConfig,
}

impl Orchestrator {
    pub fn new(
        instances: Ledger<MetaInstance>,
        scheduler: Scheduler,
        driver: Arc<dyn RuntimeDriver>,
        engine: ExecutionEngine,
        config: OperationsConfig,
    ) -> Self {
        Self {
            instances,
            scheduler,
            driver,
            engine,
            config,
        }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Record a new operation on the meta-instance in Preparing.
    pub fn submit(
        &self,
        meta_instance_id: &str,
        operation_type: OperationType,
        intent_id: &str,
    ) -> OperationResult<Operation> {
        let operation = Operation::new(operation_type, intent_id);
        retry_conflicts(|| {
            let instance = self.instances.get_by_id(meta_instance_id)?;
            self.instances
                .add_operation(&instance.metadata, operation.clone())?;
            Ok(())
        })?;
        Ok(operation)
    }

    /// Approve an operation that is waiting for approval.
    pub fn approve(
        &self,
        meta_instance_id: &str,
        operation_id: &str,
    ) -> OperationResult<MetaInstance> {
        retry_conflicts(|| {
            let instance = self.instances.get_by_id(meta_instance_id)?;
            let state = operation_state(&instance, operation_id)?;
            match state {
                OperationState::Approved => Ok(instance),
                OperationState::PendingApproval => Ok(self.instances.update_operation_status(
                    &instance.metadata,
                    operation_id,
                    Status::new(OperationState::Approved),
                )?),
                other => Err(unexpected(operation_id, other, "pending_approval")),
            }
        })
    }

    /// Refuse an operation. It ends Failed with `reason`.
    pub fn reject(
        &self,
        meta_instance_id: &str,
        operation_id: &str,
        reason: &str,
    ) -> OperationResult<MetaInstance> {
        retry_conflicts(|| {
            let instance = self.instances.get_by_id(meta_instance_id)?;
            let state = operation_state(&instance, operation_id)?;
            if state.is_terminal() {
                return Err(unexpected(operation_id, state, "a non-terminal state"));
            }
            Ok(self.instances.update_operation_status(
                &instance.metadata,
                operation_id,
                Status::with_message(OperationState::Failed, format!("rejected: {reason}")),
            )?)
        })
    }

    /// Run the operation as a top-level workflow.
    pub async fn run(&self, params: &OperationParams) -> OperationResult<OperationState> {
        let outcome = self
            .engine
            .execute(&params.workflow_id(), OPERATION_WORKFLOW, params, |ctx| async move {
                self.protocol(&ctx, params).await
            })
            .await;
        self.settle(params, outcome)
    }

    /// Run the operation as a child of another workflow.
    pub async fn run_child(
        &self,
        parent: &WorkflowContext,
        params: &OperationParams,
    ) -> OperationResult<OperationState> {
        let outcome = parent
            .child(&params.workflow_id(), OPERATION_WORKFLOW, params, |ctx| async move {
                self.protocol(&ctx, params).await
            })
            .await;
        self.settle(params, outcome)
    }

    /// Restart operation workflows a previous process left unfinished.
    pub fn resume_incomplete(
        &self,
    ) -> OperationResult<Vec<JoinHandle<OperationResult<OperationState>>>> {
        let mut handles = Vec::new();
        for record in self.engine.incomplete(OPERATION_WORKFLOW)? {
            let params: OperationParams =
                serde_json::from_value(record.params).map_err(EngineError::from)?;
            info!(
                workflow_id = %record.id,
                completed_steps = record.completed_steps.len(),
                "resuming operation"
            );
            let orchestrator = self.clone();
            handles.push(tokio::spawn(async move { orchestrator.run(&params).await }));
        }
        Ok(handles)
    }

    fn settle(
        &self,
        params: &OperationParams,
        outcome: EngineResult<OperationState>,
    ) -> OperationResult<OperationState> {
        match outcome {
            Ok(state) => Ok(state),
            // Another execution owns the operation.
            Err(e @ EngineError::DuplicateWorkflow(_)) => Err(e.into()),
            Err(e) => {
                self.mark_failed(params, &e.to_string());
                Err(e.into())
            }
        }
    }

    async fn protocol(
        &self,
        ctx: &WorkflowContext,
        p: &OperationParams,
    ) -> EngineResult<OperationState> {
        let opts = StepOptions::new(self.config.step_timeout)
            .with_retries(self.config.max_attempts, self.config.initial_backoff);

        let operation_type: OperationType = ctx
            .step("inspect", &opts, move || self.inspect(p))
            .await?;

        if operation_type.allocates() {
            let is_active = operation_type == OperationType::Create;
            let _: RuntimeInstance = ctx
                .step("allocate", &opts, move || self.allocate(p, is_active))
                .await?;
        }

        let _: OperationState = ctx
            .step("request-approval", &opts, move || self.request_approval(p))
            .await?;

        let approval = StepOptions::new(self.config.approval_timeout);
        ctx.step("await-approval", &approval, move || self.await_approval(p))
            .await?;

        let planned: Vec<PlannedInstance> = ctx
            .step("instances", &opts, move || self.plan(p))
            .await?;
        for instance in &planned {
            let ri = instance.runtime_instance_id.as_str();
            match (instance.is_active, operation_type) {
                (true, OperationType::Create | OperationType::Restart | OperationType::Update) => {
                    ctx.step(&format!("start:{ri}"), &opts, move || self.start(p, ri))
                        .await?;
                }
                (true, OperationType::Stop) => {
                    ctx.step(&format!("stop:{ri}"), &opts, move || self.stop(p, ri))
                        .await?;
                }
                (true, OperationType::Delete | OperationType::Relocate) => {
                    ctx.step(&format!("stop:{ri}"), &opts, move || self.stop(p, ri))
                        .await?;
                    ctx.step(&format!("remove:{ri}"), &opts, move || self.remove(p, ri))
                        .await?;
                }
                (false, OperationType::Relocate) => {
                    ctx.step(&format!("start:{ri}"), &opts, move || self.start(p, ri))
                        .await?;
                    ctx.step(&format!("activate:{ri}"), &opts, move || self.activate(p, ri))
                        .await?;
                }
                (false, other) => {
                    debug!(
                        meta_instance_id = %p.meta_instance_id,
                        runtime_instance_id = %ri,
                        operation_type = ?other,
                        "passive instance left untouched"
                    );
                }
            }
        }

        ctx.step("complete", &opts, move || self.complete(p)).await
    }

    async fn inspect(&self, p: &OperationParams) -> Result<OperationType, StepError> {
        let instance = self.instances.get_by_id(&p.meta_instance_id)?;
        let operation = find_operation(&instance, &p.operation_id)?;
        if operation.status.state == OperationState::Failed {
            return Err(StepError::fatal(format!(
                "operation {} already failed: {}",
                operation.id, operation.status.message
            )));
        }
        Ok(operation.operation_type)
    }

    async fn allocate(
        &self,
        p: &OperationParams,
        is_active: bool,
    ) -> Result<RuntimeInstance, StepError> {
        Ok(self
            .scheduler
            .allocate_runtime_instance(&p.meta_instance_id, is_active)?)
    }

    async fn request_approval(&self, p: &OperationParams) -> Result<OperationState, StepError> {
        let mut instance = self.instances.get_by_id(&p.meta_instance_id)?;
        let mut state = find_operation(&instance, &p.operation_id)?.status.state;
        if state == OperationState::Preparing {
            instance = self.instances.update_operation_status(
                &instance.metadata,
                &p.operation_id,
                Status::new(OperationState::PendingApproval),
            )?;
            state = OperationState::PendingApproval;
            info!(
                meta_instance_id = %p.meta_instance_id,
                operation_id = %p.operation_id,
                "operation awaiting approval"
            );
        }
        if state == OperationState::PendingApproval && self.config.auto_approve {
            self.instances.update_operation_status(
                &instance.metadata,
                &p.operation_id,
                Status::with_message(OperationState::Approved, "auto-approved"),
            )?;
            state = OperationState::Approved;
        }
        match state {
            OperationState::Failed => Err(StepError::fatal(format!(
                "operation {} was rejected",
                p.operation_id
            ))),
            state => Ok(state),
        }
    }

    async fn await_approval(&self, p: &OperationParams) -> Result<(), StepError> {
        loop {
            let instance = self.instances.get_by_id(&p.meta_instance_id)?;
            let operation = find_operation(&instance, &p.operation_id)?;
            match operation.status.state {
                OperationState::Approved | OperationState::Succeeded => return Ok(()),
                OperationState::Failed => {
                    return Err(StepError::fatal(format!(
                        "operation {} failed while awaiting approval: {}",
                        operation.id, operation.status.message
                    )));
                }
                OperationState::Preparing | OperationState::PendingApproval => {
                    debug!(operation_id = %p.operation_id, "approval pending");
                    tokio::time::sleep(self.config.approval_poll_interval).await;
                }
            }
        }
    }

    async fn plan(&self, p: &OperationParams) -> Result<Vec<PlannedInstance>, StepError> {
        let instance = self.instances.get_by_id(&p.meta_instance_id)?;
        let mut planned: Vec<PlannedInstance> = instance
            .runtime_instances
            .iter()
            .map(|ri| PlannedInstance {
                runtime_instance_id: ri.id.clone(),
                is_active: ri.is_active,
            })
            .collect();
        planned.sort_by_key(|ri| !ri.is_active);
        Ok(planned)
    }

    async fn start(&self, p: &OperationParams, runtime_instance_id: &str) -> Result<(), StepError> {
        self.driver
            .start_instance(&p.meta_instance_id, runtime_instance_id)
            .await?;
        Ok(())
    }

    async fn stop(&self, p: &OperationParams, runtime_instance_id: &str) -> Result<(), StepError> {
        self.driver
            .stop_instance(&p.meta_instance_id, runtime_instance_id)
            .await?;
        Ok(())
    }

    async fn remove(
        &self,
        p: &OperationParams,
        runtime_instance_id: &str,
    ) -> Result<(), StepError> {
        let instance = self.instances.get_by_id(&p.meta_instance_id)?;
        if instance.runtime_instance(runtime_instance_id).is_none() {
            return Ok(());
        }
        self.instances
            .remove_runtime_instance(&instance.metadata, runtime_instance_id)?;
        Ok(())
    }

    async fn activate(
        &self,
        p: &OperationParams,
        runtime_instance_id: &str,
    ) -> Result<(), StepError> {
        let instance = self.instances.get_by_id(&p.meta_instance_id)?;
        let runtime = instance.runtime_instance(runtime_instance_id).ok_or_else(|| {
            StepError::fatal(format!("runtime instance {runtime_instance_id} disappeared"))
        })?;
        if runtime.is_active {
            return Ok(());
        }
        self.instances
            .update_runtime_active_state(&instance.metadata, runtime_instance_id, true)?;
        info!(
            meta_instance_id = %p.meta_instance_id,
            %runtime_instance_id,
            "relocation cut over"
        );
        Ok(())
    }

    async fn complete(&self, p: &OperationParams) -> Result<OperationState, StepError> {
        let instance = self.instances.get_by_id(&p.meta_instance_id)?;
        if find_operation(&instance, &p.operation_id)?.status.state != OperationState::Succeeded {
            self.instances.update_operation_status(
                &instance.metadata,
                &p.operation_id,
                Status::new(OperationState::Succeeded),
            )?;
        }
        info!(
            meta_instance_id = %p.meta_instance_id,
            operation_id = %p.operation_id,
            "operation succeeded"
        );
        Ok(OperationState::Succeeded)
    }

    /// Record the operation as Failed unless it already finished.
    fn mark_failed(&self, p: &OperationParams, message: &str) {
        let outcome = retry_conflicts(|| {
            let instance = self.instances.get_by_id(&p.meta_instance_id)?;
            if operation_state(&instance, &p.operation_id)?.is_terminal() {
                return Ok(());
            }
            self.instances.update_operation_status(
                &instance.metadata,
                &p.operation_id,
                Status::with_message(OperationState::Failed, message),
            )?;
            Ok(())
        });
        match outcome {
            Ok(()) => warn!(
                meta_instance_id = %p.meta_instance_id,
                operation_id = %p.operation_id,
                error = %message,
                "operation failed"
            ),
            Err(e) => warn!(
                meta_instance_id = %p.meta_instance_id,
                operation_id = %p.operation_id,
                error = %e,
                "could not record operation failure"
            ),
        }
    }
}

fn find_operation<'a>(
    instance: &'a MetaInstance,
    operation_id: &str,
) -> Result<&'a Operation, StepError> {
    instance.operation(operation_id).ok_or_else(|| {
        StepError::fatal(format!(
            "meta-instance {} has no operation {operation_id}",
            instance.metadata.id
        ))
    })
}

fn operation_state(instance: &MetaInstance, operation_id: &str) -> OperationResult<OperationState> {
    instance
        .operation(operation_id)
        .map(|op| op.status.state)
        .ok_or_else(|| OperationError::UnknownOperation {
            meta_instance_id: instance.metadata.id.clone(),
            operation_id: operation_id.to_string(),
        })
}

fn unexpected(operation_id: &str, state: OperationState, expected: &str) -> OperationError {
    OperationError::UnexpectedState {
        operation_id: operation_id.to_string(),
        state: format!("{state:?}"),
        expected: expected.to_string(),
    }
}

/// Re-run `f` while it fails with a ledger version conflict.
fn retry_conflicts<T>(mut f: impl FnMut() -> OperationResult<T>) -> OperationResult<T> {
    let mut attempt = 1;
    loop {
        match f() {
            Err(OperationError::State(e)) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                debug!(attempt, error = %e, "ledger conflict, re-reading");
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}
