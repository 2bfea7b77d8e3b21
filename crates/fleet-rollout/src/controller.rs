//! Rollout controller.
//!
//! Each tick lists active deployment plans and picks, per plan, the
//! deployment that is InProgress or else the oldest Pending one. That
//! deployment is rolled out by the `rollout` workflow:
//!
//! 1. `start` moves the deployment to InProgress.
//! 2. `materialize` gathers meta-instances up to the instance count:
//!    already tagged ones first, then re-tagged ones from older
//!    deployments, then new ones.
//! 3. `emit-operations` gives every meta-instance one operation for the
//!    deployment: Create when it has no runtime instance, else Update.
//! 4. The operations run concurrently as child workflows.
//! 5. `finish` records Completed when all succeeded, Failed otherwise.
//!
//! A deployment paused or cancelled mid-rollout ends the execution
//! without touching its state. Resuming a paused deployment starts a new
//! execution, which replays the operations that already finished.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_core::{OperationsConfig, RolloutConfig};
use fleet_orchestrator::{
    EngineResult, OperationError, OperationParams, Orchestrator, StepError, StepOptions,
    WorkflowContext,
};
use fleet_state::{
    Deployment, DeploymentPlan, DeploymentState, Ledger, ListFilter, MetaInstance,
    MetaInstanceQuery, MetaInstanceState, Membership, NewMetaInstance, OperationType, PlanState,
    Status, WorkflowRecord, WorkflowStatus, new_id,
};

use crate::error::{RolloutError, RolloutResult};

/// Workflow kind of deployment rollouts.
pub const ROLLOUT_WORKFLOW: &str = "rollout";

/// Version conflicts tolerated while recording a failed rollout.
const CONFLICT_RETRIES: u32 = 5;

/// Serialized parameters of a rollout workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutParams {
    pub plan_id: String,
    pub deployment_id: String,
    /// Number of earlier executions that ended on a pause or cancel.
    #[serde(default)]
    pub attempt: u32,
}

impl RolloutParams {
    pub fn new(plan_id: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            deployment_id: deployment_id.into(),
            attempt: 0,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn workflow_id(&self) -> String {
        match self.attempt {
            0 => format!("rollout:{}:{}", self.plan_id, self.deployment_id),
            n => format!("rollout:{}:{}:{n}", self.plan_id, self.deployment_id),
        }
    }
}

/// Polls deployment plans and rolls out their deployments.
#[derive(Clone)]
pub struct RolloutController {
    plans: Ledger<DeploymentPlan>,
    instances: Ledger<MetaInstance>,
    orchestrator: Orchestrator,
    poll_interval: Duration,
    steps: StepOptions,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl RolloutController {
    pub fn new(
        plans: Ledger<DeploymentPlan>,
        instances: Ledger<MetaInstance>,
        orchestrator: Orchestrator,
        rollout: &RolloutConfig,
        operations: &OperationsConfig,
    ) -> Self {
        Self {
            plans,
            instances,
            orchestrator,
            poll_interval: rollout.poll_interval,
            steps: StepOptions::new(operations.step_timeout)
                .with_retries(operations.max_attempts, operations.initial_backoff),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the poll loop until `shutdown` changes.
    ///
    /// Rollouts already started keep running after the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(poll_interval = ?self.poll_interval, "rollout controller started");
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => match self.reconcile_once() {
                    Ok(handles) if !handles.is_empty() => {
                        info!(count = handles.len(), "rollouts started");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "rollout reconciliation failed"),
                },
                _ = shutdown.changed() => {
                    info!("rollout controller shutting down");
                    break;
                }
            }
        }
    }

    /// Start a rollout task for every plan with a deployment due.
    ///
    /// Deployments whose rollout is already running in this process are
    /// skipped.
    pub fn reconcile_once(
        &self,
    ) -> RolloutResult<Vec<JoinHandle<RolloutResult<DeploymentState>>>> {
        let plans = self
            .plans
            .list(&ListFilter::new().state_in([PlanState::Active]))?;

        let mut handles = Vec::new();
        for plan in plans {
            let Some(deployment) = due_deployment(&plan) else {
                continue;
            };
            let key = format!("{}:{}", plan.metadata.id, deployment.id);
            let Some(claim) = InFlight::claim(&self.in_flight, key) else {
                debug!(
                    plan_id = %plan.metadata.id,
                    deployment_id = %deployment.id,
                    "rollout already in flight"
                );
                continue;
            };
            let params = match self.current_execution(&plan.metadata.id, &deployment.id) {
                Ok(params) => params,
                Err(e) => {
                    warn!(
                        plan_id = %plan.metadata.id,
                        deployment_id = %deployment.id,
                        error = %e,
                        "could not look up rollout execution"
                    );
                    continue;
                }
            };
            info!(
                plan_id = %params.plan_id,
                deployment_id = %params.deployment_id,
                attempt = params.attempt,
                state = ?deployment.status.state,
                instance_count = deployment.instance_count,
                "rolling out deployment"
            );
            let controller = self.clone();
            handles.push(tokio::spawn(async move {
                let _claim = claim;
                controller.roll_out(&params).await
            }));
        }
        Ok(handles)
    }

    /// Parameters of the execution that should roll out the deployment now.
    ///
    /// Executions that ended on a pause or cancel are skipped; the first
    /// one that is unused, still running, or finished for good is picked.
    pub fn current_execution(
        &self,
        plan_id: &str,
        deployment_id: &str,
    ) -> RolloutResult<RolloutParams> {
        let engine = self.orchestrator.engine();
        let mut params = RolloutParams::new(plan_id, deployment_id);
        while let Some(record) = engine.get(&params.workflow_id())? {
            if !ended_halted(&record) {
                break;
            }
            params.attempt += 1;
        }
        Ok(params)
    }

    /// Roll out one deployment until it finishes, pauses or is cancelled.
    pub async fn roll_out(&self, params: &RolloutParams) -> RolloutResult<DeploymentState> {
        let plan = self.plans.get_by_id(&params.plan_id)?;
        if plan.deployment(&params.deployment_id).is_none() {
            return Err(RolloutError::UnknownDeployment {
                plan_id: params.plan_id.clone(),
                deployment_id: params.deployment_id.clone(),
            });
        }

        let outcome = self
            .orchestrator
            .engine()
            .execute(&params.workflow_id(), ROLLOUT_WORKFLOW, params, |ctx| async move {
                self.protocol(&ctx, params).await
            })
            .await;
        match outcome {
            Ok(state) => Ok(state),
            Err(e) => {
                self.fail_deployment(params, &e.to_string());
                Err(e.into())
            }
        }
    }

    async fn protocol(
        &self,
        ctx: &WorkflowContext,
        p: &RolloutParams,
    ) -> EngineResult<DeploymentState> {
        let opts = self.steps;

        let started: DeploymentState = ctx.step("start", &opts, move || self.start(p)).await?;
        if started != DeploymentState::InProgress {
            return Ok(halt(p, started));
        }

        if let Some(state) = self.halted(p)? {
            return Ok(halt(p, state));
        }
        let members: Vec<String> = ctx
            .step("materialize", &opts, move || self.materialize(p))
            .await?;
        let members = members.as_slice();

        if let Some(state) = self.halted(p)? {
            return Ok(halt(p, state));
        }
        let operations: Vec<OperationParams> = ctx
            .step("emit-operations", &opts, move || self.emit_operations(p, members))
            .await?;

        if let Some(state) = self.halted(p)? {
            return Ok(halt(p, state));
        }

        let mut tasks = JoinSet::new();
        for operation in operations.iter().cloned() {
            let orchestrator = self.orchestrator.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let outcome = orchestrator.run_child(&ctx, &operation).await;
                (operation, outcome)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((operation, Err(e))) => {
                    warn!(
                        deployment_id = %p.deployment_id,
                        meta_instance_id = %operation.meta_instance_id,
                        operation_id = %operation.operation_id,
                        error = %e,
                        "operation failed"
                    );
                    failures.push(format!("{}: {e}", operation.meta_instance_id));
                }
                Err(e) => failures.push(format!("operation task: {e}")),
            }
        }

        let total = operations.len();
        let failures = failures.as_slice();
        ctx.step("finish", &opts, move || self.finish(p, total, failures))
            .await
    }

    async fn start(&self, p: &RolloutParams) -> Result<DeploymentState, StepError> {
        let plan = self.plans.get_by_id(&p.plan_id)?;
        match find_deployment(&plan, &p.deployment_id)?.status.state {
            state @ (DeploymentState::InProgress
            | DeploymentState::Paused
            | DeploymentState::Cancelled) => Ok(state),
            DeploymentState::Pending => {
                self.plans.update_deployment_status(
                    &plan.metadata,
                    &p.deployment_id,
                    Status::new(DeploymentState::InProgress),
                )?;
                Ok(DeploymentState::InProgress)
            }
            other => Err(StepError::fatal(format!(
                "deployment {} is {other:?}",
                p.deployment_id
            ))),
        }
    }

    async fn materialize(&self, p: &RolloutParams) -> Result<Vec<String>, StepError> {
        let plan = self.plans.get_by_id(&p.plan_id)?;
        let wanted = find_deployment(&plan, &p.deployment_id)?.instance_count as usize;

        let live = self.instances.list(
            &ListFilter::new()
                .state_in([MetaInstanceState::Active])
                .query(MetaInstanceQuery {
                    plan_ids: Membership {
                        include: vec![p.plan_id.clone()],
                        ..Default::default()
                    },
                    ..Default::default()
                }),
        )?;
        let (tagged, others): (Vec<MetaInstance>, Vec<MetaInstance>) = live
            .into_iter()
            .partition(|mi| mi.deployment_id.as_deref() == Some(p.deployment_id.as_str()));

        let mut ids: Vec<String> = tagged.into_iter().map(|mi| mi.metadata.id).collect();
        let mut retagged = 0;
        for mi in others {
            if ids.len() >= wanted {
                break;
            }
            self.instances
                .update_deployment_id(&mi.metadata, &p.deployment_id)?;
            ids.push(mi.metadata.id);
            retagged += 1;
        }

        let mut created = 0;
        while ids.len() < wanted {
            let suffix = new_id();
            let mi = self.instances.create(NewMetaInstance {
                name: format!("{}-{}", plan.name, &suffix[..8]),
                deployment_plan_id: p.plan_id.clone(),
                deployment_id: Some(p.deployment_id.clone()),
            })?;
            ids.push(mi.metadata.id);
            created += 1;
        }
        ids.truncate(wanted);

        info!(
            deployment_id = %p.deployment_id,
            instances = ids.len(),
            retagged,
            created,
            "meta-instances materialized"
        );
        Ok(ids)
    }

    async fn emit_operations(
        &self,
        p: &RolloutParams,
        members: &[String],
    ) -> Result<Vec<OperationParams>, StepError> {
        let mut emitted = Vec::with_capacity(members.len());
        for meta_instance_id in members {
            let instance = self.instances.get_by_id(meta_instance_id)?;
            let existing = instance
                .operations
                .iter()
                .find(|op| op.intent_id == p.deployment_id);
            let operation_id = match existing {
                Some(op) => op.id.clone(),
                None => {
                    let operation_type = if instance.runtime_instances.is_empty() {
                        OperationType::Create
                    } else {
                        OperationType::Update
                    };
                    self.orchestrator
                        .submit(meta_instance_id, operation_type, &p.deployment_id)
                        .map_err(step_error)?
                        .id
                }
            };
            emitted.push(OperationParams::new(meta_instance_id, operation_id));
        }
        debug!(deployment_id = %p.deployment_id, count = emitted.len(), "operations emitted");
        Ok(emitted)
    }

    async fn finish(
        &self,
        p: &RolloutParams,
        total: usize,
        failures: &[String],
    ) -> Result<DeploymentState, StepError> {
        let (target, message) = if failures.is_empty() {
            (DeploymentState::Completed, format!("{total} operation(s) succeeded"))
        } else {
            (
                DeploymentState::Failed,
                format!(
                    "{} of {total} operation(s) failed: {}",
                    failures.len(),
                    failures.join("; ")
                ),
            )
        };

        let plan = self.plans.get_by_id(&p.plan_id)?;
        let current = find_deployment(&plan, &p.deployment_id)?.status.state;
        if is_halted(current) {
            return Ok(halt(p, current));
        }
        if current != target {
            self.plans.update_deployment_status(
                &plan.metadata,
                &p.deployment_id,
                Status::with_message(target, message.as_str()),
            )?;
        }
        info!(
            plan_id = %p.plan_id,
            deployment_id = %p.deployment_id,
            state = ?target,
            %message,
            "rollout finished"
        );
        Ok(target)
    }

    /// The deployment's state if it was paused or cancelled meanwhile.
    fn halted(&self, p: &RolloutParams) -> EngineResult<Option<DeploymentState>> {
        let plan = self.plans.get_by_id(&p.plan_id)?;
        Ok(plan
            .deployment(&p.deployment_id)
            .map(|d| d.status.state)
            .filter(|state| is_halted(*state)))
    }

    /// Record an InProgress deployment as Failed.
    fn fail_deployment(&self, p: &RolloutParams, message: &str) {
        for _ in 0..CONFLICT_RETRIES {
            let plan = match self.plans.get_by_id(&p.plan_id) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(plan_id = %p.plan_id, error = %e, "could not record rollout failure");
                    return;
                }
            };
            let in_progress = plan
                .deployment(&p.deployment_id)
                .is_some_and(|d| d.status.state == DeploymentState::InProgress);
            if !in_progress {
                return;
            }
            match self.plans.update_deployment_status(
                &plan.metadata,
                &p.deployment_id,
                Status::with_message(DeploymentState::Failed, message),
            ) {
                Ok(_) => {
                    warn!(
                        plan_id = %p.plan_id,
                        deployment_id = %p.deployment_id,
                        error = %message,
                        "rollout failed"
                    );
                    return;
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    warn!(
                        deployment_id = %p.deployment_id,
                        error = %e,
                        "could not record rollout failure"
                    );
                    return;
                }
            }
        }
        warn!(
            deployment_id = %p.deployment_id,
            "gave up recording rollout failure after repeated conflicts"
        );
    }
}

/// The deployment a plan should be rolling out now, if any.
fn due_deployment(plan: &DeploymentPlan) -> Option<&Deployment> {
    plan.in_progress_deployment().or_else(|| {
        plan.deployments
            .iter()
            .find(|d| d.status.state == DeploymentState::Pending)
    })
}

fn is_halted(state: DeploymentState) -> bool {
    matches!(state, DeploymentState::Paused | DeploymentState::Cancelled)
}

fn halt(p: &RolloutParams, state: DeploymentState) -> DeploymentState {
    info!(
        plan_id = %p.plan_id,
        deployment_id = %p.deployment_id,
        attempt = p.attempt,
        ?state,
        "rollout halted"
    );
    state
}

/// Whether a rollout execution finished because its deployment was
/// paused or cancelled.
fn ended_halted(record: &WorkflowRecord) -> bool {
    record.status == WorkflowStatus::Completed
        && record
            .output
            .clone()
            .and_then(|output| serde_json::from_value::<DeploymentState>(output).ok())
            .is_some_and(is_halted)
}

fn find_deployment<'a>(
    plan: &'a DeploymentPlan,
    deployment_id: &str,
) -> Result<&'a Deployment, StepError> {
    plan.deployment(deployment_id).ok_or_else(|| {
        StepError::fatal(format!(
            "deployment plan {} has no deployment {deployment_id}",
            plan.metadata.id
        ))
    })
}

fn step_error(e: OperationError) -> StepError {
    match e {
        OperationError::State(e) => e.into(),
        other => StepError::fatal(other),
    }
}

/// Marks a rollout as running in this process until dropped.
struct InFlight {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlight {
    fn claim(set: &Arc<Mutex<HashSet<String>>>, key: String) -> Option<Self> {
        if !lock(set).insert(key.clone()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            key,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
