//! Meta-instances and their runtime instances and operations.
//!
//! Runtime instances and operations are children of the meta-instance:
//! every mutator below is one version-checked update of the parent.
//! Adding or removing a runtime instance also books or frees capacity
//! on its node in the same transaction.

use redb::TableDefinition;
use tracing::{debug, info};

use super::{Entity, Ledger, require};
use crate::error::{StateError, StateResult};
use crate::filter::{Membership, RecordQuery};
use crate::store::{Record, Tx};
use crate::tables::*;
use crate::transitions::{self, TransitionTable};
use crate::types::*;

#[derive(Debug, Clone, Default)]
pub struct NewMetaInstance {
    pub name: String,
    pub deployment_plan_id: RecordId,
    pub deployment_id: Option<RecordId>,
}

/// Extra criteria for listing meta-instances.
#[derive(Debug, Clone, Default)]
pub struct MetaInstanceQuery {
    pub plan_ids: Membership<RecordId>,
    /// Unassigned meta-instances only pass when `include` is empty.
    pub deployment_ids: Membership<RecordId>,
}

impl RecordQuery<MetaInstance> for MetaInstanceQuery {
    fn matches(&self, record: &MetaInstance) -> bool {
        let deployment = match &record.deployment_id {
            Some(id) => self.deployment_ids.admits(id),
            None => self.deployment_ids.include.is_empty(),
        };
        deployment && self.plan_ids.admits(&record.deployment_plan_id)
    }
}

impl Record for MetaInstance {
    const KIND: &'static str = "meta-instance";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = META_INSTANCES;
    const NAMES: TableDefinition<'static, &'static str, &'static str> = META_INSTANCE_NAMES;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Entity for MetaInstance {
    type State = MetaInstanceState;
    type CreateRequest = NewMetaInstance;
    type StatusUpdate = Status<MetaInstanceState>;
    type Query = MetaInstanceQuery;
    type ChildTransitions = TransitionTable<OperationState>;

    fn state(&self) -> MetaInstanceState {
        self.status.state
    }

    fn build(request: NewMetaInstance) -> StateResult<Self> {
        require("meta-instance name", &request.name)?;
        require("deployment plan id", &request.deployment_plan_id)?;
        Ok(MetaInstance {
            metadata: Metadata::fresh(),
            name: request.name,
            status: Status::new(MetaInstanceState::Active),
            deployment_plan_id: request.deployment_plan_id,
            deployment_id: request.deployment_id.filter(|id| !id.is_empty()),
            runtime_instances: Vec::new(),
            operations: Vec::new(),
        })
    }

    fn check_references(&self, tx: &Tx<'_>) -> StateResult<()> {
        let plan = live_plan(tx, &self.deployment_plan_id)?;
        if let Some(deployment_id) = &self.deployment_id {
            ensure_deployment(&plan, deployment_id)?;
        }
        Ok(())
    }

    fn target_state(update: &Status<MetaInstanceState>) -> MetaInstanceState {
        update.state
    }

    fn apply_status(&mut self, update: Status<MetaInstanceState>) -> StateResult<()> {
        self.status = update;
        Ok(())
    }

    /// Deleting a meta-instance frees whatever its runtime instances
    /// still hold on their nodes.
    fn on_delete(&mut self, tx: &Tx<'_>) -> StateResult<()> {
        for runtime in self.runtime_instances.drain(..) {
            release_placement(tx, &runtime)?;
        }
        Ok(())
    }

    fn default_transitions() -> TransitionTable<MetaInstanceState> {
        transitions::meta_instance()
    }

    fn default_child_transitions() -> TransitionTable<OperationState> {
        transitions::operation()
    }
}

impl Ledger<MetaInstance> {
    /// Attach a runtime instance and reserve the plan's resources on its
    /// node.
    ///
    /// A meta-instance holds at most one active and one passive runtime
    /// instance. If the node is no longer Allocated, already hosts one of
    /// the plan's payloads, or lacks capacity, the whole update is
    /// rejected with `RecordInsertConflict`.
    pub fn add_runtime_instance(
        &self,
        metadata: &Metadata,
        runtime: RuntimeInstance,
    ) -> StateResult<MetaInstance> {
        let record = self.mutate(metadata, |record: &mut MetaInstance, tx| {
            if record.status.state != MetaInstanceState::Active {
                return Err(StateError::invalid(format!(
                    "meta-instance {} is marked for deletion",
                    record.metadata.id
                )));
            }
            if record.runtime_instance(&runtime.id).is_some() {
                return Err(StateError::invalid(format!(
                    "runtime instance {} already exists",
                    runtime.id
                )));
            }
            if let Some(existing) = record.runtime_instance_by_activeness(runtime.is_active) {
                return Err(StateError::invalid(format!(
                    "meta-instance {} already has {} runtime instance {}",
                    record.metadata.id,
                    activeness(runtime.is_active),
                    existing.id
                )));
            }

            let plan = live_plan(tx, &record.deployment_plan_id)?;
            let mut node: Node = tx
                .get(&runtime.node_id)?
                .ok_or_else(|| StateError::not_found(format!("node {}", runtime.node_id)))?;
            node.reserve(Placement {
                runtime_instance_id: runtime.id.clone(),
                meta_instance_id: record.metadata.id.clone(),
                payloads: plan.payload_names(),
                resources: plan.requirements(),
            })?;
            tx.put(&node)?;

            record.runtime_instances.push(runtime.clone());
            Ok(())
        })?;
        info!(
            meta_instance_id = %record.metadata.id,
            runtime_instance_id = %runtime.id,
            node_id = %runtime.node_id,
            is_active = runtime.is_active,
            "runtime instance added"
        );
        Ok(record)
    }

    /// Record substrate state reported for a runtime instance.
    pub fn update_runtime_status(
        &self,
        metadata: &Metadata,
        runtime_instance_id: &str,
        status: Status<RuntimeState>,
    ) -> StateResult<MetaInstance> {
        let state = status.state;
        let record = self.mutate(metadata, |record: &mut MetaInstance, _| {
            find_runtime(record, runtime_instance_id)?.status = status;
            Ok(())
        })?;
        debug!(
            meta_instance_id = %record.metadata.id,
            %runtime_instance_id,
            ?state,
            "runtime status updated"
        );
        Ok(record)
    }

    /// Flip a runtime instance between active and passive.
    pub fn update_runtime_active_state(
        &self,
        metadata: &Metadata,
        runtime_instance_id: &str,
        is_active: bool,
    ) -> StateResult<MetaInstance> {
        let record = self.mutate(metadata, |record: &mut MetaInstance, _| {
            if let Some(other) = record
                .runtime_instances
                .iter()
                .find(|ri| ri.is_active == is_active && ri.id != runtime_instance_id)
            {
                return Err(StateError::invalid(format!(
                    "meta-instance {} already has {} runtime instance {}",
                    record.metadata.id,
                    activeness(is_active),
                    other.id
                )));
            }
            find_runtime(record, runtime_instance_id)?.is_active = is_active;
            Ok(())
        })?;
        info!(
            meta_instance_id = %record.metadata.id,
            %runtime_instance_id,
            is_active,
            "runtime instance activeness changed"
        );
        Ok(record)
    }

    /// Detach a runtime instance and return its capacity to the node.
    pub fn remove_runtime_instance(
        &self,
        metadata: &Metadata,
        runtime_instance_id: &str,
    ) -> StateResult<MetaInstance> {
        let record = self.mutate(metadata, |record: &mut MetaInstance, tx| {
            let idx = record
                .runtime_instances
                .iter()
                .position(|ri| ri.id == runtime_instance_id)
                .ok_or_else(|| {
                    StateError::not_found(format!("runtime instance {runtime_instance_id}"))
                })?;
            let runtime = record.runtime_instances.remove(idx);
            release_placement(tx, &runtime)
        })?;
        info!(
            meta_instance_id = %record.metadata.id,
            %runtime_instance_id,
            "runtime instance removed"
        );
        Ok(record)
    }

    pub fn add_operation(
        &self,
        metadata: &Metadata,
        operation: Operation,
    ) -> StateResult<MetaInstance> {
        require("operation intent id", &operation.intent_id)?;
        let record = self.mutate(metadata, |record: &mut MetaInstance, _| {
            if record.operation(&operation.id).is_some() {
                return Err(StateError::invalid(format!(
                    "operation {} already exists",
                    operation.id
                )));
            }
            record.operations.push(operation.clone());
            Ok(())
        })?;
        info!(
            meta_instance_id = %record.metadata.id,
            operation_id = %operation.id,
            operation_type = ?operation.operation_type,
            intent_id = %operation.intent_id,
            "operation added"
        );
        Ok(record)
    }

    /// Move an operation along its transition table.
    pub fn update_operation_status(
        &self,
        metadata: &Metadata,
        operation_id: &str,
        status: Status<OperationState>,
    ) -> StateResult<MetaInstance> {
        let table = self.child_transitions();
        let target = status.state;
        let record = self.mutate(metadata, |record: &mut MetaInstance, _| {
            let operation = record
                .operations
                .iter_mut()
                .find(|op| op.id == operation_id)
                .ok_or_else(|| StateError::not_found(format!("operation {operation_id}")))?;
            table.check("operation", operation.status.state, target)?;
            operation.status = status;
            Ok(())
        })?;
        info!(
            meta_instance_id = %record.metadata.id,
            %operation_id,
            state = ?target,
            version = record.metadata.version,
            "operation status updated"
        );
        Ok(record)
    }

    pub fn remove_operation(
        &self,
        metadata: &Metadata,
        operation_id: &str,
    ) -> StateResult<MetaInstance> {
        let record = self.mutate(metadata, |record: &mut MetaInstance, _| {
            let before = record.operations.len();
            record.operations.retain(|op| op.id != operation_id);
            if record.operations.len() == before {
                return Err(StateError::not_found(format!("operation {operation_id}")));
            }
            Ok(())
        })?;
        info!(meta_instance_id = %record.metadata.id, %operation_id, "operation removed");
        Ok(record)
    }

    /// Assign the meta-instance to a deployment of its plan.
    pub fn update_deployment_id(
        &self,
        metadata: &Metadata,
        deployment_id: &str,
    ) -> StateResult<MetaInstance> {
        require("deployment id", deployment_id)?;
        let record = self.mutate(metadata, |record: &mut MetaInstance, tx| {
            let plan = live_plan(tx, &record.deployment_plan_id)?;
            ensure_deployment(&plan, deployment_id)?;
            record.deployment_id = Some(deployment_id.to_string());
            Ok(())
        })?;
        info!(meta_instance_id = %record.metadata.id, %deployment_id, "deployment assigned");
        Ok(record)
    }
}

fn live_plan(tx: &Tx<'_>, plan_id: &str) -> StateResult<DeploymentPlan> {
    match tx.get::<DeploymentPlan>(plan_id)? {
        Some(plan) if !plan.metadata.is_deleted => Ok(plan),
        _ => Err(StateError::invalid(format!("unknown deployment plan {plan_id}"))),
    }
}

fn ensure_deployment(plan: &DeploymentPlan, deployment_id: &str) -> StateResult<()> {
    if plan.deployment(deployment_id).is_none() {
        return Err(StateError::invalid(format!(
            "deployment plan {} has no deployment {deployment_id}",
            plan.metadata.id
        )));
    }
    Ok(())
}

fn find_runtime<'a>(
    record: &'a mut MetaInstance,
    id: &str,
) -> StateResult<&'a mut RuntimeInstance> {
    record
        .runtime_instances
        .iter_mut()
        .find(|ri| ri.id == id)
        .ok_or_else(|| StateError::not_found(format!("runtime instance {id}")))
}

fn release_placement(tx: &Tx<'_>, runtime: &RuntimeInstance) -> StateResult<()> {
    if let Some(mut node) = tx.get::<Node>(&runtime.node_id)?
        && node.release(&runtime.id)
    {
        tx.put(&node)?;
    }
    Ok(())
}

fn activeness(is_active: bool) -> &'static str {
    if is_active { "an active" } else { "a passive" }
}
