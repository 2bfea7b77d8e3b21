//! Deployment plans and their child deployments.

use std::collections::HashSet;

use redb::TableDefinition;
use tracing::info;

use super::{Entity, Ledger, require};
use crate::error::{StateError, StateResult};
use crate::filter::{Membership, RecordQuery};
use crate::store::{Record, Tx};
use crate::tables::*;
use crate::transitions::{self, TransitionTable};
use crate::types::*;

#[derive(Debug, Clone, Default)]
pub struct NewDeploymentPlan {
    pub name: String,
    pub namespace: String,
    pub service_name: String,
    pub matching_compute_capabilities: Vec<RecordId>,
    pub applications: Vec<Application>,
}

/// Input to [`Ledger::<DeploymentPlan>::add_deployment`].
#[derive(Debug, Clone, Default)]
pub struct NewDeployment {
    pub payload_coordinates: Vec<PayloadCoordinate>,
    pub instance_count: u32,
}

/// Extra criteria for listing deployment plans.
#[derive(Debug, Clone, Default)]
pub struct PlanQuery {
    pub namespaces: Membership<String>,
    pub service_names: Membership<String>,
    /// Admit plans holding at least one deployment in any of these states.
    pub deployment_states: Vec<DeploymentState>,
}

impl RecordQuery<DeploymentPlan> for PlanQuery {
    fn matches(&self, plan: &DeploymentPlan) -> bool {
        self.namespaces.admits(&plan.namespace)
            && self.service_names.admits(&plan.service_name)
            && (self.deployment_states.is_empty()
                || plan
                    .deployments
                    .iter()
                    .any(|d| self.deployment_states.contains(&d.status.state)))
    }
}

impl Record for DeploymentPlan {
    const KIND: &'static str = "deployment plan";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = DEPLOYMENT_PLANS;
    const NAMES: TableDefinition<'static, &'static str, &'static str> = DEPLOYMENT_PLAN_NAMES;

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

impl Entity for DeploymentPlan {
    type State = PlanState;
    type CreateRequest = NewDeploymentPlan;
    type StatusUpdate = Status<PlanState>;
    type Query = PlanQuery;
    type ChildTransitions = TransitionTable<DeploymentState>;

    fn state(&self) -> PlanState {
        self.status.state
    }

    fn build(request: NewDeploymentPlan) -> StateResult<Self> {
        require("deployment plan name", &request.name)?;
        require("namespace", &request.namespace)?;
        require("service name", &request.service_name)?;
        if request.applications.is_empty() {
            return Err(StateError::invalid("a deployment plan needs at least one application"));
        }
        let mut seen = HashSet::new();
        for app in &request.applications {
            require("application payload name", &app.payload_name)?;
            if !seen.insert(app.payload_name.as_str()) {
                return Err(StateError::invalid(format!(
                    "payload {:?} is declared twice",
                    app.payload_name
                )));
            }
        }
        Ok(DeploymentPlan {
            metadata: Metadata::fresh(),
            name: request.name,
            status: Status::new(PlanState::Active),
            namespace: request.namespace,
            service_name: request.service_name,
            matching_compute_capabilities: request.matching_compute_capabilities,
            applications: request.applications,
            deployments: Vec::new(),
        })
    }

    fn check_references(&self, tx: &Tx<'_>) -> StateResult<()> {
        for capability_id in &self.matching_compute_capabilities {
            let capability: Option<ComputeCapability> = tx.get(capability_id)?;
            if !capability.is_some_and(|c| !c.metadata.is_deleted) {
                return Err(StateError::invalid(format!(
                    "unknown compute capability {capability_id}"
                )));
            }
        }
        Ok(())
    }

    fn target_state(update: &Status<PlanState>) -> PlanState {
        update.state
    }

    fn apply_status(&mut self, update: Status<PlanState>) -> StateResult<()> {
        self.status = update;
        Ok(())
    }

    fn default_transitions() -> TransitionTable<PlanState> {
        transitions::deployment_plan()
    }

    fn default_child_transitions() -> TransitionTable<DeploymentState> {
        transitions::deployment()
    }
}

impl Ledger<DeploymentPlan> {
    /// Append a Pending deployment to a plan.
    ///
    /// Every application must get exactly one payload coordinate and no
    /// deployment of the plan may be InProgress.
    pub fn add_deployment(
        &self,
        metadata: &Metadata,
        request: NewDeployment,
    ) -> StateResult<(DeploymentPlan, Deployment)> {
        let deployment = Deployment {
            id: new_id(),
            status: Status::new(DeploymentState::Pending),
            payload_coordinates: request.payload_coordinates,
            instance_count: request.instance_count,
        };
        let plan = self.mutate(metadata, |plan: &mut DeploymentPlan, _| {
            if let Some(running) = plan.in_progress_deployment() {
                return Err(StateError::invalid(format!(
                    "deployment {} of plan {} is still in progress",
                    running.id, plan.metadata.id
                )));
            }
            check_coordinates(plan, &deployment.payload_coordinates)?;
            plan.deployments.push(deployment.clone());
            Ok(())
        })?;
        info!(
            plan_id = %plan.metadata.id,
            deployment_id = %deployment.id,
            instance_count = deployment.instance_count,
            "deployment added"
        );
        Ok((plan, deployment))
    }

    /// Move one deployment of a plan to a new status.
    pub fn update_deployment_status(
        &self,
        metadata: &Metadata,
        deployment_id: &str,
        status: Status<DeploymentState>,
    ) -> StateResult<DeploymentPlan> {
        let table = self.child_transitions();
        let target = status.state;
        let plan = self.mutate(metadata, |plan: &mut DeploymentPlan, _| {
            if target == DeploymentState::InProgress
                && let Some(running) = plan.in_progress_deployment()
                && running.id != deployment_id
            {
                return Err(StateError::invalid(format!(
                    "deployment {} of plan {} is already in progress",
                    running.id, plan.metadata.id
                )));
            }
            let deployment = plan
                .deployments
                .iter_mut()
                .find(|d| d.id == deployment_id)
                .ok_or_else(|| StateError::not_found(format!("deployment {deployment_id}")))?;
            table.check("deployment", deployment.status.state, target)?;
            deployment.status = status;
            Ok(())
        })?;
        info!(
            plan_id = %plan.metadata.id,
            %deployment_id,
            state = ?target,
            version = plan.metadata.version,
            "deployment status updated"
        );
        Ok(plan)
    }
}

fn check_coordinates(plan: &DeploymentPlan, coordinates: &[PayloadCoordinate]) -> StateResult<()> {
    let mut seen = HashSet::new();
    for coordinate in coordinates {
        require("payload coordinate uri", &coordinate.uri)?;
        if !seen.insert(coordinate.payload_name.as_str()) {
            return Err(StateError::invalid(format!(
                "payload {:?} has more than one coordinate",
                coordinate.payload_name
            )));
        }
        if !plan
            .applications
            .iter()
            .any(|app| app.payload_name == coordinate.payload_name)
        {
            return Err(StateError::invalid(format!(
                "payload {:?} is not declared by plan {}",
                coordinate.payload_name, plan.metadata.id
            )));
        }
    }
    if let Some(missing) = plan
        .applications
        .iter()
        .find(|app| !seen.contains(app.payload_name.as_str()))
    {
        return Err(StateError::invalid(format!(
            "no payload coordinate for application {:?}",
            missing.payload_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ListFilter;
    use crate::store::StateStore;

    fn plans() -> Ledger<DeploymentPlan> {
        Ledger::with_default_transitions(StateStore::open_in_memory().unwrap())
    }

    fn app(payload: &str, cores: u64, memory: u64) -> Application {
        Application {
            payload_name: payload.to_string(),
            resources: Resources::new(cores, memory),
        }
    }

    fn new_plan(name: &str) -> NewDeploymentPlan {
        NewDeploymentPlan {
            name: name.to_string(),
            namespace: "default".to_string(),
            service_name: "checkout".to_string(),
            matching_compute_capabilities: vec![],
            applications: vec![app("api", 1, 256), app("sidecar", 0, 64)],
        }
    }

    fn coordinates(version: &str) -> Vec<PayloadCoordinate> {
        ["api", "sidecar"]
            .iter()
            .map(|payload| PayloadCoordinate {
                payload_name: payload.to_string(),
                uri: format!("registry.local/{payload}:{version}"),
            })
            .collect()
    }

    fn new_deployment(version: &str, count: u32) -> NewDeployment {
        NewDeployment {
            payload_coordinates: coordinates(version),
            instance_count: count,
        }
    }

    #[test]
    fn create_validates_required_fields() {
        let ledger = plans();

        let mut request = new_plan("p");
        request.namespace.clear();
        assert!(matches!(
            ledger.create(request).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        let mut request = new_plan("p");
        request.applications.clear();
        assert!(matches!(
            ledger.create(request).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        let mut request = new_plan("p");
        request.applications.push(app("api", 1, 1));
        assert!(matches!(
            ledger.create(request).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        let plan = ledger.create(new_plan("p")).unwrap();
        assert_eq!(plan.status.state, PlanState::Active);
        assert!(plan.deployments.is_empty());
    }

    #[test]
    fn add_deployment_bumps_version() {
        let ledger = plans();
        let plan = ledger.create(new_plan("p")).unwrap();

        let (updated, deployment) = ledger
            .add_deployment(&plan.metadata, new_deployment("1.0", 3))
            .unwrap();
        assert_eq!(updated.metadata.version, plan.metadata.version + 1);
        assert_eq!(deployment.status.state, DeploymentState::Pending);
        assert_eq!(updated.deployment(&deployment.id), Some(&deployment));

        // The old token is stale now.
        let err = ledger
            .add_deployment(&plan.metadata, new_deployment("1.1", 3))
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn add_deployment_checks_coordinates() {
        let ledger = plans();
        let plan = ledger.create(new_plan("p")).unwrap();

        let mut missing = new_deployment("1.0", 1);
        missing.payload_coordinates.pop();
        assert!(matches!(
            ledger.add_deployment(&plan.metadata, missing).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        let mut duplicated = new_deployment("1.0", 1);
        duplicated.payload_coordinates.push(duplicated.payload_coordinates[0].clone());
        assert!(matches!(
            ledger.add_deployment(&plan.metadata, duplicated).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        let mut unknown = new_deployment("1.0", 1);
        unknown.payload_coordinates.push(PayloadCoordinate {
            payload_name: "cron".into(),
            uri: "registry.local/cron:1".into(),
        });
        assert!(matches!(
            ledger.add_deployment(&plan.metadata, unknown).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        // Nothing was written.
        assert_eq!(ledger.get_by_id(&plan.metadata.id).unwrap().metadata.version, 0);
    }

    #[test]
    fn only_one_deployment_in_progress() {
        let ledger = plans();
        let plan = ledger.create(new_plan("p")).unwrap();
        let (plan, first) = ledger
            .add_deployment(&plan.metadata, new_deployment("1.0", 1))
            .unwrap();
        let (plan, second) = ledger
            .add_deployment(&plan.metadata, new_deployment("1.1", 1))
            .unwrap();

        let plan = ledger
            .update_deployment_status(
                &plan.metadata,
                &first.id,
                Status::new(DeploymentState::InProgress),
            )
            .unwrap();
        assert_eq!(plan.in_progress_deployment().map(|d| d.id.as_str()), Some(first.id.as_str()));

        let err = ledger
            .update_deployment_status(
                &plan.metadata,
                &second.id,
                Status::new(DeploymentState::InProgress),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));

        let err = ledger
            .add_deployment(&plan.metadata, new_deployment("1.2", 1))
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));

        let plan = ledger
            .update_deployment_status(
                &plan.metadata,
                &first.id,
                Status::with_message(DeploymentState::Completed, "1/1 operations succeeded"),
            )
            .unwrap();
        ledger
            .update_deployment_status(
                &plan.metadata,
                &second.id,
                Status::new(DeploymentState::InProgress),
            )
            .unwrap();
    }

    #[test]
    fn deployment_transitions_are_checked() {
        let ledger = plans();
        let plan = ledger.create(new_plan("p")).unwrap();
        let (plan, deployment) = ledger
            .add_deployment(&plan.metadata, new_deployment("1.0", 1))
            .unwrap();

        let err = ledger
            .update_deployment_status(
                &plan.metadata,
                &deployment.id,
                Status::new(DeploymentState::Completed),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));

        let err = ledger
            .update_deployment_status(
                &plan.metadata,
                "missing",
                Status::new(DeploymentState::Cancelled),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RecordNotFound(_)));

        let plan = ledger
            .update_deployment_status(
                &plan.metadata,
                &deployment.id,
                Status::new(DeploymentState::Cancelled),
            )
            .unwrap();
        let err = ledger
            .update_deployment_status(
                &plan.metadata,
                &deployment.id,
                Status::new(DeploymentState::InProgress),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));
    }

    #[test]
    fn terminal_deployments_accumulate() {
        let ledger = plans();
        let mut plan = ledger.create(new_plan("p")).unwrap();
        for i in 0..5 {
            let (next, deployment) = ledger
                .add_deployment(&plan.metadata, new_deployment(&format!("1.{i}"), 1))
                .unwrap();
            plan = ledger
                .update_deployment_status(
                    &next.metadata,
                    &deployment.id,
                    Status::new(DeploymentState::Cancelled),
                )
                .unwrap();
        }
        assert_eq!(plan.deployments.len(), 5);
        assert!(plan.deployments.iter().all(|d| d.status.state.is_terminal()));
    }

    #[test]
    fn query_by_namespace_and_deployment_state() {
        let ledger = plans();
        let a = ledger.create(new_plan("a")).unwrap();
        let mut other = new_plan("b");
        other.namespace = "batch".into();
        ledger.create(other).unwrap();
        ledger.add_deployment(&a.metadata, new_deployment("1.0", 2)).unwrap();

        let pending = ledger
            .list(&ListFilter::new().query(PlanQuery {
                deployment_states: vec![DeploymentState::Pending],
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "a");

        let batch = ledger
            .list(&ListFilter::new().query(PlanQuery {
                namespaces: Membership {
                    include: vec!["batch".into()],
                    exclude: vec![],
                },
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "b");
    }

    #[test]
    fn inactive_plans_filtered_by_state() {
        let ledger = plans();
        let a = ledger.create(new_plan("a")).unwrap();
        ledger.create(new_plan("b")).unwrap();
        ledger
            .update_status(&a.metadata, Status::new(PlanState::Inactive))
            .unwrap();

        let active = ledger
            .list(&ListFilter::new().state_in([PlanState::Active]))
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "b");
    }
}
