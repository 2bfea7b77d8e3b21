//! Scheduler: allocates runtime instances for meta-instances.

use tracing::{debug, info};

use fleet_state::*;

use crate::error::{SchedulerError, SchedulerResult};
use crate::placement::{Requirements, first_fit};

/// First-fit scheduler over the node ledger.
#[derive(Clone)]
pub struct Scheduler {
    nodes: Ledger<Node>,
    plans: Ledger<DeploymentPlan>,
    instances: Ledger<MetaInstance>,
}

impl Scheduler {
    pub fn new(
        nodes: Ledger<Node>,
        plans: Ledger<DeploymentPlan>,
        instances: Ledger<MetaInstance>,
    ) -> Self {
        Self {
            nodes,
            plans,
            instances,
        }
    }

    /// Ensure the meta-instance has a runtime instance with the given
    /// activeness, placing a new one if needed.
    ///
    /// Idempotent: an existing runtime instance with matching `is_active`
    /// is returned unchanged, also when a concurrent call placed it first.
    /// Fails with `NoNodesAvailable` when no node qualifies, and with a
    /// ledger conflict when the chosen node was consumed by a concurrent
    /// allocation for another meta-instance.
    pub fn allocate_runtime_instance(
        &self,
        meta_instance_id: &str,
        is_active: bool,
    ) -> SchedulerResult<RuntimeInstance> {
        let instance = self.instances.get_by_id(meta_instance_id)?;
        if let Some(existing) = already_allocated(&instance, is_active) {
            return Ok(existing);
        }

        let plan = self.plans.get_by_id(&instance.deployment_plan_id)?;
        let requirements = Requirements::for_plan(&plan);
        let candidates = self.nodes.list(&requirements.node_filter())?;
        let node = first_fit(&candidates, &requirements).ok_or_else(|| {
            SchedulerError::NoNodesAvailable {
                meta_instance_id: meta_instance_id.to_string(),
                required: requirements.resources,
                payloads: requirements.payloads.clone(),
            }
        })?;
        debug!(
            %meta_instance_id,
            node_id = %node.metadata.id,
            candidates = candidates.len(),
            "node selected"
        );

        // A concurrent allocation may have committed since the first read.
        let instance = self.instances.get_by_id(meta_instance_id)?;
        if let Some(existing) = already_allocated(&instance, is_active) {
            return Ok(existing);
        }
        let runtime = RuntimeInstance::pending(node.metadata.id.clone(), is_active);
        match self
            .instances
            .add_runtime_instance(&instance.metadata, runtime.clone())
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                let instance = self.instances.get_by_id(meta_instance_id)?;
                return match already_allocated(&instance, is_active) {
                    Some(existing) => Ok(existing),
                    None => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            %meta_instance_id,
            runtime_instance_id = %runtime.id,
            node_id = %runtime.node_id,
            is_active,
            cores = requirements.resources.cores,
            memory = requirements.resources.memory,
            "runtime instance allocated"
        );
        Ok(runtime)
    }
}

fn already_allocated(instance: &MetaInstance, is_active: bool) -> Option<RuntimeInstance> {
    let existing = instance.runtime_instance_by_activeness(is_active)?;
    debug!(
        meta_instance_id = %instance.metadata.id,
        runtime_instance_id = %existing.id,
        is_active,
        "runtime instance already allocated"
    );
    Some(existing.clone())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    struct Fleet {
        nodes: Ledger<Node>,
        plans: Ledger<DeploymentPlan>,
        instances: Ledger<MetaInstance>,
        scheduler: Scheduler,
    }

    fn fleet() -> Fleet {
        let store = StateStore::open_in_memory().unwrap();
        let nodes = Ledger::with_default_transitions(store.clone());
        let plans = Ledger::with_default_transitions(store.clone());
        let instances = Ledger::with_default_transitions(store);
        let scheduler = Scheduler::new(nodes.clone(), plans.clone(), instances.clone());
        Fleet {
            nodes,
            plans,
            instances,
            scheduler,
        }
    }

    impl Fleet {
        fn node(&self, name: &str, total: Resources, reserved: Resources) -> Node {
            let node = self
                .nodes
                .create(NewNode {
                    name: name.into(),
                    update_domain: "ud-1".into(),
                    total_resources: total,
                    system_reserved_resources: reserved,
                    ..Default::default()
                })
                .unwrap();
            let node = self
                .nodes
                .update_status(
                    &node.metadata,
                    NodeStatusUpdate::in_cluster(NodeState::Allocating, "c1"),
                )
                .unwrap();
            self.nodes
                .update_status(
                    &node.metadata,
                    NodeStatusUpdate::in_cluster(NodeState::Allocated, "c1"),
                )
                .unwrap()
        }

        fn plan(
            &self,
            name: &str,
            payload: &str,
            needs: Resources) -> (DeploymentPlan, Deployment,
        ) {
            let plan = self
                .plans
                .create(NewDeploymentPlan {
                    name: name.into(),
                    namespace: "default".into(),
                    service_name: name.into(),
                    matching_compute_capabilities: vec![],
                    applications: vec![Application {
                        payload_name: payload.into(),
                        resources: needs,
                    }],
                })
                .unwrap();
            self.plans
                .add_deployment(
                    &plan.metadata,
                    NewDeployment {
                        payload_coordinates: vec![PayloadCoordinate {
                            payload_name: payload.into(),
                            uri: format!("registry.local/{payload}:1"),
                        }],
                        instance_count: 1,
                    },
                )
                .unwrap()
        }

        fn meta_instance(
            &self,
            name: &str,
            plan: &DeploymentPlan,
            deployment: &Deployment,
        ) -> MetaInstance {
            self.instances
                .create(NewMetaInstance {
                    name: name.into(),
                    deployment_plan_id: plan.metadata.id.clone(),
                    deployment_id: Some(deployment.id.clone()),
                })
                .unwrap()
        }

        fn remaining(&self, node: &Node) -> Resources {
            self.nodes.get_by_id(&node.metadata.id).unwrap().remaining_resources
        }
    }

    #[test]
    fn allocation_consumes_node_capacity() {
        let f = fleet();
        let node = f.node("n1", Resources::new(64, 512), Resources::new(4, 32));
        assert_eq!(node.remaining_resources, Resources::new(60, 480));
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(1, 0));
        let mi = f.meta_instance("mi-1", &plan, &deployment);

        let runtime = f
            .scheduler
            .allocate_runtime_instance(&mi.metadata.id, true)
            .unwrap();
        assert_eq!(runtime.node_id, node.metadata.id);
        assert!(runtime.is_active);
        assert_eq!(runtime.status.state, RuntimeState::Pending);
        assert_eq!(f.remaining(&node), Resources::new(59, 480));

        let stored = f.instances.get_by_id(&mi.metadata.id).unwrap();
        assert_eq!(stored.runtime_instances, vec![runtime]);
        assert_eq!(stored.metadata.version, mi.metadata.version + 1);
    }

    #[test]
    fn allocation_is_idempotent() {
        let f = fleet();
        let node = f.node("n1", Resources::new(64, 512), Resources::new(4, 32));
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(1, 0));
        let mi = f.meta_instance("mi-1", &plan, &deployment);

        let first = f.scheduler.allocate_runtime_instance(&mi.metadata.id, true).unwrap();
        let second = f.scheduler.allocate_runtime_instance(&mi.metadata.id, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(f.remaining(&node), Resources::new(59, 480));
        assert_eq!(f.instances.get_by_id(&mi.metadata.id).unwrap().runtime_instances.len(), 1);
    }

    #[test]
    fn never_places_the_same_payload_twice_on_a_node() {
        let f = fleet();
        let a = f.node("a", Resources::new(8, 64), Resources::ZERO);
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(1, 0));
        let first = f.meta_instance("mi-1", &plan, &deployment);
        let second = f.meta_instance("mi-2", &plan, &deployment);

        let placed = f.scheduler.allocate_runtime_instance(&first.metadata.id, true).unwrap();
        assert_eq!(placed.node_id, a.metadata.id);

        let err = f
            .scheduler
            .allocate_runtime_instance(&second.metadata.id, true)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoNodesAvailable { .. }));
        assert!(!err.is_retryable());

        let b = f.node("b", Resources::new(8, 64), Resources::ZERO);
        let placed = f.scheduler.allocate_runtime_instance(&second.metadata.id, true).unwrap();
        assert_eq!(placed.node_id, b.metadata.id);
    }

    #[test]
    fn passive_instance_goes_to_another_node() {
        let f = fleet();
        let a = f.node("a", Resources::new(8, 64), Resources::ZERO);
        let b = f.node("b", Resources::new(8, 64), Resources::ZERO);
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(2, 16));
        let mi = f.meta_instance("mi-1", &plan, &deployment);

        let active = f.scheduler.allocate_runtime_instance(&mi.metadata.id, true).unwrap();
        let passive = f.scheduler.allocate_runtime_instance(&mi.metadata.id, false).unwrap();
        assert_ne!(active.node_id, passive.node_id);
        assert!(!passive.is_active);
        for node in [&a, &b] {
            assert_eq!(f.remaining(node), Resources::new(6, 48));
        }
    }

    #[test]
    fn insufficient_capacity_is_skipped() {
        let f = fleet();
        let small = f.node("a-small", Resources::new(2, 64), Resources::new(1, 0));
        let big = f.node("b-big", Resources::new(16, 64), Resources::ZERO);
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(4, 32));
        let mi = f.meta_instance("mi-1", &plan, &deployment);

        let runtime = f.scheduler.allocate_runtime_instance(&mi.metadata.id, true).unwrap();
        assert_eq!(runtime.node_id, big.metadata.id);
        assert_eq!(f.remaining(&small), Resources::new(1, 64));
        assert_eq!(f.remaining(&big), Resources::new(12, 32));
    }

    #[test]
    fn only_allocated_nodes_are_candidates() {
        let f = fleet();
        f.nodes
            .create(NewNode {
                name: "fresh".into(),
                total_resources: Resources::new(64, 512),
                ..Default::default()
            })
            .unwrap();
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(1, 0));
        let mi = f.meta_instance("mi-1", &plan, &deployment);

        let err = f.scheduler.allocate_runtime_instance(&mi.metadata.id, true).unwrap_err();
        assert!(matches!(err, SchedulerError::NoNodesAvailable { .. }));
    }

    #[test]
    fn unknown_meta_instance_is_not_found() {
        let f = fleet();
        let err = f.scheduler.allocate_runtime_instance("missing", true).unwrap_err();
        assert!(matches!(err, SchedulerError::State(StateError::RecordNotFound(_))));
    }

    #[test]
    fn concurrent_allocations_agree_on_one_instance() {
        let f = fleet();
        let rounds = 40;
        for i in 0..rounds {
            f.node(&format!("n{i:02}"), Resources::new(8, 64), Resources::ZERO);
        }
        let (plan, deployment) = f.plan("checkout", "api", Resources::new(1, 8));

        for round in 0..rounds {
            let mi = f.meta_instance(&format!("mi-{round}"), &plan, &deployment);
            let barrier = Arc::new(Barrier::new(2));
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let scheduler = f.scheduler.clone();
                    let barrier = Arc::clone(&barrier);
                    let id = mi.metadata.id.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        scheduler.allocate_runtime_instance(&id, true)
                    })
                })
                .collect();
            let placed: Vec<RuntimeInstance> = workers
                .into_iter()
                .map(|worker| worker.join().unwrap().unwrap())
                .collect();

            let stored = f.instances.get_by_id(&mi.metadata.id).unwrap();
            assert_eq!(stored.runtime_instances.len(), 1, "round {round}");
            assert_eq!(placed[0], stored.runtime_instances[0]);
            assert_eq!(placed[1], stored.runtime_instances[0]);
        }
    }
}
