//! Nodes: lifecycle, cluster membership and capacity accounting.

use redb::TableDefinition;

use super::{Entity, require};
use crate::error::{StateError, StateResult};
use crate::filter::{Membership, Range, RecordQuery};
use crate::store::{Record, Tx};
use crate::tables::*;
use crate::transitions::{self, TransitionTable};
use crate::types::*;

#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    pub update_domain: String,
    pub total_resources: Resources,
    pub system_reserved_resources: Resources,
    pub capability_ids: Vec<RecordId>,
    pub local_volumes: Vec<LocalVolume>,
    pub disruptions: Vec<Disruption>,
}

/// Node status change. `cluster_id` must be supplied exactly when the
/// target state is Allocating or Allocated.
#[derive(Debug, Clone)]
pub struct NodeStatusUpdate {
    pub status: Status<NodeState>,
    pub cluster_id: Option<RecordId>,
}

impl NodeStatusUpdate {
    pub fn new(state: NodeState) -> Self {
        Self {
            status: Status::new(state),
            cluster_id: None,
        }
    }

    pub fn in_cluster(state: NodeState, cluster_id: impl Into<RecordId>) -> Self {
        Self {
            status: Status::new(state),
            cluster_id: Some(cluster_id.into()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status.message = message.into();
        self
    }
}

/// Extra criteria for listing nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    pub cluster_ids: Membership<RecordId>,
    pub update_domains: Membership<String>,
    pub remaining_cores: Range,
    pub remaining_memory: Range,
    pub total_cores: Range,
    pub total_memory: Range,
    /// Reject nodes already hosting any of these payloads.
    pub without_payloads: Vec<String>,
}

impl RecordQuery<Node> for NodeQuery {
    fn matches(&self, node: &Node) -> bool {
        let in_cluster = match &node.cluster_id {
            Some(cluster_id) => self.cluster_ids.admits(cluster_id),
            None => self.cluster_ids.include.is_empty(),
        };
        in_cluster
            && self.update_domains.admits(&node.update_domain)
            && self.remaining_cores.contains(node.remaining_resources.cores)
            && self.remaining_memory.contains(node.remaining_resources.memory)
            && self.total_cores.contains(node.total_resources.cores)
            && self.total_memory.contains(node.total_resources.memory)
            && !self
                .without_payloads
                .iter()
                .any(|payload| node.hosts_payload(payload))
    }
}

impl Record for Node {
    const KIND: &'static str = "node";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = NODES;
    const NAMES: TableDefinition<'static, &'static str, &'static str> = NODE_NAMES;

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

impl Entity for Node {
    type State = NodeState;
    type CreateRequest = NewNode;
    type StatusUpdate = NodeStatusUpdate;
    type Query = NodeQuery;
    type ChildTransitions = ();

    fn state(&self) -> NodeState {
        self.status.state
    }

    fn build(request: NewNode) -> StateResult<Self> {
        require("node name", &request.name)?;
        let remaining = request
            .total_resources
            .checked_sub(&request.system_reserved_resources)
            .ok_or_else(|| {
                StateError::invalid(format!(
                    "system reserved resources {:?} exceed total {:?}",
                    request.system_reserved_resources, request.total_resources
                ))
            })?;
        Ok(Node {
            metadata: Metadata::fresh(),
            name: request.name,
            status: Status::new(NodeState::Unallocated),
            cluster_id: None,
            update_domain: request.update_domain,
            total_resources: request.total_resources,
            system_reserved_resources: request.system_reserved_resources,
            remaining_resources: remaining,
            disruptions: request.disruptions,
            capability_ids: request.capability_ids,
            local_volumes: request.local_volumes,
            placements: Vec::new(),
        })
    }

    fn check_references(&self, tx: &Tx<'_>) -> StateResult<()> {
        for capability_id in &self.capability_ids {
            let capability: Option<ComputeCapability> = tx.get(capability_id)?;
            if !capability.is_some_and(|c| !c.metadata.is_deleted) {
                return Err(StateError::invalid(format!(
                    "unknown compute capability {capability_id}"
                )));
            }
        }
        Ok(())
    }

    fn target_state(update: &NodeStatusUpdate) -> NodeState {
        update.status.state
    }

    fn apply_status(&mut self, update: NodeStatusUpdate) -> StateResult<()> {
        let target = update.status.state;
        let cluster_id = update.cluster_id.filter(|id| !id.trim().is_empty());

        if target.requires_cluster() {
            let Some(cluster_id) = cluster_id else {
                return Err(StateError::invalid(format!(
                    "cluster id is required for a node moving to {target:?}"
                )));
            };
            if self.status.state.requires_cluster()
                && self.cluster_id.as_deref() != Some(cluster_id.as_str())
            {
                return Err(StateError::invalid(format!(
                    "cluster id of node {} is immutable while {:?}",
                    self.metadata.id, self.status.state
                )));
            }
            self.cluster_id = Some(cluster_id);
        } else {
            if cluster_id.is_some() {
                return Err(StateError::invalid(format!(
                    "cluster id is not allowed for a node moving to {target:?}"
                )));
            }
            self.cluster_id = None;
        }

        self.status = update.status;
        Ok(())
    }

    fn default_transitions() -> TransitionTable<NodeState> {
        transitions::node()
    }

    fn default_child_transitions() -> Self::ChildTransitions {}
}

impl Node {
    /// Claim capacity for a runtime instance and bump the node's version.
    ///
    /// Rejects with `RecordInsertConflict` when the node cannot take the
    /// placement any more, so the caller retries on another node.
    pub(crate) fn reserve(&mut self, placement: Placement) -> StateResult<()> {
        if self.metadata.is_deleted || self.status.state != NodeState::Allocated {
            return Err(StateError::conflict(format!(
                "node {} is not accepting placements",
                self.metadata.id
            )));
        }
        if let Some(payload) = placement.payloads.iter().find(|p| self.hosts_payload(p)) {
            return Err(StateError::conflict(format!(
                "node {} already hosts payload {payload:?}",
                self.metadata.id
            )));
        }
        self.remaining_resources = self
            .remaining_resources
            .checked_sub(&placement.resources)
            .ok_or_else(|| {
                StateError::conflict(format!(
                    "node {} has {:?} remaining, {:?} requested",
                    self.metadata.id, self.remaining_resources, placement.resources
                ))
            })?;
        self.placements.push(placement);
        self.metadata.version += 1;
        Ok(())
    }

    /// Return the capacity held by a runtime instance. No-op when the
    /// node holds nothing for it.
    pub(crate) fn release(&mut self, runtime_instance_id: &str) -> bool {
        let Some(idx) = self
            .placements
            .iter()
            .position(|p| p.runtime_instance_id == runtime_instance_id)
        else {
            return false;
        };
        let placement = self.placements.remove(idx);
        self.remaining_resources = self.remaining_resources.saturating_add(&placement.resources);
        self.metadata.version += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ListFilter;
    use crate::ledger::{Ledger, NewCapability};
    use crate::store::StateStore;

    fn nodes() -> Ledger<Node> {
        Ledger::with_default_transitions(StateStore::open_in_memory().unwrap())
    }

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.to_string(),
            update_domain: "ud-1".to_string(),
            total_resources: Resources::new(64, 512),
            system_reserved_resources: Resources::new(4, 32),
            ..Default::default()
        }
    }

    fn allocate(ledger: &Ledger<Node>, node: &Node, cluster: &str) -> Node {
        let node = ledger
            .update_status(
                &node.metadata,
                NodeStatusUpdate::in_cluster(NodeState::Allocating, cluster),
            )
            .unwrap();
        ledger
            .update_status(
                &node.metadata,
                NodeStatusUpdate::in_cluster(NodeState::Allocated, cluster),
            )
            .unwrap()
    }

    fn placement(ri: &str, payload: &str, cores: u64) -> Placement {
        Placement {
            runtime_instance_id: ri.to_string(),
            meta_instance_id: "mi-1".to_string(),
            payloads: vec![payload.to_string()],
            resources: Resources::new(cores, 0),
        }
    }

    #[test]
    fn create_computes_remaining() {
        let node = nodes().create(new_node("n1")).unwrap();
        assert_eq!(node.status.state, NodeState::Unallocated);
        assert_eq!(node.remaining_resources, Resources::new(60, 480));
        assert!(node.cluster_id.is_none());
    }

    #[test]
    fn create_rejects_overreserved_node() {
        let mut request = new_node("n1");
        request.system_reserved_resources = Resources::new(65, 0);
        let err = nodes().create(request).unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));
    }

    #[test]
    fn create_checks_capabilities_exist() {
        let store = StateStore::open_in_memory().unwrap();
        let capabilities: Ledger<ComputeCapability> =
            Ledger::with_default_transitions(store.clone());
        let ledger: Ledger<Node> = Ledger::with_default_transitions(store);

        let mut request = new_node("n1");
        request.capability_ids = vec!["missing".into()];
        assert!(matches!(
            ledger.create(request).unwrap_err(),
            StateError::RequestInvalid(_)
        ));

        let gpu = capabilities
            .create(NewCapability {
                name: "gpu".into(),
                capability_type: "gpu".into(),
                score: 1,
            })
            .unwrap();
        let mut request = new_node("n1");
        request.capability_ids = vec![gpu.metadata.id.clone()];
        assert_eq!(ledger.create(request).unwrap().capability_ids, vec![gpu.metadata.id]);
    }

    #[test]
    fn allocating_requires_cluster_id() {
        let ledger = nodes();
        let node = ledger.create(new_node("n1")).unwrap();

        let err = ledger
            .update_status(&node.metadata, NodeStatusUpdate::new(NodeState::Allocating))
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));

        let err = ledger
            .update_status(
                &node.metadata,
                NodeStatusUpdate::in_cluster(NodeState::Allocating, " "),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));

        let allocated = allocate(&ledger, &node, "c1");
        assert_eq!(allocated.cluster_id.as_deref(), Some("c1"));
        assert_eq!(allocated.metadata.version, 2);
    }

    #[test]
    fn cluster_id_is_immutable_once_allocating() {
        let ledger = nodes();
        let node = ledger.create(new_node("n1")).unwrap();
        let allocating = ledger
            .update_status(
                &node.metadata,
                NodeStatusUpdate::in_cluster(NodeState::Allocating, "c1"),
            )
            .unwrap();

        let err = ledger
            .update_status(
                &allocating.metadata,
                NodeStatusUpdate::in_cluster(NodeState::Allocated, "c2"),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));
    }

    #[test]
    fn cluster_id_forbidden_and_cleared_outside_allocation() {
        let ledger = nodes();
        let node = ledger.create(new_node("n1")).unwrap();
        let allocated = allocate(&ledger, &node, "c1");

        let err = ledger
            .update_status(
                &allocated.metadata,
                NodeStatusUpdate::in_cluster(NodeState::Evicted, "c1"),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));

        let evicted = ledger
            .update_status(
                &allocated.metadata,
                NodeStatusUpdate::new(NodeState::Evicted).with_message("hardware fault"),
            )
            .unwrap();
        assert!(evicted.cluster_id.is_none());
        assert_eq!(evicted.status.message, "hardware fault");
    }

    #[test]
    fn node_transition_table_is_enforced() {
        let ledger = nodes();
        let node = ledger.create(new_node("n1")).unwrap();
        let err = ledger
            .update_status(&node.metadata, NodeStatusUpdate::new(NodeState::Sanitizing))
            .unwrap_err();
        assert!(matches!(err, StateError::RequestInvalid(_)));
    }

    #[test]
    fn reserve_and_release_track_remaining() {
        let ledger = nodes();
        let node = ledger.create(new_node("n1")).unwrap();
        let mut node = allocate(&ledger, &node, "c1");
        let version = node.metadata.version;

        node.reserve(placement("ri-1", "api", 10)).unwrap();
        assert_eq!(node.remaining_resources, Resources::new(50, 480));
        assert_eq!(node.metadata.version, version + 1);
        assert_eq!(node.computed_remaining(), Some(node.remaining_resources));

        // Same payload again is refused (anti-affinity).
        let err = node.reserve(placement("ri-2", "api", 1)).unwrap_err();
        assert!(err.is_conflict());

        // Over-subscription is refused.
        let err = node.reserve(placement("ri-3", "worker", 51)).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(node.remaining_resources, Resources::new(50, 480));

        assert!(node.release("ri-1"));
        assert!(!node.release("ri-1"));
        assert_eq!(node.remaining_resources, Resources::new(60, 480));
    }

    #[test]
    fn reserve_requires_allocated_node() {
        let mut node = nodes().create(new_node("n1")).unwrap();
        assert!(node.reserve(placement("ri-1", "api", 1)).unwrap_err().is_conflict());
    }

    #[test]
    fn query_filters_by_capacity_cluster_and_payload() {
        let ledger = nodes();
        let a = ledger.create(new_node("a")).unwrap();
        let a = allocate(&ledger, &a, "c1");
        let b = ledger.create(new_node("b")).unwrap();
        allocate(&ledger, &b, "c2");
        let mut small = new_node("small");
        small.total_resources = Resources::new(8, 64);
        small.system_reserved_resources = Resources::ZERO;
        ledger.create(small).unwrap();

        let big = ledger
            .list(&ListFilter::new().query(NodeQuery {
                remaining_cores: Range::at_least(16),
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(big.len(), 2);

        let in_c1 = ledger
            .list(&ListFilter::new().query(NodeQuery {
                cluster_ids: Membership {
                    include: vec!["c1".into()],
                    exclude: vec![],
                },
                ..Default::default()
            }))
            .unwrap();
        assert_eq!(in_c1.len(), 1);
        assert_eq!(in_c1[0].metadata.id, a.metadata.id);

        // Give node a a placement through the repository.
        let store = ledger.store().clone();
        store
            .compare_and_swap(&a.metadata, |node: &mut Node, _| {
                node.placements.push(placement("ri-1", "api", 1));
                Ok(())
            })
            .unwrap();
        let free_of_api = ledger
            .list(
                &ListFilter::new()
                    .state_in([NodeState::Allocated])
                    .query(NodeQuery {
                        without_payloads: vec!["api".into()],
                        ..Default::default()
                    }),
            )
            .unwrap();
        assert_eq!(free_of_api.len(), 1);
        assert_eq!(free_of_api[0].name, "b");
    }
}
