//! Placement requirements and first-fit selection.

use fleet_state::{DeploymentPlan, ListFilter, Node, NodeQuery, NodeState, Range, Resources};

/// What one instance of a deployment plan needs from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirements {
    /// Sum of every application's cores and memory.
    pub resources: Resources,
    /// Payload names; a node may host each at most once.
    pub payloads: Vec<String>,
}

impl Requirements {
    pub fn for_plan(plan: &DeploymentPlan) -> Self {
        Self {
            resources: plan.requirements(),
            payloads: plan.payload_names(),
        }
    }

    /// Ledger filter selecting candidate nodes.
    pub fn node_filter(&self) -> ListFilter<Node> {
        ListFilter::new()
            .state_in([NodeState::Allocated])
            .query(NodeQuery {
                remaining_cores: Range::at_least(self.resources.cores),
                remaining_memory: Range::at_least(self.resources.memory),
                without_payloads: self.payloads.clone(),
                ..Default::default()
            })
    }

    pub fn admits(&self, node: &Node) -> bool {
        node.status.state == NodeState::Allocated
            && !node.metadata.is_deleted
            && node.remaining_resources.covers(&self.resources)
            && !self.payloads.iter().any(|p| node.hosts_payload(p))
    }
}

/// First node, in the given order, that satisfies `requirements`.
pub fn first_fit<'a>(candidates: &'a [Node], requirements: &Requirements) -> Option<&'a Node> {
    candidates.iter().find(|node| requirements.admits(node))
}
