//! Domain types for the fleet ledger.
//!
//! Every top-level record carries a [`Metadata`] token. Child records
//! (deployments, runtime instances, operations) live inside their parent
//! and are guarded by the parent's version.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a record or child record.
pub type RecordId = String;

/// Generate a fresh record ID.
pub fn new_id() -> RecordId {
    Uuid::new_v4().to_string()
}

// ── Shared ────────────────────────────────────────────────────────

/// Optimistic-concurrency token shared by all entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: RecordId,
    /// Compare-and-swap key; bumped by exactly one on every mutation.
    pub version: u64,
    pub is_deleted: bool,
}

impl Metadata {
    /// Metadata for a record that has never been persisted.
    pub fn fresh() -> Self {
        Self {
            id: new_id(),
            version: 0,
            is_deleted: false,
        }
    }
}

/// A state plus a free-form explanation of how it was reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status<S> {
    pub state: S,
    #[serde(default)]
    pub message: String,
}

impl<S> Status<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            message: String::new(),
        }
    }

    pub fn with_message(state: S, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }
}

/// Compute resources: cores and memory (MiB).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u64,
    pub memory: u64,
}

impl Resources {
    pub const ZERO: Resources = Resources { cores: 0, memory: 0 };

    pub fn new(cores: u64, memory: u64) -> Self {
        Self { cores, memory }
    }

    /// `self - other`, or `None` if either quantity would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cores: self.cores.checked_sub(other.cores)?,
            memory: self.memory.checked_sub(other.memory)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cores: self.cores.saturating_add(other.cores),
            memory: self.memory.saturating_add(other.memory),
        }
    }

    /// Whether `other` fits inside `self`.
    pub fn covers(&self, other: &Resources) -> bool {
        self.cores >= other.cores && self.memory >= other.memory
    }
}

// ── Cluster / ComputeCapability ───────────────────────────────────

/// Lifecycle shared by clusters and compute capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Pending,
    Active,
    InActive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: Metadata,
    pub name: String,
    pub status: Status<ActivationState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub metadata: Metadata,
    pub name: String,
    /// Capability family, e.g. "gpu" or "nvme".
    pub capability_type: String,
    /// Relative quality of the capability (higher is better).
    pub score: u64,
    pub status: Status<ActivationState>,
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unallocated,
    Allocating,
    Allocated,
    Evicted,
    Sanitizing,
}

impl NodeState {
    /// States in which a node belongs to a cluster.
    pub fn requires_cluster(self) -> bool {
        matches!(self, NodeState::Allocating | NodeState::Allocated)
    }
}

/// A planned or ongoing interruption of a node (maintenance, repair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disruption {
    pub id: RecordId,
    pub reason: String,
    /// Unix seconds.
    pub starts_at: u64,
    pub ends_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVolume {
    pub name: String,
    pub mount_path: String,
    pub capacity_bytes: u64,
}

/// Resources held on a node by one runtime instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub runtime_instance_id: RecordId,
    pub meta_instance_id: RecordId,
    pub payloads: Vec<String>,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: Metadata,
    pub name: String,
    pub status: Status<NodeState>,
    /// Present exactly while Allocating or Allocated.
    pub cluster_id: Option<RecordId>,
    pub update_domain: String,
    pub total_resources: Resources,
    pub system_reserved_resources: Resources,
    /// `total - reserved - Σ placements`, maintained by the repository.
    pub remaining_resources: Resources,
    pub disruptions: Vec<Disruption>,
    pub capability_ids: Vec<RecordId>,
    pub local_volumes: Vec<LocalVolume>,
    pub placements: Vec<Placement>,
}

impl Node {
    /// Capacity left after system reservations and every placement.
    pub fn computed_remaining(&self) -> Option<Resources> {
        let placed = self
            .placements
            .iter()
            .fold(Resources::ZERO, |acc, p| acc.saturating_add(&p.resources));
        self.total_resources
            .checked_sub(&self.system_reserved_resources)?
            .checked_sub(&placed)
    }

    pub fn hosts_payload(&self, payload: &str) -> bool {
        self.placements
            .iter()
            .any(|p| p.payloads.iter().any(|name| name == payload))
    }
}

// ── DeploymentPlan ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Active,
    Inactive,
}

/// One workload component a plan runs in every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub payload_name: String,
    pub resources: Resources,
}

/// Where a deployment fetches a payload from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadCoordinate {
    pub payload_name: String,
    /// Artifact reference, e.g. `registry.local/api:1.4.2`.
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    InProgress,
    Cancelled,
    Failed,
    Paused,
    Completed,
}

impl DeploymentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentState::Cancelled | DeploymentState::Failed | DeploymentState::Completed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: RecordId,
    pub status: Status<DeploymentState>,
    pub payload_coordinates: Vec<PayloadCoordinate>,
    pub instance_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub metadata: Metadata,
    pub name: String,
    pub status: Status<PlanState>,
    pub namespace: String,
    pub service_name: String,
    pub matching_compute_capabilities: Vec<RecordId>,
    pub applications: Vec<Application>,
    pub deployments: Vec<Deployment>,
}

impl DeploymentPlan {
    /// Resources one instance of this plan consumes on a node.
    pub fn requirements(&self) -> Resources {
        self.applications
            .iter()
            .fold(Resources::ZERO, |acc, app| acc.saturating_add(&app.resources))
    }

    pub fn payload_names(&self) -> Vec<String> {
        self.applications
            .iter()
            .map(|app| app.payload_name.clone())
            .collect()
    }

    pub fn deployment(&self, deployment_id: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.id == deployment_id)
    }

    pub fn in_progress_deployment(&self) -> Option<&Deployment> {
        self.deployments
            .iter()
            .find(|d| d.status.state == DeploymentState::InProgress)
    }
}

// ── MetaInstance ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaInstanceState {
    Active,
    MarkedForDeletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Pending,
    Starting,
    Running,
    Terminated,
    Failed,
    Unknown,
}

/// A concrete placement of a meta-instance on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInstance {
    pub id: RecordId,
    pub node_id: RecordId,
    /// Live instance (true) or staged replacement (false).
    pub is_active: bool,
    pub status: Status<RuntimeState>,
}

impl RuntimeInstance {
    pub fn pending(node_id: impl Into<RecordId>, is_active: bool) -> Self {
        Self {
            id: new_id(),
            node_id: node_id.into(),
            is_active,
            status: Status::new(RuntimeState::Pending),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Restart,
    Stop,
    Delete,
    Relocate,
}

impl OperationType {
    /// Whether the operation needs a new runtime instance before approval.
    pub fn allocates(self) -> bool {
        matches!(self, OperationType::Create | OperationType::Relocate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Preparing,
    PendingApproval,
    Approved,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }
}

/// A requested lifecycle change on a meta-instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: RecordId,
    pub operation_type: OperationType,
    /// What asked for the change, e.g. the deployment ID of a rollout.
    pub intent_id: String,
    pub status: Status<OperationState>,
}

impl Operation {
    pub fn new(operation_type: OperationType, intent_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            operation_type,
            intent_id: intent_id.into(),
            status: Status::new(OperationState::Preparing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInstance {
    pub metadata: Metadata,
    pub name: String,
    pub status: Status<MetaInstanceState>,
    pub deployment_plan_id: RecordId,
    pub deployment_id: Option<RecordId>,
    pub runtime_instances: Vec<RuntimeInstance>,
    pub operations: Vec<Operation>,
}

impl MetaInstance {
    pub fn runtime_instance(&self, runtime_instance_id: &str) -> Option<&RuntimeInstance> {
        self.runtime_instances
            .iter()
            .find(|ri| ri.id == runtime_instance_id)
    }

    /// The runtime instance with the given activeness, if any.
    pub fn runtime_instance_by_activeness(&self, is_active: bool) -> Option<&RuntimeInstance> {
        self.runtime_instances
            .iter()
            .find(|ri| ri.is_active == is_active)
    }

    pub fn operation(&self, operation_id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == operation_id)
    }
}

// ── Workflows ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
}

/// Output recorded for a step that finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub name: String,
    pub output: serde_json::Value,
}

/// Durable-execution checkpoint for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    /// Name of the protocol the workflow runs.
    pub kind: String,
    pub params: serde_json::Value,
    pub status: WorkflowStatus,
    /// Workflow that started this one as a child execution.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub completed_steps: Vec<CompletedStep>,
    /// Result of a Completed workflow.
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    /// Unix seconds.
    pub started_at: u64,
    pub updated_at: u64,
}

impl WorkflowRecord {
    pub fn step_output(&self, name: &str) -> Option<&serde_json::Value> {
        self.completed_steps
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.output)
    }
}
