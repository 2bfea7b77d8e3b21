//! Clusters and compute capabilities: plain Pending/Active/InActive records.

use redb::TableDefinition;

use super::{Entity, require};
use crate::error::StateResult;
use crate::filter::{Membership, Range, RecordQuery};
use crate::store::Record;
use crate::tables::*;
use crate::transitions::{self, TransitionTable};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub name: String,
}

impl Record for Cluster {
    const KIND: &'static str = "cluster";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = CLUSTERS;
    const NAMES: TableDefinition<'static, &'static str, &'static str> = CLUSTER_NAMES;

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

impl Entity for Cluster {
    type State = ActivationState;
    type CreateRequest = NewCluster;
    type StatusUpdate = Status<ActivationState>;
    type Query = ();
    type ChildTransitions = ();

    fn state(&self) -> ActivationState {
        self.status.state
    }

    fn build(request: NewCluster) -> StateResult<Self> {
        require("cluster name", &request.name)?;
        Ok(Cluster {
            metadata: Metadata::fresh(),
            name: request.name,
            status: Status::new(ActivationState::Pending),
        })
    }

    fn target_state(update: &Status<ActivationState>) -> ActivationState {
        update.state
    }

    fn apply_status(&mut self, update: Status<ActivationState>) -> StateResult<()> {
        self.status = update;
        Ok(())
    }

    fn default_transitions() -> TransitionTable<ActivationState> {
        transitions::activation()
    }

    fn default_child_transitions() -> Self::ChildTransitions {}
}

#[derive(Debug, Clone)]
pub struct NewCapability {
    pub name: String,
    pub capability_type: String,
    pub score: u64,
}

/// Extra criteria for listing compute capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilityQuery {
    pub types: Membership<String>,
    pub score: Range,
}

impl RecordQuery<ComputeCapability> for CapabilityQuery {
    fn matches(&self, record: &ComputeCapability) -> bool {
        self.types.admits(&record.capability_type) && self.score.contains(record.score)
    }
}

impl Record for ComputeCapability {
    const KIND: &'static str = "compute capability";
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = CAPABILITIES;
    const NAMES: TableDefinition<'static, &'static str, &'static str> = CAPABILITY_NAMES;

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

impl Entity for ComputeCapability {
    type State = ActivationState;
    type CreateRequest = NewCapability;
    type StatusUpdate = Status<ActivationState>;
    type Query = CapabilityQuery;
    type ChildTransitions = ();

    fn state(&self) -> ActivationState {
        self.status.state
    }

    fn build(request: NewCapability) -> StateResult<Self> {
        require("capability name", &request.name)?;
        require("capability type", &request.capability_type)?;
        Ok(ComputeCapability {
            metadata: Metadata::fresh(),
            name: request.name,
            capability_type: request.capability_type,
            score: request.score,
            status: Status::new(ActivationState::Pending),
        })
    }

    fn target_state(update: &Status<ActivationState>) -> ActivationState {
        update.state
    }

    fn apply_status(&mut self, update: Status<ActivationState>) -> StateResult<()> {
        self.status = update;
        Ok(())
    }

    fn default_transitions() -> TransitionTable<ActivationState> {
        transitions::activation()
    }

    fn default_child_transitions() -> Self::ChildTransitions {}
}
