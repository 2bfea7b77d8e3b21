//! Immutable state-transition tables.
//!
//! A table maps each state to the states it may move to. Tables are
//! plain values handed to a [`Ledger`](crate::ledger::Ledger) when it is
//! built; the constructors below return the authoritative tables.

use std::fmt::Debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable<S> {
    edges: Vec<(S, Vec<S>)>,
}

impl<S: Copy + PartialEq + Debug> TransitionTable<S> {
    pub fn new(edges: &[(S, &[S])]) -> Self {
        Self {
            edges: edges
                .iter()
                .map(|(from, to)| (*from, to.to_vec()))
                .collect(),
        }
    }

    /// States reachable in one step from `from`.
    pub fn next_states(&self, from: S) -> &[S] {
        self.edges
            .iter()
            .find(|(state, _)| *state == from)
            .map(|(_, next)| next.as_slice())
            .unwrap_or(&[])
    }

    pub fn allows(&self, from: S, to: S) -> bool {
        self.next_states(from).contains(&to)
    }

    /// `RequestInvalid` unless `from → to` is in the table.
    pub fn check(&self, kind: &str, from: S, to: S) -> StateResult<()> {
        if self.allows(from, to) {
            return Ok(());
        }
        Err(StateError::invalid(format!(
            "{kind} cannot move from {from:?} to {to:?} (allowed: {:?})",
            self.next_states(from)
        )))
    }
}

/// Clusters and compute capabilities.
pub fn activation() -> TransitionTable<ActivationState> {
    use ActivationState::*;
    TransitionTable::new(&[
        (Pending, &[Active, InActive]),
        (Active, &[InActive]),
        (InActive, &[Active]),
    ])
}

pub fn node() -> TransitionTable<NodeState> {
    use NodeState::*;
    TransitionTable::new(&[
        (Unallocated, &[Allocating]),
        (Allocating, &[Allocated, Evicted]),
        (Allocated, &[Evicted]),
        (Evicted, &[Sanitizing]),
        (Sanitizing, &[Evicted, Unallocated]),
    ])
}

pub fn deployment_plan() -> TransitionTable<PlanState> {
    use PlanState::*;
    TransitionTable::new(&[(Active, &[Inactive]), (Inactive, &[Active])])
}

pub fn deployment() -> TransitionTable<DeploymentState> {
    use DeploymentState::*;
    TransitionTable::new(&[
        (Pending, &[InProgress, Cancelled]),
        (InProgress, &[Cancelled, Failed, Paused, Completed]),
        (Paused, &[InProgress, Cancelled]),
    ])
}

pub fn meta_instance() -> TransitionTable<MetaInstanceState> {
    use MetaInstanceState::*;
    TransitionTable::new(&[(Active, &[MarkedForDeletion])])
}

/// Failure is reachable from every non-terminal state so a step that
/// breaks at any point can record it.
pub fn operation() -> TransitionTable<OperationState> {
    use OperationState::*;
    TransitionTable::new(&[
        (Preparing, &[PendingApproval, Failed]),
        (PendingApproval, &[Approved, Failed]),
        (Approved, &[Succeeded, Failed]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every pair not listed must be rejected, every listed pair allowed.
    fn assert_exact<S: Copy + PartialEq + Debug>(
        table: &TransitionTable<S>,
        all: &[S],
        allowed: &[(S, S)],
    ) {
        for &from in all {
            for &to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    table.allows(from, to),
                    expected,
                    "{from:?} -> {to:?} should be {}",
                    if expected { "allowed" } else { "rejected" }
                );
                assert_eq!(table.check("record", from, to).is_ok(), expected);
            }
        }
    }

    #[test]
    fn activation_table() {
        use ActivationState::*;
        assert_exact(
            &activation(),
            &[Pending, Active, InActive],
            &[
                (Pending, Active),
                (Pending, InActive),
                (Active, InActive),
                (InActive, Active),
            ],
        );
    }

    #[test]
    fn node_table() {
        use NodeState::*;
        assert_exact(
            &node(),
            &[Unallocated, Allocating, Allocated, Evicted, Sanitizing],
            &[
                (Unallocated, Allocating),
                (Allocating, Allocated),
                (Allocating, Evicted),
                (Allocated, Evicted),
                (Evicted, Sanitizing),
                (Sanitizing, Evicted),
                (Sanitizing, Unallocated),
            ],
        );
    }

    #[test]
    fn deployment_plan_table() {
        use PlanState::*;
        assert_exact(
            &deployment_plan(),
            &[Active, Inactive],
            &[(Active, Inactive), (Inactive, Active)],
        );
    }

    #[test]
    fn deployment_table() {
        use DeploymentState::*;
        assert_exact(
            &deployment(),
            &[Pending, InProgress, Cancelled, Failed, Paused, Completed],
            &[
                (Pending, InProgress),
                (Pending, Cancelled),
                (InProgress, Cancelled),
                (InProgress, Failed),
                (InProgress, Paused),
                (InProgress, Completed),
                (Paused, InProgress),
                (Paused, Cancelled),
            ],
        );
    }

    #[test]
    fn meta_instance_is_one_way() {
        use MetaInstanceState::*;
        assert_exact(
            &meta_instance(),
            &[Active, MarkedForDeletion],
            &[(Active, MarkedForDeletion)],
        );
    }

    #[test]
    fn operation_table() {
        use OperationState::*;
        assert_exact(
            &operation(),
            &[Preparing, PendingApproval, Approved, Succeeded, Failed],
            &[
                (Preparing, PendingApproval),
                (Preparing, Failed),
                (PendingApproval, Approved),
                (PendingApproval, Failed),
                (Approved, Succeeded),
                (Approved, Failed),
            ],
        );
    }

    #[test]
    fn rejection_names_allowed_states() {
        let err = node()
            .check("node", NodeState::Unallocated, NodeState::Allocated)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Unallocated"));
        assert!(msg.contains("Allocating"));
    }
}
