//! Generic entity ledger.
//!
//! [`Ledger<E>`] implements create / get / update-status / list / delete
//! once for every entity. Entities plug in through [`Entity`]: their
//! state enum, how a creation request becomes a record, and any rule a
//! status change must satisfy beyond the transition table. Child
//! collections (deployments, runtime instances, operations) get their
//! own mutators in the per-entity modules; each one is a single
//! version-checked update of the parent.

mod cluster;
mod meta_instance;
mod node;
mod plan;

use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::filter::{ListFilter, RecordQuery};
use crate::store::{Record, StateStore, Tx};
use crate::transitions::TransitionTable;
use crate::types::Metadata;

pub use cluster::{CapabilityQuery, NewCapability, NewCluster};
pub use meta_instance::{MetaInstanceQuery, NewMetaInstance};
pub use node::{NewNode, NodeQuery, NodeStatusUpdate};
pub use plan::{NewDeployment, NewDeploymentPlan, PlanQuery};

/// Per-entity configuration of the generic ledger.
pub trait Entity: Record + Debug {
    type State: Copy + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Validated input to [`Ledger::create`].
    type CreateRequest: Send;
    /// Payload of [`Ledger::update_status`].
    type StatusUpdate: Debug + Send;
    /// Entity-specific list criteria.
    type Query: RecordQuery<Self>;
    /// Transition tables for child collections, if any.
    type ChildTransitions: Clone + Send + Sync + 'static;

    fn state(&self) -> Self::State;

    /// Build a fresh record (new ID, version 0, initial status),
    /// rejecting missing required fields with `RequestInvalid`.
    fn build(request: Self::CreateRequest) -> StateResult<Self>;

    /// Checks against related records, run in the insert transaction.
    fn check_references(&self, _tx: &Tx<'_>) -> StateResult<()> {
        Ok(())
    }

    fn target_state(update: &Self::StatusUpdate) -> Self::State;

    /// Apply an allowed status change, enforcing rules beyond the table.
    fn apply_status(&mut self, update: Self::StatusUpdate) -> StateResult<()>;

    /// Side effects of a soft delete, run in the delete transaction.
    fn on_delete(&mut self, _tx: &Tx<'_>) -> StateResult<()> {
        Ok(())
    }

    fn default_transitions() -> TransitionTable<Self::State>;
    fn default_child_transitions() -> Self::ChildTransitions;
}

/// Versioned, state-machine-validated access to one entity kind.
pub struct Ledger<E: Entity> {
    store: StateStore,
    transitions: Arc<TransitionTable<E::State>>,
    children: Arc<E::ChildTransitions>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for Ledger<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transitions: Arc::clone(&self.transitions),
            children: Arc::clone(&self.children),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Ledger<E> {
    pub fn new(
        store: StateStore,
        transitions: TransitionTable<E::State>,
        children: E::ChildTransitions,
    ) -> Self {
        Self {
            store,
            transitions: Arc::new(transitions),
            children: Arc::new(children),
            _entity: PhantomData,
        }
    }

    /// Ledger using the authoritative transition tables.
    pub fn with_default_transitions(store: StateStore) -> Self {
        Self::new(store, E::default_transitions(), E::default_child_transitions())
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn transitions(&self) -> &TransitionTable<E::State> {
        &self.transitions
    }

    pub(crate) fn child_transitions(&self) -> &E::ChildTransitions {
        &self.children
    }

    pub fn create(&self, request: E::CreateRequest) -> StateResult<E> {
        let record = E::build(request)?;
        self.store.insert(&record, |tx| record.check_references(tx))?;
        info!(
            kind = E::KIND,
            id = %record.metadata().id,
            name = record.name(),
            state = ?record.state(),
            "record created"
        );
        Ok(record)
    }

    /// Fetch a non-deleted record by ID.
    pub fn get_by_id(&self, id: &str) -> StateResult<E> {
        if id.is_empty() {
            return Err(StateError::invalid(format!("{} id must not be empty", E::KIND)));
        }
        match self.store.get::<E>(id)? {
            Some(record) if !record.metadata().is_deleted => Ok(record),
            _ => Err(StateError::not_found(format!("{} {id}", E::KIND))),
        }
    }

    /// Fetch a non-deleted record by its unique name.
    pub fn get_by_name(&self, name: &str) -> StateResult<E> {
        if name.is_empty() {
            return Err(StateError::invalid(format!("{} name must not be empty", E::KIND)));
        }
        let id = self
            .store
            .id_by_name::<E>(name)?
            .ok_or_else(|| StateError::not_found(format!("{} named {name:?}", E::KIND)))?;
        self.get_by_id(&id)
    }

    /// Move a record to a new status.
    ///
    /// A record that is gone or whose version moved on yields
    /// `RecordInsertConflict`: both are resolved by re-reading and
    /// retrying. A transition outside the table yields `RequestInvalid`.
    pub fn update_status(&self, metadata: &Metadata, update: E::StatusUpdate) -> StateResult<E> {
        let transitions = Arc::clone(&self.transitions);
        let updated = self.store.compare_and_swap(metadata, |record: &mut E, _| {
            let from = record.state();
            let to = E::target_state(&update);
            transitions.check(E::KIND, from, to)?;
            record.apply_status(update)
        })?;
        info!(
            kind = E::KIND,
            id = %metadata.id,
            state = ?updated.state(),
            version = updated.metadata().version,
            "status updated"
        );
        Ok(updated)
    }

    /// Snapshot read of the records matching `filter`, ordered by ID.
    pub fn list(&self, filter: &ListFilter<E>) -> StateResult<Vec<E>> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(self
            .store
            .scan::<E>()?
            .into_iter()
            .filter(|record| filter.matches(record))
            .take(limit)
            .collect())
    }

    /// Version-checked soft delete; releases the record's name.
    pub fn delete(&self, metadata: &Metadata) -> StateResult<E> {
        let deleted = self.store.compare_and_swap(metadata, |record: &mut E, tx| {
            record.on_delete(tx)?;
            record.metadata_mut().is_deleted = true;
            let (name, id) = (record.name().to_string(), record.metadata().id.clone());
            tx.release_name::<E>(&name, &id)
        })?;
        info!(kind = E::KIND, id = %metadata.id, "record deleted");
        Ok(deleted)
    }

    /// Remove a soft-deleted record for good.
    pub fn purge(&self, metadata: &Metadata) -> StateResult<()> {
        self.store.purge::<E>(metadata)?;
        info!(kind = E::KIND, id = %metadata.id, "record purged");
        Ok(())
    }

    /// Version-checked mutation used by child-collection mutators.
    pub(crate) fn mutate<F>(&self, metadata: &Metadata, mutate: F) -> StateResult<E>
    where
        F: FnOnce(&mut E, &Tx<'_>) -> StateResult<()>,
    {
        self.store.compare_and_swap(metadata, mutate)
    }
}

/// `RequestInvalid` if `value` is blank.
pub(crate) fn require(field: &str, value: &str) -> StateResult<()> {
    if value.trim().is_empty() {
        return Err(StateError::invalid(format!("{field} is required")));
    }
    Ok(())
}
