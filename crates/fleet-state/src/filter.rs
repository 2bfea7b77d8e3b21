//! Structured list filters.
//!
//! Filters combine with AND only: a record is returned when it passes
//! every populated criterion. There is no OR across fields and no
//! free-text search.

use std::fmt::Debug;

use crate::ledger::Entity;

/// IN / NOT-IN membership test. Empty `include` admits everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership<T> {
    pub include: Vec<T>,
    pub exclude: Vec<T>,
}

impl<T> Default for Membership<T> {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl<T: PartialEq> Membership<T> {
    pub fn admits(&self, value: &T) -> bool {
        (self.include.is_empty() || self.include.contains(value)) && !self.exclude.contains(value)
    }
}

/// Inclusive numeric range; open on either side when `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Range {
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl Range {
    pub fn at_least(min: u64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: u64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    pub fn between(min: u64, max: u64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Entity-specific filter criteria layered on top of [`ListFilter`].
pub trait RecordQuery<E>: Debug + Clone + Default + Send + Sync {
    fn matches(&self, record: &E) -> bool;
}

/// Entities without extra criteria use `()`.
impl<E> RecordQuery<E> for () {
    fn matches(&self, _record: &E) -> bool {
        true
    }
}

/// Filter accepted by [`Ledger::list`](crate::ledger::Ledger::list).
#[derive(Debug, Clone)]
pub struct ListFilter<E: Entity> {
    pub ids: Membership<String>,
    pub names: Membership<String>,
    pub states: Membership<E::State>,
    pub version: Range,
    pub include_deleted: bool,
    pub limit: Option<usize>,
    pub query: E::Query,
}

impl<E: Entity> Default for ListFilter<E> {
    fn default() -> Self {
        Self {
            ids: Membership::default(),
            names: Membership::default(),
            states: Membership::default(),
            version: Range::default(),
            include_deleted: false,
            limit: None,
            query: E::Query::default(),
        }
    }
}

impl<E: Entity> ListFilter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_in<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids.include.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn id_not_in<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids.exclude.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn name_in<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.names.include.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name_not_in<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.names.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn state_in(mut self, states: impl IntoIterator<Item = E::State>) -> Self {
        self.states.include.extend(states);
        self
    }

    pub fn state_not_in(mut self, states: impl IntoIterator<Item = E::State>) -> Self {
        self.states.exclude.extend(states);
        self
    }

    pub fn version(mut self, range: Range) -> Self {
        self.version = range;
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn query(mut self, query: E::Query) -> Self {
        self.query = query;
        self
    }

    pub fn matches(&self, record: &E) -> bool {
        let metadata = record.metadata();
        (self.include_deleted || !metadata.is_deleted)
            && self.ids.admits(&metadata.id)
            && self.names.admits(&record.name().to_string())
            && self.states.admits(&record.state())
            && self.version.contains(metadata.version)
            && self.query.matches(record)
    }
}
