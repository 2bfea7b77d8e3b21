//! fleet-state: versioned entity ledger for the fleet control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Every record carries a
//! `(id, version)` token; all mutations are compare-and-swaps on that
//! token and bump the version by exactly one. Child collections
//! (deployments, runtime instances, operations) live inside their parent
//! record and are guarded by its version.
//!
//! # Architecture
//!
//! - [`StateStore`] owns the redb database and runs each mutation in one
//!   write transaction, so node capacity accounting commits or aborts
//!   together with the runtime instance that caused it.
//! - [`Ledger<E>`] implements create / get / update-status / list /
//!   delete once for every [`Entity`], validated against an immutable
//!   [`TransitionTable`] handed in at construction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod filter;
pub mod ledger;
pub mod store;
pub mod tables;
pub mod transitions;
pub mod types;

pub use error::{StateError, StateResult};
pub use filter::{ListFilter, Membership, Range, RecordQuery};
pub use ledger::*;
pub use store::{Record, StateStore, Tx, epoch_secs};
pub use transitions::TransitionTable;
pub use types::*;
