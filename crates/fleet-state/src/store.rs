//! StateStore: redb-backed repository for the fleet ledger.
//!
//! Provides typed, generic record operations over every entity table.
//! Values are JSON-serialized into redb's `&[u8]` value columns. Each
//! mutation runs in a single write transaction, so a compare-and-swap
//! on `(id, version)` and any side effects it carries (node capacity
//! accounting, name index maintenance) commit or abort together.
//!
//! The store supports both on-disk and in-memory backends (the latter
//! for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into `RepositoryInternal` with context.
macro_rules! map_err {
    ($ctx:expr) => {
        |e| StateError::RepositoryInternal(format!("{}: {e}", $ctx))
    };
}

/// A record stored in its own table with a unique-name index.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable kind used in error messages and logs.
    const KIND: &'static str;
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;
    const NAMES: TableDefinition<'static, &'static str, &'static str>;

    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
    fn name(&self) -> &str;
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!("open database"))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [CLUSTERS, CAPABILITIES, NODES, DEPLOYMENT_PLANS, META_INSTANCES, WORKFLOWS] {
            txn.open_table(table).map_err(map_err!("open table"))?;
        }
        for names in [
            CLUSTER_NAMES,
            CAPABILITY_NAMES,
            NODE_NAMES,
            DEPLOYMENT_PLAN_NAMES,
            META_INSTANCE_NAMES,
        ] {
            txn.open_table(names).map_err(map_err!("open table"))?;
        }
        txn.commit().map_err(map_err!("commit"))?;
        Ok(())
    }

    // ── Generic records ───────────────────────────────────────────

    /// Insert a new record, claiming its name.
    ///
    /// `check` runs inside the same transaction before anything is
    /// written and may inspect related records.
    pub fn insert<R, F>(&self, record: &R, check: F) -> StateResult<()>
    where
        R: Record,
        F: FnOnce(&Tx<'_>) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        {
            let tx = Tx { txn: &txn };
            check(&tx)?;
            tx.insert(record)?;
        }
        txn.commit().map_err(map_err!("commit"))?;
        debug!(kind = R::KIND, id = %record.metadata().id, name = record.name(), "record inserted");
        Ok(())
    }

    /// Get a record by ID, including soft-deleted ones.
    pub fn get<R: Record>(&self, id: &str) -> StateResult<Option<R>> {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!("open table"))?;
        match table.get(id).map_err(map_err!("read"))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Resolve a non-deleted record's ID from its unique name.
    pub fn id_by_name<R: Record>(&self, name: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let table = txn.open_table(R::NAMES).map_err(map_err!("open table"))?;
        Ok(table
            .get(name)
            .map_err(map_err!("read"))?
            .map(|guard| guard.value().to_string()))
    }

    /// All records of a kind, ordered by ID.
    pub fn scan<R: Record>(&self) -> StateResult<Vec<R>> {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let table = txn.open_table(R::TABLE).map_err(map_err!("open table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!("read"))? {
            let (_, value) = entry.map_err(map_err!("read"))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Version-checked update of one record.
    ///
    /// Fails with `RecordInsertConflict` if the record is missing,
    /// soft-deleted, or its version differs from `current.version`.
    /// On success the version is bumped by one and the updated record
    /// is returned.
    pub fn compare_and_swap<R, F>(&self, current: &Metadata, mutate: F) -> StateResult<R>
    where
        R: Record,
        F: FnOnce(&mut R, &Tx<'_>) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let updated = {
            let tx = Tx { txn: &txn };
            let mut record: R = tx.get(&current.id)?.ok_or_else(|| stale::<R>(current))?;
            let stored = record.metadata();
            if stored.is_deleted || stored.version != current.version {
                return Err(stale::<R>(current));
            }
            mutate(&mut record, &tx)?;
            record.metadata_mut().version = current.version + 1;
            tx.put(&record)?;
            record
        };
        txn.commit().map_err(map_err!("commit"))?;
        debug!(
            kind = R::KIND,
            id = %current.id,
            version = updated.metadata().version,
            "record updated"
        );
        Ok(updated)
    }

    /// Hard-delete a soft-deleted record.
    pub fn purge<R: Record>(&self, current: &Metadata) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        {
            let tx = Tx { txn: &txn };
            let record: R = tx.get(&current.id)?.ok_or_else(|| {
                StateError::not_found(format!("{} {}", R::KIND, current.id))
            })?;
            let stored = record.metadata();
            if stored.version != current.version {
                return Err(stale::<R>(current));
            }
            if !stored.is_deleted {
                return Err(StateError::invalid(format!(
                    "{} {} must be deleted before it is purged",
                    R::KIND,
                    current.id
                )));
            }
            tx.remove::<R>(&current.id)?;
        }
        txn.commit().map_err(map_err!("commit"))?;
        debug!(kind = R::KIND, id = %current.id, "record purged");
        Ok(())
    }

    // ── Workflows ─────────────────────────────────────────────────

    /// Store a workflow record only if no record with its ID exists.
    ///
    /// Returns the existing record instead when there is one.
    pub fn create_workflow(&self, record: &WorkflowRecord) -> StateResult<Option<WorkflowRecord>> {
        let value = serde_json::to_vec(record).map_err(map_err!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        let existing = {
            let mut table = txn.open_table(WORKFLOWS).map_err(map_err!("open table"))?;
            let existing = table
                .get(record.id.as_str())
                .map_err(map_err!("read"))?
                .map(|guard| guard.value().to_vec());
            match existing {
                Some(bytes) => Some(decode::<WorkflowRecord>(&bytes)?),
                None => {
                    table
                        .insert(record.id.as_str(), value.as_slice())
                        .map_err(map_err!("write"))?;
                    None
                }
            }
        };
        txn.commit().map_err(map_err!("commit"))?;
        Ok(existing)
    }

    /// Insert or update a workflow record.
    pub fn put_workflow(&self, record: &WorkflowRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!("serialize"))?;
        let txn = self.db.begin_write().map_err(map_err!("begin write"))?;
        {
            let mut table = txn.open_table(WORKFLOWS).map_err(map_err!("open table"))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!("write"))?;
        }
        txn.commit().map_err(map_err!("commit"))?;
        Ok(())
    }

    pub fn get_workflow(&self, id: &str) -> StateResult<Option<WorkflowRecord>> {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let table = txn.open_table(WORKFLOWS).map_err(map_err!("open table"))?;
        match table.get(id).map_err(map_err!("read"))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_workflows(&self) -> StateResult<Vec<WorkflowRecord>> {
        let txn = self.db.begin_read().map_err(map_err!("begin read"))?;
        let table = txn.open_table(WORKFLOWS).map_err(map_err!("open table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!("read"))? {
            let (_, value) = entry.map_err(map_err!("read"))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }
}

/// Record access inside an open write transaction.
///
/// Each call opens and releases its table, so calls can be freely
/// interleaved across record kinds.
pub struct Tx<'a> {
    txn: &'a WriteTransaction,
}

impl Tx<'_> {
    pub fn get<R: Record>(&self, id: &str) -> StateResult<Option<R>> {
        let table = self.txn.open_table(R::TABLE).map_err(map_err!("open table"))?;
        let bytes = table
            .get(id)
            .map_err(map_err!("read"))?
            .map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    /// Overwrite a record. Callers own version bookkeeping.
    pub fn put<R: Record>(&self, record: &R) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!("serialize"))?;
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!("open table"))?;
        table
            .insert(record.metadata().id.as_str(), value.as_slice())
            .map_err(map_err!("write"))?;
        Ok(())
    }

    fn insert<R: Record>(&self, record: &R) -> StateResult<()> {
        let id = record.metadata().id.as_str();
        {
            let mut names = self.txn.open_table(R::NAMES).map_err(map_err!("open table"))?;
            let taken = names.get(record.name()).map_err(map_err!("read"))?.is_some();
            if taken {
                return Err(StateError::conflict(format!(
                    "{} named {:?} already exists",
                    R::KIND,
                    record.name()
                )));
            }
            names.insert(record.name(), id).map_err(map_err!("write"))?;
        }
        if self.get::<R>(id)?.is_some() {
            return Err(StateError::conflict(format!("{} {id} already exists", R::KIND)));
        }
        self.put(record)
    }

    /// Release a name so a new record may claim it.
    pub fn release_name<R: Record>(&self, name: &str, id: &str) -> StateResult<()> {
        let mut names = self.txn.open_table(R::NAMES).map_err(map_err!("open table"))?;
        let owner = names
            .get(name)
            .map_err(map_err!("read"))?
            .map(|guard| guard.value().to_string());
        if owner.as_deref() == Some(id) {
            names.remove(name).map_err(map_err!("write"))?;
        }
        Ok(())
    }

    fn remove<R: Record>(&self, id: &str) -> StateResult<()> {
        let mut table = self.txn.open_table(R::TABLE).map_err(map_err!("open table"))?;
        table.remove(id).map_err(map_err!("write"))?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!("deserialize"))
}

fn stale<R: Record>(current: &Metadata) -> StateError {
    StateError::conflict(format!(
        "{} {} at version {} is deleted or stale",
        R::KIND,
        current.id,
        current.version
    ))
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
