//! Persistent storage for personas and profiles using redb.
//!
//! Two record tables with one secondary index each:
//!
//! ```text
//! personas                 persona text  -> JSON row
//! personas.hasPrivateKey   "yes" | "no"  -> persona text   (multimap)
//! profiles                 profile text  -> JSON row
//! profiles.network         network       -> profile text   (multimap)
//! meta                     schema_version
//! ```
//!
//! All access goes through a [`Transaction`] scoped to the tables it needs.
//! Every record operation is available on the transaction (so several steps
//! can share one atomic unit) and on [`PersonaStore`], which opens a
//! transaction on the minimum tables, runs the step and commits.
//!
//! Writes from outside this crate should go through
//! [`PersonaStore::consistent_write_access`], which runs the consistency
//! checker before committing.
//!
//! redb serializes write transactions. Calling a `PersonaStore` write method
//! from inside a `consistent_write_access` action would wait on itself; use
//! the transaction handed to the action instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, MultimapTableDefinition, TableDefinition};
use tracing::{debug, info, warn};

use crate::config::PersonaDbConfig;
use crate::error::PersonaResult;
use crate::events::EventBus;

mod consistency;
mod links;
mod personas;
mod profiles;
mod schema;
mod transaction;

#[cfg(test)]
pub(crate) mod test_util;

pub use consistency::{CheckMode, ConsistencyReport, Diagnosis};
pub use personas::DeleteConfirmation;
pub use schema::SCHEMA_VERSION;
pub use transaction::{Mode, ReadOnly, ReadWrite, Transaction};

use personas::PersonaRow;
use profiles::ProfileRow;
use schema::{PERSONAS_BY_PRIVATE_KEY, PERSONAS_TABLE, PROFILES_BY_NETWORK, PROFILES_TABLE};

/// A record table
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectStore {
    Personas,
    Profiles,
}

impl ObjectStore {
    pub const ALL: [ObjectStore; 2] = [ObjectStore::Personas, ObjectStore::Profiles];

    pub fn name(self) -> &'static str {
        match self {
            ObjectStore::Personas => "personas",
            ObjectStore::Profiles => "profiles",
        }
    }

    /// Name of the table's secondary index
    pub fn index_name(self) -> &'static str {
        match self {
            ObjectStore::Personas => "hasPrivateKey",
            ObjectStore::Profiles => "network",
        }
    }

    pub(crate) fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            ObjectStore::Personas => PERSONAS_TABLE,
            ObjectStore::Profiles => PROFILES_TABLE,
        }
    }

    pub(crate) fn index(self) -> MultimapTableDefinition<'static, &'static str, &'static str> {
        match self {
            ObjectStore::Personas => PERSONAS_BY_PRIVATE_KEY,
            ObjectStore::Profiles => PROFILES_BY_NETWORK,
        }
    }
}

/// Handle to an open persona database. Clones share the same file.
#[derive(Clone)]
pub struct PersonaStore {
    db: Arc<RwLock<Database>>,
    bus: EventBus,
    auto_fix: bool,
    path: PathBuf,
}

impl std::fmt::Debug for PersonaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersonaStore")
            .field("path", &self.path)
            .field("auto_fix", &self.auto_fix)
            .finish()
    }
}

impl PersonaStore {
    /// Open or create the database described by `config`.
    ///
    /// This will:
    /// - Create the parent directory if it doesn't exist
    /// - Initialize the database file
    /// - Run schema migrations up to [`SCHEMA_VERSION`]
    pub fn open(config: &PersonaDbConfig, bus: EventBus) -> PersonaResult<Self> {
        let path = config.path.as_path();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;
        let previous = schema::migrate(&db)?;
        info!(
            path = %path.display(),
            schema_version = SCHEMA_VERSION,
            previous_version = previous,
            "Opened persona database"
        );

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            bus,
            auto_fix: config.auto_fix,
            path: path.to_path_buf(),
        })
    }

    /// Open with default settings at `path`.
    pub fn open_path(path: impl AsRef<Path>, bus: EventBus) -> PersonaResult<Self> {
        let config = PersonaDbConfig {
            path: path.as_ref().to_path_buf(),
            ..PersonaDbConfig::default()
        };
        Self::open(&config, bus)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The bus events are published to after each commit
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn auto_fix(&self) -> bool {
        self.auto_fix
    }

    /// Start a snapshot transaction on `scope`.
    pub fn read_transaction(&self, scope: &[ObjectStore]) -> PersonaResult<Transaction<ReadOnly>> {
        let db = self.db.read();
        let txn = db.begin_read()?;
        Ok(Transaction::new(txn, scope, self.bus.clone()))
    }

    /// Start a write transaction on `scope`. Blocks while another write
    /// transaction is open.
    pub fn write_transaction(&self, scope: &[ObjectStore]) -> PersonaResult<Transaction<ReadWrite>> {
        let db = self.db.read();
        let txn = db.begin_write()?;
        Ok(Transaction::new(txn, scope, self.bus.clone()))
    }

    pub(crate) fn with_read<T>(
        &self,
        scope: &[ObjectStore],
        f: impl FnOnce(&Transaction<ReadOnly>) -> PersonaResult<T>,
    ) -> PersonaResult<T> {
        let tx = self.read_transaction(scope)?;
        f(&tx)
    }

    /// Run `f` in its own write transaction and commit unless `f` already
    /// finished it. An error rolls back.
    pub(crate) fn with_write<T>(
        &self,
        scope: &[ObjectStore],
        f: impl FnOnce(&mut Transaction<ReadWrite>) -> PersonaResult<T>,
    ) -> PersonaResult<T> {
        let mut tx = self.write_transaction(scope)?;
        let value = f(&mut tx)?;
        if !tx.is_finished() {
            tx.commit()?;
        }
        Ok(value)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Consistent write access
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `action` in a read-write transaction over both tables, then check
    /// the link invariant and commit.
    ///
    /// The check repairs when the store was opened with `auto_fix`, and fails
    /// the write otherwise. See [`consistent_write_access_with`].
    ///
    /// [`consistent_write_access_with`]: Self::consistent_write_access_with
    pub fn consistent_write_access<T>(
        &self,
        action: impl FnOnce(&mut Transaction<ReadWrite>) -> PersonaResult<T>,
    ) -> PersonaResult<T> {
        let mode = if self.auto_fix {
            CheckMode::Fix
        } else {
            CheckMode::Throw
        };
        self.consistent_write_access_with(mode, action)
    }

    /// [`consistent_write_access`](Self::consistent_write_access) with an
    /// explicit check mode.
    ///
    /// - If `action` commits or aborts the transaction itself, the check runs
    ///   on a new transaction and a warning is logged.
    /// - If `action` fails, its transaction is rolled back, the check still
    ///   runs on a new transaction, and the action's error is returned.
    /// - In [`CheckMode::Throw`], violations fail the call and nothing done
    ///   by `action` is committed.
    pub fn consistent_write_access_with<T>(
        &self,
        mode: CheckMode,
        action: impl FnOnce(&mut Transaction<ReadWrite>) -> PersonaResult<T>,
    ) -> PersonaResult<T> {
        let mut tx = self.write_transaction(&ObjectStore::ALL)?;

        let value = match action(&mut tx) {
            Ok(value) => value,
            Err(err) => {
                if !tx.is_finished() {
                    if let Err(e) = tx.abort() {
                        warn!(error = %e, "Failed to roll back after write error");
                    }
                }
                drop(tx);
                self.check_after_failure(mode);
                return Err(err);
            }
        };

        if tx.is_finished() {
            warn!("Write transaction ended before the consistency check, checking on a new transaction");
            tx = self.write_transaction(&ObjectStore::ALL)?;
        }

        tx.check_consistency(mode)?;
        tx.commit()?;
        Ok(value)
    }

    fn check_after_failure(&self, mode: CheckMode) {
        let result = self.write_transaction(&ObjectStore::ALL).and_then(|mut tx| {
            let report = tx.check_consistency(mode)?;
            tx.commit()?;
            Ok(report)
        });
        match result {
            Ok(report) => debug!(repaired = report.len(), "Consistency check after failed write"),
            Err(e) => debug!(error = %e, "Consistency check after failed write did not pass"),
        }
    }

    /// Run the checker on its own transaction.
    pub fn check_consistency(&self, mode: CheckMode) -> PersonaResult<ConsistencyReport> {
        self.with_write(&ObjectStore::ALL, |tx| tx.check_consistency(mode))
    }

    /// Violations currently in the store, without repairing them.
    pub fn diagnose(&self) -> PersonaResult<Vec<Diagnosis>> {
        self.with_read(&ObjectStore::ALL, |tx| tx.diagnose())
    }

    /// Repopulate both secondary indexes from the record tables. Returns the
    /// number of index entries written.
    pub fn rebuild_indexes(&self) -> PersonaResult<usize> {
        self.with_write(&ObjectStore::ALL, |tx| {
            let personas = tx.rebuild_index::<PersonaRow>()?;
            let profiles = tx.rebuild_index::<ProfileRow>()?;
            info!(personas, profiles, "Rebuilt secondary indexes");
            Ok(personas + profiles)
        })
    }
}

/// Lazily opened, memoized store handle.
///
/// The first [`get`](Self::get) opens the database; later calls hand out
/// clones of the same [`PersonaStore`].
pub struct StoreAccess {
    config: PersonaDbConfig,
    bus: EventBus,
    store: Mutex<Option<PersonaStore>>,
}

impl StoreAccess {
    pub fn new(config: PersonaDbConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            store: Mutex::new(None),
        }
    }

    pub fn get(&self) -> PersonaResult<PersonaStore> {
        let mut guard = self.store.lock();
        if let Some(store) = guard.as_ref() {
            return Ok(store.clone());
        }
        let store = PersonaStore::open(&self.config, self.bus.clone())?;
        *guard = Some(store.clone());
        Ok(store)
    }

    pub fn is_open(&self) -> bool {
        self.store.lock().is_some()
    }

    pub fn config(&self) -> &PersonaDbConfig {
        &self.config
    }
}
