//! Scoped transactions over the record tables.
//!
//! A [`Transaction`] wraps one redb read or write transaction together with
//! the list of tables it may touch. Record operations check the scope before
//! opening a table, so a transaction created for `profiles` alone cannot
//! read or write `personas`.
//!
//! Events raised by write operations are buffered on the transaction and
//! handed to the [`EventBus`] only after a successful commit.

use std::fmt;
use std::marker::PhantomData;

use redb::{ReadTransaction, ReadableMultimapTable, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::ObjectStore;
use crate::error::{PersonaError, PersonaResult};
use crate::events::{EventBus, PersonaEvent};

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ReadOnly {}
    impl Sealed for super::ReadWrite {}
}

/// Marker for snapshot transactions
#[derive(Debug)]
pub enum ReadOnly {}

/// Marker for transactions that may write
#[derive(Debug)]
pub enum ReadWrite {}

/// Access mode of a [`Transaction`]. Implemented by [`ReadOnly`] and
/// [`ReadWrite`] only.
pub trait Mode: sealed::Sealed + 'static {
    #[doc(hidden)]
    type Inner;

    const NAME: &'static str;

    #[doc(hidden)]
    fn get(inner: &Self::Inner, store: ObjectStore, key: &str) -> PersonaResult<Option<Vec<u8>>>;

    #[doc(hidden)]
    fn scan(inner: &Self::Inner, store: ObjectStore) -> PersonaResult<Vec<(String, Vec<u8>)>>;

    #[doc(hidden)]
    fn index_keys(inner: &Self::Inner, store: ObjectStore, value: &str) -> PersonaResult<Vec<String>>;

    #[doc(hidden)]
    fn commit(inner: Self::Inner) -> PersonaResult<()>;

    #[doc(hidden)]
    fn abort(inner: Self::Inner) -> PersonaResult<()>;
}

fn read_value<T>(table: &T, key: &str) -> PersonaResult<Option<Vec<u8>>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let value = table.get(key)?;
    Ok(value.map(|guard| guard.value().to_vec()))
}

fn read_all<T>(table: &T) -> PersonaResult<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        rows.push((key.value().to_string(), value.value().to_vec()));
    }
    Ok(rows)
}

fn read_index<T>(index: &T, value: &str) -> PersonaResult<Vec<String>>
where
    T: ReadableMultimapTable<&'static str, &'static str>,
{
    let mut keys = Vec::new();
    for key in index.get(value)? {
        keys.push(key?.value().to_string());
    }
    Ok(keys)
}

impl Mode for ReadOnly {
    type Inner = ReadTransaction;

    const NAME: &'static str = "readonly";

    fn get(inner: &ReadTransaction, store: ObjectStore, key: &str) -> PersonaResult<Option<Vec<u8>>> {
        let table = inner.open_table(store.table())?;
        read_value(&table, key)
    }

    fn scan(inner: &ReadTransaction, store: ObjectStore) -> PersonaResult<Vec<(String, Vec<u8>)>> {
        let table = inner.open_table(store.table())?;
        read_all(&table)
    }

    fn index_keys(inner: &ReadTransaction, store: ObjectStore, value: &str) -> PersonaResult<Vec<String>> {
        let index = inner.open_multimap_table(store.index())?;
        read_index(&index, value)
    }

    fn commit(inner: ReadTransaction) -> PersonaResult<()> {
        drop(inner);
        Ok(())
    }

    fn abort(inner: ReadTransaction) -> PersonaResult<()> {
        drop(inner);
        Ok(())
    }
}

impl Mode for ReadWrite {
    type Inner = WriteTransaction;

    const NAME: &'static str = "readwrite";

    fn get(inner: &WriteTransaction, store: ObjectStore, key: &str) -> PersonaResult<Option<Vec<u8>>> {
        let table = inner.open_table(store.table())?;
        read_value(&table, key)
    }

    fn scan(inner: &WriteTransaction, store: ObjectStore) -> PersonaResult<Vec<(String, Vec<u8>)>> {
        let table = inner.open_table(store.table())?;
        read_all(&table)
    }

    fn index_keys(inner: &WriteTransaction, store: ObjectStore, value: &str) -> PersonaResult<Vec<String>> {
        let index = inner.open_multimap_table(store.index())?;
        read_index(&index, value)
    }

    fn commit(inner: WriteTransaction) -> PersonaResult<()> {
        inner.commit()?;
        Ok(())
    }

    fn abort(inner: WriteTransaction) -> PersonaResult<()> {
        inner.abort()?;
        Ok(())
    }
}

/// A stored row: serialized form of a record plus its index value.
pub(crate) trait Row: Serialize + DeserializeOwned {
    const STORE: ObjectStore;

    /// Primary key (identifier text)
    fn key(&self) -> &str;

    /// Value stored in the table's secondary index
    fn index_value(&self) -> &str;
}

/// A transaction scoped to a fixed set of tables.
///
/// Dropping a write transaction without committing rolls it back.
pub struct Transaction<M: Mode> {
    inner: Option<M::Inner>,
    scope: Vec<ObjectStore>,
    bus: EventBus,
    pending_events: Vec<PersonaEvent>,
    _mode: PhantomData<M>,
}

impl<M: Mode> fmt::Debug for Transaction<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("mode", &M::NAME)
            .field("scope", &self.scope)
            .field("finished", &self.is_finished())
            .field("pending_events", &self.pending_events.len())
            .finish()
    }
}

impl<M: Mode> Transaction<M> {
    pub(crate) fn new(inner: M::Inner, scope: &[ObjectStore], bus: EventBus) -> Self {
        let mut scope = scope.to_vec();
        scope.sort();
        scope.dedup();
        Self {
            inner: Some(inner),
            scope,
            bus,
            pending_events: Vec::new(),
            _mode: PhantomData,
        }
    }

    /// Tables this transaction may touch
    pub fn scope(&self) -> &[ObjectStore] {
        &self.scope
    }

    pub fn in_scope(&self, store: ObjectStore) -> bool {
        self.scope.contains(&store)
    }

    /// True once committed or aborted
    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    /// Commit, then publish the events raised inside the transaction.
    pub fn commit(&mut self) -> PersonaResult<()> {
        let inner = self.inner.take().ok_or(PersonaError::TransactionFinished)?;
        let events = std::mem::take(&mut self.pending_events);
        M::commit(inner)?;
        if !events.is_empty() {
            debug!(count = events.len(), "Publishing events after commit");
            self.bus.emit_all(events);
        }
        Ok(())
    }

    /// Roll back. Buffered events are discarded.
    pub fn abort(&mut self) -> PersonaResult<()> {
        let inner = self.inner.take().ok_or(PersonaError::TransactionFinished)?;
        self.pending_events.clear();
        M::abort(inner)
    }

    fn inner_for(&self, store: ObjectStore) -> PersonaResult<&M::Inner> {
        if !self.in_scope(store) {
            return Err(PersonaError::TableNotInScope {
                table: store.name(),
                scope: self.scope_names(),
            });
        }
        self.inner.as_ref().ok_or(PersonaError::TransactionFinished)
    }

    fn scope_names(&self) -> String {
        let names: Vec<&str> = self.scope.iter().map(|s| s.name()).collect();
        format!("{} [{}]", M::NAME, names.join(", "))
    }

    pub(crate) fn get_row<R: Row>(&self, key: &str) -> PersonaResult<Option<R>> {
        let inner = self.inner_for(R::STORE)?;
        match M::get(inner, R::STORE, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every row of `R`'s table, in key order
    pub(crate) fn scan_rows<R: Row>(&self) -> PersonaResult<Vec<R>> {
        let inner = self.inner_for(R::STORE)?;
        M::scan(inner, R::STORE)?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(PersonaError::from))
            .collect()
    }

    /// Rows whose index value equals `value`, in key order
    pub(crate) fn rows_by_index<R: Row>(&self, value: &str) -> PersonaResult<Vec<R>> {
        let inner = self.inner_for(R::STORE)?;
        let mut rows = Vec::new();
        for key in M::index_keys(inner, R::STORE, value)? {
            match self.get_row::<R>(&key)? {
                Some(row) if row.index_value() == value => rows.push(row),
                _ => warn!(
                    store = R::STORE.name(),
                    key = %key,
                    "Skipping stale index entry"
                ),
            }
        }
        Ok(rows)
    }
}

impl Transaction<ReadWrite> {
    /// Buffer an event until commit.
    pub(crate) fn raise(&mut self, event: PersonaEvent) {
        self.pending_events.push(event);
    }

    /// Insert or overwrite a row and keep the index in step.
    pub(crate) fn put_row<R: Row>(&mut self, row: &R) -> PersonaResult<()> {
        let inner = self.inner_for(R::STORE)?;
        let key = row.key();
        let bytes = serde_json::to_vec(row)?;

        let previous_index = {
            let mut table = inner.open_table(R::STORE.table())?;
            let previous = table.insert(key, bytes.as_slice())?;
            let index_value = previous.and_then(|guard| old_index_value::<R>(key, guard.value()));
            index_value
        };

        let mut index = inner.open_multimap_table(R::STORE.index())?;
        if let Some(old) = previous_index.as_deref() {
            if old != row.index_value() {
                index.remove(old, key)?;
            }
        }
        index.insert(row.index_value(), key)?;

        debug!(store = R::STORE.name(), key = %key, "Wrote row");
        Ok(())
    }

    /// Insert a row that must not exist yet. On a duplicate key the whole
    /// transaction is aborted.
    pub(crate) fn add_row<R: Row>(&mut self, row: &R) -> PersonaResult<()> {
        let inner = self.inner_for(R::STORE)?;
        let exists = ReadWrite::get(inner, R::STORE, row.key())?.is_some();
        if exists {
            let key = row.key().to_string();
            if let Err(e) = self.abort() {
                warn!(error = %e, "Failed to abort after duplicate key");
            }
            return Err(PersonaError::DuplicateKey {
                store: R::STORE.name(),
                key,
            });
        }
        self.put_row(row)
    }

    /// Remove a row and its index entry. Returns the removed row if it
    /// could be decoded.
    pub(crate) fn delete_row<R: Row>(&mut self, key: &str) -> PersonaResult<Option<R>> {
        let inner = self.inner_for(R::STORE)?;

        let removed: Option<R> = {
            let mut table = inner.open_table(R::STORE.table())?;
            let previous = table.remove(key)?;
            let row = match previous {
                Some(guard) => match serde_json::from_slice::<R>(guard.value()) {
                    Ok(row) => Some(row),
                    Err(e) => {
                        warn!(store = R::STORE.name(), key = %key, error = %e, "Deleted undecodable row");
                        None
                    }
                },
                None => None,
            };
            row
        };

        if let Some(row) = &removed {
            let mut index = inner.open_multimap_table(R::STORE.index())?;
            index.remove(row.index_value(), key)?;
            debug!(store = R::STORE.name(), key = %key, "Deleted row");
        }
        Ok(removed)
    }

    /// Clear `R`'s index and refill it from the primary table. Rows that
    /// do not decode are left out.
    pub(crate) fn rebuild_index<R: Row>(&mut self) -> PersonaResult<usize> {
        let inner = self.inner_for(R::STORE)?;
        inner.delete_multimap_table(R::STORE.index())?;
        let rows = ReadWrite::scan(inner, R::STORE)?;

        let mut index = inner.open_multimap_table(R::STORE.index())?;
        let mut count = 0;
        for (key, bytes) in &rows {
            match serde_json::from_slice::<R>(bytes) {
                Ok(row) => {
                    index.insert(row.index_value(), key.as_str())?;
                    count += 1;
                }
                Err(e) => warn!(store = R::STORE.name(), key = %key, error = %e, "Row left out of index"),
            }
        }
        Ok(count)
    }
}

/// Index value of the row being replaced. An undecodable old row leaves its
/// index entry behind; `rows_by_index` skips such stale entries.
fn old_index_value<R: Row>(key: &str, bytes: &[u8]) -> Option<String> {
    match serde_json::from_slice::<R>(bytes) {
        Ok(row) => Some(row.index_value().to_string()),
        Err(e) => {
            warn!(store = R::STORE.name(), key = %key, error = %e, "Overwrote undecodable row");
            None
        }
    }
}
