//! Profile table operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::transaction::{Mode, ReadWrite, Row, Transaction};
use super::{ObjectStore, PersonaStore};
use crate::error::{PersonaError, PersonaResult};
use crate::events::{ChangeReason, PersonaEvent};
use crate::identifier::{Identifier, PersonaIdentifier, ProfileIdentifier, TypedIdentifier};
use crate::types::{JsonWebKey, Patch, ProfileRecord, ProfileRecordUpdate};

/// Stored form of a profile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProfileRow {
    pub identifier: String,
    /// Index value, derived from the identifier on every write
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<JsonWebKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_persona: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Row for ProfileRow {
    const STORE: ObjectStore = ObjectStore::Profiles;

    fn key(&self) -> &str {
        &self.identifier
    }

    fn index_value(&self) -> &str {
        &self.network
    }
}

impl ProfileRow {
    pub(crate) fn from_record(record: &ProfileRecord) -> Self {
        Self {
            identifier: record.identifier.to_text(),
            network: record.network().to_string(),
            nickname: record.nickname.clone(),
            local_key: record.local_key.clone(),
            linked_persona: record.linked_persona.as_ref().map(|p| p.to_text()),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    pub(crate) fn into_record(self) -> PersonaResult<ProfileRecord> {
        let linked_persona = match self.linked_persona {
            Some(raw) => Some(decode_linked_persona(raw)?),
            None => None,
        };
        Ok(ProfileRecord {
            identifier: ProfileIdentifier::parse_typed(&self.identifier)?,
            nickname: self.nickname,
            local_key: self.local_key,
            linked_persona,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn decode_linked_persona(raw: String) -> PersonaResult<PersonaIdentifier> {
    match Identifier::parse(&raw)? {
        Identifier::EcKey(persona) => Ok(persona),
        _ => Err(PersonaError::UnexpectedLinkedType { raw }),
    }
}

fn set_only<T>(patch: Patch<T>) -> Option<T> {
    match patch {
        Patch::Set(value) => Some(value),
        Patch::Keep | Patch::Unset => None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Reads
// ═══════════════════════════════════════════════════════════════════════════

impl<M: Mode> Transaction<M> {
    /// Returns `None` if the profile is not stored.
    pub fn query_profile(&self, id: &ProfileIdentifier) -> PersonaResult<Option<ProfileRecord>> {
        self.get_row::<ProfileRow>(&id.to_text())?
            .map(ProfileRow::into_record)
            .transpose()
    }

    /// Full scan, in key order.
    pub fn query_profiles(
        &self,
        mut predicate: impl FnMut(&ProfileRecord) -> bool,
    ) -> PersonaResult<Vec<ProfileRecord>> {
        let mut records = Vec::new();
        for row in self.scan_rows::<ProfileRow>()? {
            let record = row.into_record()?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Profiles on one network, found through the `network` index.
    pub fn query_profiles_by_network(&self, network: &str) -> PersonaResult<Vec<ProfileRecord>> {
        self.rows_by_index::<ProfileRow>(network)?
            .into_iter()
            .map(ProfileRow::into_record)
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Writes
// ═══════════════════════════════════════════════════════════════════════════

impl Transaction<ReadWrite> {
    /// Insert a new profile. Fails with `DuplicateKey` (and aborts the
    /// transaction) if it already exists.
    pub fn create_profile(&mut self, record: ProfileRecord) -> PersonaResult<()> {
        self.add_row(&ProfileRow::from_record(&record))?;
        debug!(profile = %record.identifier, "Created profile");
        self.raise(PersonaEvent::IdentityCreated);
        self.raise(PersonaEvent::profile_changed(ChangeReason::New, Some(record)));
        Ok(())
    }

    /// Apply `update` to the stored profile and return the result.
    /// Fields supplied as [`Patch::Unset`] are cleared.
    pub fn update_profile(&mut self, update: ProfileRecordUpdate) -> PersonaResult<ProfileRecord> {
        let key = update.identifier.to_text();
        let mut record = self
            .get_row::<ProfileRow>(&key)?
            .ok_or(PersonaError::UpdateNonExistent(key))?
            .into_record()?;

        record.nickname = update.nickname.apply(record.nickname, true);
        record.local_key = update.local_key.apply(record.local_key, true);
        record.linked_persona = update.linked_persona.apply(record.linked_persona, true);
        record.touch();

        self.put_row(&ProfileRow::from_record(&record))?;
        self.raise(PersonaEvent::profile_changed(
            ChangeReason::Update,
            Some(record.clone()),
        ));
        Ok(record)
    }

    /// Update if stored, otherwise create.
    pub fn create_or_update_profile(
        &mut self,
        update: ProfileRecordUpdate,
    ) -> PersonaResult<ProfileRecord> {
        if self.get_row::<ProfileRow>(&update.identifier.to_text())?.is_some() {
            return self.update_profile(update);
        }

        let mut record = ProfileRecord::new(update.identifier);
        record.nickname = set_only(update.nickname);
        record.local_key = set_only(update.local_key);
        record.linked_persona = set_only(update.linked_persona);

        self.create_profile(record.clone())?;
        Ok(record)
    }

    /// Remove a profile row and return it. Persona link maps are left as
    /// they are; the consistency check cleans up the forward entry.
    pub fn delete_profile(&mut self, id: &ProfileIdentifier) -> PersonaResult<Option<ProfileRecord>> {
        let key = id.to_text();
        let Some(row) = self.delete_row::<ProfileRow>(&key)? else {
            return Ok(None);
        };

        let removed = match row.into_record() {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(profile = %key, error = %e, "Deleted profile could not be decoded");
                None
            }
        };
        debug!(profile = %key, "Deleted profile");
        self.raise(PersonaEvent::profile_changed(ChangeReason::Delete, removed.clone()));
        Ok(removed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-step forms
// ═══════════════════════════════════════════════════════════════════════════

impl PersonaStore {
    pub fn create_profile(&self, record: ProfileRecord) -> PersonaResult<()> {
        self.with_write(&[ObjectStore::Profiles], |tx| tx.create_profile(record))
    }

    pub fn query_profile(&self, id: &ProfileIdentifier) -> PersonaResult<Option<ProfileRecord>> {
        self.with_read(&[ObjectStore::Profiles], |tx| tx.query_profile(id))
    }

    pub fn query_profiles(
        &self,
        predicate: impl FnMut(&ProfileRecord) -> bool,
    ) -> PersonaResult<Vec<ProfileRecord>> {
        self.with_read(&[ObjectStore::Profiles], |tx| tx.query_profiles(predicate))
    }

    pub fn query_profiles_by_network(&self, network: &str) -> PersonaResult<Vec<ProfileRecord>> {
        self.with_read(&[ObjectStore::Profiles], |tx| tx.query_profiles_by_network(network))
    }

    pub fn update_profile(&self, update: ProfileRecordUpdate) -> PersonaResult<ProfileRecord> {
        self.with_write(&[ObjectStore::Profiles], |tx| tx.update_profile(update))
    }

    pub fn create_or_update_profile(
        &self,
        update: ProfileRecordUpdate,
    ) -> PersonaResult<ProfileRecord> {
        self.with_write(&[ObjectStore::Profiles], |tx| tx.create_or_update_profile(update))
    }

    pub fn delete_profile(&self, id: &ProfileIdentifier) -> PersonaResult<Option<ProfileRecord>> {
        self.with_write(&[ObjectStore::Profiles], |tx| tx.delete_profile(id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::events::ProfileChange;
    use crate::identifier::GroupIdentifier;

    #[test]
    fn test_create_and_query() {
        let (store, _dir) = create_test_store();
        let record = profile(1).with_nickname("Alice");
        store.create_profile(record.clone()).unwrap();

        assert_eq!(store.query_profile(&profile_id(1)).unwrap(), Some(record));
        assert!(store.query_profile(&profile_id(2)).unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let (store, _dir) = create_test_store();
        store.create_profile(profile(1)).unwrap();
        assert!(matches!(
            store.create_profile(profile(1)),
            Err(PersonaError::DuplicateKey { store: "profiles", .. })
        ));
    }

    #[test]
    fn test_create_emits_new_change() {
        let (store, _dir) = create_test_store();
        let mut rx = store.bus().subscribe();
        store.create_profile(profile(1)).unwrap();
        store.bus().dispatch_pending();

        assert_eq!(rx.try_recv().unwrap(), PersonaEvent::IdentityCreated);
        match rx.try_recv().unwrap() {
            PersonaEvent::ProfilesChanged(changes) => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].reason, ChangeReason::New);
                assert_eq!(changes[0].of.as_ref().unwrap().identifier, profile_id(1));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_query_by_network_uses_index() {
        let (store, _dir) = create_test_store();
        store.create_profile(profile(1)).unwrap();
        store.create_profile(profile(2)).unwrap();
        let other = ProfileIdentifier::new("facebook.com", "carol").unwrap();
        store.create_profile(ProfileRecord::new(other.clone())).unwrap();

        assert_eq!(store.query_profiles_by_network(NETWORK).unwrap().len(), 2);
        let facebook = store.query_profiles_by_network("facebook.com").unwrap();
        assert_eq!(facebook.len(), 1);
        assert_eq!(facebook[0].identifier, other);
        assert!(store.query_profiles_by_network("unknown").unwrap().is_empty());
    }

    #[test]
    fn test_update_clears_unset_fields() {
        let (store, _dir) = create_test_store();
        store.create_profile(profile(1).with_nickname("Alice")).unwrap();

        let mut update = ProfileRecordUpdate::new(profile_id(1));
        update.nickname = Patch::Unset;
        let next = store.update_profile(update).unwrap();
        assert_eq!(next.nickname, None);

        let renamed = store
            .update_profile(ProfileRecordUpdate::new(profile_id(1)).nickname("Al"))
            .unwrap();
        assert_eq!(renamed.nickname.as_deref(), Some("Al"));
        assert!(renamed.updated_at >= next.updated_at);
    }

    #[test]
    fn test_update_nonexistent_fails() {
        let (store, _dir) = create_test_store();
        assert!(matches!(
            store.update_profile(ProfileRecordUpdate::new(profile_id(1))),
            Err(PersonaError::UpdateNonExistent(_))
        ));
    }

    #[test]
    fn test_create_or_update() {
        let (store, _dir) = create_test_store();
        let created = store
            .create_or_update_profile(ProfileRecordUpdate::new(profile_id(1)).nickname("a"))
            .unwrap();
        let updated = store
            .create_or_update_profile(ProfileRecordUpdate::new(profile_id(1)).nickname("b"))
            .unwrap();
        assert_eq!(updated.nickname.as_deref(), Some("b"));
        assert_eq!(updated.created_at, created.created_at);
    }

    #[test]
    fn test_delete_returns_removed_record() {
        let (store, _dir) = create_test_store();
        let mut rx = store.bus().subscribe();
        store.create_profile(profile(1)).unwrap();

        let removed = store.delete_profile(&profile_id(1)).unwrap();
        assert_eq!(removed.as_ref().map(|p| &p.identifier), Some(&profile_id(1)));
        assert!(store.query_profile(&profile_id(1)).unwrap().is_none());
        assert!(store.query_profiles_by_network(NETWORK).unwrap().is_empty());
        assert!(store.delete_profile(&profile_id(1)).unwrap().is_none());

        store.bus().dispatch_pending();
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert_eq!(
            last,
            Some(PersonaEvent::ProfilesChanged(vec![ProfileChange::new(
                ChangeReason::Delete,
                removed
            )]))
        );
    }

    #[test]
    fn test_linked_persona_of_wrong_kind_is_rejected() {
        let (store, _dir) = create_test_store();
        let mut tx = store.write_transaction(&[ObjectStore::Profiles]).unwrap();
        let mut row = ProfileRow::from_record(&profile(1));
        row.linked_persona = Some(
            GroupIdentifier::new(NETWORK, "user1", "friends")
                .unwrap()
                .to_text(),
        );
        tx.put_row(&row).unwrap();

        match tx.query_profile(&profile_id(1)) {
            Err(PersonaError::UnexpectedLinkedType { raw }) => {
                assert_eq!(raw, "group:twitter.com/user1/friends");
            }
            other => panic!("expected UnexpectedLinkedType, got {:?}", other),
        }
    }
}
