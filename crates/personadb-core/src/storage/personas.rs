//! Persona table operations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::transaction::{Mode, ReadWrite, Row, Transaction};
use super::{ObjectStore, PersonaStore};
use crate::error::{PersonaError, PersonaResult};
use crate::events::PersonaEvent;
use crate::identifier::{IdentifierMap, PersonaIdentifier, ProfileIdentifier, TypedIdentifier};
use crate::types::{
    JsonWebKey, LinkedProfileDetails, LinkedProfilesMerge, MergePolicy, MnemonicInfo, Patch,
    PersonaRecord, PersonaRecordUpdate, UndefinedFieldPolicy,
};

const HAS_PRIVATE_KEY: &str = "yes";
const NO_PRIVATE_KEY: &str = "no";

/// Confirmation required by [`Transaction::delete_persona`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteConfirmation {
    DeleteEvenWithPrivate,
    DontDeleteIfHasPrivateKey,
}

/// Stored form of a persona
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PersonaRow {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<MnemonicInfo>,
    pub public_key: JsonWebKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<JsonWebKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_key: Option<JsonWebKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default)]
    pub linked_profiles: BTreeMap<String, LinkedProfileDetails>,
    /// Index value, derived from `private_key` on every write
    pub has_private_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Row for PersonaRow {
    const STORE: ObjectStore = ObjectStore::Personas;

    fn key(&self) -> &str {
        &self.identifier
    }

    fn index_value(&self) -> &str {
        &self.has_private_key
    }
}

impl PersonaRow {
    pub(crate) fn from_record(record: &PersonaRecord) -> Self {
        let has_private_key = if record.has_private_key() {
            HAS_PRIVATE_KEY
        } else {
            NO_PRIVATE_KEY
        };
        Self {
            identifier: record.identifier.to_text(),
            mnemonic: record.mnemonic.clone(),
            public_key: record.public_key.clone(),
            private_key: record.private_key.clone(),
            local_key: record.local_key.clone(),
            nickname: record.nickname.clone(),
            linked_profiles: record.linked_profiles.raw().clone(),
            has_private_key: has_private_key.to_string(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    pub(crate) fn into_record(self) -> PersonaResult<PersonaRecord> {
        Ok(PersonaRecord {
            identifier: PersonaIdentifier::parse_typed(&self.identifier)?,
            mnemonic: self.mnemonic,
            public_key: self.public_key,
            private_key: self.private_key,
            local_key: self.local_key,
            nickname: self.nickname,
            linked_profiles: IdentifierMap::from_raw(self.linked_profiles),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn merge_persona(
    mut current: PersonaRecord,
    update: PersonaRecordUpdate,
    policy: MergePolicy,
) -> PersonaRecord {
    let delete_unset = policy.explicit_undefined_field == UndefinedFieldPolicy::DeleteField;

    if let Some(public_key) = update.public_key {
        current.public_key = public_key;
    }
    current.private_key = update.private_key.apply(current.private_key, delete_unset);
    current.mnemonic = update.mnemonic.apply(current.mnemonic, delete_unset);
    current.local_key = update.local_key.apply(current.local_key, delete_unset);
    current.nickname = update.nickname.apply(current.nickname, delete_unset);

    if let Some(links) = update.linked_profiles {
        match policy.linked_profiles {
            LinkedProfilesMerge::Replace => current.linked_profiles = links,
            LinkedProfilesMerge::Merge => current.linked_profiles.merge(links),
        }
    }

    current.updated_at = Utc::now();
    current
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
    /// Returns `None` if the persona is not stored.
    pub fn query_persona(&self, id: &PersonaIdentifier) -> PersonaResult<Option<PersonaRecord>> {
        self.get_row::<PersonaRow>(&id.to_text())?
            .map(PersonaRow::into_record)
            .transpose()
    }

    /// Full scan, in key order.
    pub fn query_personas(
        &self,
        mut predicate: impl FnMut(&PersonaRecord) -> bool,
    ) -> PersonaResult<Vec<PersonaRecord>> {
        let mut records = Vec::new();
        for row in self.scan_rows::<PersonaRow>()? {
            let record = row.into_record()?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Personas owned by this user, found through the `hasPrivateKey` index.
    pub fn query_personas_with_private_key(&self) -> PersonaResult<Vec<PersonaRecord>> {
        self.rows_by_index::<PersonaRow>(HAS_PRIVATE_KEY)?
            .into_iter()
            .map(PersonaRow::into_record)
            .collect()
    }

    /// The persona a profile is linked to. Needs both tables in scope.
    pub fn query_persona_by_profile(
        &self,
        profile: &ProfileIdentifier,
    ) -> PersonaResult<Option<PersonaRecord>> {
        match self.query_profile(profile)?.and_then(|p| p.linked_persona) {
            Some(persona) => self.query_persona(&persona),
            None => Ok(None),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Writes
// ═══════════════════════════════════════════════════════════════════════════

impl Transaction<ReadWrite> {
    /// Insert a new persona. Fails with `DuplicateKey` (and aborts the
    /// transaction) if it already exists.
    pub fn create_persona(&mut self, record: PersonaRecord) -> PersonaResult<()> {
        self.add_row(&PersonaRow::from_record(&record))?;
        debug!(persona = %record.identifier, "Created persona");
        self.raise(PersonaEvent::PersonaCreated);
        self.raise(PersonaEvent::PersonaUpdated);
        Ok(())
    }

    /// Merge `update` into the stored persona and return the result.
    pub fn update_persona(
        &mut self,
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    ) -> PersonaResult<PersonaRecord> {
        let key = update.identifier.to_text();
        let current = self
            .get_row::<PersonaRow>(&key)?
            .ok_or(PersonaError::UpdateNonExistent(key))?
            .into_record()?;

        let next = merge_persona(current, update, policy);
        self.put_row(&PersonaRow::from_record(&next))?;
        self.raise(PersonaEvent::PersonaUpdated);
        Ok(next)
    }

    /// Update if stored, otherwise create. Creating needs a public key.
    pub fn create_or_update_persona(
        &mut self,
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    ) -> PersonaResult<PersonaRecord> {
        if self.get_row::<PersonaRow>(&update.identifier.to_text())?.is_some() {
            return self.update_persona(update, policy);
        }

        let public_key = update
            .public_key
            .ok_or_else(|| PersonaError::MissingPublicKey(update.identifier.to_text()))?;
        let mut record = PersonaRecord::new(update.identifier, public_key);
        record.private_key = set_only(update.private_key);
        record.mnemonic = set_only(update.mnemonic);
        record.local_key = set_only(update.local_key);
        record.nickname = set_only(update.nickname);
        if let Some(links) = update.linked_profiles {
            record.linked_profiles = links;
        }

        self.create_persona(record.clone())?;
        Ok(record)
    }

    /// Delete a persona. Absent personas are a no-op.
    pub fn delete_persona(
        &mut self,
        id: &PersonaIdentifier,
        confirmation: DeleteConfirmation,
    ) -> PersonaResult<()> {
        let key = id.to_text();
        let Some(row) = self.get_row::<PersonaRow>(&key)? else {
            return Ok(());
        };
        if confirmation == DeleteConfirmation::DontDeleteIfHasPrivateKey && row.private_key.is_some() {
            return Err(PersonaError::PrivateKeyProtected(key));
        }

        self.delete_row::<PersonaRow>(&key)?;
        debug!(persona = %key, "Deleted persona");
        self.raise(PersonaEvent::PersonaUpdated);
        Ok(())
    }

    /// Delete a persona only if it has no linked profiles and no private
    /// key. Returns whether the persona is gone afterwards.
    pub fn safe_delete_persona(&mut self, id: &PersonaIdentifier) -> PersonaResult<bool> {
        let Some(record) = self.query_persona(id)? else {
            return Ok(true);
        };
        if !record.linked_profiles.is_empty() || record.has_private_key() {
            return Ok(false);
        }

        self.delete_persona(id, DeleteConfirmation::DontDeleteIfHasPrivateKey)?;
        self.raise(PersonaEvent::PersonaUpdated);
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-step forms
// ═══════════════════════════════════════════════════════════════════════════

impl PersonaStore {
    pub fn create_persona(&self, record: PersonaRecord) -> PersonaResult<()> {
        self.with_write(&[ObjectStore::Personas], |tx| tx.create_persona(record))
    }

    pub fn query_persona(&self, id: &PersonaIdentifier) -> PersonaResult<Option<PersonaRecord>> {
        self.with_read(&[ObjectStore::Personas], |tx| tx.query_persona(id))
    }

    pub fn query_personas(
        &self,
        predicate: impl FnMut(&PersonaRecord) -> bool,
    ) -> PersonaResult<Vec<PersonaRecord>> {
        self.with_read(&[ObjectStore::Personas], |tx| tx.query_personas(predicate))
    }

    pub fn query_personas_with_private_key(&self) -> PersonaResult<Vec<PersonaRecord>> {
        self.with_read(&[ObjectStore::Personas], |tx| tx.query_personas_with_private_key())
    }

    pub fn query_persona_by_profile(
        &self,
        profile: &ProfileIdentifier,
    ) -> PersonaResult<Option<PersonaRecord>> {
        self.with_read(&ObjectStore::ALL, |tx| tx.query_persona_by_profile(profile))
    }

    pub fn update_persona(
        &self,
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    ) -> PersonaResult<PersonaRecord> {
        self.with_write(&[ObjectStore::Personas], |tx| tx.update_persona(update, policy))
    }

    pub fn create_or_update_persona(
        &self,
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    ) -> PersonaResult<PersonaRecord> {
        self.with_write(&[ObjectStore::Personas], |tx| {
            tx.create_or_update_persona(update, policy)
        })
    }

    pub fn delete_persona(
        &self,
        id: &PersonaIdentifier,
        confirmation: DeleteConfirmation,
    ) -> PersonaResult<()> {
        self.with_write(&[ObjectStore::Personas], |tx| tx.delete_persona(id, confirmation))
    }

    pub fn safe_delete_persona(&self, id: &PersonaIdentifier) -> PersonaResult<bool> {
        self.with_write(&[ObjectStore::Personas], |tx| tx.safe_delete_persona(id))
    }
}
