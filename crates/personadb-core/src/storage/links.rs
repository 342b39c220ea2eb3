//! Profile ↔ persona links.
//!
//! A link is stored on both sides: the profile's `linked_persona` and an
//! entry in the persona's `linked_profiles` map. Both sides are written in
//! the same transaction, so these operations need both tables in scope.

use tracing::{debug, info};

use super::transaction::{ReadWrite, Transaction};
use super::{ObjectStore, PersonaStore};
use crate::error::PersonaResult;
use crate::events::PersonaEvent;
use crate::identifier::{IdentifierMap, PersonaIdentifier, ProfileIdentifier};
use crate::types::{
    LinkedProfileDetails, MergePolicy, Patch, PersonaRecordUpdate, ProfileRecord,
    ProfileRecordUpdate,
};

impl Transaction<ReadWrite> {
    /// Link `profile` to `persona`, creating the profile if needed.
    ///
    /// Does nothing if the persona does not exist. A profile linked to a
    /// different persona is detached from it first. Attaching again to the
    /// same persona only replaces the link details.
    pub fn attach_profile(
        &mut self,
        profile: &ProfileIdentifier,
        persona: &PersonaIdentifier,
        details: LinkedProfileDetails,
    ) -> PersonaResult<()> {
        if self.query_persona(persona)?.is_none() {
            debug!(%profile, %persona, "Attach skipped, persona does not exist");
            return Ok(());
        }

        let current = match self.query_profile(profile)? {
            Some(record) => record,
            None => {
                let record = ProfileRecord::new(profile.clone());
                self.create_profile(record.clone())?;
                record
            }
        };

        if let Some(linked) = &current.linked_persona {
            if linked != persona {
                self.detach_profile(profile)?;
            }
        }

        let mut links = IdentifierMap::new();
        links.insert(profile.clone(), details);
        let mut persona_update = PersonaRecordUpdate::new(persona.clone());
        persona_update.linked_profiles = Some(links);
        self.update_persona(persona_update, MergePolicy::MERGE_IGNORE)?;

        let mut profile_update = ProfileRecordUpdate::new(profile.clone());
        profile_update.linked_persona = Patch::Set(persona.clone());
        self.update_profile(profile_update)?;

        info!(%profile, %persona, "Attached profile");
        self.raise(PersonaEvent::IdentityUpdated);
        Ok(())
    }

    /// Remove the link of `profile`, on both sides. The persona is kept even
    /// if this was its last profile.
    pub fn detach_profile(&mut self, profile: &ProfileIdentifier) -> PersonaResult<()> {
        let Some(record) = self.query_profile(profile)? else {
            return Ok(());
        };
        let Some(linked) = record.linked_persona else {
            return Ok(());
        };

        if let Some(persona) = self.query_persona(&linked)? {
            let mut links = persona.linked_profiles;
            links.remove(profile);
            let mut persona_update = PersonaRecordUpdate::new(linked.clone());
            persona_update.linked_profiles = Some(links);
            self.update_persona(persona_update, MergePolicy::REPLACE_DELETE)?;
        }

        let mut profile_update = ProfileRecordUpdate::new(profile.clone());
        profile_update.linked_persona = Patch::Unset;
        self.update_profile(profile_update)?;

        info!(%profile, persona = %linked, "Detached profile");
        Ok(())
    }
}

impl PersonaStore {
    pub fn attach_profile(
        &self,
        profile: &ProfileIdentifier,
        persona: &PersonaIdentifier,
        details: LinkedProfileDetails,
    ) -> PersonaResult<()> {
        self.with_write(&ObjectStore::ALL, |tx| {
            tx.attach_profile(profile, persona, details)
        })
    }

    pub fn detach_profile(&self, profile: &ProfileIdentifier) -> PersonaResult<()> {
        self.with_write(&ObjectStore::ALL, |tx| tx.detach_profile(profile))
    }
}
