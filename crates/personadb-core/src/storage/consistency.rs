//! Consistency checker for the profile ↔ persona link invariant.
//!
//! A profile's `linked_persona` names persona P exactly when P's
//! `linked_profiles` map holds that profile. The checker scans both tables
//! and reports every place where the two sides disagree:
//!
//! ```text
//! Diagnosis                 Found on   Repair
//! ───────────────────────── ────────── ──────────────────────────────────────
//! DanglingBackReference     profile    clear linked_persona
//! MissingForwardEntry       profile    add map entry (default details)
//! OrphanedForwardEntry      persona    remove map entry
//! MissingBackReference      persona    set linked_persona (first persona wins,
//!                                      later claimants lose their entry)
//! ConflictingForwardEntry   persona    remove map entry
//! MalformedForwardEntry     persona    remove map entry
//! ```
//!
//! The checker works on stored rows, not decoded records, so it can repair
//! rows whose link fields no longer decode.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::personas::PersonaRow;
use super::profiles::ProfileRow;
use super::transaction::{Mode, ReadWrite, Row, Transaction};
use crate::error::{PersonaError, PersonaResult};
use crate::events::{ChangeReason, PersonaEvent, ProfileChange};
use crate::identifier::{ProfileIdentifier, TypedIdentifier};
use crate::types::LinkedProfileDetails;

/// What to do when the check finds violations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// Repair in place
    Fix,
    /// Fail with [`PersonaError::Inconsistent`]
    Throw,
}

/// One violation of the link invariant. Identifiers are given in text form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnosis {
    /// The profile links to a persona that does not exist
    DanglingBackReference { profile: String, persona: String },
    /// The profile links to a persona whose map lacks the profile
    MissingForwardEntry { profile: String, persona: String },
    /// The persona's map lists a profile that does not exist
    OrphanedForwardEntry { persona: String, profile: String },
    /// The persona's map lists an unlinked profile
    MissingBackReference { persona: String, profile: String },
    /// The persona's map lists a profile linked to another persona
    ConflictingForwardEntry {
        persona: String,
        profile: String,
        linked_to: String,
    },
    /// The persona's map has a key that is not a profile identifier
    MalformedForwardEntry { persona: String, raw: String },
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnosis::DanglingBackReference { profile, persona } => {
                write!(f, "profile {} links to missing persona {}", profile, persona)
            }
            Diagnosis::MissingForwardEntry { profile, persona } => {
                write!(f, "profile {} links to persona {} which does not list it", profile, persona)
            }
            Diagnosis::OrphanedForwardEntry { persona, profile } => {
                write!(f, "persona {} lists missing profile {}", persona, profile)
            }
            Diagnosis::MissingBackReference { persona, profile } => {
                write!(f, "persona {} lists profile {} which is not linked", persona, profile)
            }
            Diagnosis::ConflictingForwardEntry {
                persona,
                profile,
                linked_to,
            } => write!(
                f,
                "persona {} lists profile {} which is linked to {}",
                persona, profile, linked_to
            ),
            Diagnosis::MalformedForwardEntry { persona, raw } => {
                write!(f, "persona {} lists malformed profile key {:?}", persona, raw)
            }
        }
    }
}

/// Outcome of a fix-mode check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Violations found and repaired, in the order they were repaired
    pub repaired: Vec<Diagnosis>,
    pub personas_updated: usize,
    pub profiles_updated: usize,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
    }

    pub fn len(&self) -> usize {
        self.repaired.len()
    }
}

fn rows_by_key<M: Mode, R: Row>(tx: &Transaction<M>) -> PersonaResult<BTreeMap<String, R>> {
    Ok(tx
        .scan_rows::<R>()?
        .into_iter()
        .map(|row| (row.key().to_string(), row))
        .collect())
}

fn find_violations(
    personas: &BTreeMap<String, PersonaRow>,
    profiles: &BTreeMap<String, ProfileRow>,
) -> Vec<Diagnosis> {
    let mut found = Vec::new();

    for (profile_key, profile) in profiles {
        let Some(persona_key) = &profile.linked_persona else {
            continue;
        };
        match personas.get(persona_key) {
            None => found.push(Diagnosis::DanglingBackReference {
                profile: profile_key.clone(),
                persona: persona_key.clone(),
            }),
            Some(persona) if !persona.linked_profiles.contains_key(profile_key) => {
                found.push(Diagnosis::MissingForwardEntry {
                    profile: profile_key.clone(),
                    persona: persona_key.clone(),
                })
            }
            Some(_) => {}
        }
    }

    for (persona_key, persona) in personas {
        for raw in persona.linked_profiles.keys() {
            if ProfileIdentifier::parse_typed(raw).is_err() {
                found.push(Diagnosis::MalformedForwardEntry {
                    persona: persona_key.clone(),
                    raw: raw.clone(),
                });
                continue;
            }
            let Some(profile) = profiles.get(raw) else {
                found.push(Diagnosis::OrphanedForwardEntry {
                    persona: persona_key.clone(),
                    profile: raw.clone(),
                });
                continue;
            };
            match &profile.linked_persona {
                Some(linked) if linked == persona_key => {}
                Some(linked) => found.push(Diagnosis::ConflictingForwardEntry {
                    persona: persona_key.clone(),
                    profile: raw.clone(),
                    linked_to: linked.clone(),
                }),
                None => found.push(Diagnosis::MissingBackReference {
                    persona: persona_key.clone(),
                    profile: raw.clone(),
                }),
            }
        }
    }

    found
}

impl<M: Mode> Transaction<M> {
    /// Every violation of the link invariant. Needs both tables in scope.
    pub fn diagnose(&self) -> PersonaResult<Vec<Diagnosis>> {
        let personas = rows_by_key::<M, PersonaRow>(self)?;
        let profiles = rows_by_key::<M, ProfileRow>(self)?;
        Ok(find_violations(&personas, &profiles))
    }
}

impl Transaction<ReadWrite> {
    /// Check the link invariant, repairing or failing according to `mode`.
    ///
    /// Repairs are written to this transaction; they become visible when it
    /// commits. After a fix pass, [`diagnose`](Self::diagnose) is empty.
    pub fn check_consistency(&mut self, mode: CheckMode) -> PersonaResult<ConsistencyReport> {
        let mut personas = rows_by_key::<ReadWrite, PersonaRow>(self)?;
        let mut profiles = rows_by_key::<ReadWrite, ProfileRow>(self)?;

        let violations = find_violations(&personas, &profiles);
        if violations.is_empty() {
            debug!("Persona database is consistent");
            return Ok(ConsistencyReport::default());
        }
        if mode == CheckMode::Throw {
            return Err(PersonaError::Inconsistent { violations });
        }

        let mut touched_personas = BTreeSet::new();
        let mut touched_profiles = BTreeSet::new();

        for violation in &violations {
            warn!(%violation, "Repairing persona database");
            match violation {
                Diagnosis::DanglingBackReference { profile, .. } => {
                    if let Some(row) = profiles.get_mut(profile) {
                        row.linked_persona = None;
                        touched_profiles.insert(profile.clone());
                    }
                }
                Diagnosis::MissingForwardEntry { profile, persona } => {
                    if let Some(row) = personas.get_mut(persona) {
                        row.linked_profiles
                            .insert(profile.clone(), LinkedProfileDetails::default());
                        touched_personas.insert(persona.clone());
                    }
                }
                Diagnosis::MissingBackReference { persona, profile } => {
                    let claimed_by = profiles.get_mut(profile).map(|row| {
                        row.linked_persona.get_or_insert_with(|| persona.clone()).clone()
                    });
                    if claimed_by.as_ref() == Some(persona) {
                        touched_profiles.insert(profile.clone());
                    } else if let Some(row) = personas.get_mut(persona) {
                        row.linked_profiles.remove(profile);
                        touched_personas.insert(persona.clone());
                    }
                }
                Diagnosis::OrphanedForwardEntry { persona, profile }
                | Diagnosis::ConflictingForwardEntry {
                    persona, profile, ..
                }
                | Diagnosis::MalformedForwardEntry {
                    persona,
                    raw: profile,
                } => {
                    if let Some(row) = personas.get_mut(persona) {
                        row.linked_profiles.remove(profile);
                        touched_personas.insert(persona.clone());
                    }
                }
            }
        }

        let now = Utc::now();
        for key in &touched_personas {
            if let Some(row) = personas.get_mut(key) {
                row.updated_at = now;
                self.put_row(&*row)?;
                self.raise(PersonaEvent::PersonaUpdated);
            }
        }

        let mut changes = Vec::new();
        for key in &touched_profiles {
            if let Some(row) = profiles.get_mut(key) {
                row.updated_at = now;
                self.put_row(&*row)?;
                changes.push(ProfileChange::new(
                    ChangeReason::Update,
                    row.clone().into_record().ok(),
                ));
            }
        }
        if !changes.is_empty() {
            self.raise(PersonaEvent::ProfilesChanged(changes));
        }

        Ok(ConsistencyReport {
            repaired: violations,
            personas_updated: touched_personas.len(),
            profiles_updated: touched_profiles.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{ObjectStore, PersonaStore};
    use super::*;
    use crate::types::{ConnectionConfirmState, LinkedProfileDetails};

    fn linked_pair(store: &PersonaStore, persona_seed: u8, profile_seed: u8) {
        store.create_persona(persona(persona_seed)).ok();
        store
            .attach_profile(
                &profile_id(profile_seed),
                &persona_id(persona_seed),
                LinkedProfileDetails::new(ConnectionConfirmState::Confirmed),
            )
            .unwrap();
    }

    /// Rewrite a stored profile row in place, bypassing the link operations
    fn corrupt_profile(store: &PersonaStore, seed: u8, f: impl FnOnce(&mut ProfileRow)) {
        let mut tx = store.write_transaction(&ObjectStore::ALL).unwrap();
        let mut row: ProfileRow = tx.get_row(&profile_id(seed).to_text()).unwrap().unwrap();
        f(&mut row);
        tx.put_row(&row).unwrap();
        tx.commit().unwrap();
    }

    fn corrupt_persona(store: &PersonaStore, seed: u8, f: impl FnOnce(&mut PersonaRow)) {
        let mut tx = store.write_transaction(&ObjectStore::ALL).unwrap();
        let mut row: PersonaRow = tx.get_row(&persona_id(seed).to_text()).unwrap().unwrap();
        f(&mut row);
        tx.put_row(&row).unwrap();
        tx.commit().unwrap();
    }

    fn fix(store: &PersonaStore) -> ConsistencyReport {
        let report = store.check_consistency(CheckMode::Fix).unwrap();
        assert!(store.diagnose().unwrap().is_empty());
        report
    }

    #[test]
    fn test_clean_store_has_no_violations() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        assert!(store.diagnose().unwrap().is_empty());
        assert!(store.check_consistency(CheckMode::Throw).unwrap().is_clean());
    }

    #[test]
    fn test_removed_back_reference_is_restored() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        corrupt_profile(&store, 1, |row| row.linked_persona = None);

        assert_eq!(
            store.diagnose().unwrap(),
            vec![Diagnosis::MissingBackReference {
                persona: persona_id(1).to_text(),
                profile: profile_id(1).to_text(),
            }]
        );

        let report = fix(&store);
        assert_eq!(report.profiles_updated, 1);
        let f = store.query_profile(&profile_id(1)).unwrap().unwrap();
        assert_eq!(f.linked_persona, Some(persona_id(1)));
        // The existing link details are kept
        let p = store.query_persona(&persona_id(1)).unwrap().unwrap();
        assert_eq!(
            p.linked_profiles.get(&profile_id(1)),
            Some(&LinkedProfileDetails::new(ConnectionConfirmState::Confirmed))
        );
    }

    #[test]
    fn test_dangling_back_reference_is_cleared() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        let mut tx = store.write_transaction(&ObjectStore::ALL).unwrap();
        tx.delete_row::<PersonaRow>(&persona_id(1).to_text()).unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            store.diagnose().unwrap().as_slice(),
            [Diagnosis::DanglingBackReference { .. }]
        ));
        fix(&store);
        let f = store.query_profile(&profile_id(1)).unwrap().unwrap();
        assert!(f.linked_persona.is_none());
    }

    #[test]
    fn test_missing_forward_entry_gets_pending_details() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        corrupt_persona(&store, 1, |row| row.linked_profiles.clear());

        assert!(matches!(
            store.diagnose().unwrap().as_slice(),
            [Diagnosis::MissingForwardEntry { .. }]
        ));
        let report = fix(&store);
        assert_eq!(report.personas_updated, 1);
        let p = store.query_persona(&persona_id(1)).unwrap().unwrap();
        assert_eq!(
            p.linked_profiles.get(&profile_id(1)),
            Some(&LinkedProfileDetails::new(ConnectionConfirmState::Pending))
        );
    }

    #[test]
    fn test_orphaned_forward_entry_is_removed() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        let mut tx = store.write_transaction(&ObjectStore::ALL).unwrap();
        tx.delete_profile(&profile_id(1)).unwrap();
        tx.commit().unwrap();

        assert!(matches!(
            store.diagnose().unwrap().as_slice(),
            [Diagnosis::OrphanedForwardEntry { .. }]
        ));
        fix(&store);
        let p = store.query_persona(&persona_id(1)).unwrap().unwrap();
        assert!(p.linked_profiles.is_empty());
    }

    #[test]
    fn test_conflicting_forward_entry_is_removed() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        store.create_persona(persona(2)).unwrap();
        corrupt_persona(&store, 2, |row| {
            row.linked_profiles
                .insert(profile_id(1).to_text(), LinkedProfileDetails::default());
        });

        assert!(matches!(
            store.diagnose().unwrap().as_slice(),
            [Diagnosis::ConflictingForwardEntry { linked_to, .. }] if *linked_to == persona_id(1).to_text()
        ));
        fix(&store);
        let p2 = store.query_persona(&persona_id(2)).unwrap().unwrap();
        assert!(p2.linked_profiles.is_empty());
        let f = store.query_profile(&profile_id(1)).unwrap().unwrap();
        assert_eq!(f.linked_persona, Some(persona_id(1)));
    }

    #[test]
    fn test_malformed_forward_entry_is_removed() {
        let (store, _dir) = create_test_store();
        store.create_persona(persona(1)).unwrap();
        corrupt_persona(&store, 1, |row| {
            row.linked_profiles
                .insert("not-an-identifier".to_string(), LinkedProfileDetails::default());
        });

        assert_eq!(
            store.diagnose().unwrap(),
            vec![Diagnosis::MalformedForwardEntry {
                persona: persona_id(1).to_text(),
                raw: "not-an-identifier".to_string(),
            }]
        );
        fix(&store);
    }

    #[test]
    fn test_first_claimant_wins_unlinked_profile() {
        let (store, _dir) = create_test_store();
        store.create_persona(persona(1)).unwrap();
        store.create_persona(persona(2)).unwrap();
        store.create_profile(profile(1)).unwrap();
        for seed in [1, 2] {
            corrupt_persona(&store, seed, |row| {
                row.linked_profiles
                    .insert(profile_id(1).to_text(), LinkedProfileDetails::default());
            });
        }

        let mut claimants = vec![persona_id(1).to_text(), persona_id(2).to_text()];
        claimants.sort();
        fix(&store);

        let f = store.query_profile(&profile_id(1)).unwrap().unwrap();
        assert_eq!(f.linked_persona.map(|p| p.to_text()), Some(claimants[0].clone()));
    }

    #[test]
    fn test_throw_mode_reports_and_changes_nothing() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        corrupt_profile(&store, 1, |row| row.linked_persona = None);

        match store.check_consistency(CheckMode::Throw) {
            Err(PersonaError::Inconsistent { violations }) => assert_eq!(violations.len(), 1),
            other => panic!("expected Inconsistent, got {:?}", other),
        }
        assert_eq!(store.diagnose().unwrap().len(), 1);
    }

    #[test]
    fn test_fix_raises_update_events() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        corrupt_profile(&store, 1, |row| row.linked_persona = None);
        store.bus().dispatch_pending();

        let mut rx = store.bus().subscribe();
        fix(&store);
        store.bus().dispatch_pending();
        match rx.try_recv().unwrap() {
            PersonaEvent::ProfilesChanged(changes) => {
                assert_eq!(changes[0].reason, ChangeReason::Update);
                assert_eq!(
                    changes[0].of.as_ref().and_then(|p| p.linked_persona.clone()),
                    Some(persona_id(1))
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_diagnosis_display() {
        let d = Diagnosis::OrphanedForwardEntry {
            persona: "ec_key:secp256k1/abc".to_string(),
            profile: "person:twitter.com/alice".to_string(),
        };
        assert_eq!(
            d.to_string(),
            "persona ec_key:secp256k1/abc lists missing profile person:twitter.com/alice"
        );
    }

    // ═══════════════════════════════════════════════════════════════════════
    // consistent_write_access
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_write_access_repairs_after_action() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);

        // Deleting the profile leaves an orphaned entry on the persona
        let removed = store
            .consistent_write_access(|tx| tx.delete_profile(&profile_id(1)))
            .unwrap();
        assert!(removed.is_some());
        assert!(store.diagnose().unwrap().is_empty());
        let p = store.query_persona(&persona_id(1)).unwrap().unwrap();
        assert!(p.linked_profiles.is_empty());
    }

    #[test]
    fn test_strict_write_access_rejects_inconsistent_action() {
        let (store, _dir) = create_strict_store();
        linked_pair(&store, 1, 1);

        let result = store.consistent_write_access(|tx| tx.delete_profile(&profile_id(1)));
        assert!(matches!(result, Err(PersonaError::Inconsistent { .. })));
        // Nothing from the action was committed
        assert!(store.query_profile(&profile_id(1)).unwrap().is_some());
    }

    #[test]
    fn test_write_access_checks_after_failed_action() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        corrupt_profile(&store, 1, |row| row.linked_persona = None);

        let result = store.consistent_write_access(|tx| {
            tx.create_persona(persona(2))?;
            tx.create_persona(persona(1))
        });
        assert!(matches!(result, Err(PersonaError::DuplicateKey { .. })));
        // The action was rolled back, the repair was not
        assert!(store.query_persona(&persona_id(2)).unwrap().is_none());
        assert!(store.diagnose().unwrap().is_empty());
    }

    #[test]
    fn test_write_access_when_action_commits_early() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);

        store
            .consistent_write_access(|tx| {
                tx.delete_profile(&profile_id(1))?;
                tx.commit()
            })
            .unwrap();

        assert!(store.query_profile(&profile_id(1)).unwrap().is_none());
        assert!(store.diagnose().unwrap().is_empty());
    }

    #[test]
    fn test_write_access_with_explicit_mode() {
        let (store, _dir) = create_test_store();
        linked_pair(&store, 1, 1);
        corrupt_profile(&store, 1, |row| row.linked_persona = None);

        let result = store.consistent_write_access_with(CheckMode::Throw, |_| Ok(()));
        assert!(matches!(result, Err(PersonaError::Inconsistent { .. })));
        store
            .consistent_write_access_with(CheckMode::Fix, |_| Ok(()))
            .unwrap();
        assert!(store.diagnose().unwrap().is_empty());
    }
}
