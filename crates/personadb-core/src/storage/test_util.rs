//! Fixtures shared by the storage unit tests

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tempfile::TempDir;

use super::PersonaStore;
use crate::config::PersonaDbConfig;
use crate::events::EventBus;
use crate::identifier::{EcKeyIdentifier, ProfileIdentifier};
use crate::types::{JsonWebKey, PersonaRecord, ProfileRecord};

pub(crate) const NETWORK: &str = "twitter.com";

pub(crate) fn create_test_store() -> (PersonaStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = PersonaDbConfig::in_dir(temp_dir.path());
    let store = PersonaStore::open(&config, EventBus::new()).unwrap();
    (store, temp_dir)
}

pub(crate) fn create_strict_store() -> (PersonaStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = PersonaDbConfig::in_dir(temp_dir.path()).with_auto_fix(false);
    let store = PersonaStore::open(&config, EventBus::new()).unwrap();
    (store, temp_dir)
}

/// Distinct EC public key per `seed`
pub(crate) fn public_key(seed: u8) -> JsonWebKey {
    JsonWebKey::ec_public(
        "K-256",
        URL_SAFE_NO_PAD.encode([seed; 32]),
        URL_SAFE_NO_PAD.encode([seed.wrapping_add(1); 32]),
    )
}

pub(crate) fn persona_id(seed: u8) -> EcKeyIdentifier {
    EcKeyIdentifier::from_public_key(&public_key(seed)).unwrap()
}

/// Observed persona (no private key)
pub(crate) fn persona(seed: u8) -> PersonaRecord {
    PersonaRecord::new(persona_id(seed), public_key(seed))
}

/// Persona owned by this user
pub(crate) fn owned_persona(seed: u8) -> PersonaRecord {
    persona(seed).with_private_key(public_key(seed).with_private_scalar("c2VjcmV0"))
}

pub(crate) fn profile_id(seed: u8) -> ProfileIdentifier {
    ProfileIdentifier::new(NETWORK, format!("user{}", seed)).unwrap()
}

pub(crate) fn profile(seed: u8) -> ProfileRecord {
    ProfileRecord::new(profile_id(seed))
}
