//! Persona record - a cryptographic identity that links to network profiles

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonWebKey, Patch};
use crate::identifier::{IdentifierMap, PersonaIdentifier, ProfileIdentifier};

/// Confirmation state of a profile ↔ persona link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionConfirmState {
    Confirmed,
    /// Also the state written when the consistency checker restores a link
    #[default]
    Pending,
    Denied,
}

/// Metadata stored with each entry of a persona's linked-profile map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedProfileDetails {
    pub connection_confirm_state: ConnectionConfirmState,
}

impl LinkedProfileDetails {
    pub fn new(state: ConnectionConfirmState) -> Self {
        Self {
            connection_confirm_state: state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MnemonicParameter {
    pub path: String,
    pub with_password: bool,
}

/// Set when the key pair was generated from mnemonic words
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MnemonicInfo {
    pub words: String,
    pub parameter: MnemonicParameter,
}

/// A persona as handed to callers. Always an owned copy of the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaRecord {
    pub identifier: PersonaIdentifier,
    pub mnemonic: Option<MnemonicInfo>,
    pub public_key: JsonWebKey,
    /// Present only for personas owned by this user
    pub private_key: Option<JsonWebKey>,
    pub local_key: Option<JsonWebKey>,
    pub nickname: Option<String>,
    pub linked_profiles: IdentifierMap<ProfileIdentifier, LinkedProfileDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersonaRecord {
    /// New persona with no links, timestamped now
    pub fn new(identifier: PersonaIdentifier, public_key: JsonWebKey) -> Self {
        let now = Utc::now();
        Self {
            identifier,
            mnemonic: None,
            public_key,
            private_key: None,
            local_key: None,
            nickname: None,
            linked_profiles: IdentifierMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_private_key(mut self, private_key: JsonWebKey) -> Self {
        self.private_key = Some(private_key);
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }
}

/// Partial persona for `update_persona` / `create_or_update_persona`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaRecordUpdate {
    pub identifier: PersonaIdentifier,
    #[serde(default)]
    pub public_key: Option<JsonWebKey>,
    #[serde(default)]
    pub private_key: Patch<JsonWebKey>,
    #[serde(default)]
    pub mnemonic: Patch<MnemonicInfo>,
    #[serde(default)]
    pub local_key: Patch<JsonWebKey>,
    #[serde(default)]
    pub nickname: Patch<String>,
    #[serde(default)]
    pub linked_profiles: Option<IdentifierMap<ProfileIdentifier, LinkedProfileDetails>>,
}

impl PersonaRecordUpdate {
    /// An update that changes nothing
    pub fn new(identifier: PersonaIdentifier) -> Self {
        Self {
            identifier,
            public_key: None,
            private_key: Patch::Keep,
            mnemonic: Patch::Keep,
            local_key: Patch::Keep,
            nickname: Patch::Keep,
            linked_profiles: None,
        }
    }
}

impl From<PersonaRecord> for PersonaRecordUpdate {
    fn from(record: PersonaRecord) -> Self {
        Self {
            identifier: record.identifier,
            public_key: Some(record.public_key),
            private_key: record.private_key.into(),
            mnemonic: record.mnemonic.into(),
            local_key: record.local_key.into(),
            nickname: record.nickname.into(),
            linked_profiles: Some(record.linked_profiles),
        }
    }
}
