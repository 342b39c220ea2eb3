//! Profile record - one user identity on one social network

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JsonWebKey, Patch};
use crate::identifier::{PersonaIdentifier, ProfileIdentifier};

/// A profile as handed to callers. Always an owned copy of the stored row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub identifier: ProfileIdentifier,
    pub nickname: Option<String>,
    pub local_key: Option<JsonWebKey>,
    /// Back-reference to the persona whose linked-profile map holds this profile
    pub linked_persona: Option<PersonaIdentifier>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileRecord {
    /// New unlinked profile, timestamped now
    pub fn new(identifier: ProfileIdentifier) -> Self {
        let now = Utc::now();
        Self {
            identifier,
            nickname: None,
            local_key: None,
            linked_persona: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Network component of the identifier
    pub fn network(&self) -> &str {
        self.identifier.network()
    }

    /// Update the profile's timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Partial profile for `update_profile`.
///
/// Profile updates always clear fields supplied as [`Patch::Unset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecordUpdate {
    pub identifier: ProfileIdentifier,
    #[serde(default)]
    pub nickname: Patch<String>,
    #[serde(default)]
    pub local_key: Patch<JsonWebKey>,
    #[serde(default)]
    pub linked_persona: Patch<PersonaIdentifier>,
}

impl ProfileRecordUpdate {
    /// An update that changes nothing
    pub fn new(identifier: ProfileIdentifier) -> Self {
        Self {
            identifier,
            nickname: Patch::Keep,
            local_key: Patch::Keep,
            linked_persona: Patch::Keep,
        }
    }

    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Patch::Set(nickname.into());
        self
    }
}

/// A full record overwrites every optional field, absent ones included.
impl From<ProfileRecord> for ProfileRecordUpdate {
    fn from(record: ProfileRecord) -> Self {
        fn overwrite<T>(value: Option<T>) -> Patch<T> {
            value.map(Patch::Set).unwrap_or(Patch::Unset)
        }
        Self {
            identifier: record.identifier,
            nickname: overwrite(record.nickname),
            local_key: overwrite(record.local_key),
            linked_persona: overwrite(record.linked_persona),
        }
    }
}
