//! Record types stored in the persona database

use serde::{Deserialize, Serialize};

pub mod persona;
pub mod profile;

pub use persona::{
    ConnectionConfirmState, LinkedProfileDetails, MnemonicInfo, MnemonicParameter, PersonaRecord,
    PersonaRecordUpdate,
};
pub use profile::{ProfileRecord, ProfileRecordUpdate};

/// JSON Web Key, restricted to the members this system reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// Private scalar (EC) - present only on private keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Symmetric key material (`oct`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
}

impl JsonWebKey {
    /// EC public key from base64url coordinates
    pub fn ec_public(crv: impl Into<String>, x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            kty: "EC".to_string(),
            crv: Some(crv.into()),
            x: Some(x.into()),
            y: Some(y.into()),
            d: None,
            k: None,
            alg: None,
            ext: Some(true),
            key_ops: Some(vec!["deriveKey".to_string(), "deriveBits".to_string()]),
        }
    }

    /// The private counterpart of an EC public key
    pub fn with_private_scalar(mut self, d: impl Into<String>) -> Self {
        self.d = Some(d.into());
        self
    }

    /// Symmetric (`oct`) key, used as a record's local key
    pub fn symmetric(k: impl Into<String>) -> Self {
        Self {
            kty: "oct".to_string(),
            crv: None,
            x: None,
            y: None,
            d: None,
            k: Some(k.into()),
            alg: Some("A256GCM".to_string()),
            ext: Some(true),
            key_ops: Some(vec!["encrypt".to_string(), "decrypt".to_string()]),
        }
    }

    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }
}

/// One field of a partial update.
///
/// `Keep` means the field was not supplied. `Unset` means it was supplied as
/// explicitly empty, which is distinct from not supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Patch<T> {
    Keep,
    Set(T),
    Unset,
}

impl<T> Patch<T> {
    /// Apply to a stored field. `delete_unset` decides whether `Unset`
    /// clears the field or leaves it alone.
    pub fn apply(self, current: Option<T>, delete_unset: bool) -> Option<T> {
        match self {
            Patch::Keep => current,
            Patch::Set(value) => Some(value),
            Patch::Unset if delete_unset => None,
            Patch::Unset => current,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, Patch::Keep)
    }
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> From<Option<T>> for Patch<T> {
    /// `Some` sets the field, `None` leaves it unchanged
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Patch::Set(v),
            None => Patch::Keep,
        }
    }
}

/// How `update_persona` treats the linked-profile map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkedProfilesMerge {
    /// The incoming map overwrites the stored one
    Replace,
    /// Union; incoming entries win on equal keys
    Merge,
}

/// How `update_persona` treats fields supplied as [`Patch::Unset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedFieldPolicy {
    /// Treat as "no change"
    Ignore,
    /// Remove the field from the stored record
    DeleteField,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePolicy {
    pub linked_profiles: LinkedProfilesMerge,
    pub explicit_undefined_field: UndefinedFieldPolicy,
}

impl MergePolicy {
    pub const MERGE_IGNORE: MergePolicy = MergePolicy {
        linked_profiles: LinkedProfilesMerge::Merge,
        explicit_undefined_field: UndefinedFieldPolicy::Ignore,
    };

    pub const REPLACE_DELETE: MergePolicy = MergePolicy {
        linked_profiles: LinkedProfilesMerge::Replace,
        explicit_undefined_field: UndefinedFieldPolicy::DeleteField,
    };
}
