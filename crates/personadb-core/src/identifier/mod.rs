//! Typed identifiers for personas, profiles, groups and posts
//!
//! Every identifier has a canonical text form used as the store key:
//!
//! ```text
//! person:{network}/{user_id}                    ProfileIdentifier
//! ec_key:{curve}/{compressed_point}             EcKeyIdentifier (persona)
//! group:{network}/{virtual_group_owner}/{id}    GroupIdentifier
//! post:{post_id}/{person:...}                   PostIdentifier
//! ```
//!
//! The compressed point is standard base64, so it may contain `/`. In the
//! text form every `/` of the point is written as `|`.
//!
//! Decoding is a two-step tagged-union decode: the prefix selects the kind,
//! then the kind's own parser builds the typed value. Callers that expect a
//! specific kind use [`TypedIdentifier::parse_typed`], which reports the
//! expected and actual kind on mismatch.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{PersonaError, PersonaResult};
use crate::types::JsonWebKey;

pub mod map;

pub use map::IdentifierMap;

/// A persona is identified by its EC public key.
pub type PersonaIdentifier = EcKeyIdentifier;

/// Kind tag of an identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Profile,
    EcKey,
    Group,
    Post,
}

impl IdentifierType {
    /// Prefix used in the text form (before the first `:`)
    pub fn prefix(&self) -> &'static str {
        match self {
            IdentifierType::Profile => "person",
            IdentifierType::EcKey => "ec_key",
            IdentifierType::Group => "group",
            IdentifierType::Post => "post",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "person" => Some(IdentifierType::Profile),
            "ec_key" => Some(IdentifierType::EcKey),
            "group" => Some(IdentifierType::Group),
            "post" => Some(IdentifierType::Post),
            _ => None,
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentifierType::Profile => "ProfileIdentifier",
            IdentifierType::EcKey => "ECKeyIdentifier",
            IdentifierType::Group => "GroupIdentifier",
            IdentifierType::Post => "PostIdentifier",
        };
        f.write_str(name)
    }
}

fn malformed(raw: &str, reason: impl Into<String>) -> PersonaError {
    PersonaError::MalformedIdentifier {
        raw: raw.to_string(),
        reason: reason.into(),
    }
}

/// Validate one `/`-separated component.
fn check_component(raw: &str, name: &str, value: &str) -> PersonaResult<()> {
    if value.is_empty() {
        return Err(malformed(raw, format!("{} must not be empty", name)));
    }
    if value.contains('/') {
        return Err(malformed(raw, format!("{} must not contain '/'", name)));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// ProfileIdentifier
// ═══════════════════════════════════════════════════════════════════════════

/// A user on one social network.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfileIdentifier {
    network: String,
    user_id: String,
}

impl ProfileIdentifier {
    pub fn new(network: impl Into<String>, user_id: impl Into<String>) -> PersonaResult<Self> {
        let network = network.into();
        let user_id = user_id.into();
        let id = Self { network, user_id };
        let raw = id.to_text();
        check_component(&raw, "network", &id.network)?;
        check_component(&raw, "user id", &id.user_id)?;
        Ok(id)
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn to_text(&self) -> String {
        format!("person:{}/{}", self.network, self.user_id)
    }

    fn parse_body(raw: &str, body: &str) -> PersonaResult<Self> {
        let (network, user_id) = body
            .split_once('/')
            .ok_or_else(|| malformed(raw, "expected {network}/{user_id}"))?;
        check_component(raw, "network", network)?;
        check_component(raw, "user id", user_id)?;
        Ok(Self {
            network: network.to_string(),
            user_id: user_id.to_string(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EcKeyIdentifier
// ═══════════════════════════════════════════════════════════════════════════

/// A persona: an EC public key named by curve and compressed point.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EcKeyIdentifier {
    curve: String,
    compressed_point: String,
}

impl EcKeyIdentifier {
    pub const DEFAULT_CURVE: &'static str = "secp256k1";

    pub fn new(curve: impl Into<String>, compressed_point: impl Into<String>) -> PersonaResult<Self> {
        let id = Self {
            curve: curve.into(),
            compressed_point: compressed_point.into(),
        };
        let raw = id.to_text();
        check_component(&raw, "curve", &id.curve)?;
        if id.compressed_point.is_empty() {
            return Err(malformed(&raw, "compressed point must not be empty"));
        }
        if id.compressed_point.contains('|') {
            return Err(malformed(&raw, "compressed point must not contain '|'"));
        }
        Ok(id)
    }

    /// Derive the persona identifier from an EC public key.
    ///
    /// The compressed point is `0x02 | (y & 1)` followed by `x`, encoded as
    /// standard base64.
    pub fn from_public_key(key: &JsonWebKey) -> PersonaResult<Self> {
        let describe = || format!("jwk:{}", key.crv.as_deref().unwrap_or("?"));
        let crv = key
            .crv
            .as_deref()
            .ok_or_else(|| malformed(&describe(), "public key has no curve"))?;
        let x = Self::decode_coordinate(key.x.as_deref(), "x", &describe())?;
        let y = Self::decode_coordinate(key.y.as_deref(), "y", &describe())?;
        let parity = y.last().map(|b| b & 1).unwrap_or(0);

        let mut compressed = Vec::with_capacity(x.len() + 1);
        compressed.push(0x02 | parity);
        compressed.extend_from_slice(&x);

        let curve = match crv {
            "K-256" => Self::DEFAULT_CURVE,
            other => other,
        };
        Self::new(curve, STANDARD.encode(compressed))
    }

    fn decode_coordinate(value: Option<&str>, name: &str, raw: &str) -> PersonaResult<Vec<u8>> {
        let value = value.ok_or_else(|| malformed(raw, format!("public key has no {}", name)))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| malformed(raw, format!("invalid {} coordinate: {}", name, e)))?;
        if bytes.is_empty() {
            return Err(malformed(raw, format!("empty {} coordinate", name)));
        }
        Ok(bytes)
    }

    pub fn curve(&self) -> &str {
        &self.curve
    }

    /// Compressed point in plain base64 (with `/`, not the `|` escape).
    pub fn compressed_point(&self) -> &str {
        &self.compressed_point
    }

    pub fn to_text(&self) -> String {
        format!(
            "ec_key:{}/{}",
            self.curve,
            self.compressed_point.replace('/', "|")
        )
    }

    fn parse_body(raw: &str, body: &str) -> PersonaResult<Self> {
        let (curve, point) = body
            .split_once('/')
            .ok_or_else(|| malformed(raw, "expected {curve}/{compressed_point}"))?;
        check_component(raw, "curve", curve)?;
        if point.is_empty() {
            return Err(malformed(raw, "compressed point must not be empty"));
        }
        if point.contains('/') {
            return Err(malformed(raw, "compressed point must escape '/' as '|'"));
        }
        Ok(Self {
            curve: curve.to_string(),
            compressed_point: point.replace('|', "/"),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// GroupIdentifier
// ═══════════════════════════════════════════════════════════════════════════

/// A user-defined group owned by a profile on some network.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupIdentifier {
    network: String,
    virtual_group_owner: String,
    group_id: String,
}

impl GroupIdentifier {
    pub fn new(
        network: impl Into<String>,
        virtual_group_owner: impl Into<String>,
        group_id: impl Into<String>,
    ) -> PersonaResult<Self> {
        let id = Self {
            network: network.into(),
            virtual_group_owner: virtual_group_owner.into(),
            group_id: group_id.into(),
        };
        let raw = id.to_text();
        check_component(&raw, "network", &id.network)?;
        check_component(&raw, "group owner", &id.virtual_group_owner)?;
        check_component(&raw, "group id", &id.group_id)?;
        Ok(id)
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn virtual_group_owner(&self) -> &str {
        &self.virtual_group_owner
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// The profile that owns this group
    pub fn owner(&self) -> ProfileIdentifier {
        ProfileIdentifier {
            network: self.network.clone(),
            user_id: self.virtual_group_owner.clone(),
        }
    }

    pub fn to_text(&self) -> String {
        format!(
            "group:{}/{}/{}",
            self.network, self.virtual_group_owner, self.group_id
        )
    }

    fn parse_body(raw: &str, body: &str) -> PersonaResult<Self> {
        let mut parts = body.splitn(3, '/');
        let (Some(network), Some(owner), Some(group_id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(raw, "expected {network}/{owner}/{group_id}"));
        };
        check_component(raw, "network", network)?;
        check_component(raw, "group owner", owner)?;
        check_component(raw, "group id", group_id)?;
        Ok(Self {
            network: network.to_string(),
            virtual_group_owner: owner.to_string(),
            group_id: group_id.to_string(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PostIdentifier
// ═══════════════════════════════════════════════════════════════════════════

/// A post written by a profile.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PostIdentifier {
    post_id: String,
    identifier: ProfileIdentifier,
}

impl PostIdentifier {
    pub fn new(post_id: impl Into<String>, identifier: ProfileIdentifier) -> PersonaResult<Self> {
        let id = Self {
            post_id: post_id.into(),
            identifier,
        };
        let raw = id.to_text();
        check_component(&raw, "post id", &id.post_id)?;
        Ok(id)
    }

    pub fn post_id(&self) -> &str {
        &self.post_id
    }

    /// The author of the post
    pub fn identifier(&self) -> &ProfileIdentifier {
        &self.identifier
    }

    pub fn to_text(&self) -> String {
        format!("post:{}/{}", self.post_id, self.identifier.to_text())
    }

    fn parse_body(raw: &str, body: &str) -> PersonaResult<Self> {
        let (post_id, author) = body
            .split_once('/')
            .ok_or_else(|| malformed(raw, "expected {post_id}/{profile}"))?;
        check_component(raw, "post id", post_id)?;
        let identifier = ProfileIdentifier::parse_typed(author)?;
        Ok(Self {
            post_id: post_id.to_string(),
            identifier,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Identifier (tagged union)
// ═══════════════════════════════════════════════════════════════════════════

/// Any identifier, decoded from its text form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Identifier {
    Profile(ProfileIdentifier),
    EcKey(EcKeyIdentifier),
    Group(GroupIdentifier),
    Post(PostIdentifier),
}

impl Identifier {
    /// Decode any identifier kind.
    pub fn parse(raw: &str) -> PersonaResult<Self> {
        let (prefix, body) = raw
            .split_once(':')
            .ok_or_else(|| malformed(raw, "missing kind prefix"))?;
        let kind = IdentifierType::from_prefix(prefix)
            .ok_or_else(|| malformed(raw, format!("unknown identifier kind {:?}", prefix)))?;
        Ok(match kind {
            IdentifierType::Profile => Identifier::Profile(ProfileIdentifier::parse_body(raw, body)?),
            IdentifierType::EcKey => Identifier::EcKey(EcKeyIdentifier::parse_body(raw, body)?),
            IdentifierType::Group => Identifier::Group(GroupIdentifier::parse_body(raw, body)?),
            IdentifierType::Post => Identifier::Post(PostIdentifier::parse_body(raw, body)?),
        })
    }

    pub fn kind(&self) -> IdentifierType {
        match self {
            Identifier::Profile(_) => IdentifierType::Profile,
            Identifier::EcKey(_) => IdentifierType::EcKey,
            Identifier::Group(_) => IdentifierType::Group,
            Identifier::Post(_) => IdentifierType::Post,
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            Identifier::Profile(id) => id.to_text(),
            Identifier::EcKey(id) => id.to_text(),
            Identifier::Group(id) => id.to_text(),
            Identifier::Post(id) => id.to_text(),
        }
    }
}

/// An identifier kind that can be recovered from [`Identifier`].
pub trait TypedIdentifier: Sized + Clone + Into<Identifier> {
    const TYPE: IdentifierType;

    fn from_identifier(id: Identifier) -> Option<Self>;

    /// Parse text and require it to be of this kind.
    fn parse_typed(raw: &str) -> PersonaResult<Self> {
        let id = Identifier::parse(raw)?;
        let actual = id.kind();
        Self::from_identifier(id).ok_or_else(|| PersonaError::IdentifierKindMismatch {
            expected: Self::TYPE,
            actual,
            raw: raw.to_string(),
        })
    }
}

macro_rules! typed_identifier {
    ($ty:ident, $variant:ident) => {
        impl TypedIdentifier for $ty {
            const TYPE: IdentifierType = IdentifierType::$variant;

            fn from_identifier(id: Identifier) -> Option<Self> {
                match id {
                    Identifier::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Identifier {
            fn from(id: $ty) -> Self {
                Identifier::$variant(id)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_text())
            }
        }

        impl FromStr for $ty {
            type Err = PersonaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse_typed(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = PersonaError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::parse_typed(&s)
            }
        }

        impl From<$ty> for String {
            fn from(id: $ty) -> Self {
                id.to_text()
            }
        }
    };
}

typed_identifier!(ProfileIdentifier, Profile);
typed_identifier!(EcKeyIdentifier, EcKey);
typed_identifier!(GroupIdentifier, Group);
typed_identifier!(PostIdentifier, Post);

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for Identifier {
    type Err = PersonaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Identifier {
    type Error = PersonaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.to_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> JsonWebKey {
        JsonWebKey::ec_public(
            "K-256",
            "AQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHyA",
            "ISIjJCUmJygpKissLS4vMDEyMzQ1Njc4OTo7PD0-P0A",
        )
    }

    #[test]
    fn test_profile_text_form() {
        let id = ProfileIdentifier::new("twitter.com", "alice").unwrap();
        assert_eq!(id.to_text(), "person:twitter.com/alice");
        assert_eq!(id.network(), "twitter.com");
        assert_eq!(id.user_id(), "alice");
    }

    #[test]
    fn test_profile_rejects_slash() {
        assert!(ProfileIdentifier::new("twitter.com", "a/b").is_err());
        assert!(ProfileIdentifier::new("", "alice").is_err());
    }

    #[test]
    fn test_persona_from_public_key() {
        let id = EcKeyIdentifier::from_public_key(&sample_key()).unwrap();
        assert_eq!(id.curve(), "secp256k1");
        assert_eq!(
            id.compressed_point(),
            "AgECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g"
        );
    }

    #[test]
    fn test_persona_escapes_slash_in_text() {
        let key = JsonWebKey::ec_public(
            "K-256",
            "-_v7-_v7-_v7-_v7-_v7-_v7-_v7-_v7-_v7-_v7-_s",
            "__________________________________________8",
        );
        let id = EcKeyIdentifier::from_public_key(&key).unwrap();
        assert!(id.compressed_point().contains('/'));
        let text = id.to_text();
        assert!(text.starts_with("ec_key:secp256k1/A|v7+|v7"));
        assert_eq!(text.matches('/').count(), 1);

        let parsed = EcKeyIdentifier::parse_typed(&text).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.to_text(), text);
    }

    #[test]
    fn test_public_key_without_coordinates_fails() {
        let mut key = sample_key();
        key.y = None;
        assert!(matches!(
            EcKeyIdentifier::from_public_key(&key),
            Err(PersonaError::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn test_parse_dispatches_on_prefix() {
        let group = Identifier::parse("group:facebook.com/alice/friends").unwrap();
        assert_eq!(group.kind(), IdentifierType::Group);

        let post = Identifier::parse("post:12345/person:facebook.com/alice").unwrap();
        match post {
            Identifier::Post(post) => {
                assert_eq!(post.post_id(), "12345");
                assert_eq!(post.identifier().user_id(), "alice");
            }
            other => panic!("expected post, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_typed_reports_kind_mismatch() {
        let err = ProfileIdentifier::parse_typed("group:facebook.com/alice/friends").unwrap_err();
        match err {
            PersonaError::IdentifierKindMismatch {
                expected,
                actual,
                raw,
            } => {
                assert_eq!(expected, IdentifierType::Profile);
                assert_eq!(actual, IdentifierType::Group);
                assert_eq!(raw, "group:facebook.com/alice/friends");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for raw in ["", "person", "person:", "person:twitter.com", "unknown:a/b", "ec_key:k1/"] {
            assert!(
                matches!(
                    Identifier::parse(raw),
                    Err(PersonaError::MalformedIdentifier { .. })
                ),
                "{:?} should be malformed",
                raw
            );
        }
    }

    #[test]
    fn test_serde_uses_text_form() {
        let id = ProfileIdentifier::new("twitter.com", "alice").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"person:twitter.com/alice\"");
        let back: ProfileIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let wrong: Result<ProfileIdentifier, _> =
            serde_json::from_str("\"group:facebook.com/alice/friends\"");
        assert!(wrong.is_err());
    }

    #[test]
    fn test_from_str() {
        let id: ProfileIdentifier = "person:twitter.com/bob".parse().unwrap();
        assert_eq!(id.user_id(), "bob");
        let any: Identifier = "person:twitter.com/bob".parse().unwrap();
        assert_eq!(any, Identifier::Profile(id));
    }
}
