//! Ordered map keyed by identifiers
//!
//! Keys are kept as canonical identifier text, so the map serializes as a
//! plain string map and iterates in key-text order. Typed access parses the
//! text back; an entry whose key is not a valid `K` is never handed out as
//! `K` and is reported with a warning instead.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use super::{Identifier, TypedIdentifier};

fn key_text<K: TypedIdentifier>(key: &K) -> String {
    let id: Identifier = key.clone().into();
    id.to_text()
}

pub struct IdentifierMap<K, V> {
    raw: BTreeMap<String, V>,
    _key: PhantomData<fn() -> K>,
}

impl<K: TypedIdentifier, V> IdentifierMap<K, V> {
    pub fn new() -> Self {
        Self::from_raw(BTreeMap::new())
    }

    /// Wrap an already text-keyed map. Keys are not validated here.
    pub fn from_raw(raw: BTreeMap<String, V>) -> Self {
        Self {
            raw,
            _key: PhantomData,
        }
    }

    pub fn raw(&self) -> &BTreeMap<String, V> {
        &self.raw
    }

    pub fn into_raw(self) -> BTreeMap<String, V> {
        self.raw
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.raw.get(&key_text(key))
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.raw.get_mut(&key_text(key))
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.raw.insert(key_text(&key), value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.raw.remove(&key_text(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.raw.contains_key(&key_text(key))
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Typed entries, in key order. Unparsable keys are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.raw.iter().filter_map(|(raw, value)| match K::parse_typed(raw) {
            Ok(key) => Some((key, value)),
            Err(e) => {
                warn!(key = %raw, error = %e, "Skipping invalid key in identifier map");
                None
            }
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Raw keys that do not parse as `K`.
    pub fn invalid_keys(&self) -> Vec<String> {
        self.raw
            .keys()
            .filter(|raw| K::parse_typed(raw).is_err())
            .cloned()
            .collect()
    }

    /// Union with `other`; entries of `other` win on equal keys.
    pub fn merge(&mut self, other: IdentifierMap<K, V>) {
        self.raw.extend(other.raw);
    }

    pub fn retain_raw(&mut self, mut keep: impl FnMut(&str, &mut V) -> bool) {
        self.raw.retain(|k, v| keep(k, v));
    }
}

impl<K: TypedIdentifier, V> Default for IdentifierMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Clone> Clone for IdentifierMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _key: PhantomData,
        }
    }
}

impl<K, V: PartialEq> PartialEq for IdentifierMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K, V: fmt::Debug> fmt::Debug for IdentifierMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.raw.iter()).finish()
    }
}

impl<K: TypedIdentifier, V> FromIterator<(K, V)> for IdentifierMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<K, V: Serialize> Serialize for IdentifierMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de, K, V: Deserialize<'de>> Deserialize<'de> for IdentifierMap<K, V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            raw: BTreeMap::deserialize(deserializer)?,
            _key: PhantomData,
        })
    }
}
