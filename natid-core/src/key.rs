//! Natural keys and entity state snapshots.

use crate::{compute_fingerprint, EntityType, KeyFingerprint, SurrogateId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// ATTRIBUTE VALUES
// ============================================================================

/// Value of one natural-key attribute.
///
/// Only value types that have a total equality are representable, so two
/// keys compare equal exactly when their attribute values do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
    Uuid(uuid::Uuid),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Append an unambiguous encoding of this value to `out`.
    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            AttributeValue::Null => out.push(0),
            AttributeValue::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            AttributeValue::Integer(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_be_bytes());
            }
            AttributeValue::Text(s) => {
                out.push(3);
                out.extend_from_slice(&(s.len() as u64).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            AttributeValue::Uuid(u) => {
                out.push(4);
                out.extend_from_slice(u.as_bytes());
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Null => f.write_str("null"),
            AttributeValue::Bool(b) => write!(f, "{}", b),
            AttributeValue::Integer(i) => write!(f, "{}", i),
            AttributeValue::Text(s) => write!(f, "{:?}", s),
            AttributeValue::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Bool(b)
    }
}

impl From<uuid::Uuid> for AttributeValue {
    fn from(u: uuid::Uuid) -> Self {
        AttributeValue::Uuid(u)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(AttributeValue::Null)
    }
}

// ============================================================================
// NATURAL KEY
// ============================================================================

/// Immutable snapshot of one entity's natural-key attribute values.
///
/// Attributes are kept sorted by name, so the order in which they were
/// supplied does not affect equality, hashing or the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    entity_type: EntityType,
    attributes: BTreeMap<String, AttributeValue>,
}

impl NaturalKey {
    /// Start building a key for `entity_type`.
    pub fn builder(entity_type: impl Into<EntityType>) -> NaturalKeyBuilder {
        NaturalKeyBuilder {
            entity_type: entity_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Attribute values in attribute-name order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Canonical byte encoding: entity type, then each (name, value) pair.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(self.entity_type.as_str().as_bytes());
        out.push(0);
        for (name, value) in &self.attributes {
            out.extend_from_slice(&(name.len() as u32).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
            value.encode_into(&mut out);
        }
        out
    }

    /// Stable SHA-256 fingerprint of [`encode`](Self::encode).
    pub fn fingerprint(&self) -> KeyFingerprint {
        compute_fingerprint(&self.encode())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.entity_type)?;
        for (i, (name, value)) in self.attributes.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        f.write_str("}")
    }
}

/// Builder for [`NaturalKey`], mirroring a `byNaturalId().using(..)` chain.
#[derive(Debug, Clone)]
pub struct NaturalKeyBuilder {
    entity_type: EntityType,
    attributes: BTreeMap<String, AttributeValue>,
}

impl NaturalKeyBuilder {
    /// Set one attribute. A later call for the same name replaces the value.
    pub fn using(mut self, attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    pub fn build(self) -> NaturalKey {
        NaturalKey {
            entity_type: self.entity_type,
            attributes: self.attributes,
        }
    }
}

// ============================================================================
// ENTITY STATE
// ============================================================================

/// Current attribute values of one entity instance, as held by the caller.
///
/// This is the caller's object as seen by the cache: it may have been
/// mutated through any path, tracked or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_type: EntityType,
    pub id: SurrogateId,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl EntityState {
    pub fn new(entity_type: impl Into<EntityType>, id: SurrogateId) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    /// Overwrite one attribute in place.
    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    pub fn get(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute)
    }

    /// Project the natural key over `key_attributes`.
    ///
    /// Attributes absent from the state project as [`AttributeValue::Null`];
    /// nullability is checked separately.
    pub fn natural_key<'a, I>(&self, key_attributes: I) -> NaturalKey
    where
        I: IntoIterator<Item = &'a str>,
    {
        let attributes = key_attributes
            .into_iter()
            .map(|name| {
                let value = self
                    .attributes
                    .get(name)
                    .cloned()
                    .unwrap_or(AttributeValue::Null);
                (name.to_string(), value)
            })
            .collect();
        NaturalKey {
            entity_type: self.entity_type.clone(),
            attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_equality_ignores_supply_order() {
        let a = NaturalKey::builder("User").using("name", "gavin").using("org", "hb").build();
        let b = NaturalKey::builder("User").using("org", "hb").using("name", "gavin").build();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_key_equality_is_scoped_by_entity_type() {
        let a = NaturalKey::builder("User").using("name", "gavin").build();
        let b = NaturalKey::builder("Account").using("name", "gavin").build();
        assert_ne!(a, b);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_key_values_are_case_sensitive() {
        let a = NaturalKey::builder("User").using("name", "gavin").build();
        let b = NaturalKey::builder("User").using("name", "Gavin").build();
        assert_ne!(a, b);
    }

    #[test]
    fn test_encoding_is_unambiguous_across_attribute_boundaries() {
        let a = NaturalKey::builder("T").using("a", "bc").using("d", "").build();
        let b = NaturalKey::builder("T").using("a", "b").using("d", "c").build();
        assert_ne!(a.encode(), b.encode());
    }

    #[test]
    fn test_entity_state_projects_natural_key() {
        let id = SurrogateId::now_v7();
        let state = EntityState::new("User", id)
            .with("name", "gavin")
            .with("org", "hb")
            .with("password", "secret");
        let key = state.natural_key(["name", "org"]);
        let expected = NaturalKey::builder("User").using("name", "gavin").using("org", "hb").build();
        assert_eq!(key, expected);
    }

    #[test]
    fn test_missing_attribute_projects_as_null() {
        let state = EntityState::new("User", SurrogateId::now_v7()).with("name", "gavin");
        let key = state.natural_key(["name", "org"]);
        assert_eq!(key.get("org"), Some(&AttributeValue::Null));
    }

    #[test]
    fn test_display() {
        let key = NaturalKey::builder("User").using("org", "hb").using("name", "gavin").build();
        assert_eq!(key.to_string(), "User{name=\"gavin\", org=\"hb\"}");
    }
}
