//! Identity types for NATID entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 fingerprint of a natural key, stable across processes.
pub type KeyFingerprint = [u8; 32];

/// Compute the SHA-256 fingerprint of encoded key material.
pub fn compute_fingerprint(content: &[u8]) -> KeyFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Name of a mapped entity type (e.g. `"User"`).
///
/// Natural keys, surrogate ids and cache regions are all scoped by entity
/// type, so two types may reuse the same key values without colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Surrogate identifier of one entity instance.
///
/// Uses UUIDv7 so ids are timestamp-sortable, matching how the store hands
/// them out. Unique within its entity type and stable for the entity's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurrogateId(Uuid);

impl SurrogateId {
    /// Generate a new timestamp-sortable id.
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SurrogateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one unit of work (one transaction-scoped context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitOfWorkId(Uuid);

impl UnitOfWorkId {
    pub fn now_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uow-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surrogate_id_is_v7() {
        let id = SurrogateId::now_v7();
        assert_eq!(id.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn test_surrogate_ids_are_sortable() {
        let id1 = SurrogateId::now_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = SurrogateId::now_v7();
        assert!(id1 < id2);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = compute_fingerprint(b"User\0name=gavin");
        let b = compute_fingerprint(b"User\0name=gavin");
        let c = compute_fingerprint(b"User\0name=Gavin");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_entity_type_display_and_serde() {
        let ty = EntityType::new("User");
        assert_eq!(ty.to_string(), "User");
        let json = serde_json::to_string(&ty).unwrap();
        assert_eq!(json, "\"User\"");
        let back: EntityType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }
}
