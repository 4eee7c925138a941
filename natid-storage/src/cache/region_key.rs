//! Entity-type-scoped keys for the shared resolution region.
//!
//! A `RegionKey` can only be built from a [`NaturalKey`], so it always
//! carries the entity type of the key it stands for. Two types that reuse
//! the same attribute values never share a region slot.

use natid_core::{EntityType, KeyFingerprint, NaturalKey};

/// Separator byte between the entity type name and the fingerprint.
///
/// `0xFF` never occurs in UTF-8, so it cannot appear inside a type name.
const SEPARATOR: u8 = 0xFF;

const FINGERPRINT_LEN: usize = 32;

/// Key of one natural-key mapping in a shared region.
///
/// # Binary Format
///
/// - Bytes `0..n`: entity type name (UTF-8)
/// - Byte `n`: separator (0xFF)
/// - Bytes `n+1..n+33`: SHA-256 fingerprint of the natural key
///
/// Keys sort by entity type first, so a region can scan one type's
/// mappings with [`RegionKey::type_prefix`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    inner: RegionKeyInner,
}

/// Private inner struct - prevents external construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RegionKeyInner {
    entity_type: EntityType,
    fingerprint: KeyFingerprint,
}

impl RegionKey {
    /// Region key for a natural key.
    pub fn for_key(key: &NaturalKey) -> Self {
        Self {
            inner: RegionKeyInner {
                entity_type: key.entity_type().clone(),
                fingerprint: key.fingerprint(),
            },
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.inner.entity_type
    }

    pub fn fingerprint(&self) -> &KeyFingerprint {
        &self.inner.fingerprint
    }

    /// Lock stripe this key belongs to, out of `stripes`.
    pub fn stripe(&self, stripes: usize) -> usize {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.inner.fingerprint[0..8]);
        (u64::from_be_bytes(head) % stripes.max(1) as u64) as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.inner.entity_type.as_str().as_bytes();
        let mut bytes = Vec::with_capacity(name.len() + 1 + FINGERPRINT_LEN);
        bytes.extend_from_slice(name);
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(&self.inner.fingerprint);
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the separator is missing, the fingerprint is not
    /// exactly 32 bytes, or the type name is not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FINGERPRINT_LEN + 1 {
            return None;
        }
        let split = bytes.len() - FINGERPRINT_LEN - 1;
        if bytes[split] != SEPARATOR {
            return None;
        }
        let name = std::str::from_utf8(&bytes[0..split]).ok()?;
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&bytes[split + 1..]);
        Some(Self {
            inner: RegionKeyInner {
                entity_type: EntityType::new(name),
                fingerprint,
            },
        })
    }

    /// Prefix shared by every key of `entity_type`.
    pub fn type_prefix(entity_type: &EntityType) -> Vec<u8> {
        let name = entity_type.as_str().as_bytes();
        let mut prefix = Vec::with_capacity(name.len() + 1);
        prefix.extend_from_slice(name);
        prefix.push(SEPARATOR);
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_key(name: &str) -> NaturalKey {
        NaturalKey::builder("User").using("name", name).using("org", "hb").build()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = RegionKey::for_key(&user_key("gavin"));
        let decoded = RegionKey::decode(&key.encode()).expect("decode should succeed");
        assert_eq!(key, decoded);
        assert_eq!(decoded.entity_type().as_str(), "User");
    }

    #[test]
    fn test_encode_length() {
        let key = RegionKey::for_key(&user_key("gavin"));
        assert_eq!(key.encode().len(), "User".len() + 1 + 32);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(RegionKey::decode(&[0u8; 32]).is_none());
    }

    #[test]
    fn test_decode_wrong_separator() {
        let mut bytes = RegionKey::for_key(&user_key("gavin")).encode();
        bytes[4] = 0x00;
        assert!(RegionKey::decode(&bytes).is_none());
    }

    #[test]
    fn test_type_prefix_is_prefix() {
        let key = RegionKey::for_key(&user_key("gavin"));
        let prefix = RegionKey::type_prefix(&EntityType::new("User"));
        assert!(key.encode().starts_with(&prefix));
    }

    #[test]
    fn test_prefix_does_not_match_longer_type_name() {
        let other = NaturalKey::builder("Username").using("name", "gavin").build();
        let prefix = RegionKey::type_prefix(&EntityType::new("User"));
        assert!(!RegionKey::for_key(&other).encode().starts_with(&prefix));
    }

    #[test]
    fn test_same_values_different_types_different_keys() {
        let a = NaturalKey::builder("User").using("name", "gavin").build();
        let b = NaturalKey::builder("Account").using("name", "gavin").build();
        assert_ne!(RegionKey::for_key(&a), RegionKey::for_key(&b));
    }

    #[test]
    fn test_stripe_in_range() {
        let key = RegionKey::for_key(&user_key("gavin"));
        assert!(key.stripe(7) < 7);
        assert_eq!(key.stripe(1), 0);
        assert_eq!(key.stripe(0), 0);
    }
}
