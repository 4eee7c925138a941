//! Per-unit-of-work resolution tier.
//!
//! Never shared: owned by exactly one unit of work and dropped with it.

use std::collections::{HashMap, HashSet};

use natid_core::{
    ConflictKind, EntityType, NaturalKey, ResolutionEntry, ResolutionOrigin, SurrogateId,
};

/// Natural key → surrogate id mappings visible to one unit of work.
///
/// Holds a reverse index so the current key of a managed entity can be found
/// by id, and a set of shadowed keys: keys this unit of work has moved away
/// from or deleted, which must not fall through to the shared tier or the
/// store until commit.
#[derive(Debug, Default)]
pub struct LocalResolutionCache {
    entries: HashMap<NaturalKey, ResolutionEntry>,
    reverse: HashMap<(EntityType, SurrogateId), NaturalKey>,
    shadowed: HashSet<NaturalKey>,
}

impl LocalResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `key` to `id`.
    ///
    /// Overwriting a committed mapping with a different id is rejected with
    /// `DuplicateKeyMapping`. A pending mapping may be overwritten. Any other
    /// key previously held by `id` is dropped, so an entity has at most one
    /// local key.
    pub fn put(
        &mut self,
        key: NaturalKey,
        id: SurrogateId,
        origin: ResolutionOrigin,
    ) -> Result<(), ConflictKind> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.id != id && existing.origin.is_committed() {
                return Err(ConflictKind::DuplicateKeyMapping {
                    key,
                    existing: existing.id,
                    attempted: id,
                });
            }
            if existing.id != id {
                self.reverse
                    .remove(&(key.entity_type().clone(), existing.id));
            }
        }

        let slot = (key.entity_type().clone(), id);
        if let Some(previous) = self.reverse.get(&slot) {
            if previous != &key {
                let previous = previous.clone();
                self.entries.remove(&previous);
            }
        }

        self.shadowed.remove(&key);
        self.reverse.insert(slot, key.clone());
        self.entries
            .insert(key.clone(), ResolutionEntry::new(key, id, origin));
        Ok(())
    }

    /// Remove the mapping for `key`. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: &NaturalKey) -> Option<ResolutionEntry> {
        let entry = self.entries.remove(key)?;
        let slot = (key.entity_type().clone(), entry.id);
        if self.reverse.get(&slot) == Some(key) {
            self.reverse.remove(&slot);
        }
        Some(entry)
    }

    pub fn resolve(&self, key: &NaturalKey) -> Option<SurrogateId> {
        self.entries.get(key).map(|e| e.id)
    }

    pub fn entry(&self, key: &NaturalKey) -> Option<&ResolutionEntry> {
        self.entries.get(key)
    }

    /// Current local key of an entity.
    pub fn find_by_surrogate(
        &self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> Option<&NaturalKey> {
        self.reverse.get(&(entity_type.clone(), id))
    }

    /// Hide `key` from lower tiers for the rest of the unit of work.
    pub fn shadow(&mut self, key: NaturalKey) {
        self.shadowed.insert(key);
    }

    pub fn is_shadowed(&self, key: &NaturalKey) -> bool {
        self.shadowed.contains(key)
    }

    /// Let `key` fall through to lower tiers again.
    pub fn unshadow(&mut self, key: &NaturalKey) -> bool {
        self.shadowed.remove(key)
    }

    /// Forget everything known about `id`, returning its key if it had one.
    pub fn remove_surrogate(
        &mut self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> Option<NaturalKey> {
        let key = self.reverse.remove(&(entity_type.clone(), id))?;
        self.entries.remove(&key);
        Some(key)
    }

    /// Drop every mapping and every shadow.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.reverse.clear();
        self.shadowed.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries not already in the shared tier.
    pub fn promotion_candidates(&self) -> impl Iterator<Item = &ResolutionEntry> {
        self.entries
            .values()
            .filter(|e| e.origin != ResolutionOrigin::Shared)
    }

    pub(crate) fn set_origin(&mut self, key: &NaturalKey, origin: ResolutionOrigin) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.origin = origin;
        }
    }

    /// Turn every pending entry into a committed one.
    pub(crate) fn mark_committed(&mut self) -> usize {
        let mut marked = 0;
        for entry in self.entries.values_mut() {
            if entry.origin == ResolutionOrigin::LocalPending {
                entry.origin = ResolutionOrigin::LocalCommitted;
                marked += 1;
            }
        }
        marked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> NaturalKey {
        NaturalKey::builder("User")
            .using("name", name)
            .using("org", "hb")
            .build()
    }

    fn user() -> EntityType {
        EntityType::new("User")
    }

    #[test]
    fn test_put_and_resolve() {
        let mut local = LocalResolutionCache::new();
        let id = SurrogateId::now_v7();
        local.put(key("gavin"), id, ResolutionOrigin::LocalCommitted).unwrap();

        assert_eq!(local.resolve(&key("gavin")), Some(id));
        assert_eq!(local.find_by_surrogate(&user(), id), Some(&key("gavin")));
        assert_eq!(local.resolve(&key("steve")), None);
    }

    #[test]
    fn test_committed_entry_cannot_be_overwritten() {
        let mut local = LocalResolutionCache::new();
        let first = SurrogateId::now_v7();
        let second = SurrogateId::now_v7();
        local.put(key("gavin"), first, ResolutionOrigin::Shared).unwrap();

        let err = local
            .put(key("gavin"), second, ResolutionOrigin::LocalPending)
            .unwrap_err();
        assert!(matches!(err, ConflictKind::DuplicateKeyMapping { existing, attempted, .. }
            if existing == first && attempted == second));
        assert_eq!(local.resolve(&key("gavin")), Some(first));
    }

    #[test]
    fn test_pending_entry_can_be_overwritten() {
        let mut local = LocalResolutionCache::new();
        let first = SurrogateId::now_v7();
        let second = SurrogateId::now_v7();
        local.put(key("gavin"), first, ResolutionOrigin::LocalPending).unwrap();
        local.put(key("gavin"), second, ResolutionOrigin::LocalPending).unwrap();

        assert_eq!(local.resolve(&key("gavin")), Some(second));
        assert_eq!(local.find_by_surrogate(&user(), first), None);
        assert_eq!(local.find_by_surrogate(&user(), second), Some(&key("gavin")));
    }

    #[test]
    fn test_same_id_reput_is_allowed() {
        let mut local = LocalResolutionCache::new();
        let id = SurrogateId::now_v7();
        local.put(key("gavin"), id, ResolutionOrigin::Shared).unwrap();
        local.put(key("gavin"), id, ResolutionOrigin::LocalCommitted).unwrap();
        assert_eq!(
            local.entry(&key("gavin")).map(|e| e.origin),
            Some(ResolutionOrigin::LocalCommitted)
        );
    }

    #[test]
    fn test_new_key_for_same_id_replaces_old_key() {
        let mut local = LocalResolutionCache::new();
        let id = SurrogateId::now_v7();
        local.put(key("gavin"), id, ResolutionOrigin::LocalCommitted).unwrap();
        local.put(key("Gavin"), id, ResolutionOrigin::LocalPending).unwrap();

        assert_eq!(local.resolve(&key("gavin")), None);
        assert_eq!(local.resolve(&key("Gavin")), Some(id));
        assert_eq!(local.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut local = LocalResolutionCache::new();
        let id = SurrogateId::now_v7();
        local.put(key("gavin"), id, ResolutionOrigin::LocalCommitted).unwrap();

        assert!(local.remove(&key("gavin")).is_some());
        assert!(local.remove(&key("gavin")).is_none());
        assert_eq!(local.find_by_surrogate(&user(), id), None);
    }

    #[test]
    fn test_shadow_cleared_by_put() {
        let mut local = LocalResolutionCache::new();
        local.shadow(key("gavin"));
        assert!(local.is_shadowed(&key("gavin")));

        local
            .put(key("gavin"), SurrogateId::now_v7(), ResolutionOrigin::LocalPending)
            .unwrap();
        assert!(!local.is_shadowed(&key("gavin")));
    }

    #[test]
    fn test_clear_and_promotion_candidates() {
        let mut local = LocalResolutionCache::new();
        local.put(key("a"), SurrogateId::now_v7(), ResolutionOrigin::Shared).unwrap();
        local.put(key("b"), SurrogateId::now_v7(), ResolutionOrigin::LocalCommitted).unwrap();
        local.put(key("c"), SurrogateId::now_v7(), ResolutionOrigin::LocalPending).unwrap();
        local.shadow(key("d"));

        assert_eq!(local.promotion_candidates().count(), 2);

        local.clear();
        assert!(local.is_empty());
        assert!(!local.is_shadowed(&key("d")));
    }

    #[test]
    fn test_unshadow_and_mark_committed() {
        let mut local = LocalResolutionCache::new();
        local.shadow(key("gavin"));
        assert!(local.unshadow(&key("gavin")));
        assert!(!local.unshadow(&key("gavin")));

        local.put(key("a"), SurrogateId::now_v7(), ResolutionOrigin::LocalPending).unwrap();
        local.put(key("b"), SurrogateId::now_v7(), ResolutionOrigin::Shared).unwrap();
        assert_eq!(local.mark_committed(), 1);
        assert_eq!(
            local.entry(&key("a")).map(|e| e.origin),
            Some(ResolutionOrigin::LocalCommitted)
        );
        assert_eq!(local.entry(&key("b")).map(|e| e.origin), Some(ResolutionOrigin::Shared));
    }
}
