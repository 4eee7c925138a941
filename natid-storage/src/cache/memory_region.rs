//! In-memory shared region.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use natid_core::{EntityType, NatIdError, NatIdResult, StoreError, SurrogateId};

use super::region_key::RegionKey;
use super::traits::{RegionStats, SharedRegion};

/// Process-local region backed by a `HashMap`.
///
/// The region can be switched offline with [`set_available`](Self::set_available)
/// to exercise the degraded paths of the shared cache.
#[derive(Debug)]
pub struct InMemoryRegion {
    entries: RwLock<HashMap<RegionKey, SurrogateId>>,
    stats: RwLock<RegionStats>,
    available: AtomicBool,
}

impl Default for InMemoryRegion {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(RegionStats::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryRegion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored mappings, regardless of availability.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> NatIdResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NatIdError::Store(StoreError::Unavailable {
                component: "in-memory region".to_string(),
                reason: "region is offline".to_string(),
            }))
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut RegionStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

fn poisoned<T>(_: T) -> NatIdError {
    NatIdError::Store(StoreError::LockPoisoned)
}

#[async_trait]
impl SharedRegion for InMemoryRegion {
    async fn get(&self, key: &RegionKey) -> NatIdResult<Option<SurrogateId>> {
        self.ensure_available()?;
        let found = self.entries.read().map_err(poisoned)?.get(key).copied();
        self.with_stats(|s| {
            if found.is_some() {
                s.hits += 1;
            } else {
                s.misses += 1;
            }
        });
        Ok(found)
    }

    async fn put(&self, key: &RegionKey, id: SurrogateId) -> NatIdResult<()> {
        self.ensure_available()?;
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.clone(), id);
        let count = entries.len() as u64;
        drop(entries);
        self.with_stats(|s| s.entry_count = count);
        Ok(())
    }

    async fn evict(&self, key: &RegionKey) -> NatIdResult<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.write().map_err(poisoned)?;
        let removed = entries.remove(key).is_some();
        let count = entries.len() as u64;
        drop(entries);
        self.with_stats(|s| {
            s.entry_count = count;
            if removed {
                s.evictions += 1;
            }
        });
        Ok(removed)
    }

    async fn clear_region(&self, entity_type: &EntityType) -> NatIdResult<u64> {
        self.ensure_available()?;
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|key, _| key.entity_type() != entity_type);
        let removed = (before - entries.len()) as u64;
        let count = entries.len() as u64;
        drop(entries);
        self.with_stats(|s| {
            s.entry_count = count;
            s.evictions += removed;
        });
        Ok(removed)
    }

    async fn stats(&self) -> NatIdResult<RegionStats> {
        Ok(self.stats.read().map_err(poisoned)?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natid_core::NaturalKey;

    fn key(ty: &str, name: &str) -> RegionKey {
        RegionKey::for_key(&NaturalKey::builder(ty).using("name", name).build())
    }

    #[tokio::test]
    async fn test_put_get_evict() {
        let region = InMemoryRegion::new();
        let id = SurrogateId::now_v7();
        let k = key("User", "gavin");

        assert_eq!(region.get(&k).await.unwrap(), None);
        region.put(&k, id).await.unwrap();
        assert_eq!(region.get(&k).await.unwrap(), Some(id));
        assert!(region.evict(&k).await.unwrap());
        assert!(!region.evict(&k).await.unwrap());

        let stats = region.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_clear_region_only_touches_one_type() {
        let region = InMemoryRegion::new();
        region.put(&key("User", "a"), SurrogateId::now_v7()).await.unwrap();
        region.put(&key("User", "b"), SurrogateId::now_v7()).await.unwrap();
        region.put(&key("Account", "a"), SurrogateId::now_v7()).await.unwrap();

        assert_eq!(region.clear_region(&EntityType::new("User")).await.unwrap(), 2);
        assert_eq!(region.len(), 1);
        assert!(region.get(&key("Account", "a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_offline_region_fails() {
        let region = InMemoryRegion::new();
        region.set_available(false);
        let result = region.get(&key("User", "a")).await;
        assert!(matches!(
            result,
            Err(NatIdError::Store(StoreError::Unavailable { .. }))
        ));
    }
}
