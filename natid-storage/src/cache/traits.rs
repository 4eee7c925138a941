//! Shared region trait.
//!
//! This module defines the trait that must be implemented by the key-value
//! stores backing the shared resolution tier.

use async_trait::async_trait;
use natid_core::{EntityType, NatIdResult, SurrogateId};

use super::region_key::RegionKey;

/// Pluggable key-value region backing the shared resolution tier.
///
/// Implementations may be eventually consistent across processes but must
/// read their own writes within one process. They are not required to
/// serialize concurrent access to one key: `SharedResolutionCache` does that.
///
/// Any method may fail with `StoreError::Unavailable`; the shared cache
/// treats such failures as misses rather than surfacing them to resolution.
#[async_trait]
pub trait SharedRegion: Send + Sync {
    /// Get the surrogate id mapped to `key`.
    async fn get(&self, key: &RegionKey) -> NatIdResult<Option<SurrogateId>>;

    /// Map `key` to `id`, overwriting any previous mapping.
    async fn put(&self, key: &RegionKey, id: SurrogateId) -> NatIdResult<()>;

    /// Remove the mapping for `key`. Returns whether one existed.
    async fn evict(&self, key: &RegionKey) -> NatIdResult<bool>;

    /// Remove every mapping of `entity_type`, returning the count.
    async fn clear_region(&self, entity_type: &EntityType) -> NatIdResult<u64>;

    /// Get region statistics.
    async fn stats(&self) -> NatIdResult<RegionStats>;
}

/// Statistics about region usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Number of lookups that found a mapping.
    pub hits: u64,
    /// Number of lookups that found nothing.
    pub misses: u64,
    /// Number of mappings currently stored.
    pub entry_count: u64,
    /// Number of mappings removed by eviction or region clears.
    pub evictions: u64,
}

impl RegionStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
