//! Process-wide resolution tier.
//!
//! Wraps a [`SharedRegion`] with lock striping: every access to a key holds
//! the mutex of the stripe its fingerprint falls in. Multi-key writes take
//! all their stripes in ascending index order, so two committing units of
//! work can never deadlock on each other.
//!
//! Region failures never reach resolution. A failed read is a miss. A failed
//! eviction quarantines the key (or the whole type, for a failed region
//! clear) so possibly stale mappings are never served; the quarantine lifts
//! once a later write for that key or type succeeds.
//!
//! Every write also stamps an [`InvalidationLog`]. Mappings a unit of work
//! merely read are promoted with [`BatchOp::Promote`], which is dropped when
//! the key or the entity was written after that unit of work began.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use natid_core::{
    ConflictKind, EntityType, NatIdError, NatIdResult, NaturalKey, ResolutionConfig, StoreError,
    SurrogateId,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::invalidation::InvalidationLog;
use super::region_key::RegionKey;
use super::traits::{RegionStats, SharedRegion};

/// One write against the shared tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Map `key` to `id`, retiring any other key `id` held.
    Put { key: NaturalKey, id: SurrogateId },
    /// Drop the mapping of `key`.
    Evict { key: NaturalKey },
    /// Drop whichever key `id` is mapped under.
    EvictSurrogate {
        entity_type: EntityType,
        id: SurrogateId,
    },
    /// Map `key` to `id` as read by the committing unit of work.
    ///
    /// Skipped if the key, the entity or its type was written after the
    /// batch's read epoch, if `key` holds another id, or if `id` is cached
    /// under another key. Never retires anything.
    Promote { key: NaturalKey, id: SurrogateId },
}

/// Precondition of a batch: `key` is unmapped or already mapped to `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExpectation {
    pub key: NaturalKey,
    pub id: SurrogateId,
}

/// Writes of one commit, applied all-or-nothing with respect to conflicts.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    expectations: Vec<KeyExpectation>,
    ops: Vec<BatchOp>,
    read_epoch: u64,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch of a unit of work that opened its reader at `read_epoch`.
    pub fn for_reader(read_epoch: u64) -> Self {
        Self {
            read_epoch,
            ..Self::default()
        }
    }

    pub fn read_epoch(&self) -> u64 {
        self.read_epoch
    }

    pub fn expect_absent_or_owned(&mut self, key: NaturalKey, id: SurrogateId) {
        self.expectations.push(KeyExpectation { key, id });
    }

    pub fn push(&mut self, op: BatchOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn expectations(&self) -> &[KeyExpectation] {
        &self.expectations
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.expectations.is_empty()
    }

    pub fn put_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, BatchOp::Put { .. } | BatchOp::Promote { .. }))
            .count()
    }
}

type ReverseIndex = HashMap<(EntityType, SurrogateId), RegionKey>;

/// Shared resolution tier over a pluggable region.
pub struct SharedResolutionCache<R: SharedRegion> {
    region: R,
    stripes: Vec<Mutex<()>>,
    reverse: RwLock<ReverseIndex>,
    quarantined_keys: RwLock<HashSet<RegionKey>>,
    quarantined_types: RwLock<HashSet<EntityType>>,
    invalidations: RwLock<InvalidationLog>,
    running: AtomicBool,
}

fn poisoned<T>(_: T) -> NatIdError {
    NatIdError::Store(StoreError::LockPoisoned)
}

impl<R: SharedRegion> SharedResolutionCache<R> {
    /// Start a shared tier over `region`.
    pub fn start(region: R, config: &ResolutionConfig) -> Arc<Self> {
        let stripes = config.lock_stripes.max(1);
        info!(stripes, "Shared resolution cache started");
        Arc::new(Self {
            region,
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            reverse: RwLock::new(HashMap::new()),
            quarantined_keys: RwLock::new(HashSet::new()),
            quarantined_types: RwLock::new(HashSet::new()),
            invalidations: RwLock::new(InvalidationLog::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Stop serving. Every later read misses and every later write is dropped.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Shared resolution cache shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub async fn region_stats(&self) -> NatIdResult<RegionStats> {
        self.region.stats().await
    }

    /// Whether `key` is currently withheld because of a failed eviction.
    pub fn is_quarantined(&self, key: &NaturalKey) -> bool {
        self.is_region_key_quarantined(&RegionKey::for_key(key))
    }

    fn is_region_key_quarantined(&self, rk: &RegionKey) -> bool {
        let by_type = self
            .quarantined_types
            .read()
            .map(|t| t.contains(rk.entity_type()))
            .unwrap_or(true);
        let by_key = self
            .quarantined_keys
            .read()
            .map(|k| k.contains(rk))
            .unwrap_or(true);
        by_type || by_key
    }

    fn quarantine(&self, rk: &RegionKey) {
        if let Ok(mut keys) = self.quarantined_keys.write() {
            keys.insert(rk.clone());
        }
    }

    fn release(&self, rk: &RegionKey) {
        if let Ok(mut keys) = self.quarantined_keys.write() {
            keys.remove(rk);
        }
    }

    /// Open a reader at the current invalidation epoch.
    ///
    /// Pair every call with [`end_read`](Self::end_read).
    pub fn begin_read(&self) -> u64 {
        self.invalidations
            .write()
            .map(|mut log| log.open_reader())
            .unwrap_or(0)
    }

    pub fn end_read(&self, since: u64) {
        if let Ok(mut log) = self.invalidations.write() {
            log.close_reader(since);
        }
    }

    pub fn open_readers(&self) -> usize {
        self.invalidations
            .read()
            .map(|log| log.open_readers())
            .unwrap_or(0)
    }

    fn stamp(&self, f: impl FnOnce(&mut InvalidationLog, u64)) {
        if let Ok(mut log) = self.invalidations.write() {
            let epoch = log.advance();
            f(&mut log, epoch);
        }
    }

    fn invalidated_since(&self, rk: &RegionKey, id: SurrogateId, since: u64) -> bool {
        self.invalidations
            .read()
            .map(|log| log.invalidated_since(rk, id, since))
            .unwrap_or(true)
    }

    fn reverse_key(&self, entity_type: &EntityType, id: SurrogateId) -> Option<RegionKey> {
        self.reverse
            .read()
            .ok()
            .and_then(|r| r.get(&(entity_type.clone(), id)).cloned())
    }

    async fn lock_stripes(&self, stripes: BTreeSet<usize>) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(stripes.len());
        // BTreeSet iterates in ascending order.
        for stripe in stripes {
            guards.push(self.stripes[stripe].lock().await);
        }
        guards
    }

    fn stripe_of(&self, rk: &RegionKey) -> usize {
        rk.stripe(self.stripes.len())
    }

    // ========================================================================
    // SINGLE-KEY OPERATIONS
    // ========================================================================

    /// Surrogate id cached for `key`, if any.
    pub async fn get(&self, key: &NaturalKey) -> Option<SurrogateId> {
        if !self.is_running() {
            return None;
        }
        let rk = RegionKey::for_key(key);
        let _guard = self.stripes[self.stripe_of(&rk)].lock().await;
        self.get_locked(&rk).await
    }

    /// Read several keys under one lock set, as a single snapshot.
    ///
    /// No commit batch is half-visible in the result.
    pub async fn get_many(&self, keys: &[NaturalKey]) -> Vec<Option<SurrogateId>> {
        if !self.is_running() {
            return vec![None; keys.len()];
        }
        let rks: Vec<RegionKey> = keys.iter().map(RegionKey::for_key).collect();
        let stripes = rks.iter().map(|rk| self.stripe_of(rk)).collect();
        let _guards = self.lock_stripes(stripes).await;
        let mut found = Vec::with_capacity(rks.len());
        for rk in &rks {
            found.push(self.get_locked(rk).await);
        }
        found
    }

    async fn get_locked(&self, rk: &RegionKey) -> Option<SurrogateId> {
        if self.is_region_key_quarantined(rk) {
            debug!(entity_type = %rk.entity_type(), "Quarantined key treated as miss");
            return None;
        }
        match self.region.get(rk).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, entity_type = %rk.entity_type(), "Shared region read failed, treating as miss");
                None
            }
        }
    }

    /// Map `key` to `id`. Returns whether the region accepted the write.
    pub async fn put(&self, key: &NaturalKey, id: SurrogateId) -> bool {
        if !self.is_running() {
            return false;
        }
        let rk = RegionKey::for_key(key);
        let mut stripes = BTreeSet::from([self.stripe_of(&rk)]);
        if let Some(previous) = self.reverse_key(key.entity_type(), id) {
            stripes.insert(self.stripe_of(&previous));
        }
        let locked = stripes.clone();
        let _guards = self.lock_stripes(stripes).await;
        self.put_locked(rk, id, &locked).await
    }

    async fn put_locked(&self, rk: RegionKey, id: SurrogateId, locked: &BTreeSet<usize>) -> bool {
        let slot = (rk.entity_type().clone(), id);
        self.stamp(|log, epoch| {
            log.stamp_key(&rk, epoch);
            log.stamp_id(&slot.0, id, epoch);
        });
        if let Some(previous) = self.reverse_key(&slot.0, id) {
            if previous != rk {
                if locked.contains(&self.stripe_of(&previous)) {
                    self.evict_if_owned(&previous, id).await;
                } else {
                    // Previous key moved stripes since the lock set was built.
                    self.quarantine(&previous);
                }
            }
        }

        match self.region.put(&rk, id).await {
            Ok(()) => {
                self.release(&rk);
                if let Ok(mut reverse) = self.reverse.write() {
                    reverse.insert(slot, rk);
                }
                true
            }
            Err(e) => {
                warn!(error = %e, entity_type = %rk.entity_type(), "Shared region write failed");
                self.quarantine(&rk);
                false
            }
        }
    }

    /// Write a mapping read by a unit of work, if nothing contradicts it.
    async fn promote_locked(&self, rk: RegionKey, id: SurrogateId) -> bool {
        if self.is_region_key_quarantined(&rk) {
            return false;
        }
        if self
            .reverse_key(rk.entity_type(), id)
            .is_some_and(|previous| previous != rk)
        {
            debug!(entity_type = %rk.entity_type(), id = %id, "Entity cached under another key, promotion dropped");
            return false;
        }
        match self.region.get(&rk).await {
            Ok(Some(owner)) if owner != id => return false,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, entity_type = %rk.entity_type(), "Shared region read failed, promotion dropped");
                return false;
            }
        }
        match self.region.put(&rk, id).await {
            Ok(()) => {
                if let Ok(mut reverse) = self.reverse.write() {
                    reverse.insert((rk.entity_type().clone(), id), rk);
                }
                true
            }
            Err(e) => {
                warn!(error = %e, entity_type = %rk.entity_type(), "Shared region write failed");
                self.quarantine(&rk);
                false
            }
        }
    }

    /// Drop the mapping of `key`.
    ///
    /// On region failure the key is quarantined and the error returned.
    pub async fn evict(&self, key: &NaturalKey) -> NatIdResult<bool> {
        let rk = RegionKey::for_key(key);
        let _guard = self.stripes[self.stripe_of(&rk)].lock().await;
        self.evict_locked(&rk).await
    }

    async fn evict_locked(&self, rk: &RegionKey) -> NatIdResult<bool> {
        self.stamp(|log, epoch| log.stamp_key(rk, epoch));
        match self.region.evict(rk).await {
            Ok(removed) => {
                self.release(rk);
                let mut owners = Vec::new();
                if let Ok(mut reverse) = self.reverse.write() {
                    reverse.retain(|(_, id), v| {
                        if *v == *rk {
                            owners.push(*id);
                            false
                        } else {
                            true
                        }
                    });
                }
                self.stamp(|log, epoch| {
                    for id in owners {
                        log.stamp_id(rk.entity_type(), id, epoch);
                    }
                });
                Ok(removed)
            }
            Err(e) => {
                warn!(error = %e, entity_type = %rk.entity_type(), "Shared region eviction failed, quarantining key");
                self.quarantine(rk);
                Err(e)
            }
        }
    }

    /// Evict `rk` only if it still maps to `id`.
    async fn evict_if_owned(&self, rk: &RegionKey, id: SurrogateId) {
        self.stamp(|log, epoch| log.stamp_id(rk.entity_type(), id, epoch));
        let owned = match self.region.get(rk).await {
            Ok(found) => found == Some(id),
            // Unknown owner: evict anyway, a missing mapping is only a miss.
            Err(_) => true,
        };
        if owned {
            let _ = self.evict_locked(rk).await;
        } else if let Ok(mut reverse) = self.reverse.write() {
            reverse.remove(&(rk.entity_type().clone(), id));
        }
    }

    /// Drop whatever key `id` is cached under. Returns whether one was found.
    pub async fn evict_surrogate(&self, entity_type: &EntityType, id: SurrogateId) -> bool {
        self.stamp(|log, epoch| log.stamp_id(entity_type, id, epoch));
        let Some(rk) = self.reverse_key(entity_type, id) else {
            return false;
        };
        let _guard = self.stripes[self.stripe_of(&rk)].lock().await;
        self.evict_if_owned(&rk, id).await;
        true
    }

    /// Drop every mapping of `entity_type`.
    ///
    /// Takes every stripe. On region failure the whole type stays
    /// quarantined until a later clear succeeds.
    pub async fn clear_region(&self, entity_type: &EntityType) -> NatIdResult<u64> {
        let _guards = self.lock_stripes((0..self.stripes.len()).collect()).await;
        self.stamp(|log, epoch| log.stamp_type(entity_type, epoch));
        match self.region.clear_region(entity_type).await {
            Ok(removed) => {
                self.quarantined_types
                    .write()
                    .map_err(poisoned)?
                    .remove(entity_type);
                self.quarantined_keys
                    .write()
                    .map_err(poisoned)?
                    .retain(|rk| rk.entity_type() != entity_type);
                self.reverse
                    .write()
                    .map_err(poisoned)?
                    .retain(|(ty, _), _| ty != entity_type);
                info!(entity_type = %entity_type, removed, "Shared region cleared");
                Ok(removed)
            }
            Err(e) => {
                warn!(error = %e, entity_type = %entity_type, "Shared region clear failed, quarantining type");
                self.quarantined_types
                    .write()
                    .map_err(poisoned)?
                    .insert(entity_type.clone());
                Err(e)
            }
        }
    }

    // ========================================================================
    // BATCHES
    // ========================================================================

    fn batch_stripes(&self, batch: &CommitBatch) -> BTreeSet<usize> {
        let mut stripes = BTreeSet::new();
        for expectation in &batch.expectations {
            stripes.insert(self.stripe_of(&RegionKey::for_key(&expectation.key)));
        }
        for op in &batch.ops {
            match op {
                BatchOp::Put { key, id } => {
                    stripes.insert(self.stripe_of(&RegionKey::for_key(key)));
                    if let Some(previous) = self.reverse_key(key.entity_type(), *id) {
                        stripes.insert(self.stripe_of(&previous));
                    }
                }
                BatchOp::Evict { key } | BatchOp::Promote { key, .. } => {
                    stripes.insert(self.stripe_of(&RegionKey::for_key(key)));
                }
                BatchOp::EvictSurrogate { entity_type, id } => {
                    if let Some(previous) = self.reverse_key(entity_type, *id) {
                        stripes.insert(self.stripe_of(&previous));
                    }
                }
            }
        }
        stripes
    }

    /// Apply a commit batch.
    ///
    /// All stripes the batch touches are locked in ascending order, then
    /// every expectation is checked. If one fails nothing is written and the
    /// conflict is returned. Otherwise the ops run in order and the number
    /// of accepted puts and promotions is returned.
    ///
    /// Promotions are judged against writes made before this batch: the
    /// batch's own evictions never block its own promotions.
    pub async fn apply(&self, batch: &CommitBatch) -> Result<u64, ConflictKind> {
        if !self.is_running() || batch.is_empty() {
            return Ok(0);
        }
        let locked = self.batch_stripes(batch);
        let _guards = self.lock_stripes(locked.clone()).await;

        let evicted_in_batch: HashSet<&NaturalKey> = batch
            .ops
            .iter()
            .filter_map(|op| match op {
                BatchOp::Evict { key } => Some(key),
                _ => None,
            })
            .collect();

        for expectation in &batch.expectations {
            if evicted_in_batch.contains(&expectation.key) {
                continue;
            }
            let rk = RegionKey::for_key(&expectation.key);
            if let Some(owner) = self.get_locked(&rk).await {
                if owner != expectation.id {
                    debug!(key = %expectation.key, owner = %owner, "Commit batch rejected");
                    return Err(ConflictKind::NaturalKeyConflict {
                        key: expectation.key.clone(),
                        owner,
                        claimant: expectation.id,
                    });
                }
            }
        }

        let promotable: Vec<bool> = batch
            .ops
            .iter()
            .map(|op| match op {
                BatchOp::Promote { key, id } => {
                    !self.invalidated_since(&RegionKey::for_key(key), *id, batch.read_epoch)
                }
                _ => true,
            })
            .collect();

        let mut puts = 0u64;
        for (op, promotable) in batch.ops.iter().zip(promotable) {
            match op {
                BatchOp::Promote { key, id } => {
                    if !promotable {
                        debug!(key = %key, id = %id, "Read written since, promotion dropped");
                    } else if self.promote_locked(RegionKey::for_key(key), *id).await {
                        puts += 1;
                    }
                }
                BatchOp::Put { key, id } => {
                    if self.put_locked(RegionKey::for_key(key), *id, &locked).await {
                        puts += 1;
                    }
                }
                BatchOp::Evict { key } => {
                    let _ = self.evict_locked(&RegionKey::for_key(key)).await;
                }
                BatchOp::EvictSurrogate { entity_type, id } => {
                    self.stamp(|log, epoch| log.stamp_id(entity_type, *id, epoch));
                    if let Some(rk) = self.reverse_key(entity_type, *id) {
                        if locked.contains(&self.stripe_of(&rk)) {
                            self.evict_if_owned(&rk, *id).await;
                        } else {
                            self.quarantine(&rk);
                        }
                    }
                }
            }
        }
        debug!(ops = batch.ops.len(), puts, "Commit batch applied");
        Ok(puts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRegion;

    fn key(name: &str) -> NaturalKey {
        NaturalKey::builder("User")
            .using("name", name)
            .using("org", "hb")
            .build()
    }

    fn shared() -> Arc<SharedResolutionCache<InMemoryRegion>> {
        SharedResolutionCache::start(
            InMemoryRegion::new(),
            &ResolutionConfig::default().with_lock_stripes(8),
        )
    }

    #[tokio::test]
    async fn test_put_get_evict() {
        let cache = shared();
        let id = SurrogateId::now_v7();

        assert_eq!(cache.get(&key("gavin")).await, None);
        assert!(cache.put(&key("gavin"), id).await);
        assert_eq!(cache.get(&key("gavin")).await, Some(id));
        assert!(cache.evict(&key("gavin")).await.unwrap());
        assert_eq!(cache.get(&key("gavin")).await, None);
    }

    #[tokio::test]
    async fn test_put_retires_previous_key_of_same_id() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        cache.put(&key("gavin"), id).await;
        cache.put(&key("Gavin"), id).await;

        assert_eq!(cache.get(&key("gavin")).await, None);
        assert_eq!(cache.get(&key("Gavin")).await, Some(id));
    }

    #[tokio::test]
    async fn test_evict_surrogate() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        cache.put(&key("gavin"), id).await;

        assert!(cache.evict_surrogate(&EntityType::new("User"), id).await);
        assert_eq!(cache.get(&key("gavin")).await, None);
        assert!(!cache.evict_surrogate(&EntityType::new("User"), id).await);
    }

    #[tokio::test]
    async fn test_region_outage_reads_as_miss() {
        let cache = shared();
        cache.put(&key("gavin"), SurrogateId::now_v7()).await;
        cache.region().set_available(false);
        assert_eq!(cache.get(&key("gavin")).await, None);
    }

    #[tokio::test]
    async fn test_failed_eviction_quarantines_key() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        cache.put(&key("gavin"), id).await;

        cache.region().set_available(false);
        assert!(cache.evict(&key("gavin")).await.is_err());
        cache.region().set_available(true);

        // Stale mapping is still in the region but never served.
        assert!(cache.is_quarantined(&key("gavin")));
        assert_eq!(cache.get(&key("gavin")).await, None);

        assert!(cache.evict(&key("gavin")).await.unwrap());
        assert!(!cache.is_quarantined(&key("gavin")));
    }

    #[tokio::test]
    async fn test_failed_clear_quarantines_type() {
        let cache = shared();
        cache.put(&key("gavin"), SurrogateId::now_v7()).await;

        cache.region().set_available(false);
        assert!(cache.clear_region(&EntityType::new("User")).await.is_err());
        cache.region().set_available(true);
        assert_eq!(cache.get(&key("gavin")).await, None);

        assert_eq!(cache.clear_region(&EntityType::new("User")).await.unwrap(), 1);
        let id = SurrogateId::now_v7();
        cache.put(&key("steve"), id).await;
        assert_eq!(cache.get(&key("steve")).await, Some(id));
    }

    #[tokio::test]
    async fn test_batch_conflict_applies_nothing() {
        let cache = shared();
        let owner = SurrogateId::now_v7();
        let claimant = SurrogateId::now_v7();
        cache.put(&key("taken"), owner).await;

        let mut batch = CommitBatch::new();
        batch.push(BatchOp::Put {
            key: key("fresh"),
            id: SurrogateId::now_v7(),
        });
        batch.expect_absent_or_owned(key("taken"), claimant);
        batch.push(BatchOp::Put {
            key: key("taken"),
            id: claimant,
        });

        let err = cache.apply(&batch).await.unwrap_err();
        assert!(matches!(err, ConflictKind::NaturalKeyConflict { owner: o, .. } if o == owner));
        assert_eq!(cache.get(&key("fresh")).await, None);
        assert_eq!(cache.get(&key("taken")).await, Some(owner));
    }

    #[tokio::test]
    async fn test_batch_swap_within_one_commit() {
        let cache = shared();
        let a = SurrogateId::now_v7();
        cache.put(&key("old"), a).await;

        let mut batch = CommitBatch::new();
        batch.expect_absent_or_owned(key("new"), a);
        batch.push(BatchOp::Evict { key: key("old") });
        batch.push(BatchOp::Put { key: key("new"), id: a });

        assert_eq!(cache.apply(&batch).await.unwrap(), 1);
        assert_eq!(cache.get(&key("old")).await, None);
        assert_eq!(cache.get(&key("new")).await, Some(a));
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let cache = shared();
        cache.put(&key("gavin"), SurrogateId::now_v7()).await;
        cache.shutdown();

        assert!(!cache.is_running());
        assert_eq!(cache.get(&key("gavin")).await, None);
        assert!(!cache.put(&key("steve"), SurrogateId::now_v7()).await);
    }

    fn promotion(since: u64, key: NaturalKey, id: SurrogateId) -> CommitBatch {
        let mut batch = CommitBatch::for_reader(since);
        batch.push(BatchOp::Promote { key, id });
        batch
    }

    #[tokio::test]
    async fn test_promotion_of_untouched_read_is_applied() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        let since = cache.begin_read();

        assert_eq!(cache.apply(&promotion(since, key("gavin"), id)).await.unwrap(), 1);
        assert_eq!(cache.get(&key("gavin")).await, Some(id));
        cache.end_read(since);
    }

    #[tokio::test]
    async fn test_promotion_dropped_after_rename_since_read() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        let since = cache.begin_read();

        let mut rename = CommitBatch::new();
        rename.expect_absent_or_owned(key("renamed"), id);
        rename.push(BatchOp::Evict { key: key("gavin") });
        rename.push(BatchOp::Put { key: key("renamed"), id });
        cache.apply(&rename).await.unwrap();

        assert_eq!(cache.apply(&promotion(since, key("gavin"), id)).await.unwrap(), 0);
        assert_eq!(cache.get(&key("gavin")).await, None);
        assert_eq!(cache.get(&key("renamed")).await, Some(id));
        cache.end_read(since);
    }

    #[tokio::test]
    async fn test_promotion_dropped_after_surrogate_eviction_since_read() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        let since = cache.begin_read();

        let mut delete = CommitBatch::new();
        delete.push(BatchOp::EvictSurrogate {
            entity_type: EntityType::new("User"),
            id,
        });
        cache.apply(&delete).await.unwrap();

        assert_eq!(cache.apply(&promotion(since, key("gavin"), id)).await.unwrap(), 0);
        assert_eq!(cache.get(&key("gavin")).await, None);
        cache.end_read(since);
    }

    #[tokio::test]
    async fn test_promotion_never_retires_or_overwrites() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        let other = SurrogateId::now_v7();
        cache.put(&key("current"), id).await;
        cache.put(&key("taken"), other).await;
        let since = cache.begin_read();

        assert_eq!(cache.apply(&promotion(since, key("stale"), id)).await.unwrap(), 0);
        assert_eq!(cache.get(&key("current")).await, Some(id));
        assert_eq!(cache.get(&key("stale")).await, None);

        let newcomer = SurrogateId::now_v7();
        assert_eq!(cache.apply(&promotion(since, key("taken"), newcomer)).await.unwrap(), 0);
        assert_eq!(cache.get(&key("taken")).await, Some(other));
        cache.end_read(since);
    }

    #[tokio::test]
    async fn test_get_many_reads_every_key() {
        let cache = shared();
        let id = SurrogateId::now_v7();
        cache.put(&key("gavin"), id).await;

        let found = cache.get_many(&[key("gavin"), key("steve")]).await;
        assert_eq!(found, vec![Some(id), None]);

        cache.shutdown();
        assert_eq!(cache.get_many(&[key("gavin")]).await, vec![None]);
    }

    #[tokio::test]
    async fn test_readers_are_released() {
        let cache = shared();
        let first = cache.begin_read();
        let second = cache.begin_read();
        assert_eq!(cache.open_readers(), 2);
        cache.end_read(first);
        cache.end_read(second);
        assert_eq!(cache.open_readers(), 0);
    }
}
