//! Natural-key mutation tracking.
//!
//! Staged transitions are held per entity and collapse: K1 → K2 → K3 is one
//! record K1 → K3, and a transition back to K1 drops the record entirely.

use natid_core::{
    ConflictKind, EntityType, MutationRecord, NaturalKey, ResolutionOrigin, SurrogateId,
    UnitOfWorkId,
};
use tracing::debug;

use super::local::LocalResolutionCache;
use super::shared::{BatchOp, CommitBatch, SharedResolutionCache};
use super::traits::SharedRegion;

/// Outcome of observing an entity's current natural key.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Key matches the last recorded key.
    Unchanged,
    /// A transition is staged for commit.
    Staged(MutationRecord),
    /// The new key already resolves to another entity.
    Conflict(ConflictKind),
    /// The entity has no recorded key in this unit of work.
    Untracked,
}

impl Observation {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Observation::Conflict(_))
    }
}

/// Staged natural-key transitions of one unit of work.
#[derive(Debug)]
pub struct MutationTracker {
    unit_of_work: UnitOfWorkId,
    pending: Vec<MutationRecord>,
}

impl MutationTracker {
    pub fn new(unit_of_work: UnitOfWorkId) -> Self {
        Self {
            unit_of_work,
            pending: Vec::new(),
        }
    }

    pub fn unit_of_work(&self) -> UnitOfWorkId {
        self.unit_of_work
    }

    pub fn pending(&self) -> &[MutationRecord] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn position(&self, entity_type: &EntityType, id: SurrogateId) -> Option<usize> {
        self.pending
            .iter()
            .position(|r| r.id == id && r.entity_type() == entity_type)
    }

    pub fn has_pending(&self, entity_type: &EntityType, id: SurrogateId) -> bool {
        self.position(entity_type, id).is_some()
    }

    /// Compare `current` with the last key recorded for `id` and stage the
    /// difference.
    ///
    /// `shared` is consulted for collisions only when the entity type is
    /// cacheable; the caller passes `None` otherwise.
    pub async fn observe<R: SharedRegion>(
        &mut self,
        id: SurrogateId,
        current: NaturalKey,
        local: &mut LocalResolutionCache,
        shared: Option<&SharedResolutionCache<R>>,
    ) -> Observation {
        let entity_type = current.entity_type().clone();
        let Some(baseline) = local.find_by_surrogate(&entity_type, id).cloned() else {
            return Observation::Untracked;
        };
        if baseline == current {
            return Observation::Unchanged;
        }

        if let Some(owner) = local.resolve(&current) {
            if owner != id {
                return Observation::Conflict(ConflictKind::NaturalKeyConflict {
                    key: current,
                    owner,
                    claimant: id,
                });
            }
        }
        if !local.is_shadowed(&current) {
            if let Some(shared) = shared {
                if let Some(owner) = shared.get(&current).await {
                    if owner != id {
                        return Observation::Conflict(ConflictKind::NaturalKeyConflict {
                            key: current,
                            owner,
                            claimant: id,
                        });
                    }
                }
            }
        }

        // Collapse onto an earlier record for the same entity.
        let committed_key = match self.position(&entity_type, id) {
            Some(index) => self.pending.remove(index).old_key,
            None => baseline,
        };

        if committed_key == current {
            debug!(id = %id, key = %current, "Natural key reverted, mutation dropped");
            // Reverted keys are committed state again.
            if let Err(conflict) = local.put(current, id, ResolutionOrigin::LocalCommitted) {
                return Observation::Conflict(conflict);
            }
            return Observation::Unchanged;
        }

        if let Err(conflict) = local.put(current.clone(), id, ResolutionOrigin::LocalPending) {
            return Observation::Conflict(conflict);
        }
        local.shadow(committed_key.clone());

        let record = MutationRecord::new(id, committed_key, current, self.unit_of_work);
        debug!(
            id = %id,
            old_key = %record.old_key,
            new_key = %record.new_key,
            "Natural key mutation staged"
        );
        self.pending.push(record.clone());
        Observation::Staged(record)
    }

    /// Drop the staged transition of one entity, returning it.
    pub fn cancel(&mut self, entity_type: &EntityType, id: SurrogateId) -> Option<MutationRecord> {
        let index = self.position(entity_type, id)?;
        Some(self.pending.remove(index))
    }

    /// Add every staged transition to a commit batch without applying it.
    ///
    /// For types where `cacheable` holds, the batch gets an eviction of the
    /// old key and an expectation that the new key is free or already owned.
    /// The new key itself is written by the caller with the other pending
    /// entries.
    pub fn plan_pending(&self, batch: &mut CommitBatch, cacheable: impl Fn(&EntityType) -> bool) {
        for record in &self.pending {
            if cacheable(record.entity_type()) {
                batch.expect_absent_or_owned(record.new_key.clone(), record.id);
                batch.push(BatchOp::Evict {
                    key: record.old_key.clone(),
                });
            }
        }
    }

    /// Apply every staged transition once the commit went through.
    ///
    /// Local gets the new keys as committed entries.
    pub fn apply_pending(
        &mut self,
        unit_of_work: UnitOfWorkId,
        local: &mut LocalResolutionCache,
    ) -> Vec<MutationRecord> {
        if unit_of_work != self.unit_of_work {
            return Vec::new();
        }
        let applied: Vec<MutationRecord> = self.pending.drain(..).collect();
        for record in &applied {
            if local.resolve(&record.new_key) == Some(record.id) {
                local.set_origin(&record.new_key, ResolutionOrigin::LocalCommitted);
            }
        }
        applied
    }

    /// Drop every staged transition. Shared is never touched.
    pub fn discard_pending(&mut self, unit_of_work: UnitOfWorkId) -> usize {
        if unit_of_work != self.unit_of_work {
            return 0;
        }
        let discarded = self.pending.len();
        self.pending.clear();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryRegion;
    use natid_core::ResolutionConfig;

    fn key(org: &str) -> NaturalKey {
        NaturalKey::builder("User")
            .using("name", "gavin")
            .using("org", org)
            .build()
    }

    fn setup() -> (MutationTracker, LocalResolutionCache, SurrogateId) {
        let tracker = MutationTracker::new(UnitOfWorkId::now_v7());
        let mut local = LocalResolutionCache::new();
        let id = SurrogateId::now_v7();
        local.put(key("hb"), id, ResolutionOrigin::LocalCommitted).unwrap();
        (tracker, local, id)
    }

    const NO_SHARED: Option<&SharedResolutionCache<InMemoryRegion>> = None;

    #[tokio::test]
    async fn test_unchanged_and_untracked() {
        let (mut tracker, mut local, id) = setup();
        let obs = tracker.observe(id, key("hb"), &mut local, NO_SHARED).await;
        assert_eq!(obs, Observation::Unchanged);

        let obs = tracker
            .observe(SurrogateId::now_v7(), key("hb"), &mut local, NO_SHARED)
            .await;
        assert_eq!(obs, Observation::Untracked);
    }

    #[tokio::test]
    async fn test_stage_shadows_old_key() {
        let (mut tracker, mut local, id) = setup();
        let obs = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;

        assert!(matches!(obs, Observation::Staged(ref r) if r.old_key == key("hb")));
        assert_eq!(local.resolve(&key("hb")), None);
        assert!(local.is_shadowed(&key("hb")));
        assert_eq!(local.resolve(&key("ceylon")), Some(id));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn test_successive_mutations_collapse() {
        let (mut tracker, mut local, id) = setup();
        let _ = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;
        let obs = tracker.observe(id, key("acme"), &mut local, NO_SHARED).await;

        assert!(matches!(obs, Observation::Staged(ref r)
            if r.old_key == key("hb") && r.new_key == key("acme")));
        assert_eq!(tracker.len(), 1);
        assert_eq!(local.resolve(&key("ceylon")), None);
        assert!(!local.is_shadowed(&key("ceylon")));
    }

    #[tokio::test]
    async fn test_revert_drops_record() {
        let (mut tracker, mut local, id) = setup();
        let _ = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;
        let obs = tracker.observe(id, key("hb"), &mut local, NO_SHARED).await;

        assert_eq!(obs, Observation::Unchanged);
        assert!(tracker.is_empty());
        assert_eq!(local.resolve(&key("hb")), Some(id));
        assert!(!local.is_shadowed(&key("hb")));
    }

    #[tokio::test]
    async fn test_local_collision_is_conflict() {
        let (mut tracker, mut local, id) = setup();
        let other = SurrogateId::now_v7();
        local.put(key("ceylon"), other, ResolutionOrigin::LocalCommitted).unwrap();

        let obs = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;
        assert!(matches!(obs, Observation::Conflict(ConflictKind::NaturalKeyConflict { owner, .. })
            if owner == other));
        assert!(tracker.is_empty());
        assert_eq!(local.resolve(&key("hb")), Some(id));
    }

    #[tokio::test]
    async fn test_shared_collision_is_conflict() {
        let (mut tracker, mut local, id) = setup();
        let shared = SharedResolutionCache::start(InMemoryRegion::new(), &ResolutionConfig::default());
        let other = SurrogateId::now_v7();
        shared.put(&key("ceylon"), other).await;

        let obs = tracker
            .observe(id, key("ceylon"), &mut local, Some(shared.as_ref()))
            .await;
        assert!(obs.is_conflict());
    }

    #[tokio::test]
    async fn test_plan_pending_leaves_state_untouched() {
        let (mut tracker, mut local, id) = setup();
        let _ = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;

        let mut batch = CommitBatch::new();
        tracker.plan_pending(&mut batch, |_| true);

        assert_eq!(batch.ops(), &[BatchOp::Evict { key: key("hb") }]);
        assert_eq!(batch.expectations().len(), 1);
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            local.entry(&key("ceylon")).map(|e| e.origin),
            Some(ResolutionOrigin::LocalPending)
        );
        assert!(local.is_shadowed(&key("hb")));
    }

    #[tokio::test]
    async fn test_plan_pending_skips_non_cacheable_batch() {
        let (mut tracker, mut local, id) = setup();
        let _ = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;

        let mut batch = CommitBatch::new();
        tracker.plan_pending(&mut batch, |_| false);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_apply_pending_commits_new_keys() {
        let (mut tracker, mut local, id) = setup();
        let uow = tracker.unit_of_work();
        let _ = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;

        assert!(tracker.apply_pending(UnitOfWorkId::now_v7(), &mut local).is_empty());
        let applied = tracker.apply_pending(uow, &mut local);

        assert_eq!(applied.len(), 1);
        assert!(tracker.is_empty());
        assert_eq!(
            local.entry(&key("ceylon")).map(|e| e.origin),
            Some(ResolutionOrigin::LocalCommitted)
        );
    }

    #[tokio::test]
    async fn test_discard_pending_requires_owner() {
        let (mut tracker, mut local, id) = setup();
        let _ = tracker.observe(id, key("ceylon"), &mut local, NO_SHARED).await;

        assert_eq!(tracker.discard_pending(UnitOfWorkId::now_v7()), 0);
        assert_eq!(tracker.discard_pending(tracker.unit_of_work()), 1);
        assert!(tracker.is_empty());
    }
}
