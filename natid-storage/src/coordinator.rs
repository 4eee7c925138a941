//! Resolution coordinator and units of work.
//!
//! The coordinator is the process-wide entry point: it owns the shared tier,
//! the persister handle and the statistics sink. Every unit of work it
//! begins gets a fresh local tier and mutation tracker.
//!
//! Resolution order for `resolve(key, options)`:
//! 1. Local hit: returned as is, no statistics change.
//! 2. `cacheable` local miss on a cacheable type: Shared. A hit seeds Local.
//! 3. Store lookup by natural key. Absence is never cached.
//!
//! On commit, entries of cacheable types that did not come from Shared are
//! promoted into it. Entries the unit of work wrote go in unconditionally,
//! under key expectations. Entries it only read go in as promotions, which
//! Shared drops if another commit touched the key or entity after this unit
//! of work began.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use natid_core::{
    AttributeValue, ConflictKind, EntityState, EntityType, NatIdResult, NaturalKey,
    ResolutionConfig, ResolutionOrigin, ResolveOptions, SurrogateId, UnitOfWorkId,
    ValidationError,
};
use tracing::{debug, info, warn};

use crate::cache::{
    BatchOp, CommitBatch, LocalResolutionCache, MutationTracker, Observation,
    ReattachmentValidator, SharedRegion, SharedResolutionCache, Verdict,
};
use crate::persister::EntityPersister;
use crate::stats::ResolutionStatistics;

// ============================================================================
// COORDINATOR
// ============================================================================

/// Process-wide resolution service.
pub struct ResolutionCoordinator<R: SharedRegion, P: EntityPersister> {
    config: Arc<ResolutionConfig>,
    shared: Arc<SharedResolutionCache<R>>,
    persister: Arc<P>,
    stats: Arc<ResolutionStatistics>,
}

impl<R: SharedRegion, P: EntityPersister> Clone for ResolutionCoordinator<R, P> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            shared: Arc::clone(&self.shared),
            persister: Arc::clone(&self.persister),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<R: SharedRegion, P: EntityPersister> ResolutionCoordinator<R, P> {
    /// Create a coordinator. Fails if `config` does not validate.
    pub fn new(
        config: ResolutionConfig,
        shared: Arc<SharedResolutionCache<R>>,
        persister: Arc<P>,
    ) -> NatIdResult<Self> {
        config.validate()?;
        let stats = Arc::new(ResolutionStatistics::new(config.statistics_enabled));
        Ok(Self {
            config: Arc::new(config),
            shared,
            persister,
            stats,
        })
    }

    /// Begin a new unit of work.
    pub fn begin(&self) -> UnitOfWork<R, P> {
        let id = UnitOfWorkId::now_v7();
        debug!(unit_of_work = %id, "Unit of work started");
        UnitOfWork {
            id,
            config: Arc::clone(&self.config),
            shared: Arc::clone(&self.shared),
            persister: Arc::clone(&self.persister),
            stats: Arc::clone(&self.stats),
            read_epoch: self.shared.begin_read(),
            local: LocalResolutionCache::new(),
            tracker: MutationTracker::new(id),
            refreshed: HashSet::new(),
            deletions: Vec::new(),
            rollback_only: None,
            finished: false,
        }
    }

    pub fn statistics(&self) -> &ResolutionStatistics {
        &self.stats
    }

    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedResolutionCache<R> {
        &self.shared
    }

    pub fn persister(&self) -> &P {
        &self.persister
    }

    /// Bulk-invalidate every Shared mapping of `entity_type`.
    pub async fn evict_entity_type(&self, entity_type: &EntityType) -> NatIdResult<u64> {
        self.shared.clear_region(entity_type).await
    }
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

/// One deletion staged in a unit of work.
#[derive(Debug, Clone)]
struct PendingDeletion {
    entity_type: EntityType,
    id: SurrogateId,
    keys: Vec<NaturalKey>,
}

/// Result of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub unit_of_work: UnitOfWorkId,
    pub mutations_applied: usize,
    pub deletions_applied: usize,
    pub promoted: u64,
}

/// Result of a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolledBack {
    pub unit_of_work: UnitOfWorkId,
    pub mutations_discarded: usize,
}

/// A commit refused because of a conflict.
///
/// Owns the unit of work; the caller must [`rollback`](Self::rollback).
#[must_use]
pub struct Rejected<R: SharedRegion, P: EntityPersister> {
    conflict: ConflictKind,
    unit_of_work: UnitOfWork<R, P>,
}

impl<R: SharedRegion, P: EntityPersister> Rejected<R, P> {
    pub fn conflict(&self) -> &ConflictKind {
        &self.conflict
    }

    /// The refused unit of work, exactly as it was before commit.
    pub fn unit_of_work(&self) -> &UnitOfWork<R, P> {
        &self.unit_of_work
    }

    pub fn rollback(self) -> RolledBack {
        self.unit_of_work.rollback()
    }
}

impl<R: SharedRegion, P: EntityPersister> fmt::Debug for Rejected<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("conflict", &self.conflict)
            .field("unit_of_work", &self.unit_of_work.id)
            .finish()
    }
}

/// A unit of work: the scope of one local tier and one mutation tracker.
///
/// Ends with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it without either discards everything, like a rollback.
pub struct UnitOfWork<R: SharedRegion, P: EntityPersister> {
    id: UnitOfWorkId,
    config: Arc<ResolutionConfig>,
    shared: Arc<SharedResolutionCache<R>>,
    persister: Arc<P>,
    stats: Arc<ResolutionStatistics>,
    read_epoch: u64,
    local: LocalResolutionCache,
    tracker: MutationTracker,
    refreshed: HashSet<(EntityType, SurrogateId)>,
    deletions: Vec<PendingDeletion>,
    rollback_only: Option<ConflictKind>,
    finished: bool,
}

impl<R: SharedRegion, P: EntityPersister> fmt::Debug for UnitOfWork<R, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("local_entries", &self.local.len())
            .field("pending_mutations", &self.tracker.len())
            .field("rollback_only", &self.rollback_only.is_some())
            .finish()
    }
}

impl<R: SharedRegion, P: EntityPersister> UnitOfWork<R, P> {
    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    /// Conflict that doomed this unit of work, if any.
    pub fn rollback_only(&self) -> Option<&ConflictKind> {
        self.rollback_only.as_ref()
    }

    pub fn local(&self) -> &LocalResolutionCache {
        &self.local
    }

    pub fn pending_mutations(&self) -> usize {
        self.tracker.len()
    }

    /// Shared tier, if `entity_type` may use it.
    fn shared_for(&self, entity_type: &EntityType) -> Option<Arc<SharedResolutionCache<R>>> {
        if self.config.is_natural_key_cacheable(entity_type) && self.shared.is_running() {
            Some(Arc::clone(&self.shared))
        } else {
            None
        }
    }

    fn mark_rollback_only(&mut self, conflict: &ConflictKind) {
        warn!(unit_of_work = %self.id, conflict = %conflict, "Unit of work marked rollback-only");
        if self.rollback_only.is_none() {
            self.rollback_only = Some(conflict.clone());
        }
    }

    fn is_deleted(&self, entity_type: &EntityType, id: SurrogateId) -> bool {
        self.deletions
            .iter()
            .any(|d| d.id == id && &d.entity_type == entity_type)
    }

    /// Check `key` against the mapping of its entity type.
    fn validate_key(&self, key: &NaturalKey) -> NatIdResult<()> {
        let entity_type = key.entity_type();
        let nullability = self.persister.nullability(entity_type)?;

        for (attribute, _) in key.attributes() {
            if !nullability.contains_key(attribute) {
                return Err(ValidationError::UnknownAttribute {
                    entity_type: entity_type.clone(),
                    attribute: attribute.to_string(),
                }
                .into());
            }
        }
        for (attribute, nullable) in &nullability {
            match key.get(attribute) {
                None => {
                    return Err(ValidationError::MissingAttribute {
                        entity_type: entity_type.clone(),
                        attribute: attribute.clone(),
                    }
                    .into())
                }
                Some(AttributeValue::Null) if !nullable => {
                    return Err(ValidationError::NullabilityViolation {
                        entity_type: entity_type.clone(),
                        attribute: attribute.clone(),
                    }
                    .into())
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Project and validate the natural key of `state`.
    fn key_of(&self, state: &EntityState) -> NatIdResult<NaturalKey> {
        let nullability = self.persister.nullability(&state.entity_type)?;
        let key = state.natural_key(nullability.keys().map(String::as_str));
        self.validate_key(&key)?;
        Ok(key)
    }

    /// Whether a lower-tier answer `key → id` contradicts this unit of work.
    fn contradicts_local(&self, key: &NaturalKey, id: SurrogateId) -> bool {
        let known_elsewhere = self
            .local
            .find_by_surrogate(key.entity_type(), id)
            .is_some_and(|local_key| local_key != key);
        known_elsewhere || self.is_deleted(key.entity_type(), id)
    }

    // ========================================================================
    // RESOLUTION
    // ========================================================================

    /// Resolve a natural key to a surrogate id.
    pub async fn resolve(
        &mut self,
        key: &NaturalKey,
        options: ResolveOptions,
    ) -> NatIdResult<Option<SurrogateId>> {
        self.validate_key(key)?;

        if let Some(id) = self.local.resolve(key) {
            debug!(key = %key, id = %id, "Resolved from local tier");
            return Ok(Some(id));
        }
        if self.local.is_shadowed(key) {
            debug!(key = %key, "Key retired in this unit of work");
            return Ok(None);
        }

        if options.cacheable && self.config.query_cache_enabled {
            if let Some(shared) = self.shared_for(key.entity_type()) {
                match shared.get(key).await {
                    Some(id) => {
                        self.stats.record_hit();
                        if self.contradicts_local(key, id) {
                            debug!(key = %key, id = %id, "Shared hit contradicts local state");
                            return Ok(None);
                        }
                        self.local.put(key.clone(), id, ResolutionOrigin::Shared)?;
                        debug!(key = %key, id = %id, "Resolved from shared tier");
                        return Ok(Some(id));
                    }
                    None => self.stats.record_miss(),
                }
            }
        }

        self.stats.record_query_execution();
        let found = self.persister.find_by_natural_key(key).await?;
        let Some(id) = found else {
            debug!(key = %key, "Natural key not found in store");
            return Ok(None);
        };
        if self.contradicts_local(key, id) {
            debug!(key = %key, id = %id, "Store hit contradicts local state");
            return Ok(None);
        }
        self.local
            .put(key.clone(), id, ResolutionOrigin::LocalCommitted)?;
        debug!(key = %key, id = %id, "Resolved from store");
        Ok(Some(id))
    }

    // ========================================================================
    // ENTITY LIFECYCLE
    // ========================================================================

    /// Register a new entity. Its key is pending until commit.
    ///
    /// A key that already resolves to another entity marks the unit of work
    /// rollback-only and returns the conflict.
    pub async fn persist(&mut self, state: &EntityState) -> NatIdResult<()> {
        let key = self.key_of(state)?;

        let mut owner = self.local.resolve(&key);
        if owner.is_none() && !self.local.is_shadowed(&key) {
            if let Some(shared) = self.shared_for(key.entity_type()) {
                owner = shared.get(&key).await;
            }
        }
        if let Some(owner) = owner.filter(|owner| *owner != state.id) {
            let conflict = ConflictKind::NaturalKeyConflict {
                key,
                owner,
                claimant: state.id,
            };
            self.mark_rollback_only(&conflict);
            return Err(conflict.into());
        }

        self.local
            .put(key.clone(), state.id, ResolutionOrigin::LocalPending)?;
        debug!(key = %key, id = %state.id, "Entity persisted");
        Ok(())
    }

    /// Load an entity by surrogate id and associate it.
    pub async fn load(
        &mut self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> NatIdResult<Option<EntityState>> {
        if self.is_deleted(entity_type, id) {
            return Ok(None);
        }
        let Some(state) = self.persister.load_by_surrogate_id(entity_type, id).await? else {
            return Ok(None);
        };
        if self.local.find_by_surrogate(entity_type, id).is_none() {
            let key = self.key_of(&state)?;
            self.local.put(key, id, ResolutionOrigin::LocalCommitted)?;
        }
        Ok(Some(state))
    }

    /// Flush the current state of an associated entity.
    ///
    /// Returns [`Observation::Untracked`] for entities this unit of work has
    /// no key for; those go through [`reattach`](Self::reattach).
    pub async fn flush_entity(&mut self, state: &EntityState) -> NatIdResult<Observation> {
        let key = self.key_of(state)?;
        let shared = self.shared_for(&state.entity_type);
        let observation = self
            .tracker
            .observe(state.id, key, &mut self.local, shared.as_deref())
            .await;
        if let Observation::Conflict(conflict) = &observation {
            self.mark_rollback_only(conflict);
        }
        Ok(observation)
    }

    /// Bring a detached entity back into this unit of work.
    ///
    /// A key that diverges from the persisted one without a prior
    /// [`lock`](Self::lock) is a stale key: the unit of work becomes
    /// rollback-only and no cached mapping is touched.
    pub async fn reattach(&mut self, state: &EntityState) -> NatIdResult<Verdict> {
        let current = self.key_of(state)?;
        let slot = (state.entity_type.clone(), state.id);
        let declared = self.refreshed.contains(&slot)
            || self.tracker.has_pending(&state.entity_type, state.id);

        let persister = Arc::clone(&self.persister);
        let validator = ReattachmentValidator::new(persister.as_ref());
        let verdict = validator.validate(state, &current, declared).await?;

        match &verdict {
            Verdict::Consistent => {
                if self.local.find_by_surrogate(&state.entity_type, state.id).is_none() {
                    self.local
                        .put(current, state.id, ResolutionOrigin::LocalCommitted)?;
                }
            }
            Verdict::Declared => {
                if self.local.find_by_surrogate(&state.entity_type, state.id).is_none() {
                    if let Some(persisted) = validator.persisted_key(state).await? {
                        self.local
                            .put(persisted, state.id, ResolutionOrigin::LocalCommitted)?;
                    }
                }
                if let Observation::Conflict(conflict) = self.flush_entity(state).await? {
                    return Ok(Verdict::Conflict(conflict));
                }
            }
            Verdict::Conflict(conflict) => self.mark_rollback_only(conflict),
            Verdict::Unknown => {}
        }
        Ok(verdict)
    }

    /// Explicit lock/refresh: re-read the persisted key and associate the
    /// entity. Later key changes on it are declared.
    ///
    /// Returns false if nothing is persisted for the id.
    pub async fn lock(&mut self, state: &EntityState) -> NatIdResult<bool> {
        let persisted = self
            .persister
            .persisted_natural_key(&state.entity_type, state.id)
            .await?;
        let Some(persisted) = persisted else {
            return Ok(false);
        };
        if self.local.find_by_surrogate(&state.entity_type, state.id).is_none() {
            self.local
                .put(persisted, state.id, ResolutionOrigin::LocalCommitted)?;
        }
        self.refreshed.insert((state.entity_type.clone(), state.id));
        debug!(entity_type = %state.entity_type, id = %state.id, "Entity locked");
        Ok(true)
    }

    /// Delete an entity. Its keys stop resolving here at once and are
    /// evicted from Shared on commit.
    pub async fn delete(&mut self, entity_type: &EntityType, id: SurrogateId) -> NatIdResult<()> {
        let mut keys = Vec::new();
        if let Some(record) = self.tracker.cancel(entity_type, id) {
            keys.push(record.old_key);
        }
        match self.local.remove_surrogate(entity_type, id) {
            Some(key) => keys.push(key),
            None => {
                if let Some(key) = self.persister.persisted_natural_key(entity_type, id).await? {
                    keys.push(key);
                }
            }
        }
        for key in &keys {
            self.local.shadow(key.clone());
        }
        self.refreshed.remove(&(entity_type.clone(), id));
        debug!(entity_type = %entity_type, id = %id, keys = keys.len(), "Entity deleted");
        self.deletions.push(PendingDeletion {
            entity_type: entity_type.clone(),
            id,
            keys,
        });
        Ok(())
    }

    /// Detach one entity, dropping its staged key change.
    ///
    /// The old key of a dropped change resolves through the lower tiers
    /// again. If another entity claimed it here in the meantime, both now
    /// hold it: the unit of work becomes rollback-only.
    pub fn evict(&mut self, entity_type: &EntityType, id: SurrogateId) {
        if let Some(record) = self.tracker.cancel(entity_type, id) {
            self.local.unshadow(&record.old_key);
            if let Some(claimant) = self.local.resolve(&record.old_key).filter(|c| *c != id) {
                let conflict = ConflictKind::NaturalKeyConflict {
                    key: record.old_key,
                    owner: id,
                    claimant,
                };
                self.mark_rollback_only(&conflict);
            }
        }
        let _ = self.local.remove_surrogate(entity_type, id);
        self.refreshed.remove(&(entity_type.clone(), id));
    }

    /// Detach everything: local entries, staged changes, refresh markers and
    /// staged deletions.
    pub fn clear(&mut self) {
        let discarded = self.tracker.discard_pending(self.id);
        self.local.clear();
        self.refreshed.clear();
        self.deletions.clear();
        // Nothing read so far survives, so later reads start a new epoch.
        self.shared.end_read(self.read_epoch);
        self.read_epoch = self.shared.begin_read();
        debug!(unit_of_work = %self.id, discarded, "Unit of work cleared");
    }

    // ========================================================================
    // COMPLETION
    // ========================================================================

    /// Shared writes of this unit of work. Leaves every local structure as
    /// it is.
    fn plan_commit(&self) -> CommitBatch {
        let cacheable = |ty: &EntityType| self.config.is_natural_key_cacheable(ty);
        let mut batch = CommitBatch::for_reader(self.read_epoch);

        self.tracker.plan_pending(&mut batch, cacheable);

        for deletion in &self.deletions {
            if !cacheable(&deletion.entity_type) {
                continue;
            }
            for key in &deletion.keys {
                batch.push(BatchOp::Evict { key: key.clone() });
            }
            batch.push(BatchOp::EvictSurrogate {
                entity_type: deletion.entity_type.clone(),
                id: deletion.id,
            });
        }

        for entry in self.local.promotion_candidates() {
            let entity_type = entry.entity_type();
            if !cacheable(entity_type) || self.is_deleted(entity_type, entry.id) {
                continue;
            }
            let (key, id) = (entry.key.clone(), entry.id);
            if entry.origin == ResolutionOrigin::LocalPending {
                if !self.tracker.has_pending(entity_type, id) {
                    batch.expect_absent_or_owned(key.clone(), id);
                }
                batch.push(BatchOp::Put { key, id });
            } else {
                batch.push(BatchOp::Promote { key, id });
            }
        }

        batch
    }

    /// Commit: apply staged transitions and promote committed mappings.
    ///
    /// Staged keys are re-checked against Shared under the stripe locks. On
    /// conflict nothing is applied, Shared or local, and the unit of work
    /// comes back inside [`Rejected`].
    pub async fn commit(mut self) -> Result<Committed, Rejected<R, P>> {
        if let Some(conflict) = self.rollback_only.clone() {
            return Err(Rejected {
                conflict,
                unit_of_work: self,
            });
        }

        let promoted = if self.config.second_level_cache_enabled {
            let batch = self.plan_commit();
            match self.shared.apply(&batch).await {
                Ok(puts) => puts,
                Err(conflict) => {
                    self.mark_rollback_only(&conflict);
                    return Err(Rejected {
                        conflict,
                        unit_of_work: self,
                    });
                }
            }
        } else {
            0
        };
        self.stats.record_puts(promoted);

        let mutations_applied = self.tracker.apply_pending(self.id, &mut self.local).len();
        self.local.mark_committed();

        let committed = Committed {
            unit_of_work: self.id,
            mutations_applied,
            deletions_applied: self.deletions.len(),
            promoted,
        };
        info!(
            unit_of_work = %self.id,
            mutations = committed.mutations_applied,
            deletions = committed.deletions_applied,
            promoted,
            "Unit of work committed"
        );
        self.finished = true;
        Ok(committed)
    }

    /// Roll back: discard Local and the tracker. Shared is never touched.
    pub fn rollback(mut self) -> RolledBack {
        let mutations_discarded = self.tracker.discard_pending(self.id);
        self.local.clear();
        self.finished = true;
        info!(unit_of_work = %self.id, mutations_discarded, "Unit of work rolled back");
        RolledBack {
            unit_of_work: self.id,
            mutations_discarded,
        }
    }
}

impl<R: SharedRegion, P: EntityPersister> Drop for UnitOfWork<R, P> {
    fn drop(&mut self) {
        if !self.finished {
            let discarded = self.tracker.discard_pending(self.id);
            debug!(unit_of_work = %self.id, discarded, "Unit of work dropped without commit");
        }
        self.local.clear();
        self.shared.end_read(self.read_epoch);
    }
}
