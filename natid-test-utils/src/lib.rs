//! NATID Test Utilities
//!
//! Centralized test infrastructure for the NATID workspace:
//! - Proptest generators for keys and values
//! - The `User` fixture mapping and entities
//! - A session harness that writes entity rows to the in-memory store on
//!   commit, the way a real transaction would

use std::collections::HashMap;
use std::sync::Arc;

pub use natid_core::{
    AttributeValue, ConflictKind, EntityState, EntityType, NatIdError, NatIdResult, NaturalKey,
    ResolutionConfig, ResolveOptions, SurrogateId, ValidationError,
};
pub use natid_storage::{
    Committed, EntityMapping, InMemoryPersister, InMemoryRegion, NaturalKeyAttribute,
    Observation, Rejected, ResolutionCoordinator, RolledBack, SharedResolutionCache, UnitOfWork,
    Verdict,
};

pub type TestCoordinator = ResolutionCoordinator<InMemoryRegion, InMemoryPersister>;
pub type TestUnitOfWork = UnitOfWork<InMemoryRegion, InMemoryPersister>;

// ============================================================================
// TRACING
// ============================================================================

/// Install a test-writer subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! The `User{name, org}` fixture used across scenarios.

    use super::*;

    pub const USER: &str = "User";

    /// `User` with natural key `(name, org)`, both non-nullable by default.
    pub fn user_mapping() -> EntityMapping {
        EntityMapping::new(USER)
            .with_attribute(NaturalKeyAttribute::new("name"))
            .with_attribute(NaturalKeyAttribute::new("org"))
    }

    pub fn user_type() -> EntityType {
        EntityType::new(USER)
    }

    pub fn user(name: &str, org: &str, password: &str) -> EntityState {
        EntityState::new(USER, SurrogateId::now_v7())
            .with("name", name)
            .with("org", org)
            .with("password", password)
    }

    pub fn user_key(name: &str, org: &str) -> NaturalKey {
        NaturalKey::builder(USER)
            .using("name", name)
            .using("org", org)
            .build()
    }

    /// Config with everything on and `User` keys cacheable.
    pub fn cacheable_config() -> ResolutionConfig {
        ResolutionConfig::default()
            .with_second_level_cache(true)
            .with_query_cache(true)
            .with_statistics(true)
            .with_cacheable_natural_key(USER, true)
    }

    /// Config with the second-level cache on but `User` keys not cacheable.
    pub fn non_cacheable_config() -> ResolutionConfig {
        ResolutionConfig::default()
            .with_second_level_cache(true)
            .with_query_cache(true)
            .with_statistics(true)
    }
}

// ============================================================================
// TEST ENVIRONMENT
// ============================================================================

/// Coordinator, in-memory store and in-memory shared region, wired up.
pub struct TestEnv {
    pub coordinator: TestCoordinator,
    pub persister: Arc<InMemoryPersister>,
}

impl TestEnv {
    /// Environment with the `User` mapping registered.
    pub fn new(config: ResolutionConfig) -> Self {
        Self::with_mappings(config, vec![fixtures::user_mapping()])
    }

    pub fn with_mappings(config: ResolutionConfig, mappings: Vec<EntityMapping>) -> Self {
        let persister = Arc::new(InMemoryPersister::new());
        for mapping in mappings {
            persister
                .register(mapping)
                .expect("mapping registration should succeed");
        }
        let shared = SharedResolutionCache::start(InMemoryRegion::new(), &config);
        let coordinator = ResolutionCoordinator::new(config, shared, Arc::clone(&persister))
            .expect("test config should validate");
        Self {
            coordinator,
            persister,
        }
    }

    pub fn session(&self) -> TestSession {
        TestSession {
            uow: self.coordinator.begin(),
            persister: Arc::clone(&self.persister),
            inserts: Vec::new(),
            updates: HashMap::new(),
            deletes: Vec::new(),
        }
    }

    /// Insert rows directly, outside any unit of work.
    pub fn seed(&self, states: &[EntityState]) {
        for state in states {
            self.persister
                .insert(state)
                .expect("seeding the store should succeed");
        }
    }

    /// Overwrite a row directly, bypassing every cache.
    pub fn update_out_of_band(&self, state: &EntityState) {
        let updated = self
            .persister
            .update(state)
            .expect("out-of-band update should succeed");
        assert!(updated, "out-of-band update of a missing row");
    }
}

// ============================================================================
// SESSION HARNESS
// ============================================================================

/// A unit of work plus the entity writes it would flush to the store.
///
/// Rows are written to the in-memory persister only after the resolution
/// commit succeeds: deletes first, then updates, then inserts.
pub struct TestSession {
    uow: TestUnitOfWork,
    persister: Arc<InMemoryPersister>,
    inserts: Vec<EntityState>,
    updates: HashMap<(EntityType, SurrogateId), EntityState>,
    deletes: Vec<(EntityType, SurrogateId)>,
}

impl TestSession {
    pub fn uow(&mut self) -> &mut TestUnitOfWork {
        &mut self.uow
    }

    pub async fn resolve(
        &mut self,
        key: &NaturalKey,
        options: ResolveOptions,
    ) -> NatIdResult<Option<SurrogateId>> {
        self.uow.resolve(key, options).await
    }

    pub async fn persist(&mut self, state: &EntityState) -> NatIdResult<()> {
        self.uow.persist(state).await?;
        self.inserts.push(state.clone());
        Ok(())
    }

    pub async fn load(
        &mut self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> NatIdResult<Option<EntityState>> {
        self.uow.load(entity_type, id).await
    }

    fn queue_update(&mut self, state: &EntityState) {
        if let Some(insert) = self.inserts.iter_mut().find(|s| s.id == state.id) {
            *insert = state.clone();
            return;
        }
        self.updates
            .insert((state.entity_type.clone(), state.id), state.clone());
    }

    /// Flush an associated entity and queue its row update.
    pub async fn flush(&mut self, state: &EntityState) -> NatIdResult<Observation> {
        let observation = self.uow.flush_entity(state).await?;
        if matches!(observation, Observation::Unchanged | Observation::Staged(_)) {
            self.queue_update(state);
        }
        Ok(observation)
    }

    /// Reattach a detached entity and queue its row update unless rejected.
    pub async fn reattach(&mut self, state: &EntityState) -> NatIdResult<Verdict> {
        let verdict = self.uow.reattach(state).await?;
        if matches!(verdict, Verdict::Consistent | Verdict::Declared) {
            self.queue_update(state);
        }
        Ok(verdict)
    }

    pub async fn lock(&mut self, state: &EntityState) -> NatIdResult<bool> {
        self.uow.lock(state).await
    }

    pub async fn delete(&mut self, entity_type: &EntityType, id: SurrogateId) -> NatIdResult<()> {
        self.uow.delete(entity_type, id).await?;
        self.inserts.retain(|s| s.id != id);
        self.updates.remove(&(entity_type.clone(), id));
        self.deletes.push((entity_type.clone(), id));
        Ok(())
    }

    /// Detach one entity and forget its queued row update.
    pub fn evict(&mut self, entity_type: &EntityType, id: SurrogateId) {
        self.uow.evict(entity_type, id);
        self.updates.remove(&(entity_type.clone(), id));
    }

    pub fn clear(&mut self) {
        self.uow.clear();
        self.inserts.clear();
        self.updates.clear();
        self.deletes.clear();
    }

    /// Commit the resolution state, then write the rows.
    pub async fn commit(
        self,
    ) -> Result<Committed, Rejected<InMemoryRegion, InMemoryPersister>> {
        let Self {
            uow,
            persister,
            inserts,
            updates,
            deletes,
        } = self;
        let committed = uow.commit().await?;

        for (entity_type, id) in &deletes {
            persister
                .delete(entity_type, *id)
                .expect("store delete should succeed");
        }
        for state in updates.values() {
            persister.update(state).expect("store update should succeed");
        }
        for state in &inserts {
            persister.insert(state).expect("store insert should succeed");
        }
        Ok(committed)
    }

    pub fn rollback(self) -> RolledBack {
        self.uow.rollback()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for NATID types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random surrogate id.
    pub fn arb_surrogate_id() -> impl Strategy<Value = SurrogateId> {
        any::<[u8; 16]>().prop_map(|bytes| SurrogateId::from_uuid(Uuid::from_bytes(bytes)))
    }

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        "[A-Z][a-zA-Z]{0,12}".prop_map(EntityType::new)
    }

    /// Generate any attribute value, null included.
    pub fn arb_attribute_value() -> impl Strategy<Value = AttributeValue> {
        prop_oneof![
            Just(AttributeValue::Null),
            any::<bool>().prop_map(AttributeValue::Bool),
            any::<i64>().prop_map(AttributeValue::Integer),
            ".{0,16}".prop_map(AttributeValue::Text),
            any::<[u8; 16]>().prop_map(|b| AttributeValue::Uuid(Uuid::from_bytes(b))),
        ]
    }

    /// Generate a natural key with one to four attributes.
    pub fn arb_natural_key() -> impl Strategy<Value = NaturalKey> {
        (
            arb_entity_type(),
            prop::collection::btree_map("[a-z]{1,8}", arb_attribute_value(), 1..4),
        )
            .prop_map(|(entity_type, attributes)| {
                attributes
                    .into_iter()
                    .fold(NaturalKey::builder(entity_type), |builder, (name, value)| {
                        builder.using(name, value)
                    })
                    .build()
            })
    }

    /// Generate a `User{name, org}` key with non-null values.
    pub fn arb_user_key() -> impl Strategy<Value = NaturalKey> {
        ("[a-z]{1,8}", "[a-z]{1,8}").prop_map(|(name, org)| fixtures::user_key(&name, &org))
    }
}
