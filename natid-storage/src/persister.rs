//! Entity persister collaborator and its in-memory implementation.
//!
//! The resolution cache never reads or writes entity rows itself. Everything
//! it needs from the store goes through [`EntityPersister`].

use async_trait::async_trait;
use natid_core::{
    EntityState, EntityType, NatIdError, NatIdResult, NaturalKey, StoreError, SurrogateId,
    ValidationError,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

// ============================================================================
// PERSISTER TRAIT
// ============================================================================

/// Store-facing operations consumed by the resolution cache.
#[async_trait]
pub trait EntityPersister: Send + Sync {
    /// Nullability of each natural-key attribute of `entity_type`.
    ///
    /// The key set of the returned map is the natural-key attribute set.
    fn nullability(&self, entity_type: &EntityType) -> NatIdResult<BTreeMap<String, bool>>;

    /// Load full entity state by surrogate id.
    async fn load_by_surrogate_id(
        &self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> NatIdResult<Option<EntityState>>;

    /// Natural key as currently persisted for `id`.
    async fn persisted_natural_key(
        &self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> NatIdResult<Option<NaturalKey>>;

    /// Store lookup by natural key. This is the only blocking call on the
    /// resolution path.
    async fn find_by_natural_key(&self, key: &NaturalKey) -> NatIdResult<Option<SurrogateId>>;
}

// ============================================================================
// MAPPING METADATA
// ============================================================================

/// One natural-key attribute of a mapped entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKeyAttribute {
    pub name: String,
    /// `None` when the mapping does not declare it.
    pub nullable: Option<bool>,
}

impl NaturalKeyAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: None,
        }
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    /// Undeclared natural-key attributes are non-nullable.
    pub fn is_nullable(&self) -> bool {
        self.nullable.unwrap_or(false)
    }
}

/// Natural-key mapping of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMapping {
    pub entity_type: EntityType,
    pub natural_key: Vec<NaturalKeyAttribute>,
}

impl EntityMapping {
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            natural_key: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: NaturalKeyAttribute) -> Self {
        self.natural_key.push(attribute);
        self
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.natural_key.iter().map(|a| a.name.as_str())
    }

    pub fn key_of(&self, state: &EntityState) -> NaturalKey {
        state.natural_key(self.attribute_names())
    }
}

// ============================================================================
// IN-MEMORY PERSISTER
// ============================================================================

/// In-memory persister for testing.
///
/// Enforces a unique constraint on natural keys per entity type, like the
/// store's unique index would.
#[derive(Debug, Default)]
pub struct InMemoryPersister {
    mappings: RwLock<HashMap<EntityType, EntityMapping>>,
    rows: RwLock<HashMap<(EntityType, SurrogateId), EntityState>>,
    key_lookups: AtomicU64,
}

fn poisoned<T>(_: T) -> NatIdError {
    NatIdError::Store(StoreError::LockPoisoned)
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the mapping of an entity type.
    pub fn register(&self, mapping: EntityMapping) -> NatIdResult<()> {
        let mut mappings = self.mappings.write().map_err(poisoned)?;
        mappings.insert(mapping.entity_type.clone(), mapping);
        Ok(())
    }

    fn mapping(&self, entity_type: &EntityType) -> NatIdResult<EntityMapping> {
        let mappings = self.mappings.read().map_err(poisoned)?;
        mappings.get(entity_type).cloned().ok_or_else(|| {
            NatIdError::Validation(ValidationError::UnknownEntityType {
                entity_type: entity_type.clone(),
            })
        })
    }

    fn key_taken_by_other(
        rows: &HashMap<(EntityType, SurrogateId), EntityState>,
        mapping: &EntityMapping,
        state: &EntityState,
    ) -> Option<SurrogateId> {
        let key = mapping.key_of(state);
        rows.values()
            .filter(|row| row.entity_type == state.entity_type && row.id != state.id)
            .find(|row| mapping.key_of(row) == key)
            .map(|row| row.id)
    }

    /// Insert a new row.
    pub fn insert(&self, state: &EntityState) -> NatIdResult<()> {
        let mapping = self.mapping(&state.entity_type)?;
        let mut rows = self.rows.write().map_err(poisoned)?;
        let row_key = (state.entity_type.clone(), state.id);
        if rows.contains_key(&row_key) {
            return Err(NatIdError::Store(StoreError::Corrupted {
                component: "persister".to_string(),
                reason: format!("{} {} already exists", state.entity_type, state.id),
            }));
        }
        if let Some(owner) = Self::key_taken_by_other(&rows, &mapping, state) {
            return Err(NatIdError::Store(StoreError::Corrupted {
                component: "persister".to_string(),
                reason: format!("unique natural key violated, owned by {}", owner),
            }));
        }
        rows.insert(row_key, state.clone());
        Ok(())
    }

    /// Overwrite an existing row. Returns false if the row does not exist.
    pub fn update(&self, state: &EntityState) -> NatIdResult<bool> {
        let mapping = self.mapping(&state.entity_type)?;
        let mut rows = self.rows.write().map_err(poisoned)?;
        if let Some(owner) = Self::key_taken_by_other(&rows, &mapping, state) {
            return Err(NatIdError::Store(StoreError::Corrupted {
                component: "persister".to_string(),
                reason: format!("unique natural key violated, owned by {}", owner),
            }));
        }
        match rows.get_mut(&(state.entity_type.clone(), state.id)) {
            Some(row) => {
                *row = state.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete(&self, entity_type: &EntityType, id: SurrogateId) -> NatIdResult<bool> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        Ok(rows.remove(&(entity_type.clone(), id)).is_some())
    }

    /// Delete every row of `entity_type`, returning the count.
    pub fn delete_all(&self, entity_type: &EntityType) -> NatIdResult<u64> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let before = rows.len();
        rows.retain(|(ty, _), _| ty != entity_type);
        Ok((before - rows.len()) as u64)
    }

    pub fn count(&self, entity_type: &EntityType) -> usize {
        self.rows
            .read()
            .map(|rows| rows.keys().filter(|(ty, _)| ty == entity_type).count())
            .unwrap_or(0)
    }

    /// Number of `find_by_natural_key` calls served so far.
    pub fn key_lookups(&self) -> u64 {
        self.key_lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EntityPersister for InMemoryPersister {
    fn nullability(&self, entity_type: &EntityType) -> NatIdResult<BTreeMap<String, bool>> {
        let mapping = self.mapping(entity_type)?;
        Ok(mapping
            .natural_key
            .iter()
            .map(|a| (a.name.clone(), a.is_nullable()))
            .collect())
    }

    async fn load_by_surrogate_id(
        &self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> NatIdResult<Option<EntityState>> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(&(entity_type.clone(), id)).cloned())
    }

    async fn persisted_natural_key(
        &self,
        entity_type: &EntityType,
        id: SurrogateId,
    ) -> NatIdResult<Option<NaturalKey>> {
        let mapping = self.mapping(entity_type)?;
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .get(&(entity_type.clone(), id))
            .map(|row| mapping.key_of(row)))
    }

    async fn find_by_natural_key(&self, key: &NaturalKey) -> NatIdResult<Option<SurrogateId>> {
        self.key_lookups.fetch_add(1, Ordering::Relaxed);
        let mapping = self.mapping(key.entity_type())?;
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .values()
            .filter(|row| &row.entity_type == key.entity_type())
            .find(|row| &mapping.key_of(row) == key)
            .map(|row| row.id))
    }
}
