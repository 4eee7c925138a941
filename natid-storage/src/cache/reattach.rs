//! Reattachment validation.
//!
//! Compares a detached entity's current natural key with the key last
//! persisted for its surrogate id. It never intercepts writes: divergence is
//! found by comparing snapshots when the entity comes back.

use natid_core::{ConflictKind, EntityState, NatIdResult, NaturalKey};
use tracing::debug;

use crate::persister::EntityPersister;

/// Outcome of validating a reattached entity.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Current key matches the persisted key.
    Consistent,
    /// Key diverges, but the change was declared (staged or after a refresh).
    Declared,
    /// Key diverges without declaration, or the declared change collides.
    Conflict(ConflictKind),
    /// Nothing is persisted for this surrogate id.
    Unknown,
}

impl Verdict {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Verdict::Conflict(_))
    }
}

/// Snapshot comparison against the store.
pub struct ReattachmentValidator<'a, P: EntityPersister + ?Sized> {
    persister: &'a P,
}

impl<'a, P: EntityPersister + ?Sized> ReattachmentValidator<'a, P> {
    pub fn new(persister: &'a P) -> Self {
        Self { persister }
    }

    /// Last-known-persisted key of `state`'s surrogate id.
    pub async fn persisted_key(&self, state: &EntityState) -> NatIdResult<Option<NaturalKey>> {
        self.persister
            .persisted_natural_key(&state.entity_type, state.id)
            .await
    }

    /// Validate `current` (the key projected from `state`).
    ///
    /// `declared` is true when the transition was staged through the tracker
    /// or the entity was explicitly locked/refreshed first.
    pub async fn validate(
        &self,
        state: &EntityState,
        current: &NaturalKey,
        declared: bool,
    ) -> NatIdResult<Verdict> {
        let Some(persisted) = self.persisted_key(state).await? else {
            return Ok(Verdict::Unknown);
        };
        if &persisted == current {
            return Ok(Verdict::Consistent);
        }
        if declared {
            return Ok(Verdict::Declared);
        }
        debug!(
            entity_type = %state.entity_type,
            id = %state.id,
            persisted = %persisted,
            current = %current,
            "Undeclared natural key change on reattach"
        );
        Ok(Verdict::Conflict(ConflictKind::StaleNaturalKey {
            entity_type: state.entity_type.clone(),
            id: state.id,
            persisted,
            current: current.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persister::{EntityMapping, InMemoryPersister, NaturalKeyAttribute};
    use natid_core::SurrogateId;

    fn persister_with(state: &EntityState) -> InMemoryPersister {
        let p = InMemoryPersister::new();
        p.register(
            EntityMapping::new("User")
                .with_attribute(NaturalKeyAttribute::new("name"))
                .with_attribute(NaturalKeyAttribute::new("org")),
        )
        .unwrap();
        p.insert(state).unwrap();
        p
    }

    fn key_of(state: &EntityState) -> NaturalKey {
        state.natural_key(["name", "org"])
    }

    fn gavin() -> EntityState {
        EntityState::new("User", SurrogateId::now_v7())
            .with("name", "gavin")
            .with("org", "hb")
    }

    #[tokio::test]
    async fn test_consistent() {
        let state = gavin();
        let p = persister_with(&state);
        let verdict = ReattachmentValidator::new(&p)
            .validate(&state, &key_of(&state), false)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Consistent);
    }

    #[tokio::test]
    async fn test_undeclared_divergence_is_stale() {
        let mut state = gavin();
        let p = persister_with(&state);
        state.set("org", "ceylon");

        let verdict = ReattachmentValidator::new(&p)
            .validate(&state, &key_of(&state), false)
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Conflict(ConflictKind::StaleNaturalKey { ref persisted, .. })
            if persisted.get("org") == Some(&"hb".into())));
    }

    #[tokio::test]
    async fn test_declared_divergence() {
        let mut state = gavin();
        let p = persister_with(&state);
        state.set("org", "ceylon");

        let verdict = ReattachmentValidator::new(&p)
            .validate(&state, &key_of(&state), true)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Declared);
    }

    #[tokio::test]
    async fn test_unknown_entity() {
        let state = gavin();
        let p = persister_with(&state);
        let ghost = EntityState::new("User", SurrogateId::now_v7()).with("name", "ghost");

        let verdict = ReattachmentValidator::new(&p)
            .validate(&ghost, &key_of(&ghost), false)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Unknown);
    }
}
