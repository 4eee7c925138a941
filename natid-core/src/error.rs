//! Error types for NATID operations

use crate::{EntityType, NaturalKey, SurrogateId};
use thiserror::Error;

/// Consistency violations between natural keys and surrogate ids.
///
/// Every variant means the current unit of work can no longer commit: the
/// caller must roll back and, if desired, retry after corrective action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConflictKind {
    #[error("Duplicate mapping for {key}: already mapped to {existing}, rejected {attempted}")]
    DuplicateKeyMapping {
        key: NaturalKey,
        existing: SurrogateId,
        attempted: SurrogateId,
    },

    #[error("Natural key {key} is owned by {owner}, cannot be claimed by {claimant}")]
    NaturalKeyConflict {
        key: NaturalKey,
        owner: SurrogateId,
        claimant: SurrogateId,
    },

    #[error("Stale natural key for {entity_type} {id}: persisted {persisted}, found {current}")]
    StaleNaturalKey {
        entity_type: EntityType,
        id: SurrogateId,
        persisted: NaturalKey,
        current: NaturalKey,
    },
}

impl ConflictKind {
    /// Surrogate id of the entity whose operation was rejected.
    pub fn subject(&self) -> SurrogateId {
        match self {
            ConflictKind::DuplicateKeyMapping { attempted, .. } => *attempted,
            ConflictKind::NaturalKeyConflict { claimant, .. } => *claimant,
            ConflictKind::StaleNaturalKey { id, .. } => *id,
        }
    }
}

/// Natural-key shape errors, raised before any cache interaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Natural key attribute {entity_type}.{attribute} is not nullable")]
    NullabilityViolation {
        entity_type: EntityType,
        attribute: String,
    },

    #[error("Natural key attribute {entity_type}.{attribute} is missing")]
    MissingAttribute {
        entity_type: EntityType,
        attribute: String,
    },

    #[error("{entity_type}.{attribute} is not part of the natural key")]
    UnknownAttribute {
        entity_type: EntityType,
        attribute: String,
    },

    #[error("Entity type {entity_type} is not mapped with a natural key")]
    UnknownEntityType { entity_type: EntityType },
}

/// Failures of the external store or the shared cache region.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{component} unavailable: {reason}")]
    Unavailable { component: String, reason: String },

    #[error("Corrupted entry in {component}: {reason}")]
    Corrupted { component: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all NATID errors.
#[derive(Debug, Clone, Error)]
pub enum NatIdError {
    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictKind),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl NatIdError {
    /// Conflict carried by this error, if any.
    pub fn conflict(&self) -> Option<&ConflictKind> {
        match self {
            NatIdError::Conflict(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Result type alias for NATID operations.
pub type NatIdResult<T> = Result<T, NatIdError>;

// =============================================================================
// TESTS
// =============================================================================
