//! Resolution entries and staged key transitions.

use crate::{EntityType, NaturalKey, SurrogateId, Timestamp, UnitOfWorkId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a resolution entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionOrigin {
    /// Copied from the shared tier; already committed there.
    Shared,
    /// Committed state read from the store (load, lookup, applied mutation).
    LocalCommitted,
    /// Written by the owning unit of work and not yet committed.
    LocalPending,
}

impl ResolutionOrigin {
    pub fn is_committed(&self) -> bool {
        !matches!(self, ResolutionOrigin::LocalPending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionOrigin::Shared => "Shared",
            ResolutionOrigin::LocalCommitted => "LocalCommitted",
            ResolutionOrigin::LocalPending => "LocalPending",
        }
    }
}

impl fmt::Display for ResolutionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One natural key → surrogate id mapping held by a resolution tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionEntry {
    pub key: NaturalKey,
    pub id: SurrogateId,
    pub origin: ResolutionOrigin,
}

impl ResolutionEntry {
    pub fn new(key: NaturalKey, id: SurrogateId, origin: ResolutionOrigin) -> Self {
        Self { key, id, origin }
    }

    pub fn entity_type(&self) -> &EntityType {
        self.key.entity_type()
    }
}

/// A staged natural-key transition for one entity.
///
/// Lives only as long as its unit of work: applied on commit, discarded on
/// rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub id: SurrogateId,
    pub old_key: NaturalKey,
    pub new_key: NaturalKey,
    pub unit_of_work: UnitOfWorkId,
    pub observed_at: Timestamp,
}

impl MutationRecord {
    pub fn new(
        id: SurrogateId,
        old_key: NaturalKey,
        new_key: NaturalKey,
        unit_of_work: UnitOfWorkId,
    ) -> Self {
        Self {
            id,
            old_key,
            new_key,
            unit_of_work,
            observed_at: Utc::now(),
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        self.new_key.entity_type()
    }
}
