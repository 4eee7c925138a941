//! NATID Storage - Natural-Key Resolution Cache
//!
//! Local and shared resolution tiers, mutation tracking, reattachment
//! validation and the coordinator that drives them per unit of work.
//! Entity rows stay behind the [`EntityPersister`] collaborator.

pub mod cache;
pub mod coordinator;
pub mod persister;
pub mod stats;

pub use cache::{
    BatchOp, CommitBatch, InMemoryRegion, LmdbRegion, LmdbRegionError, LocalResolutionCache,
    MutationTracker, Observation, ReattachmentValidator, RegionKey, RegionStats, SharedRegion,
    SharedResolutionCache, Verdict,
};
pub use coordinator::{Committed, Rejected, ResolutionCoordinator, RolledBack, UnitOfWork};
pub use persister::{EntityMapping, EntityPersister, InMemoryPersister, NaturalKeyAttribute};
pub use stats::{ResolutionStatistics, StatisticsSnapshot};

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
