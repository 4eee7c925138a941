//! Two-tier natural-key resolution cache.
//!
//! # Tiers
//!
//! - [`LocalResolutionCache`]: owned by one unit of work, sees its own
//!   uncommitted writes, dropped when the unit of work ends.
//! - [`SharedResolutionCache`]: process-wide, only ever holds committed
//!   mappings, backed by a pluggable [`SharedRegion`].
//!
//! # Consistency
//!
//! Key transitions are staged by the [`MutationTracker`] and reach Shared
//! as one [`CommitBatch`], applied under every involved stripe lock. A
//! detached entity coming back is checked by the [`ReattachmentValidator`]
//! against the persisted key; undeclared divergence is a conflict.
//!
//! Mappings a unit of work only read are promoted on commit as
//! [`BatchOp::Promote`], which Shared drops if the key or entity was written
//! after the unit of work began.
//!
//! # Type Scoping
//!
//! [`RegionKey`] cannot be built without an entity type, so two types with
//! equal attribute values never share a region slot.

pub mod invalidation;
pub mod lmdb_region;
pub mod local;
pub mod memory_region;
pub mod mutation;
pub mod reattach;
pub mod region_key;
pub mod shared;
pub mod traits;

pub use invalidation::InvalidationLog;
pub use lmdb_region::{LmdbRegion, LmdbRegionError};
pub use local::LocalResolutionCache;
pub use memory_region::InMemoryRegion;
pub use mutation::{MutationTracker, Observation};
pub use reattach::{ReattachmentValidator, Verdict};
pub use region_key::RegionKey;
pub use shared::{BatchOp, CommitBatch, KeyExpectation, SharedResolutionCache};
pub use traits::{RegionStats, SharedRegion};
