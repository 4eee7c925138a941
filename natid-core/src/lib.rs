//! NATID Core - Natural-Key Types
//!
//! Pure data structures shared by every NATID crate: identities, natural
//! keys, resolution entries, errors and configuration. No caching logic
//! lives here.

pub mod config;
pub mod entry;
pub mod error;
pub mod identity;
pub mod key;

pub use config::{ResolutionConfig, ResolveOptions, DEFAULT_LOCK_STRIPES};
pub use entry::{MutationRecord, ResolutionEntry, ResolutionOrigin};
pub use error::{
    ConfigError, ConflictKind, NatIdError, NatIdResult, StoreError, ValidationError,
};
pub use identity::{
    compute_fingerprint, EntityType, KeyFingerprint, SurrogateId, Timestamp, UnitOfWorkId,
};
pub use key::{AttributeValue, EntityState, NaturalKey, NaturalKeyBuilder};

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
