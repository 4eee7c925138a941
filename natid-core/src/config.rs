//! Configuration types

use crate::{ConfigError, EntityType, NatIdError, NatIdResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default number of lock stripes guarding the shared tier.
pub const DEFAULT_LOCK_STRIPES: usize = 64;

/// Resolution cache configuration.
///
/// Natural-key caching is opt-in per entity type: a type missing from
/// `natural_key_cacheable_by_type` (or mapped to `false`) never touches the
/// shared tier, whatever `second_level_cache_enabled` says.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub second_level_cache_enabled: bool,
    /// Gates the per-call `cacheable` resolve option.
    ///
    /// Only resolution reads are gated. Collision checks in `persist` and
    /// entity flushes still read the shared tier for cacheable types, and
    /// commits still write to it.
    pub query_cache_enabled: bool,
    pub statistics_enabled: bool,
    pub natural_key_cacheable_by_type: HashMap<String, bool>,
    /// Number of per-key lock stripes in the shared tier.
    pub lock_stripes: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            second_level_cache_enabled: false,
            query_cache_enabled: false,
            statistics_enabled: false,
            natural_key_cacheable_by_type: HashMap::new(),
            lock_stripes: DEFAULT_LOCK_STRIPES,
        }
    }
}

impl ResolutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> NatIdResult<Self> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_second_level_cache(mut self, enabled: bool) -> Self {
        self.second_level_cache_enabled = enabled;
        self
    }

    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// Declare whether `entity_type`'s natural key may be cached in the shared tier.
    pub fn with_cacheable_natural_key(mut self, entity_type: impl Into<String>, cacheable: bool) -> Self {
        self.natural_key_cacheable_by_type
            .insert(entity_type.into(), cacheable);
        self
    }

    pub fn with_lock_stripes(mut self, stripes: usize) -> Self {
        self.lock_stripes = stripes;
        self
    }

    /// Whether `entity_type` may interact with the shared tier at all.
    pub fn is_natural_key_cacheable(&self, entity_type: &EntityType) -> bool {
        self.second_level_cache_enabled
            && self
                .natural_key_cacheable_by_type
                .get(entity_type.as_str())
                .copied()
                .unwrap_or(false)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> NatIdResult<()> {
        if self.lock_stripes == 0 {
            return Err(NatIdError::Config(ConfigError::InvalidValue {
                field: "lock_stripes".to_string(),
                value: self.lock_stripes.to_string(),
                reason: "lock_stripes must be greater than 0".to_string(),
            }));
        }

        if let Some(name) = self
            .natural_key_cacheable_by_type
            .keys()
            .find(|name| name.trim().is_empty())
        {
            return Err(NatIdError::Config(ConfigError::InvalidValue {
                field: "natural_key_cacheable_by_type".to_string(),
                value: format!("{:?}", name),
                reason: "entity type names must not be blank".to_string(),
            }));
        }

        Ok(())
    }
}

/// Per-call resolution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// Consult the shared tier on a local miss.
    pub cacheable: bool,
}

impl ResolveOptions {
    pub fn cacheable() -> Self {
        Self { cacheable: true }
    }

    pub fn uncached() -> Self {
        Self { cacheable: false }
    }
}
