//! LMDB-backed shared region.
//!
//! Uses the heed crate (Rust bindings for LMDB) so the shared tier survives
//! process restarts and can be mapped by several processes on one host.
//!
//! # Layout
//!
//! One unnamed database. Keys are [`RegionKey::encode`] output, values are
//! the 16 raw bytes of the surrogate id.
//!
//! # Thread Safety
//!
//! - Read transactions for `get`
//! - Write transactions for `put`, `evict` and `clear_region`
//! - Statistics are kept behind a `RwLock`

use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use natid_core::{EntityType, NatIdError, NatIdResult, StoreError, SurrogateId};
use uuid::Uuid;

use super::region_key::RegionKey;
use super::traits::{RegionStats, SharedRegion};

const COMPONENT: &str = "lmdb region";

/// Error type for LMDB region operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbRegionError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A stored value is not a 16-byte surrogate id.
    #[error("Corrupted value: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbRegionError> for NatIdError {
    fn from(e: LmdbRegionError) -> Self {
        match e {
            LmdbRegionError::Corrupted(reason) => NatIdError::Store(StoreError::Corrupted {
                component: COMPONENT.to_string(),
                reason,
            }),
            other => NatIdError::Store(StoreError::Unavailable {
                component: COMPONENT.to_string(),
                reason: other.to_string(),
            }),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbRegionError {
    LmdbRegionError::Transaction(e.to_string())
}

/// Shared region stored in an LMDB environment.
pub struct LmdbRegion {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: RwLock<RegionStats>,
}

impl LmdbRegion {
    /// Open (or create) a region under `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the memory map in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbRegionError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per region and the files are
        // not truncated or remapped by anything else while it is open.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbRegionError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbRegionError::DbOpen(e.to_string()))?;
        let entry_count = db.len(&wtxn).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            stats: RwLock::new(RegionStats {
                entry_count,
                ..Default::default()
            }),
        })
    }

    fn with_stats(&self, f: impl FnOnce(&mut RegionStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    fn decode_id(bytes: &[u8]) -> Result<SurrogateId, LmdbRegionError> {
        Uuid::from_slice(bytes)
            .map(SurrogateId::from_uuid)
            .map_err(|e| LmdbRegionError::Corrupted(e.to_string()))
    }

    /// Collect the stored keys that decode to a key of `entity_type`.
    ///
    /// Bytes that merely share the type prefix are left alone.
    fn collect_region_keys(
        &self,
        entity_type: &EntityType,
    ) -> Result<Vec<Vec<u8>>, LmdbRegionError> {
        let prefix = RegionKey::type_prefix(entity_type);
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for result in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = result.map_err(txn_err)?;
            if !key.starts_with(&prefix) {
                continue;
            }
            if RegionKey::decode(key).is_some_and(|rk| rk.entity_type() == entity_type) {
                keys.push(key.to_vec());
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl SharedRegion for LmdbRegion {
    async fn get(&self, key: &RegionKey) -> NatIdResult<Option<SurrogateId>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let found = self.db.get(&rtxn, &key.encode()).map_err(txn_err)?;
        match found {
            Some(bytes) => {
                self.with_stats(|s| s.hits += 1);
                Ok(Some(Self::decode_id(bytes)?))
            }
            None => {
                self.with_stats(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &RegionKey, id: SurrogateId) -> NatIdResult<()> {
        let encoded = key.encode();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let is_new = self.db.get(&wtxn, &encoded).map_err(txn_err)?.is_none();
        self.db
            .put(&mut wtxn, &encoded, id.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        if is_new {
            self.with_stats(|s| s.entry_count += 1);
        }
        Ok(())
    }

    async fn evict(&self, key: &RegionKey) -> NatIdResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, &key.encode()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        if deleted {
            self.with_stats(|s| {
                s.entry_count = s.entry_count.saturating_sub(1);
                s.evictions += 1;
            });
        }
        Ok(deleted)
    }

    async fn clear_region(&self, entity_type: &EntityType) -> NatIdResult<u64> {
        let keys = self.collect_region_keys(entity_type)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        self.with_stats(|s| {
            s.entry_count = s.entry_count.saturating_sub(deleted);
            s.evictions += deleted;
        });
        Ok(deleted)
    }

    async fn stats(&self) -> NatIdResult<RegionStats> {
        Ok(self.stats.read().map(|s| s.clone()).unwrap_or_default())
    }
}
