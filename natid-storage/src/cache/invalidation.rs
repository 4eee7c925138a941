//! Invalidation stamps for read promotions.
//!
//! Every write the shared tier applies stamps the region keys, surrogate ids
//! and entity types it touched with a fresh epoch. A unit of work opens a
//! reader at the current epoch when it begins. A mapping it only read may be
//! promoted on commit only if nothing it names was stamped after that.
//!
//! Stamps older than the oldest open reader can never block a promotion and
//! are pruned when readers close. With no reader open nothing is recorded.

use std::collections::{BTreeMap, HashMap};

use natid_core::{EntityType, SurrogateId};

use super::region_key::RegionKey;

#[derive(Debug, Default)]
pub struct InvalidationLog {
    epoch: u64,
    keys: HashMap<RegionKey, u64>,
    ids: HashMap<(EntityType, SurrogateId), u64>,
    types: HashMap<EntityType, u64>,
    readers: BTreeMap<u64, usize>,
}

impl InvalidationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn open_readers(&self) -> usize {
        self.readers.values().sum()
    }

    /// Register a reader starting now and return its epoch.
    pub fn open_reader(&mut self) -> u64 {
        *self.readers.entry(self.epoch).or_insert(0) += 1;
        self.epoch
    }

    pub fn close_reader(&mut self, since: u64) {
        if let Some(count) = self.readers.get_mut(&since) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&since);
            }
        }
        self.prune();
    }

    /// Start the epoch of one write.
    pub fn advance(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn stamp_key(&mut self, rk: &RegionKey, epoch: u64) {
        if !self.readers.is_empty() {
            self.keys.insert(rk.clone(), epoch);
        }
    }

    pub fn stamp_id(&mut self, entity_type: &EntityType, id: SurrogateId, epoch: u64) {
        if !self.readers.is_empty() {
            self.ids.insert((entity_type.clone(), id), epoch);
        }
    }

    pub fn stamp_type(&mut self, entity_type: &EntityType, epoch: u64) {
        if !self.readers.is_empty() {
            self.types.insert(entity_type.clone(), epoch);
        }
    }

    /// Whether the key, the id or the whole type was written after `since`.
    pub fn invalidated_since(&self, rk: &RegionKey, id: SurrogateId, since: u64) -> bool {
        let after = |stamp: Option<&u64>| stamp.is_some_and(|s| *s > since);
        after(self.keys.get(rk))
            || after(self.ids.get(&(rk.entity_type().clone(), id)))
            || after(self.types.get(rk.entity_type()))
    }

    fn prune(&mut self) {
        let Some(horizon) = self.readers.keys().next().copied() else {
            self.keys.clear();
            self.ids.clear();
            self.types.clear();
            return;
        };
        self.keys.retain(|_, s| *s > horizon);
        self.ids.retain(|_, s| *s > horizon);
        self.types.retain(|_, s| *s > horizon);
    }

    #[cfg(test)]
    fn stamp_count(&self) -> usize {
        self.keys.len() + self.ids.len() + self.types.len()
    }
}
