//! Per-type cache tiers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;

use ledger_core::{EntityBox, EntityTypeDescription};
use lru::LruCache;
use serde::Serialize;

/// Which tier serves an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// In-memory only, never persisted
    PureCache,
    /// Bounded LRU of values plus an optional id-existence set
    Lru,
    /// Every live row of the type
    FullTable,
}

/// Hit/miss/eviction counters of one tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl TierStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Pure-cache entities: id -> box, bounded by a byte budget.
#[derive(Debug)]
pub(crate) struct PureTier {
    pub entries: HashMap<String, EntityBox>,
    pub budget_bytes: usize,
    pub row_bytes: usize,
    pub stats: TierStats,
}

impl PureTier {
    pub fn new(ty: &dyn EntityTypeDescription, budget_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            budget_bytes,
            row_bytes: ty.estimated_row_size().max(1),
            stats: TierStats::default(),
        }
    }

    fn capacity(&self) -> usize {
        (self.budget_bytes / self.row_bytes).max(1)
    }

    /// Upsert or remove; returns whether a new id appeared.
    pub fn apply(&mut self, entity: EntityBox) -> bool {
        if entity.is_deleted() {
            self.entries.remove(&entity.id);
            return false;
        }
        self.entries.insert(entity.id.clone(), entity).is_none()
    }

    /// Evict the oldest revisions until the tier fits its budget. Returns
    /// the number of entries evicted.
    pub fn enforce_budget(&mut self) -> usize {
        let capacity = self.capacity();
        if self.entries.len() <= capacity {
            return 0;
        }
        let excess = self.entries.len() - capacity;
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|(id, b)| (b.block_number(), id.clone()))
            .collect();
        by_age.sort_unstable();
        for (_, id) in by_age.into_iter().take(excess) {
            self.entries.remove(&id);
        }
        self.stats.evictions += excess as u64;
        excess
    }

    /// Keep only entries produced at or before `block_number`.
    pub fn truncate(&mut self, block_number: i64) {
        if block_number < 0 {
            self.entries.clear();
            return;
        }
        let bound = block_number as u64;
        self.entries.retain(|_, b| b.block_number() <= bound);
    }
}

/// LRU value cache with an optional full id-existence set.
#[derive(Debug)]
pub(crate) struct LruTier {
    pub values: LruCache<String, EntityBox>,
    /// Loaded lazily on first read when enabled
    pub ids: Option<HashSet<String>>,
    pub stats: TierStats,
}

impl LruTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            values: LruCache::new(capacity),
            ids: None,
            stats: TierStats::default(),
        }
    }

    /// Cache a value read from the store.
    pub fn remember(&mut self, entity: EntityBox) {
        let id = entity.id.clone();
        if let Some((evicted, _)) = self.values.push(id.clone(), entity) {
            if evicted != id {
                self.stats.evictions += 1;
            }
        }
    }

    /// Keep the tier consistent with a revision written through to the store.
    pub fn apply(&mut self, entity: &EntityBox) {
        if entity.is_deleted() {
            self.values.pop(&entity.id);
            if let Some(ids) = self.ids.as_mut() {
                ids.remove(&entity.id);
            }
            return;
        }
        if self.values.contains(&entity.id) {
            self.values.put(entity.id.clone(), entity.clone());
        }
        if let Some(ids) = self.ids.as_mut() {
            ids.insert(entity.id.clone());
        }
    }
}

/// Every live row of a type, kept while it fits its budget.
#[derive(Debug)]
pub(crate) struct FullTableTier {
    pub rows: BTreeMap<String, EntityBox>,
    pub budget_bytes: usize,
    pub row_bytes: usize,
    pub stats: TierStats,
}

impl FullTableTier {
    pub fn new(rows: Vec<EntityBox>, budget_bytes: usize, row_bytes: usize) -> Self {
        Self {
            rows: rows.into_iter().map(|b| (b.id.clone(), b)).collect(),
            budget_bytes,
            row_bytes,
            stats: TierStats::default(),
        }
    }

    pub fn apply(&mut self, entity: &EntityBox) {
        if entity.is_deleted() {
            self.rows.remove(&entity.id);
        } else {
            self.rows.insert(entity.id.clone(), entity.clone());
        }
    }

    pub fn fits(&self) -> bool {
        fits_budget(self.rows.len() as u64, self.row_bytes, self.budget_bytes)
    }
}

/// `rows * row_bytes <= budget`, without overflowing.
pub(crate) fn fits_budget(rows: u64, row_bytes: usize, budget_bytes: usize) -> bool {
    rows.checked_mul(row_bytes as u64)
        .is_some_and(|total| total <= budget_bytes as u64)
}

/// The tier serving one (chain, entity type).
#[derive(Debug)]
pub(crate) enum TypeCache {
    Pure(PureTier),
    Lru(LruTier),
    FullTable(FullTableTier),
}

impl TypeCache {
    pub fn kind(&self) -> TierKind {
        match self {
            TypeCache::Pure(_) => TierKind::PureCache,
            TypeCache::Lru(_) => TierKind::Lru,
            TypeCache::FullTable(_) => TierKind::FullTable,
        }
    }

    pub fn stats(&self) -> TierStats {
        match self {
            TypeCache::Pure(t) => t.stats,
            TypeCache::Lru(t) => t.stats,
            TypeCache::FullTable(t) => t.stats,
        }
    }

    pub fn entries(&self) -> usize {
        match self {
            TypeCache::Pure(t) => t.entries.len(),
            TypeCache::Lru(t) => t.values.len(),
            TypeCache::FullTable(t) => t.rows.len(),
        }
    }

    pub fn budget_bytes(&self) -> Option<usize> {
        match self {
            TypeCache::Pure(t) => Some(t.budget_bytes),
            TypeCache::Lru(_) => None,
            TypeCache::FullTable(t) => Some(t.budget_bytes),
        }
    }

    pub fn id_set_entries(&self) -> Option<usize> {
        match self {
            TypeCache::Lru(t) => t.ids.as_ref().map(HashSet::len),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use ledger_core::{BlockStamp, EntitySchema};

    fn at(id: &str, n: u64) -> EntityBox {
        EntityBox::upsert("Price", id, BlockStamp::new(n, "0x", "1", DateTime::UNIX_EPOCH))
    }

    #[test]
    fn test_lru_counts_only_real_evictions() {
        let mut tier = LruTier::new(2);
        tier.remember(at("a", 1));
        tier.remember(at("a", 2));
        assert_eq!(tier.stats.evictions, 0);
        tier.remember(at("b", 1));
        tier.remember(at("c", 1));
        assert_eq!(tier.stats.evictions, 1);
        assert!(!tier.values.contains("a"));
    }

    #[test]
    fn test_lru_apply_updates_id_set() {
        let mut tier = LruTier::new(2);
        tier.ids = Some(HashSet::new());
        tier.apply(&at("a", 1));
        assert!(tier.ids.as_ref().unwrap().contains("a"));
        // Values are refreshed only when already resident
        assert!(!tier.values.contains("a"));
        tier.apply(&EntityBox::deleted("Price", "a", at("a", 2).gen_block));
        assert!(!tier.ids.as_ref().unwrap().contains("a"));
    }

    #[test]
    fn test_pure_tier_evicts_oldest_blocks() {
        let ty = EntitySchema::new("Price");
        let row = ty.estimated_row_size();
        let mut tier = PureTier::new(&ty, row * 2);
        tier.apply(at("new", 9));
        tier.apply(at("old", 1));
        tier.apply(at("mid", 5));
        assert_eq!(tier.enforce_budget(), 1);
        assert!(!tier.entries.contains_key("old"));
        assert_eq!(tier.stats.evictions, 1);
    }

    #[test]
    fn test_pure_tier_truncate() {
        let ty = EntitySchema::new("Price");
        let mut tier = PureTier::new(&ty, usize::MAX);
        tier.apply(at("a", 1));
        tier.apply(at("b", 5));
        tier.truncate(3);
        assert!(tier.entries.contains_key("a"));
        assert!(!tier.entries.contains_key("b"));
        tier.truncate(-1);
        assert!(tier.entries.is_empty());
    }

    #[test]
    fn test_fits_budget_handles_overflow() {
        assert!(fits_budget(2, 10, 20));
        assert!(!fits_budget(3, 10, 20));
        assert!(!fits_budget(u64::MAX, 2, usize::MAX));
    }

    #[test]
    fn test_hit_rate() {
        let stats = TierStats {
            hits: 3,
            misses: 1,
            evictions: 0,
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(TierStats::default().hit_rate(), 0.0);
    }
}
