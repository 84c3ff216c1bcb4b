//! Tiered cache in front of a [`Store`].
//!
//! Each (chain, entity type) is served by exactly one tier, chosen on first
//! use from the type flags and the configured budgets:
//!
//! - pure-cache types live only in memory and never touch the store;
//! - sparse types are loaded whole into a full-table tier while
//!   `rows * estimated_row_size` fits the budget, and are refused for the rest
//!   of the process once they outgrow it;
//! - everything else gets an LRU of values plus an id-existence set.
//!
//! All tiers sit behind one mutex, so several controllers may share a
//! `CachedStore`.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use ledger_core::{
    compile_filters, matches_all, CacheConfig, EntityBox, EntityFilter, EntityTypeDescription,
    EntityTypeRef, LedgerResult, StoreError,
};
use tracing::{debug, info, warn};

use super::source::{CacheRead, CacheSource};
use super::tier::{fits_budget, FullTableTier, LruTier, PureTier, TierKind, TypeCache};
use crate::diagnostics::TierSnapshot;
use crate::store::Store;

/// (chain, entity type)
type TierKey = (String, String);

#[derive(Debug, Default)]
struct Tiers {
    caches: HashMap<TierKey, TypeCache>,
    /// Sparse types that outgrew the full-table budget
    refused: HashSet<String>,
}

/// A [`Store`] wrapped with per-type cache tiers.
#[derive(Debug)]
pub struct CachedStore<S: Store> {
    store: Arc<S>,
    config: CacheConfig,
    tiers: Mutex<Tiers>,
}

impl<S: Store> CachedStore<S> {
    /// Wrap `store`, rejecting a cache config that could not build its tiers.
    pub fn new(store: Arc<S>, config: CacheConfig) -> LedgerResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            tiers: Mutex::new(Tiers::default()),
        })
    }

    /// The wrapped backend.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Tiers>> {
        self.tiers
            .lock()
            .map_err(|_| StoreError::LockPoisoned.into())
    }

    /// Tier serving `ty` on `chain`, built on first use.
    fn tier<'t>(
        &self,
        tiers: &'t mut Tiers,
        ty: &dyn EntityTypeDescription,
        chain: &str,
    ) -> LedgerResult<&'t mut TypeCache> {
        let Tiers { caches, refused } = tiers;
        match caches.entry((chain.to_string(), ty.name().to_string())) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(v) => {
                let cache = self.build_tier(refused, ty, chain)?;
                Ok(v.insert(cache))
            }
        }
    }

    fn build_tier(
        &self,
        refused: &mut HashSet<String>,
        ty: &dyn EntityTypeDescription,
        chain: &str,
    ) -> LedgerResult<TypeCache> {
        if ty.is_cache() {
            let budget = ty
                .cache_size_budget()
                .unwrap_or(self.config.pure_cache_default_budget_bytes);
            debug!(entity = ty.name(), chain, budget_bytes = budget, "Selected pure cache tier");
            return Ok(TypeCache::Pure(PureTier::new(ty, budget)));
        }

        if ty.is_sparse() && !refused.contains(ty.name()) {
            let budget = self.config.full_table_budget_bytes;
            let row_bytes = ty.estimated_row_size().max(1);
            let rows = self.store.count_entity(ty, chain)?;
            if fits_budget(rows, row_bytes, budget) {
                let table = self.store.list_entities(ty, chain, &[], None)?;
                debug!(
                    entity = ty.name(),
                    chain,
                    rows = table.len(),
                    "Selected full-table cache tier"
                );
                return Ok(TypeCache::FullTable(FullTableTier::new(table, budget, row_bytes)));
            }
            refused.insert(ty.name().to_string());
            warn!(
                entity = ty.name(),
                chain,
                rows,
                row_bytes,
                budget_bytes = budget,
                "Full-table cache refused, falling back to LRU"
            );
        }

        debug!(entity = ty.name(), chain, capacity = self.config.lru_capacity, "Selected LRU cache tier");
        Ok(TypeCache::Lru(LruTier::new(self.config.lru_capacity)))
    }

    /// Which tier currently serves a type, if one has been built.
    pub fn tier_kind(&self, entity: &str, chain: &str) -> LedgerResult<Option<TierKind>> {
        let tiers = self.lock()?;
        Ok(tiers
            .caches
            .get(&(chain.to_string(), entity.to_string()))
            .map(TypeCache::kind))
    }

    // === Passthroughs ===

    pub fn init_schema(&self, types: Vec<EntityTypeRef>) -> LedgerResult<()> {
        self.store.init_schema(types)
    }

    pub fn get_entity_type(&self, name: &str) -> Option<EntityTypeRef> {
        self.store.get_entity_type(name)
    }

    pub fn growth_aggregation(&self, chain: &str, block_time: DateTime<Utc>) -> LedgerResult<()> {
        self.store.growth_aggregation(chain, block_time)
    }

    // === Reads ===

    /// Latest committed revision of one entity.
    pub fn get_entity(
        &self,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        id: &str,
    ) -> LedgerResult<CacheRead<Option<EntityBox>>> {
        let mut tiers = self.lock()?;
        let read = match self.tier(&mut tiers, ty, chain)? {
            TypeCache::Pure(pure) => {
                pure.stats.hits += 1;
                CacheRead::from_cache(pure.entries.get(id).cloned(), CacheSource::PureCache)
            }
            TypeCache::FullTable(full) => {
                full.stats.hits += 1;
                CacheRead::from_cache(full.rows.get(id).cloned(), CacheSource::FullTable)
            }
            TypeCache::Lru(lru) => self.read_through(lru, ty, chain, id)?,
        };
        debug!(
            entity = ty.name(),
            chain,
            id,
            source = read.source().as_str(),
            "Entity read"
        );
        Ok(read)
    }

    fn read_through(
        &self,
        lru: &mut LruTier,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        id: &str,
    ) -> LedgerResult<CacheRead<Option<EntityBox>>> {
        if self.config.enable_id_set && lru.ids.is_none() {
            let ids = self.store.get_all_ids(ty, chain)?;
            debug!(entity = ty.name(), chain, ids = ids.len(), "Loaded id set");
            lru.ids = Some(ids.into_iter().collect());
        }
        if let Some(ids) = &lru.ids {
            if !ids.contains(id) {
                lru.stats.hits += 1;
                return Ok(CacheRead::from_cache(None, CacheSource::IdSet));
            }
        }
        if let Some(found) = lru.values.get(id) {
            let found = found.clone();
            lru.stats.hits += 1;
            return Ok(CacheRead::from_cache(Some(found), CacheSource::Lru));
        }
        lru.stats.misses += 1;
        let found = self.store.get_entity(ty, chain, id)?;
        if let Some(entity) = &found {
            lru.remember(entity.clone());
        }
        Ok(CacheRead::from_storage(found))
    }

    /// Live entities matching every filter, ascending by id.
    pub fn list_entities(
        &self,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        filters: &[EntityFilter],
        limit: Option<usize>,
    ) -> LedgerResult<CacheRead<Vec<EntityBox>>> {
        let mut tiers = self.lock()?;
        let limit = limit.unwrap_or(usize::MAX);
        let read = match self.tier(&mut tiers, ty, chain)? {
            TypeCache::Pure(pure) => {
                let compiled = compile_filters(filters, ty)?;
                let mut rows: Vec<EntityBox> = pure
                    .entries
                    .values()
                    .filter(|b| matches_all(&compiled, b))
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| a.id.cmp(&b.id));
                rows.truncate(limit);
                pure.stats.hits += 1;
                CacheRead::from_cache(rows, CacheSource::PureCache)
            }
            TypeCache::FullTable(full) => {
                let compiled = compile_filters(filters, ty)?;
                let rows = full
                    .rows
                    .values()
                    .filter(|b| matches_all(&compiled, b))
                    .take(limit)
                    .cloned()
                    .collect();
                full.stats.hits += 1;
                CacheRead::from_cache(rows, CacheSource::FullTable)
            }
            TypeCache::Lru(_) => {
                CacheRead::from_storage(self.store.list_entities(ty, chain, filters, Some(limit))?)
            }
        };
        debug!(
            entity = ty.name(),
            chain,
            rows = read.value().len(),
            source = read.source().as_str(),
            "Entity list"
        );
        Ok(read)
    }

    /// Ids of every live entity, ascending.
    pub fn get_all_ids(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<Vec<String>> {
        let mut tiers = self.lock()?;
        let mut ids: Vec<String> = match self.tier(&mut tiers, ty, chain)? {
            TypeCache::Pure(pure) => pure.entries.keys().cloned().collect(),
            TypeCache::FullTable(full) => return Ok(full.rows.keys().cloned().collect()),
            TypeCache::Lru(LruTier { ids: Some(ids), .. }) => ids.iter().cloned().collect(),
            TypeCache::Lru(_) => self.store.get_all_ids(ty, chain)?,
        };
        ids.sort();
        Ok(ids)
    }

    pub fn get_max_id(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<i64> {
        let mut tiers = self.lock()?;
        match self.tier(&mut tiers, ty, chain)? {
            TypeCache::Pure(pure) => Ok(pure
                .entries
                .keys()
                .filter_map(|id| id.parse::<i64>().ok())
                .max()
                .unwrap_or(0)),
            _ => self.store.get_max_id(ty, chain),
        }
    }

    pub fn count_entity(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<u64> {
        let mut tiers = self.lock()?;
        match self.tier(&mut tiers, ty, chain)? {
            TypeCache::Pure(pure) => Ok(pure.entries.len() as u64),
            TypeCache::FullTable(full) => Ok(full.rows.len() as u64),
            TypeCache::Lru(LruTier { ids: Some(ids), .. }) => Ok(ids.len() as u64),
            TypeCache::Lru(_) => self.store.count_entity(ty, chain),
        }
    }

    // === Writes ===

    /// Persist revisions and keep the active tiers consistent. Returns how
    /// many entities were created.
    pub fn set_entities(
        &self,
        ty: &dyn EntityTypeDescription,
        boxes: Vec<EntityBox>,
    ) -> LedgerResult<u64> {
        if boxes.is_empty() {
            return Ok(0);
        }
        let mut tiers = self.lock()?;

        if ty.is_cache() {
            let mut created = 0;
            let mut chains = BTreeSet::new();
            for entity in boxes {
                let chain = entity.gen_block.chain.clone();
                let TypeCache::Pure(pure) = self.tier(&mut tiers, ty, &chain)? else {
                    return Err(StoreError::Backend {
                        operation: "set_entities".to_string(),
                        reason: format!("pure-cache type {} served by a persistent tier", ty.name()),
                    }
                    .into());
                };
                if pure.apply(entity) {
                    created += 1;
                }
                chains.insert(chain);
            }
            for chain in chains {
                if let Some(TypeCache::Pure(pure)) =
                    tiers.caches.get_mut(&(chain.clone(), ty.name().to_string()))
                {
                    let evicted = pure.enforce_budget();
                    if evicted > 0 {
                        warn!(
                            entity = ty.name(),
                            chain = chain.as_str(),
                            evicted,
                            budget_bytes = pure.budget_bytes,
                            "Pure cache over budget, evicted oldest entries"
                        );
                    }
                }
            }
            return Ok(created);
        }

        let created = self.store.set_entities(ty, boxes.clone())?;

        let Tiers { caches, refused } = &mut *tiers;
        for entity in &boxes {
            let key = (entity.gen_block.chain.clone(), ty.name().to_string());
            let outgrown = match caches.get_mut(&key) {
                Some(TypeCache::Lru(lru)) => {
                    lru.apply(entity);
                    None
                }
                Some(TypeCache::FullTable(full)) => {
                    full.apply(entity);
                    (!full.fits()).then_some(full.rows.len())
                }
                Some(TypeCache::Pure(_)) | None => None,
            };
            if let Some(rows) = outgrown {
                refused.insert(ty.name().to_string());
                warn!(
                    entity = ty.name(),
                    chain = key.0.as_str(),
                    rows,
                    budget_bytes = self.config.full_table_budget_bytes,
                    "Full-table cache outgrew its budget, demoting to LRU"
                );
                caches.insert(key, TypeCache::Lru(LruTier::new(self.config.lru_capacity)));
            }
        }
        Ok(created)
    }

    /// Roll back to `block_number` on `chain`. Every tier of the chain is
    /// dropped except pure caches, which only lose entries above the bound.
    pub fn reorg(&self, block_number: i64, chain: &str) -> LedgerResult<()> {
        let mut tiers = self.lock()?;
        let before = tiers.caches.len();
        tiers.caches.retain(|(tier_chain, _), cache| {
            if tier_chain != chain {
                return true;
            }
            match cache {
                TypeCache::Pure(pure) => {
                    pure.truncate(block_number);
                    true
                }
                _ => false,
            }
        });
        let dropped = before - tiers.caches.len();
        self.store.reorg(block_number, chain)?;
        info!(chain, block_number, dropped_tiers = dropped, "Cache reorg applied");
        Ok(())
    }

    // === Diagnostics ===

    pub fn tier_snapshots(&self) -> LedgerResult<Vec<TierSnapshot>> {
        let tiers = self.lock()?;
        let mut snapshots: Vec<TierSnapshot> = tiers
            .caches
            .iter()
            .map(|((chain, entity), cache)| {
                let stats = cache.stats();
                TierSnapshot {
                    chain: chain.clone(),
                    entity: entity.clone(),
                    tier: cache.kind(),
                    entries: cache.entries(),
                    id_set_entries: cache.id_set_entries(),
                    budget_bytes: cache.budget_bytes(),
                    hits: stats.hits,
                    misses: stats.misses,
                    evictions: stats.evictions,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| (&a.chain, &a.entity).cmp(&(&b.chain, &b.entity)));
        Ok(snapshots)
    }

    /// Sparse types refused the full-table tier, sorted.
    pub fn refused_types(&self) -> LedgerResult<Vec<String>> {
        let tiers = self.lock()?;
        let mut refused: Vec<String> = tiers.refused.iter().cloned().collect();
        refused.sort();
        Ok(refused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::TimeZone;
    use ledger_core::{BlockStamp, EntitySchema, FieldDescription, LedgerError, ScalarKind};

    fn block(n: u64) -> BlockStamp {
        let time = Utc.timestamp_opt(1_600_000_000 + n as i64 * 12, 0).unwrap();
        BlockStamp::new(n, format!("0x{:x}", n), "1", time)
    }

    fn plain() -> EntitySchema {
        EntitySchema::new("Plain").with_field(FieldDescription::new("n", ScalarKind::Int8))
    }

    fn row(entity: &str, id: &str, n: u64) -> EntityBox {
        EntityBox::upsert(entity, id, block(n)).with_field("n", n as i64)
    }

    fn cached(config: CacheConfig) -> CachedStore<MemoryStore> {
        CachedStore::new(Arc::new(MemoryStore::new()), config).unwrap()
    }

    #[test]
    fn test_zero_lru_capacity_is_rejected() {
        let err = CachedStore::new(
            Arc::new(MemoryStore::new()),
            CacheConfig::new().with_lru_capacity(0),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)), "{err:?}");
    }

    #[test]
    fn test_lru_sources_follow_hits_and_evictions() {
        let cache = cached(CacheConfig::new().with_lru_capacity(2));
        let ty = plain();
        cache
            .set_entities(&ty, vec![row("Plain", "a", 1), row("Plain", "b", 1), row("Plain", "c", 1)])
            .unwrap();

        let source = |id: &str| cache.get_entity(&ty, "1", id).unwrap().source();
        assert_eq!(source("a"), CacheSource::Persistent);
        assert_eq!(source("a"), CacheSource::Lru);
        assert_eq!(source("b"), CacheSource::Persistent);
        assert_eq!(source("c"), CacheSource::Persistent);
        assert_eq!(source("a"), CacheSource::Persistent);
        assert_eq!(source("zz"), CacheSource::IdSet);

        let snap = cache.tier_snapshots().unwrap();
        assert_eq!(snap[0].tier, TierKind::Lru);
        assert_eq!(snap[0].evictions, 2);
        assert_eq!(snap[0].id_set_entries, Some(3));
    }

    #[test]
    fn test_without_id_set_misses_go_to_store() {
        let cache = cached(CacheConfig::new().with_id_set(false));
        let ty = plain();
        let read = cache.get_entity(&ty, "1", "ghost").unwrap();
        assert_eq!(read.source(), CacheSource::Persistent);
        assert!(read.into_value().is_none());
    }

    #[test]
    fn test_cached_values_are_copies() {
        let cache = cached(CacheConfig::new());
        let ty = plain();
        cache.set_entities(&ty, vec![row("Plain", "a", 1)]).unwrap();
        let mut first = cache.get_entity(&ty, "1", "a").unwrap().into_value().unwrap();
        first.set_field("n", 99i64);
        let again = cache.get_entity(&ty, "1", "a").unwrap();
        assert_eq!(again.source(), CacheSource::Lru);
        assert_eq!(again.into_value().unwrap().field("n"), Some(&1i64.into()));
    }

    #[test]
    fn test_pure_cache_never_touches_store() {
        let cache = cached(CacheConfig::new());
        let ty = EntitySchema::new("Spot")
            .with_field(FieldDescription::new("n", ScalarKind::Int8))
            .cache(1 << 20);
        let created = cache
            .set_entities(&ty, vec![row("Spot", "x", 3), row("Spot", "y", 8)])
            .unwrap();
        assert_eq!(created, 2);
        assert_eq!(cache.store().stats().writes, 0);
        let read = cache.get_entity(&ty, "1", "x").unwrap();
        assert_eq!(read.source(), CacheSource::PureCache);
        assert!(read.into_value().is_some());
        assert_eq!(cache.count_entity(&ty, "1").unwrap(), 2);

        cache.reorg(5, "1").unwrap();
        assert!(cache.get_entity(&ty, "1", "x").unwrap().into_value().is_some());
        assert!(cache.get_entity(&ty, "1", "y").unwrap().into_value().is_none());
    }

    #[test]
    fn test_sparse_type_uses_full_table_until_over_budget() {
        let ty = EntitySchema::new("Pool")
            .with_field(FieldDescription::new("n", ScalarKind::Int8))
            .sparse();
        let row_bytes = ty.estimated_row_size();
        let cache = cached(CacheConfig::new().with_full_table_budget(row_bytes * 2));
        cache.set_entities(&ty, vec![row("Pool", "a", 1)]).unwrap();

        let read = cache.get_entity(&ty, "1", "a").unwrap();
        assert_eq!(read.source(), CacheSource::FullTable);
        assert_eq!(cache.tier_kind("Pool", "1").unwrap(), Some(TierKind::FullTable));

        cache
            .set_entities(&ty, vec![row("Pool", "b", 2), row("Pool", "c", 2)])
            .unwrap();
        assert_eq!(cache.tier_kind("Pool", "1").unwrap(), Some(TierKind::Lru));
        assert_eq!(cache.refused_types().unwrap(), vec!["Pool".to_string()]);

        // Refusal survives a reorg that drops the tier
        cache.reorg(10, "1").unwrap();
        cache.get_entity(&ty, "1", "a").unwrap();
        assert_eq!(cache.tier_kind("Pool", "1").unwrap(), Some(TierKind::Lru));
    }

    #[test]
    fn test_sparse_type_refused_when_already_too_big() {
        let ty = EntitySchema::new("Pool")
            .with_field(FieldDescription::new("n", ScalarKind::Int8))
            .sparse();
        let cache = cached(CacheConfig::new().with_full_table_budget(1));
        cache.store().set_entities(&ty, vec![row("Pool", "a", 1)]).unwrap();
        let read = cache.get_entity(&ty, "1", "a").unwrap();
        assert_eq!(read.source(), CacheSource::Persistent);
        assert_eq!(cache.refused_types().unwrap(), vec!["Pool".to_string()]);
    }

    #[test]
    fn test_reorg_drops_persistent_tiers() {
        let cache = cached(CacheConfig::new());
        let ty = plain();
        cache.set_entities(&ty, vec![row("Plain", "a", 1)]).unwrap();
        cache.set_entities(&ty, vec![row("Plain", "a", 4)]).unwrap();
        cache.get_entity(&ty, "1", "a").unwrap();
        cache.reorg(2, "1").unwrap();
        assert_eq!(cache.tier_kind("Plain", "1").unwrap(), None);
        let a = cache.get_entity(&ty, "1", "a").unwrap();
        assert_eq!(a.source(), CacheSource::Persistent);
        assert_eq!(a.into_value().unwrap().block_number(), 1);
    }

    #[test]
    fn test_list_from_full_table_applies_filters() {
        let ty = EntitySchema::new("Pool")
            .with_field(FieldDescription::new("n", ScalarKind::Int8))
            .sparse();
        let cache = cached(CacheConfig::new());
        cache
            .set_entities(&ty, vec![row("Pool", "a", 1), row("Pool", "b", 2), row("Pool", "c", 3)])
            .unwrap();
        let read = cache
            .list_entities(&ty, "1", &[EntityFilter::ge("n", 2i64)], Some(1))
            .unwrap();
        assert_eq!(read.source(), CacheSource::FullTable);
        let ids: Vec<_> = read.into_value().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }
}
