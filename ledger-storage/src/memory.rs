//! In-memory [`Store`] backend.
//!
//! Keeps every committed version per id, ordered by block number, so a reorg
//! can roll committed state back as well. Used by tests and as the reference
//! backend for the cache and controller.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use ledger_core::{
    compile_filters, matches_all, EntityBox, EntityFilter, EntityTypeDescription, EntityTypeRef,
    LedgerResult, StoreError,
};
use serde::Serialize;

use crate::store::Store;

/// (chain, entity type)
type TableKey = (String, String);

/// id -> versions ascending by block number
type Table = BTreeMap<String, Vec<EntityBox>>;

/// Call counters for the in-memory backend.
#[derive(Debug, Default)]
pub struct StoreStats {
    /// Point reads served
    pub entity_reads: AtomicU64,
    /// List queries served
    pub list_calls: AtomicU64,
    /// Full id scans served
    pub id_scans: AtomicU64,
    /// Revisions written
    pub writes: AtomicU64,
    /// Aggregation hooks run
    pub aggregations: AtomicU64,
    /// Reorgs applied
    pub reorgs: AtomicU64,
}

impl StoreStats {
    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            entity_reads: self.entity_reads.load(Ordering::Relaxed),
            list_calls: self.list_calls.load(Ordering::Relaxed),
            id_scans: self.id_scans.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            aggregations: self.aggregations.load(Ordering::Relaxed),
            reorgs: self.reorgs.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of store counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StoreStatsSnapshot {
    pub entity_reads: u64,
    pub list_calls: u64,
    pub id_scans: u64,
    pub writes: u64,
    pub aggregations: u64,
    pub reorgs: u64,
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    types: RwLock<BTreeMap<String, EntityTypeRef>>,
    tables: RwLock<HashMap<TableKey, Table>>,
    aggregations: RwLock<Vec<(String, DateTime<Utc>)>>,
    stats: StoreStats,
}

fn read<T>(lock: &RwLock<T>) -> LedgerResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| StoreError::LockPoisoned.into())
}

fn write<T>(lock: &RwLock<T>) -> LedgerResult<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| StoreError::LockPoisoned.into())
}

fn table_key(chain: &str, entity: &str) -> TableKey {
    (chain.to_string(), entity.to_string())
}

/// Latest version of an id when it is live.
fn live(versions: &[EntityBox]) -> Option<&EntityBox> {
    versions.last().filter(|b| !b.is_deleted())
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with types already installed.
    pub fn with_types(types: Vec<EntityTypeRef>) -> LedgerResult<Arc<Self>> {
        let store = Self::new();
        store.init_schema(types)?;
        Ok(Arc::new(store))
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Aggregation hook invocations, oldest first.
    pub fn aggregations(&self) -> LedgerResult<Vec<(String, DateTime<Utc>)>> {
        Ok(read(&self.aggregations)?.clone())
    }

    /// Every stored version of one id, oldest first.
    pub fn versions(&self, entity: &str, chain: &str, id: &str) -> LedgerResult<Vec<EntityBox>> {
        let tables = read(&self.tables)?;
        Ok(tables
            .get(&table_key(chain, entity))
            .and_then(|t| t.get(id))
            .cloned()
            .unwrap_or_default())
    }

    /// Clear all stored data, keeping the installed types.
    pub fn clear(&self) -> LedgerResult<()> {
        write(&self.tables)?.clear();
        write(&self.aggregations)?.clear();
        Ok(())
    }
}

impl Store for MemoryStore {
    fn init_schema(&self, types: Vec<EntityTypeRef>) -> LedgerResult<()> {
        for ty in &types {
            ty.verify()?;
        }
        let mut installed = write(&self.types)?;
        for ty in types {
            installed.insert(ty.name().to_string(), ty);
        }
        Ok(())
    }

    fn get_entity_type(&self, name: &str) -> Option<EntityTypeRef> {
        self.types.read().ok()?.get(name).cloned()
    }

    fn get_entity(
        &self,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        id: &str,
    ) -> LedgerResult<Option<EntityBox>> {
        self.stats.entity_reads.fetch_add(1, Ordering::Relaxed);
        let tables = read(&self.tables)?;
        Ok(tables
            .get(&table_key(chain, ty.name()))
            .and_then(|t| t.get(id))
            .and_then(|versions| live(versions))
            .cloned())
    }

    fn list_entities(
        &self,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        filters: &[EntityFilter],
        limit: Option<usize>,
    ) -> LedgerResult<Vec<EntityBox>> {
        self.stats.list_calls.fetch_add(1, Ordering::Relaxed);
        let compiled = compile_filters(filters, ty)?;
        let tables = read(&self.tables)?;
        let Some(table) = tables.get(&table_key(chain, ty.name())) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter_map(|versions| live(versions))
            .filter(|b| matches_all(&compiled, b))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn get_all_ids(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<Vec<String>> {
        self.stats.id_scans.fetch_add(1, Ordering::Relaxed);
        let tables = read(&self.tables)?;
        Ok(tables
            .get(&table_key(chain, ty.name()))
            .map(|t| {
                t.iter()
                    .filter(|(_, versions)| live(versions).is_some())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_max_id(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<i64> {
        let tables = read(&self.tables)?;
        Ok(tables
            .get(&table_key(chain, ty.name()))
            .and_then(|t| t.keys().filter_map(|id| id.parse::<i64>().ok()).max())
            .unwrap_or(0))
    }

    fn count_entity(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<u64> {
        let tables = read(&self.tables)?;
        Ok(tables
            .get(&table_key(chain, ty.name()))
            .map(|t| t.values().filter(|v| live(v).is_some()).count() as u64)
            .unwrap_or(0))
    }

    fn set_entities(
        &self,
        ty: &dyn EntityTypeDescription,
        boxes: Vec<EntityBox>,
    ) -> LedgerResult<u64> {
        let mut tables = write(&self.tables)?;
        let mut created = 0;
        for entity in boxes {
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            let table = tables
                .entry(table_key(&entity.gen_block.chain, ty.name()))
                .or_default();
            let versions = table.entry(entity.id.clone()).or_default();
            if live(versions).is_none() && !entity.is_deleted() {
                created += 1;
            }
            let number = entity.block_number();
            match versions.binary_search_by_key(&number, EntityBox::block_number) {
                Ok(at) => versions[at] = entity,
                Err(at) => versions.insert(at, entity),
            }
        }
        Ok(created)
    }

    fn growth_aggregation(&self, chain: &str, block_time: DateTime<Utc>) -> LedgerResult<()> {
        self.stats.aggregations.fetch_add(1, Ordering::Relaxed);
        write(&self.aggregations)?.push((chain.to_string(), block_time));
        Ok(())
    }

    fn reorg(&self, block_number: i64, chain: &str) -> LedgerResult<()> {
        self.stats.reorgs.fetch_add(1, Ordering::Relaxed);
        let mut tables = write(&self.tables)?;
        for ((table_chain, _), table) in tables.iter_mut() {
            if table_chain != chain {
                continue;
            }
            if block_number < 0 {
                table.clear();
                continue;
            }
            let bound = block_number as u64;
            for versions in table.values_mut() {
                versions.retain(|v| v.block_number() <= bound);
            }
            table.retain(|_, versions| !versions.is_empty());
        }
        Ok(())
    }
}
