//! Block-processing session over a [`CachedStore`].
//!
//! A [`Controller`] accumulates uncommitted revisions for one chain, answers
//! point-in-time reads by merging them with committed data, and flushes them
//! on commit. Every public method holds the session lock for its whole
//! duration, including any store calls it makes.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use ledger_core::{
    compile_filters, matches_all, Cursor, EntityBox, EntityError, EntityFilter,
    EntityTypeDescription, EntityTypeRef, LedgerConfig, LedgerResult, StoreError, Value,
};
use tracing::{debug, info};

use crate::cache::CachedStore;
use crate::change_set::{ChangeHistory, ChangeSet};
use crate::diagnostics::{DiagnosticsSnapshot, Operation, Timings, ALL_ENTITIES};
use crate::placeholder::PlaceholderSequence;
use crate::store::Store;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    /// Nothing written yet
    #[default]
    Unstarted,
    /// Holding uncommitted revisions
    Active,
    /// Last commit succeeded and left nothing pending
    Committed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unstarted => "unstarted",
            Phase::Active => "active",
            Phase::Committed => "committed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage {
    /// Entities ascending by id
    pub entities: Vec<EntityBox>,
    /// Cursor for the next page, `None` when this page is the last
    pub next_cursor: Option<String>,
}

/// Outcome of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    pub block_number: u64,
    /// Resolved entities written to the store
    pub flushed: usize,
    /// Entities the store reported as newly created
    pub created: u64,
    /// Revisions above the commit block still held in memory
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct ControllerState {
    change_set: ChangeSet,
    phase: Phase,
    timings: Timings,
}

/// Uncommitted ledger for one chain.
#[derive(Debug)]
pub struct Controller<S: Store> {
    chain: String,
    store: Arc<CachedStore<S>>,
    placeholders: Arc<PlaceholderSequence>,
    state: Mutex<ControllerState>,
}

fn is_positive_numeric(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && id.parse::<i64>().is_ok_and(|n| n > 0)
}

impl<S: Store> Controller<S> {
    /// Create a controller with its own placeholder sequence.
    pub fn new(
        chain: impl Into<String>,
        store: Arc<CachedStore<S>>,
        config: &LedgerConfig,
    ) -> LedgerResult<Self> {
        config.validate()?;
        let placeholders = Arc::new(PlaceholderSequence::new(
            config.time_series_placeholder_prefix.clone(),
        ));
        Ok(Self::with_placeholders(chain, store, placeholders))
    }

    /// Create a controller drawing placeholder ids from a shared sequence.
    pub fn with_placeholders(
        chain: impl Into<String>,
        store: Arc<CachedStore<S>>,
        placeholders: Arc<PlaceholderSequence>,
    ) -> Self {
        Self {
            chain: chain.into(),
            store,
            placeholders,
            state: Mutex::new(ControllerState::default()),
        }
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub fn store(&self) -> &Arc<CachedStore<S>> {
        &self.store
    }

    pub fn placeholders(&self) -> &PlaceholderSequence {
        &self.placeholders
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, ControllerState>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned.into())
    }

    pub fn phase(&self) -> LedgerResult<Phase> {
        Ok(self.lock()?.phase)
    }

    /// Uncommitted revisions at or below `block_number`.
    pub fn pending_count(&self, block_number: u64) -> LedgerResult<usize> {
        Ok(self.lock()?.change_set.count(block_number))
    }

    fn entity_type(&self, name: &str) -> LedgerResult<EntityTypeRef> {
        self.store.get_entity_type(name).ok_or_else(|| {
            EntityError::UnknownEntity {
                entity: name.to_string(),
            }
            .into()
        })
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Admit a revision into the uncommitted ledger. Returns the id it was
    /// stored under, which differs from the given one when a time-series
    /// placeholder was assigned.
    pub fn set_entity(&self, entity: &str, mut revision: EntityBox) -> LedgerResult<String> {
        let started = Instant::now();
        let ty = self.entity_type(entity)?;
        let mut state = self.lock()?;

        revision.entity = ty.name().to_string();
        if revision.gen_block.chain != self.chain {
            return Err(EntityError::InvalidFieldValue {
                entity: revision.entity.clone(),
                id: revision.id.clone(),
                field: "gen_block.chain".to_string(),
                reason: format!(
                    "revision for chain {} written to chain {}",
                    revision.gen_block.chain, self.chain
                ),
            }
            .into());
        }
        revision.check_value(ty.as_ref())?;

        let mut fresh = false;
        if ty.is_time_series() {
            if !is_positive_numeric(&revision.id) {
                revision.id = self.placeholders.next_id();
                fresh = true;
            }
            if !revision.is_deleted() {
                if let Some(ts) = ty.timestamp_field() {
                    let time = revision.gen_block.time;
                    revision.set_field(ts.name.clone(), Value::Timestamp(time));
                }
            }
        }

        if (ty.is_immutable() || ty.is_time_series())
            && !fresh
            && self.is_present(&state.change_set, ty.as_ref(), &revision.id)?
        {
            return Err(EntityError::UpdateImmutable {
                entity: revision.entity.clone(),
                id: revision.id.clone(),
                chain: self.chain.clone(),
            }
            .into());
        }

        let id = revision.id.clone();
        debug!(
            entity = ty.name(),
            id = id.as_str(),
            block_number = revision.block_number(),
            "Entity set"
        );
        state.change_set.push(ty.as_ref(), revision)?;
        state.phase = Phase::Active;
        state
            .timings
            .record(ty.name(), Operation::Set, started.elapsed());
        Ok(id)
    }

    /// Whether an entity currently exists in the ledger or the store.
    fn is_present(
        &self,
        change_set: &ChangeSet,
        ty: &dyn EntityTypeDescription,
        id: &str,
    ) -> LedgerResult<bool> {
        if let Some(last) = change_set
            .history(ty.name(), id)
            .and_then(|h| h.revisions().last())
        {
            return Ok(!last.is_deleted());
        }
        Ok(self
            .store
            .get_entity(ty, &self.chain, id)?
            .into_value()
            .is_some())
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// The entity as of `block_number`: the latest uncommitted revision at or
    /// below it resolved against older state, or committed data.
    pub fn get_entity(
        &self,
        entity: &str,
        id: &str,
        block_number: u64,
    ) -> LedgerResult<Option<EntityBox>> {
        self.get(entity, id, block_number, false)
    }

    /// The entity only if it was written exactly at `block_number`.
    pub fn get_entity_in_block(
        &self,
        entity: &str,
        id: &str,
        block_number: u64,
    ) -> LedgerResult<Option<EntityBox>> {
        self.get(entity, id, block_number, true)
    }

    fn get(
        &self,
        entity: &str,
        id: &str,
        block_number: u64,
        in_block: bool,
    ) -> LedgerResult<Option<EntityBox>> {
        let started = Instant::now();
        let ty = self.entity_type(entity)?;
        let mut state = self.lock()?;

        let history = state.change_set.history(ty.name(), id);
        let window = history.map_or(0, |h| h.count(block_number));
        let found = match history {
            Some(h) if window > 0 => {
                let revisions = &h.revisions()[..window];
                if in_block && revisions[window - 1].block_number() != block_number {
                    None
                } else {
                    Some(self.fold(ty.as_ref(), id, revisions)?).filter(|b| !b.is_deleted())
                }
            }
            _ if in_block => None,
            _ => self.store.get_entity(ty.as_ref(), &self.chain, id)?.into_value(),
        };

        state
            .timings
            .record(ty.name(), Operation::Get, started.elapsed());
        Ok(found)
    }

    /// Resolve a run of revisions into one materialized box, deleted or not.
    ///
    /// Starts from the last self-contained revision; only when none exists
    /// is the committed value read as the base.
    fn fold(
        &self,
        ty: &dyn EntityTypeDescription,
        id: &str,
        revisions: &[EntityBox],
    ) -> LedgerResult<EntityBox> {
        let anchor = revisions.iter().rposition(|r| r.is_self_contained(ty));
        let (mut resolved, rest) = match anchor {
            Some(at) => (revisions[at].clone(), &revisions[at + 1..]),
            None => {
                let base = self
                    .store
                    .get_entity(ty, &self.chain, id)?
                    .into_value()
                    .unwrap_or_else(|| {
                        EntityBox::deleted(ty.name(), id, revisions[0].gen_block.clone())
                    });
                (base, revisions)
            }
        };
        for revision in rest {
            resolved.merge(ty, revision.clone())?;
        }
        resolved.materialize(ty)?;
        Ok(resolved)
    }

    /// List entities as of `block_number`, paginated by `cursor`.
    pub fn list_entity(
        &self,
        entity: &str,
        filters: &[EntityFilter],
        block_number: u64,
        cursor: &str,
        limit: Option<usize>,
    ) -> LedgerResult<ListPage> {
        let started = Instant::now();
        let ty = self.entity_type(entity)?;
        let mut state = self.lock()?;
        let page = self.list(&state.change_set, ty.as_ref(), filters, block_number, cursor, limit)?;
        state
            .timings
            .record(ty.name(), Operation::List, started.elapsed());
        Ok(page)
    }

    /// List the entities on the forward side of `entity.field`, a derived
    /// reverse relation, that point back at `id`.
    pub fn list_related(
        &self,
        entity: &str,
        id: &str,
        field: &str,
        block_number: u64,
        cursor: &str,
        limit: Option<usize>,
    ) -> LedgerResult<ListPage> {
        let started = Instant::now();
        let ty = self.entity_type(entity)?;
        let reverse = ty.reverse_field(field)?;
        let target = self.entity_type(&reverse.target)?;
        let Some(forward) = target.field(&reverse.field) else {
            return Err(EntityError::InvalidField {
                entity: target.name().to_string(),
                field: reverse.field.clone(),
                reason: format!("reverse side of {}.{} does not exist", ty.name(), field),
            }
            .into());
        };
        let filter = if forward.is_list() {
            EntityFilter::has_any(reverse.field.clone(), [id])
        } else {
            EntityFilter::eq(reverse.field.clone(), id)
        };

        let mut state = self.lock()?;
        let page = self.list(
            &state.change_set,
            target.as_ref(),
            &[filter],
            block_number,
            cursor,
            limit,
        )?;
        state
            .timings
            .record(target.name(), Operation::List, started.elapsed());
        Ok(page)
    }

    fn list(
        &self,
        change_set: &ChangeSet,
        ty: &dyn EntityTypeDescription,
        filters: &[EntityFilter],
        block_number: u64,
        raw_cursor: &str,
        limit: Option<usize>,
    ) -> LedgerResult<ListPage> {
        if limit == Some(0) {
            return Err(EntityError::InvalidListFilter {
                entity: ty.name().to_string(),
                reason: "limit must be positive".to_string(),
            }
            .into());
        }
        let compiled = compile_filters(filters, ty)?;
        let cursor = Cursor::parse(raw_cursor)?;
        let after = cursor.after();

        // Ids the ledger has an opinion on, matching or not, are never read
        // from the store.
        let mut decided = HashSet::new();
        let mut pending = Vec::new();
        for (id, history) in change_set.histories(ty.name()) {
            let window = history.count(block_number);
            if window == 0 {
                continue;
            }
            decided.insert(id.clone());
            if !cursor.includes_uncommitted() || after.is_some_and(|a| id.as_str() <= a) {
                continue;
            }
            let resolved = self.fold(ty, id, &history.revisions()[..window])?;
            if matches_all(&compiled, &resolved) {
                pending.push(resolved);
            }
        }

        let primary = ty.primary_field().name.clone();
        let mut store_filters = filters.to_vec();
        if !decided.is_empty() {
            store_filters.push(EntityFilter::id_not_in(primary.clone(), Arc::new(decided)));
        }
        if let Some(after) = after {
            store_filters.push(EntityFilter::gt(primary, after));
        }
        let committed = self
            .store
            .list_entities(ty, &self.chain, &store_filters, limit.map(|l| l.saturating_add(1)))?
            .into_value();

        let mut merged = merge_by_id(pending, committed);
        let limit = match limit {
            Some(limit) if merged.len() > limit => limit,
            _ => {
                return Ok(ListPage {
                    entities: merged.into_iter().map(|(b, _)| b).collect(),
                    next_cursor: None,
                })
            }
        };

        let rest = merged.split_off(limit);
        let pending_remains = rest.iter().any(|(_, uncommitted)| *uncommitted);
        let page: Vec<EntityBox> = merged.into_iter().map(|(b, _)| b).collect();
        let next_cursor = page.last().map(|last| {
            if pending_remains {
                Cursor::Uncommitted(last.id.clone())
            } else {
                Cursor::Committed(last.id.clone())
            }
            .to_string()
        });
        Ok(ListPage {
            entities: page,
            next_cursor,
        })
    }

    // ========================================================================
    // COMMIT / REORG
    // ========================================================================

    /// Flush every revision at or below `block_number` to the store.
    ///
    /// Each batch the store accepts is settled in the ledger as its resolved
    /// rows, so a commit that fails partway can be retried without applying
    /// operators twice or reissuing time-series ids.
    pub fn commit(&self, block_number: u64, block_time: DateTime<Utc>) -> LedgerResult<CommitSummary> {
        let started = Instant::now();
        let mut state = self.lock()?;

        // (type, ledger id each row came from, resolved rows)
        let mut batches: Vec<(EntityTypeRef, Vec<String>, Vec<EntityBox>)> = Vec::new();
        for entity in state.change_set.entity_types() {
            let ty = self.entity_type(entity)?;
            let mut origins = Vec::new();
            let mut rows = Vec::new();
            for (id, history) in state.change_set.histories(entity) {
                if let Some(resolved) = self.resolve_for_commit(ty.as_ref(), id, history, block_number)? {
                    origins.push(id.clone());
                    rows.push(resolved);
                }
            }
            if ty.is_time_series() {
                self.finalize_placeholders(ty.as_ref(), &state.change_set, &mut rows)?;
            }
            if !rows.is_empty() {
                batches.push((ty, origins, rows));
            }
        }

        let mut flushed = 0;
        let mut created = 0;
        for (ty, origins, rows) in batches {
            let set_started = Instant::now();
            flushed += rows.len();
            created += self.store.set_entities(ty.as_ref(), rows.clone())?;
            for (origin, row) in origins.iter().zip(rows) {
                state
                    .change_set
                    .settle(ty.as_ref(), origin, block_number, row)?;
            }
            state
                .timings
                .record(ty.name(), Operation::Set, set_started.elapsed());
        }
        self.store.growth_aggregation(&self.chain, block_time)?;

        let remaining = state.change_set.split(block_number);
        state.change_set = remaining;
        let remaining = state.change_set.len();
        state.phase = if state.change_set.is_empty() {
            Phase::Committed
        } else {
            Phase::Active
        };
        state
            .timings
            .record(ALL_ENTITIES, Operation::Commit, started.elapsed());

        info!(
            chain = self.chain.as_str(),
            block_number,
            flushed,
            created,
            remaining,
            "Committed block"
        );
        Ok(CommitSummary {
            block_number,
            flushed,
            created,
            remaining,
        })
    }

    fn resolve_for_commit(
        &self,
        ty: &dyn EntityTypeDescription,
        id: &str,
        history: &ChangeHistory,
        block_number: u64,
    ) -> LedgerResult<Option<EntityBox>> {
        let window = history.count(block_number);
        if window == 0 {
            return Ok(None);
        }
        self.fold(ty, id, &history.revisions()[..window]).map(Some)
    }

    /// Give placeholder rows their final ids: the next numbers after the
    /// store's maximum, in (block, issue) order, skipping numeric ids the
    /// ledger already holds for the type.
    fn finalize_placeholders(
        &self,
        ty: &dyn EntityTypeDescription,
        change_set: &ChangeSet,
        rows: &mut [EntityBox],
    ) -> LedgerResult<()> {
        let mut provisional: Vec<(u64, u64, usize)> = rows
            .iter()
            .enumerate()
            .filter_map(|(at, row)| {
                self.placeholders
                    .sequence_of(&row.id)
                    .map(|seq| (row.block_number(), seq, at))
            })
            .collect();
        if provisional.is_empty() {
            return Ok(());
        }
        provisional.sort_unstable();

        let taken: HashSet<i64> = change_set
            .histories(ty.name())
            .filter_map(|(id, _)| id.parse::<i64>().ok())
            .collect();
        let mut next = self.store.get_max_id(ty, &self.chain)? + 1;
        for (_, _, at) in provisional {
            while taken.contains(&next) {
                next += 1;
            }
            debug!(
                entity = ty.name(),
                placeholder = rows[at].id.as_str(),
                id = next,
                "Finalized time-series id"
            );
            rows[at].id = next.to_string();
            next += 1;
        }
        Ok(())
    }

    /// Discard every uncommitted revision above `block_number`; a negative
    /// bound discards the whole ledger. The store is rolled back as well.
    pub fn reorg(&self, block_number: i64) -> LedgerResult<()> {
        let started = Instant::now();
        let mut state = self.lock()?;
        let before = state.change_set.len();
        if block_number < 0 {
            state.change_set.clear();
        } else {
            let _discarded = state.change_set.split(block_number as u64);
        }
        let dropped = before - state.change_set.len();
        self.store.reorg(block_number, &self.chain)?;
        state
            .timings
            .record(ALL_ENTITIES, Operation::Reorg, started.elapsed());
        info!(
            chain = self.chain.as_str(),
            block_number,
            dropped,
            "Reorg applied"
        );
        Ok(())
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    pub fn diagnostics(&self) -> LedgerResult<DiagnosticsSnapshot> {
        let state = self.lock()?;
        Ok(DiagnosticsSnapshot {
            chain: self.chain.clone(),
            phase: state.phase.as_str().to_string(),
            pending_revisions: state.change_set.len(),
            cache: self.store.tier_snapshots()?,
            refused_full_table: self.store.refused_types()?,
            timings: state.timings.snapshot(),
        })
    }
}

/// Merge two id-sorted, id-disjoint lists, tagging uncommitted rows.
fn merge_by_id(pending: Vec<EntityBox>, committed: Vec<EntityBox>) -> Vec<(EntityBox, bool)> {
    let mut tagged: BTreeMap<String, (EntityBox, bool)> = BTreeMap::new();
    for row in committed {
        tagged.insert(row.id.clone(), (row, false));
    }
    for row in pending {
        tagged.insert(row.id.clone(), (row, true));
    }
    tagged.into_values().collect()
}
