//! The uncommitted ledger.
//!
//! A [`ChangeHistory`] holds the revisions of one entity id ordered by block
//! number, at most one per block. A [`ChangeSet`] maps entity type and id to
//! histories. Both split at a block number: commit flushes the lower half,
//! reorg discards the upper half.

use std::collections::BTreeMap;

use ledger_core::{EntityBox, EntityTypeDescription, LedgerResult};

/// Revisions of one entity, strictly ascending by block number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeHistory {
    revisions: Vec<EntityBox>,
}

impl ChangeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a revision in block order; a revision at an existing block
    /// merges into the one already there.
    pub fn push(&mut self, ty: &dyn EntityTypeDescription, revision: EntityBox) -> LedgerResult<()> {
        let number = revision.block_number();
        match self
            .revisions
            .binary_search_by_key(&number, EntityBox::block_number)
        {
            Ok(at) => self.revisions[at].merge(ty, revision),
            Err(at) => {
                self.revisions.insert(at, revision);
                Ok(())
            }
        }
    }

    /// Number of revisions at or below `block_number`.
    pub fn count(&self, block_number: u64) -> usize {
        self.revisions
            .partition_point(|r| r.block_number() <= block_number)
    }

    /// Last revision at or below `block_number`.
    pub fn latest(&self, block_number: u64) -> Option<&EntityBox> {
        self.count(block_number)
            .checked_sub(1)
            .map(|at| &self.revisions[at])
    }

    /// Keep revisions at or below `block_number`, returning the rest.
    pub fn split(&mut self, block_number: u64) -> ChangeHistory {
        let at = self.count(block_number);
        ChangeHistory {
            revisions: self.revisions.split_off(at),
        }
    }

    /// Append a history whose revisions all come after this one's.
    pub fn append(&mut self, mut later: ChangeHistory) {
        debug_assert!(match (self.revisions.last(), later.revisions.first()) {
            (Some(a), Some(b)) => a.block_number() < b.block_number(),
            _ => true,
        });
        self.revisions.append(&mut later.revisions);
    }

    pub fn revisions(&self) -> &[EntityBox] {
        &self.revisions
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}

/// entity type -> id -> history
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    entities: BTreeMap<String, BTreeMap<String, ChangeHistory>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ty: &dyn EntityTypeDescription, revision: EntityBox) -> LedgerResult<()> {
        self.entities
            .entry(revision.entity.clone())
            .or_default()
            .entry(revision.id.clone())
            .or_default()
            .push(ty, revision)
    }

    pub fn history(&self, entity: &str, id: &str) -> Option<&ChangeHistory> {
        self.entities.get(entity)?.get(id)
    }

    /// Histories of one entity type, ascending by id.
    pub fn histories(&self, entity: &str) -> impl Iterator<Item = (&String, &ChangeHistory)> {
        self.entities.get(entity).into_iter().flatten()
    }

    /// Entity types with pending revisions.
    pub fn entity_types(&self) -> impl Iterator<Item = &String> {
        self.entities.keys()
    }

    /// Revisions at or below `block_number` across the whole ledger.
    pub fn count(&self, block_number: u64) -> usize {
        self.entities
            .values()
            .flat_map(BTreeMap::values)
            .map(|h| h.count(block_number))
            .sum()
    }

    /// Keep revisions at or below `block_number`, returning the rest. Empty
    /// branches are pruned on both sides.
    pub fn split(&mut self, block_number: u64) -> ChangeSet {
        let mut upper = ChangeSet::new();
        for (entity, ids) in self.entities.iter_mut() {
            for (id, history) in ids.iter_mut() {
                let later = history.split(block_number);
                if !later.is_empty() {
                    upper
                        .entities
                        .entry(entity.clone())
                        .or_default()
                        .insert(id.clone(), later);
                }
            }
            ids.retain(|_, h| !h.is_empty());
        }
        self.entities.retain(|_, ids| !ids.is_empty());
        upper
    }

    /// Replace the revisions of `origin` at or below `block_number` with one
    /// resolved revision, filed under the resolved box's id. Later revisions
    /// move along with it.
    pub fn settle(
        &mut self,
        ty: &dyn EntityTypeDescription,
        origin: &str,
        block_number: u64,
        resolved: EntityBox,
    ) -> LedgerResult<()> {
        let ids = self.entities.entry(resolved.entity.clone()).or_default();
        let mut later = ids
            .remove(origin)
            .map(|mut h| h.split(block_number))
            .unwrap_or_default();
        for revision in later.revisions.iter_mut() {
            revision.id = resolved.id.clone();
        }
        let mut settled = ChangeHistory {
            revisions: vec![resolved],
        };
        settled.append(later);

        let id = settled.revisions[0].id.clone();
        match ids.get_mut(&id) {
            Some(existing) => {
                for revision in settled.revisions {
                    existing.push(ty, revision)?;
                }
            }
            None => {
                ids.insert(id, settled);
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entities.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Total revisions held.
    pub fn len(&self) -> usize {
        self.entities
            .values()
            .flat_map(BTreeMap::values)
            .map(ChangeHistory::len)
            .sum()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::DateTime;
    use ledger_core::{BlockStamp, EntitySchema, FieldDescription, ScalarKind};
    use proptest::prelude::*;

    fn schema() -> EntitySchema {
        EntitySchema::new("Vault").with_field(FieldDescription::new("shares", ScalarKind::Int8))
    }

    fn rev(n: u64) -> EntityBox {
        let stamp = BlockStamp::new(n, format!("0x{n:x}"), "1", DateTime::UNIX_EPOCH);
        EntityBox::upsert("Vault", "a", stamp).with_field("shares", n as i64)
    }

    fn ordered_and_shuffled() -> impl Strategy<Value = (Vec<u64>, Vec<u64>)> {
        proptest::collection::btree_set(0u64..1_000, 1..20).prop_flat_map(|set| {
            let ordered: Vec<u64> = set.into_iter().collect();
            (Just(ordered.clone()), Just(ordered).prop_shuffle())
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Push order does not affect the final history.
        #[test]
        fn prop_push_is_order_independent((ordered, shuffled) in ordered_and_shuffled()) {
            let ty = schema();
            let mut in_order = ChangeHistory::new();
            for &n in &ordered {
                in_order.push(&ty, rev(n)).unwrap();
            }
            let mut out_of_order = ChangeHistory::new();
            for &n in &shuffled {
                out_of_order.push(&ty, rev(n)).unwrap();
            }
            prop_assert_eq!(in_order, out_of_order);
        }

        /// Split then append reconstructs the history.
        #[test]
        fn prop_split_partition_law(
            numbers in proptest::collection::btree_set(0u64..1_000, 0..20),
            at in 0u64..1_000,
        ) {
            let ty = schema();
            let mut h = ChangeHistory::new();
            for &n in &numbers {
                h.push(&ty, rev(n)).unwrap();
            }
            let original = h.clone();
            let upper = h.split(at);
            prop_assert!(h.revisions().iter().all(|r| r.block_number() <= at));
            prop_assert!(upper.revisions().iter().all(|r| r.block_number() > at));
            h.append(upper);
            prop_assert_eq!(h, original);
        }
    }
}
