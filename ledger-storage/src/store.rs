//! The durable backend boundary.

use chrono::{DateTime, Utc};
use ledger_core::{EntityBox, EntityFilter, EntityTypeDescription, EntityTypeRef, LedgerResult};

/// Durable storage for committed entity revisions.
///
/// Implementations own persistence and their own retry policy. Every call is
/// synchronous and may block the caller; the ledger holds its session lock
/// across these calls.
pub trait Store: Send + Sync {
    /// Install entity type descriptions.
    fn init_schema(&self, types: Vec<EntityTypeRef>) -> LedgerResult<()>;

    /// Look up an installed entity type.
    fn get_entity_type(&self, name: &str) -> Option<EntityTypeRef>;

    /// Latest live revision of one entity, `None` when absent or deleted.
    fn get_entity(
        &self,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        id: &str,
    ) -> LedgerResult<Option<EntityBox>>;

    /// Live entities matching every filter, ascending by id.
    fn list_entities(
        &self,
        ty: &dyn EntityTypeDescription,
        chain: &str,
        filters: &[EntityFilter],
        limit: Option<usize>,
    ) -> LedgerResult<Vec<EntityBox>>;

    /// Ids of every live entity of a type.
    fn get_all_ids(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<Vec<String>>;

    /// Largest numeric id stored for a type, deleted rows included; 0 when none.
    fn get_max_id(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<i64>;

    /// Number of live entities of a type.
    fn count_entity(&self, ty: &dyn EntityTypeDescription, chain: &str) -> LedgerResult<u64>;

    /// Persist revisions. Deleted boxes remove the entity. Returns how many
    /// entities were created.
    fn set_entities(&self, ty: &dyn EntityTypeDescription, boxes: Vec<EntityBox>)
        -> LedgerResult<u64>;

    /// Post-commit hook for derived aggregates.
    fn growth_aggregation(&self, chain: &str, block_time: DateTime<Utc>) -> LedgerResult<()>;

    /// Drop every revision above `block_number`; a negative bound drops all.
    fn reorg(&self, block_number: i64, chain: &str) -> LedgerResult<()>;
}
