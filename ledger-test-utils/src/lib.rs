//! Ledger Test Utilities
//!
//! Shared test infrastructure for the ledger workspace:
//! - Fixture schemas covering every entity flag
//! - Block stamps and revision builders
//! - Proptest generators for values and revisions
//! - Assertions for ledger-specific errors

// Re-export the in-memory backend from its source crate
pub use ledger_storage::MemoryStore;

pub use ledger_core::{
    BlockStamp, CacheConfig, EntityBox, EntityError, EntityFilter, EntitySchema,
    EntityTypeDescription, EntityTypeRef, FieldDescription, LedgerConfig, LedgerError,
    LedgerResult, Operator, ScalarKind, Value,
};

/// Chain used by every fixture.
pub const CHAIN: &str = "1";

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use ledger_storage::{CachedStore, Controller};

    /// Seconds since the epoch of block 0.
    const GENESIS_UNIX: i64 = 1_700_000_000;
    const BLOCK_SECONDS: i64 = 12;

    /// Mutable account with a numeric balance, a list field and a reverse
    /// relation to its outgoing transfers.
    pub fn account() -> EntitySchema {
        EntitySchema::new("Account")
            .with_field(FieldDescription::new("balance", ScalarKind::BigDecimal))
            .with_field(FieldDescription::new("txCount", ScalarKind::Int))
            .with_field(
                FieldDescription::new("tags", ScalarKind::String)
                    .list(1)
                    .item_nullable(),
            )
            .with_field(
                FieldDescription::new(
                    "kind",
                    ScalarKind::Enum(vec!["EOA".into(), "CONTRACT".into()]),
                )
                .nullable(),
            )
            .with_field(FieldDescription::new(
                "transfers",
                ScalarKind::Reference {
                    target: "Transfer".into(),
                    derived_from: Some("from".into()),
                },
            ))
    }

    /// Append-only transfer log.
    pub fn transfer() -> EntitySchema {
        EntitySchema::new("Transfer")
            .with_field(FieldDescription::new(
                "from",
                ScalarKind::Reference {
                    target: "Account".into(),
                    derived_from: None,
                },
            ))
            .with_field(FieldDescription::new("amount", ScalarKind::BigDecimal))
            .time_series()
    }

    /// Sparse type, eligible for a full-table cache.
    pub fn pool() -> EntitySchema {
        EntitySchema::new("Pool")
            .with_field(FieldDescription::new("symbol", ScalarKind::String))
            .with_field(FieldDescription::new("liquidity", ScalarKind::Int8))
            .sparse()
    }

    /// Pure cache type that never reaches the backing store.
    pub fn price(budget_bytes: usize) -> EntitySchema {
        EntitySchema::new("Price")
            .with_field(FieldDescription::new("usd", ScalarKind::Float))
            .cache(budget_bytes)
    }

    /// Immutable type: written once, never updated.
    pub fn genesis() -> EntitySchema {
        EntitySchema::new("Genesis")
            .with_field(FieldDescription::new("label", ScalarKind::String))
            .immutable()
    }

    pub fn all_types() -> Vec<EntityTypeRef> {
        vec![
            account().into_ref(),
            transfer().into_ref(),
            pool().into_ref(),
            price(64 * 1024).into_ref(),
            genesis().into_ref(),
        ]
    }

    pub fn block_time(number: u64) -> DateTime<Utc> {
        DateTime::from_timestamp(GENESIS_UNIX, 0).unwrap_or(DateTime::UNIX_EPOCH)
            + Duration::seconds(BLOCK_SECONDS * number as i64)
    }

    /// Stamp for block `number` on [`CHAIN`].
    pub fn block(number: u64) -> BlockStamp {
        BlockStamp::new(number, format!("0x{number:064x}"), CHAIN, block_time(number))
    }

    pub fn memory_store() -> Arc<MemoryStore> {
        MemoryStore::with_types(all_types()).expect("fixture schemas verify")
    }

    /// Backing store, cache and controller wired together with `cache`.
    pub fn ledger(cache: CacheConfig) -> (Arc<MemoryStore>, Controller<MemoryStore>) {
        let store = memory_store();
        let cached = Arc::new(
            CachedStore::new(Arc::clone(&store), cache).expect("fixture cache config is valid"),
        );
        let controller = Controller::new(CHAIN, cached, &LedgerConfig::default())
            .expect("default config is valid");
        (store, controller)
    }

    pub fn account_at(id: &str, number: u64, balance: i64) -> EntityBox {
        EntityBox::upsert("Account", id, block(number))
            .with_field("balance", rust_decimal::Decimal::from(balance))
            .with_field("txCount", 0)
            .with_field("tags", Vec::<Value>::new())
            .with_field("kind", Value::Null)
    }

    pub fn transfer_at(id: &str, number: u64, from: &str, amount: i64) -> EntityBox {
        EntityBox::upsert("Transfer", id, block(number))
            .with_field("from", from)
            .with_field("amount", rust_decimal::Decimal::from(amount))
    }

    pub fn pool_at(id: &str, number: u64, liquidity: i64) -> EntityBox {
        EntityBox::upsert("Pool", id, block(number))
            .with_field("symbol", id.to_uppercase())
            .with_field("liquidity", liquidity)
    }

    pub fn price_at(id: &str, number: u64, usd: f64) -> EntityBox {
        EntityBox::upsert("Price", id, block(number)).with_field("usd", usd)
    }

    pub fn genesis_at(id: &str, number: u64) -> EntityBox {
        EntityBox::upsert("Genesis", id, block(number)).with_field("label", id)
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    pub fn arb_entity_id() -> impl Strategy<Value = String> {
        "[a-f0-9]{1,6}"
    }

    pub fn arb_decimal() -> impl Strategy<Value = Decimal> {
        (-1_000_000i64..1_000_000, 0u32..6).prop_map(|(mantissa, scale)| Decimal::new(mantissa, scale))
    }

    /// Small affine operators whose compositions stay far from overflow.
    pub fn arb_operator() -> impl Strategy<Value = Operator> {
        prop_oneof![
            Just(Operator::remain()),
            (-100i64..100).prop_map(Operator::add),
            (-4i64..5).prop_map(Operator::multiply),
            ((-4i64..5), (-100i64..100)).prop_map(|(m, a)| Operator::affine(m, a)),
        ]
    }

    pub fn arb_tag_list() -> impl Strategy<Value = Value> {
        proptest::collection::vec(
            prop_oneof![Just(Value::Null), "[a-z]{1,4}".prop_map(Value::from)],
            0..4,
        )
        .prop_map(Value::List)
    }

    /// Full account revision at `number`.
    pub fn arb_account(number: u64) -> impl Strategy<Value = EntityBox> {
        (arb_entity_id(), arb_decimal(), 0i32..1_000, arb_tag_list()).prop_map(
            move |(id, balance, count, tags)| {
                EntityBox::upsert("Account", id, fixtures::block(number))
                    .with_field("balance", balance)
                    .with_field("txCount", count)
                    .with_field("tags", tags)
                    .with_field("kind", Value::Null)
            },
        )
    }

    /// Partial account revision that only moves the balance.
    pub fn arb_balance_update(id: String, number: u64) -> impl Strategy<Value = EntityBox> {
        arb_operator().prop_map(move |op| {
            EntityBox::partial("Account", id.clone(), fixtures::block(number), [("balance", op)])
        })
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    pub fn assert_update_immutable<T: std::fmt::Debug>(result: &LedgerResult<T>, id: &str) {
        match result {
            Err(LedgerError::Entity(EntityError::UpdateImmutable { id: got, .. })) => {
                assert_eq!(got, id, "UpdateImmutable for the wrong id")
            }
            other => panic!("Expected UpdateImmutable for {id}, got {other:?}"),
        }
    }

    pub fn assert_invalid_list_filter<T: std::fmt::Debug>(result: &LedgerResult<T>) {
        assert!(
            matches!(
                result,
                Err(LedgerError::Entity(EntityError::InvalidListFilter { .. }))
            ),
            "Expected InvalidListFilter, got {:?}",
            result
        );
    }

    pub fn assert_invalid_field_value<T: std::fmt::Debug>(result: &LedgerResult<T>, field: &str) {
        match result {
            Err(LedgerError::Entity(EntityError::InvalidFieldValue { field: got, .. })) => {
                assert_eq!(got, field)
            }
            other => panic!("Expected InvalidFieldValue on {field}, got {other:?}"),
        }
    }

    /// Ids of a page, in order.
    pub fn ids(boxes: &[EntityBox]) -> Vec<&str> {
        boxes.iter().map(|b| b.id.as_str()).collect()
    }
}
