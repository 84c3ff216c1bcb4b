//! Ledger Core - Entity Revisions
//!
//! Pure data model for the block ledger: field values, entity type
//! descriptions, revisions with deferred operators, filter evaluation and
//! pagination cursors. No I/O lives here.

pub mod config;
pub mod cursor;
pub mod entity;
pub mod error;
pub mod filter;
pub mod operator;
pub mod schema;
pub mod value;

pub use config::{CacheConfig, LedgerConfig};
pub use cursor::Cursor;
pub use entity::{BlockStamp, EntityBox};
pub use error::{
    ConfigError, EntityError, LedgerError, LedgerResult, OperatorError, StoreError,
};
pub use filter::{
    compare, compile_filters, like_to_regex, matches_all, CompiledFilter, Comparison,
    EntityFilter, FilterOperator,
};
pub use operator::{NumCalc, Operator};
pub use schema::{
    EntityFlags, EntitySchema, EntityTypeDescription, EntityTypeRef, FieldDescription,
    ReverseField, ScalarKind,
};
pub use value::Value;

/// Chain identifier, as carried by [`BlockStamp::chain`].
pub type ChainId = String;
