//! Entity type descriptions.
//!
//! The ledger never owns the schema. It consumes the narrow
//! [`EntityTypeDescription`] surface: field lookup, the primary and timestamp
//! fields, per-field shape, entity flags, reverse-relation resolution and an
//! estimated row size for cache budgeting. [`EntitySchema`] is the concrete
//! description used by the in-memory backend and by tests.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EntityError, LedgerResult};
use crate::value::Value;

/// Nominal element count used when estimating the width of list fields.
const NOMINAL_LIST_LEN: usize = 4;

/// Per-row bookkeeping overhead added to every estimated row.
const ROW_OVERHEAD_BYTES: usize = 64;

// ============================================================================
// FIELD SHAPE
// ============================================================================

/// Scalar kinds a field can hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    /// Primary key
    Id,
    String,
    Bytes,
    Boolean,
    Int,
    Int8,
    BigInt,
    Float,
    BigDecimal,
    Timestamp,
    /// Enumeration, stored as its member name
    Enum(Vec<String>),
    /// Foreign key to another entity, stored as the target id.
    ///
    /// When `derived_from` is set the field is the virtual reverse side of a
    /// relation: it is never stored and is resolved by listing `target`
    /// entities whose `derived_from` field points back at this entity.
    Reference {
        target: String,
        derived_from: Option<String>,
    },
}

impl ScalarKind {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarKind::Int
                | ScalarKind::Int8
                | ScalarKind::BigInt
                | ScalarKind::Float
                | ScalarKind::BigDecimal
        )
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ScalarKind::Int | ScalarKind::Int8 | ScalarKind::BigInt)
    }

    fn zero(&self) -> Value {
        match self {
            ScalarKind::Id | ScalarKind::String | ScalarKind::Reference { .. } => {
                Value::String(String::new())
            }
            ScalarKind::Bytes => Value::Bytes(Vec::new()),
            ScalarKind::Boolean => Value::Bool(false),
            ScalarKind::Int | ScalarKind::Int8 => Value::Int(0),
            ScalarKind::BigInt => Value::BigInt(0),
            ScalarKind::Float => Value::Float(0.0),
            ScalarKind::BigDecimal => Value::Decimal(Decimal::ZERO),
            ScalarKind::Timestamp => Value::Timestamp(DateTime::UNIX_EPOCH),
            ScalarKind::Enum(members) => members
                .first()
                .map(|m| Value::String(m.clone()))
                .unwrap_or(Value::Null),
        }
    }

    /// Check a non-null leaf value against this kind.
    fn accepts(&self, value: &Value) -> Result<(), String> {
        let ok = match (self, value) {
            (ScalarKind::Id, Value::String(_))
            | (ScalarKind::String, Value::String(_))
            | (ScalarKind::Reference { .. }, Value::String(_))
            | (ScalarKind::Bytes, Value::Bytes(_))
            | (ScalarKind::Boolean, Value::Bool(_))
            | (ScalarKind::Int, Value::Int(_))
            | (ScalarKind::Int8, Value::Int(_))
            | (ScalarKind::BigInt, Value::Int(_))
            | (ScalarKind::BigInt, Value::BigInt(_))
            | (ScalarKind::Float, Value::Float(_))
            | (ScalarKind::Float, Value::Int(_))
            | (ScalarKind::BigDecimal, Value::Decimal(_))
            | (ScalarKind::BigDecimal, Value::Int(_))
            | (ScalarKind::Timestamp, Value::Timestamp(_)) => true,
            (ScalarKind::Int, Value::BigInt(v)) => i32::try_from(*v).is_ok(),
            (ScalarKind::Enum(members), Value::String(s)) => {
                if !members.iter().any(|m| m == s) {
                    return Err(format!("{:?} is not a member of the enum", s));
                }
                true
            }
            _ => false,
        };
        if !ok {
            return Err(format!("{} value does not fit {:?}", value.kind_name(), self));
        }
        if let (ScalarKind::Int, Value::Int(v)) = (self, value) {
            if i32::try_from(*v).is_err() {
                return Err(format!("{} overflows a 32-bit int", v));
            }
        }
        Ok(())
    }

    fn width(&self) -> usize {
        match self {
            ScalarKind::Boolean => 1,
            ScalarKind::Int => 4,
            ScalarKind::Int8 | ScalarKind::Float | ScalarKind::Timestamp => 8,
            ScalarKind::BigInt | ScalarKind::BigDecimal => 16,
            ScalarKind::Id | ScalarKind::Reference { .. } => 42,
            ScalarKind::Bytes | ScalarKind::String => 32,
            ScalarKind::Enum(_) => 8,
        }
    }
}

/// Shape of one field of an entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    pub kind: ScalarKind,
    /// Whether the field itself may be null
    pub nullable: bool,
    /// 0 for scalars, 1 for `[T]`, 2 for `[[T]]`
    pub list_depth: u8,
    /// Whether list elements may be null
    pub item_nullable: bool,
}

impl FieldDescription {
    /// A non-null scalar field.
    pub fn new(name: impl Into<String>, kind: ScalarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            list_depth: 0,
            item_nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn list(mut self, depth: u8) -> Self {
        self.list_depth = depth;
        self
    }

    pub fn item_nullable(mut self) -> Self {
        self.item_nullable = true;
        self
    }

    pub fn is_list(&self) -> bool {
        self.list_depth > 0
    }

    /// Virtual reverse-relation fields are never stored.
    pub fn is_derived(&self) -> bool {
        matches!(
            self.kind,
            ScalarKind::Reference {
                derived_from: Some(_),
                ..
            }
        )
    }

    /// Numeric non-list fields are the only ones operators may target.
    pub fn accepts_operator(&self) -> bool {
        !self.is_list() && self.kind.is_numeric()
    }

    pub fn zero_value(&self) -> Value {
        if self.nullable {
            Value::Null
        } else if self.is_list() {
            Value::List(Vec::new())
        } else {
            self.kind.zero()
        }
    }

    /// Validate a value against nullability, list depth and kind.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        self.check_at(value, 0)
    }

    fn check_at(&self, value: &Value, depth: u8) -> Result<(), String> {
        if value.is_null() {
            let allowed = if depth == 0 {
                self.nullable
            } else {
                self.item_nullable
            };
            return if allowed {
                Ok(())
            } else if depth == 0 {
                Err("null is not allowed".to_string())
            } else {
                Err("null list elements are not allowed".to_string())
            };
        }
        if depth < self.list_depth {
            let Value::List(items) = value else {
                return Err(format!(
                    "expected a list at depth {}, got {}",
                    depth,
                    value.kind_name()
                ));
            };
            return items.iter().try_for_each(|item| self.check_at(item, depth + 1));
        }
        self.kind.accepts(value)
    }

    pub fn estimated_size(&self) -> usize {
        let mut size = self.kind.width();
        for _ in 0..self.list_depth {
            size *= NOMINAL_LIST_LEN;
        }
        size
    }
}

// ============================================================================
// ENTITY TYPE
// ============================================================================

bitflags! {
    /// Behavioral flags of an entity type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntityFlags: u8 {
        /// Rows can be created but never changed
        const IMMUTABLE = 0b0000_0001;
        /// Few live rows relative to history; eligible for full-table caching
        const SPARSE = 0b0000_0010;
        /// Append-only rows with auto-assigned numeric ids
        const TIME_SERIES = 0b0000_0100;
        /// Lives only in memory, never persisted
        const CACHE = 0b0000_1000;
    }
}

/// Target of a reverse relation: list `target` rows whose `field` points back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseField {
    pub target: String,
    pub field: String,
}

/// The schema surface the ledger consumes.
pub trait EntityTypeDescription: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn fields(&self) -> &[FieldDescription];

    fn flags(&self) -> EntityFlags;

    /// Memory budget in bytes for pure-cache types, when configured.
    fn cache_size_budget(&self) -> Option<usize>;

    fn timestamp_field(&self) -> Option<&FieldDescription>;

    fn field(&self, name: &str) -> Option<&FieldDescription> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// The primary key field.
    ///
    /// # Panics
    ///
    /// Panics when the type has no `Id` field; schemas are verified before use.
    fn primary_field(&self) -> &FieldDescription {
        match self.fields().iter().find(|f| f.kind == ScalarKind::Id) {
            Some(field) => field,
            None => panic!("entity {} has no primary key field", self.name()),
        }
    }

    /// Fields a complete revision carries in its data map: everything but
    /// the primary key (held by the box itself) and derived relations.
    fn stored_fields(&self) -> Vec<&FieldDescription> {
        self.fields()
            .iter()
            .filter(|f| f.kind != ScalarKind::Id && !f.is_derived())
            .collect()
    }

    fn is_immutable(&self) -> bool {
        self.flags().contains(EntityFlags::IMMUTABLE)
    }

    fn is_sparse(&self) -> bool {
        self.flags().contains(EntityFlags::SPARSE)
    }

    fn is_time_series(&self) -> bool {
        self.flags().contains(EntityFlags::TIME_SERIES)
    }

    fn is_cache(&self) -> bool {
        self.flags().contains(EntityFlags::CACHE)
    }

    /// Resolve a derived relation field to the forward side it mirrors.
    fn reverse_field(&self, name: &str) -> LedgerResult<ReverseField> {
        let Some(field) = self.field(name) else {
            return Err(EntityError::InvalidField {
                entity: self.name().to_string(),
                field: name.to_string(),
                reason: "no such field".to_string(),
            }
            .into());
        };
        match &field.kind {
            ScalarKind::Reference {
                target,
                derived_from: Some(via),
            } => Ok(ReverseField {
                target: target.clone(),
                field: via.clone(),
            }),
            _ => Err(EntityError::InvalidField {
                entity: self.name().to_string(),
                field: name.to_string(),
                reason: "not a derived relation".to_string(),
            }
            .into()),
        }
    }

    fn estimated_row_size(&self) -> usize {
        ROW_OVERHEAD_BYTES
            + self
                .fields()
                .iter()
                .filter(|f| !f.is_derived())
                .map(FieldDescription::estimated_size)
                .sum::<usize>()
    }

    /// Structural checks run once when the schema is installed.
    fn verify(&self) -> LedgerResult<()> {
        let invalid = |field: &str, reason: &str| EntityError::InvalidField {
            entity: self.name().to_string(),
            field: field.to_string(),
            reason: reason.to_string(),
        };
        let mut seen = HashSet::new();
        let mut primaries = 0;
        for field in self.fields() {
            if !seen.insert(field.name.as_str()) {
                return Err(invalid(&field.name, "duplicate field").into());
            }
            match &field.kind {
                ScalarKind::Id => {
                    primaries += 1;
                    if field.nullable || field.is_list() {
                        return Err(invalid(&field.name, "primary key must be a non-null scalar").into());
                    }
                }
                ScalarKind::Enum(members) if members.is_empty() => {
                    return Err(invalid(&field.name, "enum has no members").into());
                }
                _ => {}
            }
        }
        if primaries != 1 {
            return Err(invalid("id", "exactly one primary key field is required").into());
        }
        if self.is_time_series() {
            match self.timestamp_field() {
                Some(ts) if ts.kind == ScalarKind::Timestamp && !ts.is_list() => {}
                _ => {
                    return Err(
                        invalid("timestamp", "time-series entities need a timestamp field").into(),
                    )
                }
            }
        }
        Ok(())
    }
}

/// Shared handle to a type description.
pub type EntityTypeRef = Arc<dyn EntityTypeDescription>;

/// Concrete, builder-style entity type description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    name: String,
    fields: Vec<FieldDescription>,
    flags: EntityFlags,
    cache_size_budget: Option<usize>,
    timestamp_field: Option<String>,
}

impl EntitySchema {
    /// Create a schema with a primary `id` field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![FieldDescription::new("id", ScalarKind::Id)],
            flags: EntityFlags::empty(),
            cache_size_budget: None,
            timestamp_field: None,
        }
    }

    pub fn with_field(mut self, field: FieldDescription) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_flags(mut self, flags: EntityFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn immutable(self) -> Self {
        self.with_flags(EntityFlags::IMMUTABLE)
    }

    pub fn sparse(self) -> Self {
        self.with_flags(EntityFlags::SPARSE)
    }

    /// Mark as pure cache with the given memory budget in bytes.
    pub fn cache(mut self, budget_bytes: usize) -> Self {
        self.cache_size_budget = Some(budget_bytes);
        self.with_flags(EntityFlags::CACHE)
    }

    /// Mark as time series, adding a `timestamp` field when absent.
    pub fn time_series(mut self) -> Self {
        if !self.fields.iter().any(|f| f.name == "timestamp") {
            self.fields
                .push(FieldDescription::new("timestamp", ScalarKind::Timestamp));
        }
        self.timestamp_field = Some("timestamp".to_string());
        self.with_flags(EntityFlags::TIME_SERIES)
    }

    /// Wrap into a shared type handle.
    pub fn into_ref(self) -> EntityTypeRef {
        Arc::new(self)
    }
}

impl EntityTypeDescription for EntitySchema {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDescription] {
        &self.fields
    }

    fn flags(&self) -> EntityFlags {
        self.flags
    }

    fn cache_size_budget(&self) -> Option<usize> {
        self.cache_size_budget
    }

    fn timestamp_field(&self) -> Option<&FieldDescription> {
        let name = self.timestamp_field.as_deref()?;
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> EntitySchema {
        EntitySchema::new("Account")
            .with_field(FieldDescription::new("balance", ScalarKind::BigDecimal))
            .with_field(
                FieldDescription::new("tags", ScalarKind::String)
                    .list(1)
                    .item_nullable(),
            )
            .with_field(FieldDescription::new(
                "kind",
                ScalarKind::Enum(vec!["EOA".into(), "CONTRACT".into()]),
            ))
            .with_field(FieldDescription::new(
                "transfers",
                ScalarKind::Reference {
                    target: "Transfer".into(),
                    derived_from: Some("from".into()),
                },
            ))
    }

    #[test]
    fn test_check_rejects_null_on_required_field() {
        let schema = account();
        let balance = schema.field("balance").unwrap();
        assert!(balance.check(&Value::Null).is_err());
        assert!(balance.check(&Value::Int(3)).is_ok());
    }

    #[test]
    fn test_check_list_shape_and_items() {
        let schema = account();
        let tags = schema.field("tags").unwrap();
        assert!(tags
            .check(&Value::List(vec!["a".into(), Value::Null]))
            .is_ok());
        assert!(tags.check(&Value::String("a".into())).is_err());
        assert!(tags.check(&Value::List(vec![Value::Int(1)])).is_err());
    }

    #[test]
    fn test_check_enum_membership() {
        let schema = account();
        let kind = schema.field("kind").unwrap();
        assert!(kind.check(&"EOA".into()).is_ok());
        let err = kind.check(&"VALIDATOR".into()).unwrap_err();
        assert!(err.contains("not a member"));
    }

    #[test]
    fn test_int_range_is_enforced() {
        let field = FieldDescription::new("n", ScalarKind::Int);
        assert!(field.check(&Value::Int(i64::from(i32::MAX))).is_ok());
        assert!(field.check(&Value::Int(i64::from(i32::MAX) + 1)).is_err());
    }

    #[test]
    fn test_stored_fields_skip_primary_and_derived() {
        let schema = account();
        let names: Vec<_> = schema.stored_fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["balance", "tags", "kind"]);
    }

    #[test]
    fn test_reverse_field_resolution() {
        let schema = account();
        let reverse = schema.reverse_field("transfers").unwrap();
        assert_eq!(reverse.target, "Transfer");
        assert_eq!(reverse.field, "from");
        assert!(schema.reverse_field("balance").is_err());
        assert!(schema.reverse_field("missing").is_err());
    }

    #[test]
    fn test_verify_time_series_and_duplicates() {
        assert!(EntitySchema::new("Tick").time_series().verify().is_ok());
        let dup = EntitySchema::new("Dup").with_field(FieldDescription::new("id", ScalarKind::Id));
        assert!(dup.verify().is_err());
    }

    #[test]
    fn test_zero_values_follow_shape() {
        let schema = account();
        assert_eq!(
            schema.field("balance").unwrap().zero_value(),
            Value::Decimal(Decimal::ZERO)
        );
        assert_eq!(schema.field("tags").unwrap().zero_value(), Value::List(vec![]));
        assert_eq!(schema.field("kind").unwrap().zero_value(), "EOA".into());
        assert!(schema.estimated_row_size() > ROW_OVERHEAD_BYTES);
    }
}
