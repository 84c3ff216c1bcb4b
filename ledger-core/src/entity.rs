//! Entity revisions.
//!
//! An [`EntityBox`] is one revision of one entity as produced while handling
//! a block. It carries full or partial field data, pending [`Operator`]s for
//! fields whose prior value is not known yet, or nothing at all when the
//! revision deletes the entity. Revisions of the same id fold into each other
//! with [`EntityBox::merge`].
//!
//! The primary key lives in [`EntityBox::id`] and never in the data map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EntityError, LedgerError, LedgerResult, OperatorError};
use crate::operator::Operator;
use crate::schema::{EntityTypeDescription, FieldDescription, ScalarKind};
use crate::value::Value;

/// Block that produced a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockStamp {
    pub number: u64,
    pub hash: String,
    pub chain: String,
    pub time: DateTime<Utc>,
}

impl BlockStamp {
    pub fn new(
        number: u64,
        hash: impl Into<String>,
        chain: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            number,
            hash: hash.into(),
            chain: chain.into(),
            time,
        }
    }
}

/// One revision of one entity.
///
/// `Clone` is a deep copy: the data and operator maps are duplicated, so a
/// box handed out by a cache can be mutated without affecting the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBox {
    pub id: String,
    pub entity: String,
    /// Field values; `None` means this revision deletes the entity
    pub data: Option<BTreeMap<String, Value>>,
    /// Pending updates of fields absent from `data`
    pub operator: BTreeMap<String, Operator>,
    pub gen_block: BlockStamp,
}

impl EntityBox {
    /// A revision that writes fields. Add them with [`with_field`](Self::with_field).
    pub fn upsert(entity: impl Into<String>, id: impl Into<String>, block: BlockStamp) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            data: Some(BTreeMap::new()),
            operator: BTreeMap::new(),
            gen_block: block,
        }
    }

    /// A revision that only updates some fields through operators.
    pub fn partial<K: Into<String>>(
        entity: impl Into<String>,
        id: impl Into<String>,
        block: BlockStamp,
        operators: impl IntoIterator<Item = (K, Operator)>,
    ) -> Self {
        operators
            .into_iter()
            .fold(Self::upsert(entity, id, block), |b, (name, op)| {
                b.with_operator(name, op)
            })
    }

    /// A revision that deletes the entity.
    pub fn deleted(entity: impl Into<String>, id: impl Into<String>, block: BlockStamp) -> Self {
        Self {
            id: id.into(),
            entity: entity.into(),
            data: None,
            operator: BTreeMap::new(),
            gen_block: block,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn with_operator(mut self, name: impl Into<String>, op: Operator) -> Self {
        let name = name.into();
        if let Some(data) = self.data.as_mut() {
            data.remove(&name);
        }
        self.data.get_or_insert_with(BTreeMap::new);
        self.operator.insert(name, op);
        self
    }

    /// Write a field value, dropping any pending operator for it.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.operator.remove(&name);
        self.data
            .get_or_insert_with(BTreeMap::new)
            .insert(name, value.into());
    }

    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }

    pub fn has_pending(&self) -> bool {
        !self.operator.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.as_ref()?.get(name)
    }

    /// Block number this revision was produced at.
    pub fn block_number(&self) -> u64 {
        self.gen_block.number
    }

    /// Whether every stored field of `ty` has a value.
    pub fn is_complete(&self, ty: &dyn EntityTypeDescription) -> bool {
        let Some(data) = self.data.as_ref() else {
            return false;
        };
        ty.stored_fields()
            .iter()
            .all(|f| data.contains_key(&f.name))
    }

    /// A revision that fully determines the entity without looking further back.
    pub fn is_self_contained(&self, ty: &dyn EntityTypeDescription) -> bool {
        self.is_deleted() || (!self.has_pending() && self.is_complete(ty))
    }

    /// Backfill missing stored fields with their zero value. Fields with a
    /// pending operator are left alone.
    pub fn fill_lost_fields(&mut self, ty: &dyn EntityTypeDescription) {
        let Some(data) = self.data.as_mut() else {
            return;
        };
        for field in ty.stored_fields() {
            if !data.contains_key(&field.name) && !self.operator.contains_key(&field.name) {
                data.insert(field.name.clone(), field.zero_value());
            }
        }
    }

    /// Validate every present value and operator against the type.
    pub fn check_value(&self, ty: &dyn EntityTypeDescription) -> LedgerResult<()> {
        if let Some(data) = self.data.as_ref() {
            for (name, value) in data {
                let field = self.admitted_field(ty, name)?;
                field
                    .check(value)
                    .map_err(|reason| self.invalid_value(name, reason))?;
            }
        }
        for name in self.operator.keys() {
            let field = self.admitted_field(ty, name)?;
            if !field.accepts_operator() {
                return Err(self.invalid_value(name, "operators require a numeric scalar field"));
            }
        }
        Ok(())
    }

    fn admitted_field<'t>(
        &self,
        ty: &'t dyn EntityTypeDescription,
        name: &str,
    ) -> LedgerResult<&'t FieldDescription> {
        let Some(field) = ty.field(name) else {
            return Err(self.invalid_value(name, "no such field"));
        };
        if field.kind == ScalarKind::Id {
            return Err(self.invalid_value(name, "the primary key is carried by the revision id"));
        }
        if field.is_derived() {
            return Err(self.invalid_value(name, "derived relations cannot be written"));
        }
        Ok(field)
    }

    fn invalid_value(&self, field: &str, reason: impl Into<String>) -> LedgerError {
        EntityError::InvalidFieldValue {
            entity: self.entity.clone(),
            id: self.id.clone(),
            field: field.to_string(),
            reason: reason.into(),
        }
        .into()
    }

    fn operator_failed(&self, err: OperatorError) -> LedgerError {
        let field = match &err {
            OperatorError::Overflow { field }
            | OperatorError::NotNumeric { field }
            | OperatorError::NotRepresentable { field, .. } => field.clone(),
        };
        self.invalid_value(&field, err.to_string())
    }

    /// Fold a newer revision of the same entity into this one.
    ///
    /// # Panics
    ///
    /// Panics when the revisions disagree on id, entity type or chain, or
    /// when an operator names a field `ty` does not describe.
    pub fn merge(&mut self, ty: &dyn EntityTypeDescription, newer: EntityBox) -> LedgerResult<()> {
        assert_eq!(self.id, newer.id, "merging revisions of different ids");
        assert_eq!(self.entity, newer.entity, "merging revisions of different entities");
        assert_eq!(
            self.gen_block.chain, newer.gen_block.chain,
            "merging revisions of different chains"
        );

        let EntityBox {
            data: newer_data,
            operator: newer_ops,
            gen_block,
            ..
        } = newer;
        self.gen_block = gen_block;

        let Some(newer_data) = newer_data else {
            self.data = None;
            self.operator.clear();
            return Ok(());
        };

        if self.data.is_none() {
            // Recreated after a delete: nothing older survives.
            self.operator.clear();
            let mut data = newer_data;
            for (name, op) in newer_ops {
                let field = operand(ty, &name);
                let value = op
                    .apply(&field.zero_value(), field)
                    .map_err(|e| self.operator_failed(e))?;
                data.insert(name, value);
            }
            self.data = Some(data);
            self.fill_lost_fields(ty);
            return Ok(());
        }

        for (name, value) in newer_data {
            self.set_field(name, value);
        }
        for (name, op) in newer_ops {
            let field = operand(ty, &name);
            let known = self.field(&name).cloned();
            if let Some(current) = known {
                let value = op.apply(&current, field).map_err(|e| self.operator_failed(e))?;
                self.set_field(name, value);
            } else if let Some(prev) = self.operator.get(&name).copied() {
                let composed = prev.then(&op, &name).map_err(|e| self.operator_failed(e))?;
                self.operator.insert(name, composed);
            } else {
                self.operator.insert(name, op);
            }
        }
        Ok(())
    }

    /// Resolve remaining operators against zero values and backfill missing
    /// fields, producing a complete revision.
    pub fn materialize(&mut self, ty: &dyn EntityTypeDescription) -> LedgerResult<()> {
        if self.is_deleted() {
            self.operator.clear();
            return Ok(());
        }
        let pending = std::mem::take(&mut self.operator);
        for (name, op) in pending {
            let field = operand(ty, &name);
            let value = op
                .apply(&field.zero_value(), field)
                .map_err(|e| self.operator_failed(e))?;
            self.set_field(name, value);
        }
        self.fill_lost_fields(ty);
        Ok(())
    }
}

fn operand<'t>(ty: &'t dyn EntityTypeDescription, name: &str) -> &'t FieldDescription {
    match ty.field(name) {
        Some(field) => field,
        None => panic!("operator on undescribed field {}.{}", ty.name(), name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldDescription};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn block(n: u64) -> BlockStamp {
        let time = Utc.timestamp_opt(1_700_000_000 + n as i64 * 12, 0).unwrap();
        BlockStamp::new(n, format!("0x{:064x}", n), "1", time)
    }

    fn counter() -> EntitySchema {
        EntitySchema::new("Counter")
            .with_field(FieldDescription::new("value", ScalarKind::Int8))
            .with_field(FieldDescription::new("total", ScalarKind::BigDecimal))
            .with_field(FieldDescription::new("label", ScalarKind::String).nullable())
    }

    #[test]
    fn test_with_operator_clears_same_field_data() {
        let b = EntityBox::upsert("Counter", "a", block(1))
            .with_field("value", 3i64)
            .with_operator("value", Operator::add(1));
        assert!(b.field("value").is_none());
        assert!(b.has_pending());
    }

    #[test]
    fn test_merge_overwrites_and_resolves_known_values() {
        let ty = counter();
        let mut base = EntityBox::upsert("Counter", "a", block(1))
            .with_field("value", 10i64)
            .with_field("total", Decimal::ZERO)
            .with_field("label", Value::Null);
        let newer = EntityBox::upsert("Counter", "a", block(2))
            .with_field("label", "x")
            .with_operator("value", Operator::multiply(2));
        base.merge(&ty, newer).unwrap();
        assert_eq!(base.field("value"), Some(&Value::Int(20)));
        assert_eq!(base.field("label"), Some(&"x".into()));
        assert_eq!(base.block_number(), 2);
        assert!(!base.has_pending());
    }

    #[test]
    fn test_merge_composes_unknown_operators() {
        let ty = counter();
        let mut base = EntityBox::partial("Counter", "a", block(1), [("value", Operator::add(1))]);
        base.merge(
            &ty,
            EntityBox::partial("Counter", "a", block(2), [("value", Operator::multiply(3))]),
        )
        .unwrap();
        assert_eq!(base.operator["value"], Operator::affine(3, 3));
    }

    #[test]
    fn test_merge_delete_wipes_everything() {
        let ty = counter();
        let mut base = EntityBox::partial("Counter", "a", block(1), [("value", Operator::add(1))]);
        base.merge(&ty, EntityBox::deleted("Counter", "a", block(2)))
            .unwrap();
        assert!(base.is_deleted());
        assert!(!base.has_pending());
    }

    #[test]
    fn test_merge_after_delete_starts_from_zero() {
        let ty = counter();
        let mut base = EntityBox::deleted("Counter", "a", block(1));
        base.merge(
            &ty,
            EntityBox::partial("Counter", "a", block(2), [("value", Operator::add(5))]),
        )
        .unwrap();
        assert_eq!(base.field("value"), Some(&Value::Int(5)));
        assert_eq!(base.field("total"), Some(&Value::Decimal(Decimal::ZERO)));
        assert_eq!(base.field("label"), Some(&Value::Null));
        assert!(base.is_complete(&ty));
    }

    #[test]
    #[should_panic(expected = "different ids")]
    fn test_merge_different_ids_panics() {
        let ty = counter();
        let mut a = EntityBox::upsert("Counter", "a", block(1));
        let _ = a.merge(&ty, EntityBox::upsert("Counter", "b", block(2)));
    }

    #[test]
    fn test_check_value_reports_context() {
        let ty = counter();
        let bad = EntityBox::upsert("Counter", "a", block(1)).with_field("value", "nope");
        let err = bad.check_value(&ty).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Entity(EntityError::InvalidFieldValue { ref field, .. }) if field == "value"
        ));

        let unknown = EntityBox::upsert("Counter", "a", block(1)).with_field("ghost", 1i64);
        assert!(unknown.check_value(&ty).is_err());

        let op_on_string =
            EntityBox::partial("Counter", "a", block(1), [("label", Operator::add(1))]);
        assert!(op_on_string.check_value(&ty).is_err());
    }

    #[test]
    fn test_materialize_resolves_against_zero() {
        let ty = counter();
        let mut b = EntityBox::partial("Counter", "a", block(1), [("value", Operator::affine(2, 7))]);
        b.materialize(&ty).unwrap();
        assert_eq!(b.field("value"), Some(&Value::Int(7)));
        assert!(b.is_self_contained(&ty));
    }

    #[test]
    fn test_clone_is_independent() {
        let original = EntityBox::upsert("Counter", "a", block(1)).with_field("value", 1i64);
        let mut copy = original.clone();
        copy.set_field("value", 2i64);
        assert_eq!(original.field("value"), Some(&Value::Int(1)));
    }
}
