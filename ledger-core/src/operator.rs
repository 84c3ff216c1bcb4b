//! Deferred affine field updates.
//!
//! An [`Operator`] records `new = old * multiplier + addend` for a field whose
//! current value is not yet known. Two operators compose without knowing
//! `old`:
//!
//! ```text
//! (x * m1 + a1) * m2 + a2  ==  x * (m1 * m2) + (a1 * m2 + a2)
//! ```
//!
//! so any number of increments and scalings inside one uncommitted window
//! collapse into a single operator that is resolved once the value is needed.
//! Resolution runs in the decimal domain and converts back to the field's
//! native representation, rounding half away from zero for integer fields.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::OperatorError;
use crate::schema::{FieldDescription, ScalarKind};
use crate::value::Value;

/// Affine numeric transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NumCalc {
    pub multiplier: Decimal,
    pub addend: Decimal,
}

/// Pending update of one field. `num_calc == None` keeps the latest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Operator {
    pub num_calc: Option<NumCalc>,
}

impl Operator {
    /// No-op: keep whatever value the field has.
    pub fn remain() -> Self {
        Self { num_calc: None }
    }

    pub fn affine(multiplier: impl Into<Decimal>, addend: impl Into<Decimal>) -> Self {
        Self {
            num_calc: Some(NumCalc {
                multiplier: multiplier.into(),
                addend: addend.into(),
            }),
        }
    }

    pub fn add(addend: impl Into<Decimal>) -> Self {
        Self::affine(Decimal::ONE, addend)
    }

    pub fn multiply(multiplier: impl Into<Decimal>) -> Self {
        Self::affine(multiplier, Decimal::ZERO)
    }

    pub fn is_remain(&self) -> bool {
        self.num_calc.is_none()
    }

    /// Compose: the returned operator applies `self` first, then `next`.
    pub fn then(&self, next: &Operator, field: &str) -> Result<Operator, OperatorError> {
        let (first, second) = match (self.num_calc, next.num_calc) {
            (None, _) => return Ok(*next),
            (Some(_), None) => return Ok(*self),
            (Some(first), Some(second)) => (first, second),
        };
        let overflow = || OperatorError::Overflow {
            field: field.to_string(),
        };
        let multiplier = first
            .multiplier
            .checked_mul(second.multiplier)
            .ok_or_else(overflow)?;
        let addend = first
            .addend
            .checked_mul(second.multiplier)
            .and_then(|v| v.checked_add(second.addend))
            .ok_or_else(overflow)?;
        Ok(Operator::affine(multiplier, addend))
    }

    /// Resolve against a known value. Null origins count as zero.
    pub fn apply(&self, origin: &Value, field: &FieldDescription) -> Result<Value, OperatorError> {
        let Some(calc) = self.num_calc else {
            return Ok(origin.clone());
        };
        if !field.accepts_operator() {
            return Err(OperatorError::NotNumeric {
                field: field.name.clone(),
            });
        }
        let x = match origin {
            Value::Null => Decimal::ZERO,
            other => other.as_decimal().ok_or_else(|| OperatorError::NotNumeric {
                field: field.name.clone(),
            })?,
        };
        let y = x
            .checked_mul(calc.multiplier)
            .and_then(|v| v.checked_add(calc.addend))
            .ok_or_else(|| OperatorError::Overflow {
                field: field.name.clone(),
            })?;
        to_native(y, field)
    }
}

fn to_native(y: Decimal, field: &FieldDescription) -> Result<Value, OperatorError> {
    let unrepresentable = || OperatorError::NotRepresentable {
        field: field.name.clone(),
        value: y.to_string(),
    };
    let rounded = || y.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    match &field.kind {
        ScalarKind::Int => rounded()
            .to_i32()
            .map(|v| Value::Int(v as i64))
            .ok_or_else(unrepresentable),
        ScalarKind::Int8 => rounded().to_i64().map(Value::Int).ok_or_else(unrepresentable),
        ScalarKind::BigInt => rounded()
            .to_i128()
            .map(Value::BigInt)
            .ok_or_else(unrepresentable),
        ScalarKind::Float => y.to_f64().map(Value::Float).ok_or_else(unrepresentable),
        ScalarKind::BigDecimal => Ok(Value::Decimal(y.normalize())),
        _ => Err(OperatorError::NotNumeric {
            field: field.name.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_field() -> FieldDescription {
        FieldDescription::new("count", ScalarKind::Int8)
    }

    fn decimal_field() -> FieldDescription {
        FieldDescription::new("amount", ScalarKind::BigDecimal)
    }

    #[test]
    fn test_remain_passes_value_through() {
        let v = Operator::remain().apply(&Value::Int(9), &int_field()).unwrap();
        assert_eq!(v, Value::Int(9));
    }

    #[test]
    fn test_add_and_multiply() {
        let field = int_field();
        assert_eq!(
            Operator::add(5).apply(&Value::Int(10), &field).unwrap(),
            Value::Int(15)
        );
        assert_eq!(
            Operator::multiply(3).apply(&Value::Int(10), &field).unwrap(),
            Value::Int(30)
        );
    }

    #[test]
    fn test_null_origin_counts_as_zero() {
        let field = int_field().nullable();
        assert_eq!(
            Operator::add(2).apply(&Value::Null, &field).unwrap(),
            Value::Int(2)
        );
    }

    #[test]
    fn test_integer_rounding_is_half_away_from_zero() {
        let field = int_field();
        let half = Operator::multiply(Decimal::new(5, 1));
        assert_eq!(half.apply(&Value::Int(5), &field).unwrap(), Value::Int(3));
        assert_eq!(half.apply(&Value::Int(-5), &field).unwrap(), Value::Int(-3));
    }

    #[test]
    fn test_decimal_has_no_float_error() {
        let field = decimal_field();
        let op = Operator::add(Decimal::new(1, 1));
        let once = op.apply(&Value::Decimal(Decimal::new(2, 1)), &field).unwrap();
        assert_eq!(once, Value::Decimal(Decimal::new(3, 1)));
    }

    #[test]
    fn test_int_field_overflow_is_reported() {
        let field = FieldDescription::new("small", ScalarKind::Int);
        let err = Operator::add(i64::from(i32::MAX))
            .apply(&Value::Int(1), &field)
            .unwrap_err();
        assert!(matches!(err, OperatorError::NotRepresentable { .. }));
    }

    #[test]
    fn test_non_numeric_field_rejected() {
        let field = FieldDescription::new("name", ScalarKind::String);
        let err = Operator::add(1).apply(&"x".into(), &field).unwrap_err();
        assert!(matches!(err, OperatorError::NotNumeric { .. }));
    }

    #[test]
    fn test_then_with_remain_is_identity() {
        let op = Operator::affine(2, 3);
        assert_eq!(op.then(&Operator::remain(), "f").unwrap(), op);
        assert_eq!(Operator::remain().then(&op, "f").unwrap(), op);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Sequential application equals the composed operator on integers.
        #[test]
        fn prop_composition_matches_sequence_int(
            x in -1_000_000i64..1_000_000,
            m1 in -50i64..50, a1 in -10_000i64..10_000,
            m2 in -50i64..50, a2 in -10_000i64..10_000,
        ) {
            let field = FieldDescription::new("n", ScalarKind::Int8);
            let op1 = Operator::affine(m1, a1);
            let op2 = Operator::affine(m2, a2);
            let step = op2.apply(&op1.apply(&Value::Int(x), &field).unwrap(), &field).unwrap();
            let combined = op1.then(&op2, "n").unwrap().apply(&Value::Int(x), &field).unwrap();
            prop_assert_eq!(step, combined);
        }

        /// Sequential application equals the composed operator on decimals.
        #[test]
        fn prop_composition_matches_sequence_decimal(
            x in -1_000_000i64..1_000_000,
            m1 in -500i64..500, a1 in -100_000i64..100_000,
            m2 in -500i64..500, a2 in -100_000i64..100_000,
        ) {
            let field = FieldDescription::new("d", ScalarKind::BigDecimal);
            let origin = Value::Decimal(Decimal::new(x, 2));
            let op1 = Operator::affine(Decimal::new(m1, 1), Decimal::new(a1, 3));
            let op2 = Operator::affine(Decimal::new(m2, 1), Decimal::new(a2, 3));
            let step = op2.apply(&op1.apply(&origin, &field).unwrap(), &field).unwrap();
            let combined = op1.then(&op2, "d").unwrap().apply(&origin, &field).unwrap();
            prop_assert_eq!(step, combined);
        }

        /// Composition is associative.
        #[test]
        fn prop_then_is_associative(
            m in proptest::collection::vec(-20i64..20, 3),
            a in proptest::collection::vec(-1000i64..1000, 3),
        ) {
            let ops: Vec<_> = (0..3).map(|i| Operator::affine(m[i], a[i])).collect();
            let left = ops[0].then(&ops[1], "f").unwrap().then(&ops[2], "f").unwrap();
            let right = ops[0].then(&ops[1].then(&ops[2], "f").unwrap(), "f").unwrap();
            prop_assert_eq!(
                left.num_calc.map(|c| (c.multiplier.normalize(), c.addend.normalize())),
                right.num_calc.map(|c| (c.multiplier.normalize(), c.addend.normalize()))
            );
        }
    }
}
